use std::time::Duration;

use rand::Rng;

use crate::error::{FurrowError, Result};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
/// Tuning shared by every group a node hosts.
pub struct RaftConfig {
    /// Length of one tick in milliseconds.
    pub rtt_millis: u64,
    /// Ticks without hearing from a leader before a follower campaigns.
    pub election_rtt: u64,
    /// Ticks between leader heartbeats.
    pub heartbeat_rtt: u64,
    /// Whether leaders step down without a quorum and followers ignore disruptive votes.
    pub check_quorum: bool,
    /// Applied entries between state machine snapshots. Zero disables snapshots.
    pub snapshot_entries: u64,
    /// Entries kept in the log behind a snapshot.
    pub compaction_overhead: u64,
    /// Maximum number of entries that can be sent in an append message.
    pub max_append_entries: u64,
    /// Capacity of the per-group proposal queue.
    pub proposal_queue: usize,
}

impl RaftConfig {
    /// Validates the configuration, ensuring all values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.rtt_millis == 0 {
            return Err(FurrowError::InvalidConfig("rtt_millis cannot be 0".into()));
        }
        if self.heartbeat_rtt == 0 {
            return Err(FurrowError::InvalidConfig("heartbeat_rtt cannot be 0".into()));
        }
        if self.election_rtt <= 2 * self.heartbeat_rtt {
            return Err(FurrowError::InvalidConfig(
                "election_rtt must be more than twice heartbeat_rtt".into(),
            ));
        }
        if self.max_append_entries == 0 {
            return Err(FurrowError::InvalidConfig("max_append_entries cannot be 0".into()));
        }
        if self.proposal_queue == 0 {
            return Err(FurrowError::InvalidConfig("proposal_queue cannot be 0".into()));
        }

        Ok(())
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.rtt_millis)
    }

    pub fn election_ticks(&self) -> u64 {
        self.election_rtt
    }

    pub fn heartbeat_ticks(&self) -> u64 {
        self.heartbeat_rtt
    }

    /// An election timeout in `[election_rtt, 2 * election_rtt)`.
    pub fn randomized_election_ticks(&self) -> u64 {
        self.election_rtt + rand::thread_rng().gen_range(0..self.election_rtt.max(1))
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            rtt_millis: 100,
            election_rtt: 10,
            heartbeat_rtt: 1,
            check_quorum: true,
            snapshot_entries: 10,
            compaction_overhead: 5,
            max_append_entries: 64,
            proposal_queue: 256,
        }
    }
}
