use std::time::Duration;

use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberState {
    Alive,
    /// Missed heartbeats for longer than the suspect timeout.
    Suspect,
    /// Missed heartbeats for longer than the dead timeout.
    Failed,
    Left,
}

/// A gossip participant. Members are named by their gossip address, which is unique in the
/// cluster; `raft_address` is the tag the placement layer needs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub name: String,
    pub raft_address: String,
    /// Bumped by the member itself every gossip round.
    pub heartbeat: u64,
    pub state: MemberState,
}

impl Member {
    pub fn new(name: &str, raft_address: &str) -> Member {
        Member {
            name: name.to_string(),
            raft_address: raft_address.to_string(),
            heartbeat: 0,
            state: MemberState::Alive,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.state, MemberState::Alive | MemberState::Suspect)
    }
}

/// Local view of a remote member.
#[derive(Clone, Debug)]
pub(crate) struct Tracked {
    pub member: Member,
    /// When the heartbeat last advanced.
    pub updated: Instant,
}

/// What changed after merging a remote view of a member.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Change {
    Joined,
    Left,
    None,
}

impl Tracked {
    pub fn new(member: Member) -> Tracked {
        Tracked {
            member,
            updated: Instant::now(),
        }
    }

    /// Folds in a view of this member gossiped by someone. Only a newer heartbeat counts.
    pub fn merge(&mut self, seen: &Member) -> Change {
        if seen.heartbeat <= self.member.heartbeat {
            return Change::None;
        }
        let was_live = self.member.is_live();
        self.member.heartbeat = seen.heartbeat;
        self.member.raft_address = seen.raft_address.clone();
        self.updated = Instant::now();
        match seen.state {
            MemberState::Left => {
                self.member.state = MemberState::Left;
                if was_live {
                    Change::Left
                } else {
                    Change::None
                }
            }
            _ => {
                self.member.state = MemberState::Alive;
                if was_live {
                    Change::None
                } else {
                    Change::Joined
                }
            }
        }
    }

    /// Moves the member along alive, suspect and failed by heartbeat age. Returns the new state when
    /// it changed.
    pub fn age(&mut self, now: Instant, suspect: Duration, dead: Duration) -> Option<MemberState> {
        if self.member.state == MemberState::Left {
            return None;
        }
        let silent = now.saturating_duration_since(self.updated);
        let next = if silent >= dead {
            MemberState::Failed
        } else if silent >= suspect {
            MemberState::Suspect
        } else {
            MemberState::Alive
        };
        if next == self.member.state {
            return None;
        }
        self.member.state = next;
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seen(heartbeat: u64, state: MemberState) -> Member {
        Member {
            heartbeat,
            state,
            ..Member::new("127.0.0.1:7946", "127.0.0.1:60020")
        }
    }

    #[test]
    fn merge_ignores_stale_heartbeats() {
        let mut tracked = Tracked::new(seen(5, MemberState::Alive));
        assert_eq!(tracked.merge(&seen(5, MemberState::Left)), Change::None);
        assert_eq!(tracked.member.state, MemberState::Alive);
        assert_eq!(tracked.merge(&seen(6, MemberState::Left)), Change::Left);
        assert_eq!(tracked.member.state, MemberState::Left);
    }

    #[test]
    fn failed_member_rejoins_on_fresh_heartbeat() {
        let mut tracked = Tracked::new(seen(1, MemberState::Alive));
        let later = tracked.updated + Duration::from_secs(20);
        let suspect = Duration::from_secs(2);
        let dead = Duration::from_secs(10);
        assert_eq!(tracked.age(later, suspect, dead), Some(MemberState::Failed));
        assert_eq!(tracked.age(later, suspect, dead), None);
        assert_eq!(tracked.merge(&seen(2, MemberState::Alive)), Change::Joined);
        assert!(tracked.member.is_live());
    }

    #[test]
    fn suspect_before_failed() {
        let mut tracked = Tracked::new(seen(1, MemberState::Alive));
        let suspect = Duration::from_secs(2);
        let dead = Duration::from_secs(10);
        let at = tracked.updated + Duration::from_secs(3);
        assert_eq!(tracked.age(at, suspect, dead), Some(MemberState::Suspect));
        assert!(tracked.member.is_live());
    }
}
