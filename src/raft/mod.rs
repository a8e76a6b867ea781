//! This implementation of the [Raft](raft.github.io) consensus algorithm replicates the state of
//! every group hosted by a node. Each group runs its own instance of the state machine below: a
//! leader is elected per group, coordinates replication of the group's log to a quorum of its
//! members, and hands committed entries to the group's [`fsm::Driver`].
//!
//! The state machine itself is pure with respect to networking: commands are applied through
//! [`Apply`], and any messages it produces are written to an outbound channel that the group's
//! event loop in [`server`] routes to the TCP transport, back into the state machine, or to
//! waiting clients. Time moves forward only through [`Command::Tick`].

use std::collections::VecDeque;
use std::fmt;
use std::fmt::{Debug, Formatter};

use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::error::Result;
use crate::raft::candidate::Candidate;
use crate::raft::config::RaftConfig;
use crate::raft::error::RaftError;
use crate::raft::follower::Follower;
use crate::raft::fsm::Instruction;
use crate::raft::leader::Leader;
use crate::raft::log::RaftLog;
use crate::raft::membership::{ConfigChange, Membership};
use crate::raft::rpc::{Address, Message, Proposal, Response};
use crate::raft::store::{HardState, SnapshotMeta};

mod candidate;
pub mod config;
mod election;
pub mod error;
mod follower;
pub mod fsm;
mod leader;
pub mod log;
pub mod membership;
mod progress;
pub mod rpc;
pub mod server;
pub mod store;
pub mod tcp;
#[cfg(test)]
mod test;

/// A unique id that identifies a node. A node keeps the same id in every group it joins.
pub type NodeId = u64;

/// Identifies a replication group.
pub type GroupId = u64;

/// A term serves as a logical clock that increases monotonically when a new election begins.
pub type Term = u64;

/// Each entry has an index in the log, which with the term, describes the unique position of an entry in the log.
pub type LogIndex = u64;

pub type ClientRequestId = Uuid;

/// Commands that can be applied to the state machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Move the state machine forward.
    Tick,
    /// Start an election immediately.
    Timeout,
    /// Request that this instance vote for the provided node.
    VoteRequest {
        /// The term of the candidate.
        term: Term,
        /// The id of the candidate requesting the vote.
        candidate_id: NodeId,
        /// Term of the last log entry.
        last_term: Term,
        /// Index of the last log entry.
        last_index: LogIndex,
        /// Set when the election was triggered by a leadership transfer.
        transfer: bool,
    },
    /// Respond to a vote from another node.
    VoteResponse {
        /// The term of the voter.
        term: Term,
        /// The id of the voter responding to the vote.
        from: NodeId,
        /// Whether the vote was granted to the candidate.
        granted: bool,
    },
    /// Request from another node to append entries to our log.
    AppendEntries {
        /// The term of the node requesting entries be appended to our commit log.
        term: Term,
        /// The id of the node sending entries.
        leader_id: NodeId,
        /// The last log index preceeding new entries.
        prev_log_index: LogIndex,
        /// The log term preceeding new entries.
        prev_log_term: Term,
        /// The entries to append to our commit log.
        entries: Vec<Entry>,
        /// The leader's commit index.
        commit_index: LogIndex,
    },
    AppendResponse {
        /// The id of the responding node.
        node_id: NodeId,
        /// The term of the responding node.
        term: Term,
        /// On success the last index now matching the leader, otherwise the node's last index.
        index: LogIndex,
        /// Whether the entries were successfully appended.
        success: bool,
    },
    /// Heartbeat from the leader.
    Heartbeat {
        /// The term of the node sending a heartbeat.
        term: Term,
        /// The commit index, capped at what the receiver is known to hold.
        commit_index: LogIndex,
        /// The id of the node sending a heartbeat.
        leader_id: NodeId,
        /// Sequence of the newest read-index request this heartbeat confirms.
        read_seq: u64,
    },
    HeartbeatResponse {
        term: Term,
        from: NodeId,
        /// Echo of the heartbeat's read sequence.
        read_seq: u64,
        /// The responding node's last log index.
        last_index: LogIndex,
    },
    /// Replace the receiver's state with the leader's latest snapshot.
    InstallSnapshot {
        term: Term,
        leader_id: NodeId,
        meta: SnapshotMeta,
        data: Vec<u8>,
    },
    SnapshotResponse {
        term: Term,
        from: NodeId,
        index: LogIndex,
    },
    /// Sent by a leader to the transfer target so it campaigns without waiting for a timeout.
    TimeoutNow { term: Term, leader_id: NodeId },
    /// Don't do anything.
    Noop,
    /// Service a client proposal, possibly forwarded from another node.
    ClientRequest {
        id: ClientRequestId,
        address: Address,
        proposal: Proposal,
    },
    /// Obtain a commit index that is safe to read at.
    ReadIndex {
        id: ClientRequestId,
        address: Address,
    },
    /// Change the voters of the group through joint consensus.
    ChangeMembership {
        id: ClientRequestId,
        address: Address,
        change: ConfigChange,
    },
    /// Hand leadership to another voter.
    TransferLeader {
        id: ClientRequestId,
        address: Address,
        target: NodeId,
    },
    /// The leader appended a forwarded request at `index` in `term`.
    ProposalAccepted {
        id: ClientRequestId,
        index: LogIndex,
        term: Term,
    },
    /// Respond to a client. This is never applied to a raft node; it is proxied by the server
    /// event loop to whoever is waiting on `id`.
    ClientResponse {
        id: ClientRequestId,
        res: std::result::Result<Response, RaftError>,
    },
    /// The local fsm driver captured a snapshot at `index`.
    SnapshotCreated {
        index: LogIndex,
        term: Term,
        data: Vec<u8>,
    },
}

impl Command {
    /// The sender's term for commands exchanged between members of a group.
    pub fn term(&self) -> Option<Term> {
        match self {
            Command::VoteRequest { term, .. }
            | Command::VoteResponse { term, .. }
            | Command::AppendEntries { term, .. }
            | Command::AppendResponse { term, .. }
            | Command::Heartbeat { term, .. }
            | Command::HeartbeatResponse { term, .. }
            | Command::InstallSnapshot { term, .. }
            | Command::SnapshotResponse { term, .. }
            | Command::TimeoutNow { term, .. } => Some(*term),
            _ => None,
        }
    }

    /// The leader that sent this command, if it can only have come from one.
    fn leader(&self) -> Option<NodeId> {
        match self {
            Command::AppendEntries { leader_id, .. }
            | Command::Heartbeat { leader_id, .. }
            | Command::InstallSnapshot { leader_id, .. }
            | Command::TimeoutNow { leader_id, .. } => Some(*leader_id),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Command::AppendEntries { term, leader_id, prev_log_index, entries, commit_index, .. } => write!(
                f,
                "AppendEntries {{ term: {}, leader_id: {}, prev_log_index: {}, entries: {}, commit_index: {} }}",
                term, leader_id, prev_log_index, entries.len(), commit_index
            ),
            Command::InstallSnapshot { term, leader_id, meta, .. } => write!(
                f,
                "InstallSnapshot {{ term: {}, leader_id: {}, index: {} }}",
                term, leader_id, meta.index
            ),
            Command::SnapshotCreated { index, term, .. } => {
                write!(f, "SnapshotCreated {{ index: {}, term: {} }}", index, term)
            }
            _ => write!(f, "{:?}", self),
        }
    }
}

/// Shared behavior that all roles of the state machine must implement.
pub trait Role: Debug {
    /// Set the term for the node, reseting the current election.
    fn term(&mut self, term: Term);
    fn role(&self) -> RaftRole;
}

/// Identifies the client session a proposal belongs to so it is applied at most once.
#[derive(Serialize, PartialEq, Eq, Deserialize, Debug, Clone, Copy)]
pub struct SessionTag {
    pub client_id: u64,
    pub series_id: u64,
}

#[derive(Serialize, PartialEq, Deserialize, Debug, Clone)]
pub enum EntryType {
    Entry {
        data: Vec<u8>,
        session: Option<SessionTag>,
    },
    /// Appended by a new leader to commit entries from earlier terms.
    Control,
    /// A membership configuration, effective as soon as it is appended.
    Config { membership: Membership },
}

/// An entry in the commit log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The type of the entry
    pub entry_type: EntryType,
    /// The term of the entry.
    pub term: Term,
    /// The index of the entry within the commit log.
    pub index: LogIndex,
}

/// Volatile and persistent state that is common to all roles.
// NB: These could just be fields on the common Raft struct, but copying them is annoying.
#[derive(PartialEq, Clone, Copy)]
pub struct State {
    /// The current term of the state machine that is incremented as certain commands are applied
    /// to the state machine. The term of the Raft instance is used in determining leadership. For
    /// example, when a node receives an append entries request from a node with a higher term,
    /// the node will transition to follower and acknowledge that node as the leader.
    pub current_term: Term,
    /// Who the node has voted for in the current election.
    pub voted_for: Option<NodeId>,
    /// The current commit index of the replicated log.
    pub commit_index: LogIndex,
    /// Highest index handed to the fsm driver.
    pub last_applied: LogIndex,
    /// Ticks since the election timer was last reset.
    pub election_elapsed: u64,
    /// The randomized election timeout in ticks.
    pub election_timeout: u64,
}

impl Debug for State {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "State {{ current_term: {}, voted_for: {:?}, commit_index: {}, last_applied: {}, timeout: {} }}",
               self.current_term, self.voted_for, self.commit_index, self.last_applied,
               self.election_timeout.saturating_sub(self.election_elapsed))
    }
}

impl State {
    fn hard_state(&self) -> HardState {
        HardState {
            term: self.current_term,
            voted_for: self.voted_for,
            commit: self.commit_index,
        }
    }
}

/// The primary struct representing the state machine. Contains fields common all roles.
pub struct Raft<T: Role + Debug> {
    /// The identifier for this node.
    pub id: NodeId,
    /// The group this instance replicates.
    pub group: GroupId,
    /// Configuration for this instance.
    pub config: RaftConfig,
    /// Volatile and persistent state for the state machine. Note that specific additional per-role
    /// state may be contained in that role.
    pub state: State,
    /// An instance containing role specific state and behavior.
    pub role: T,
    /// The persistent state for this raft instance.
    pub log: RaftLog,
    /// The effective membership, i.e. the latest configuration in the log.
    pub membership: Membership,
    /// Index of the entry holding `membership`.
    pub membership_index: LogIndex,
    /// Last hard state written to the store.
    persisted: HardState,
    /// Channel to send messages to other nodes.
    pub rpc_tx: UnboundedSender<Message>,
    /// Channel to send entries to fsm driver.
    pub fsm_tx: UnboundedSender<Instruction>,
}

impl<T: Role + Debug> Debug for Raft<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Raft {{ group: {}, id: {}, state: {:?} }}", self.group, self.id, self.state)
    }
}

// Base methods for general operations (+ debugging and testing).
impl<T: Role> Raft<T> {
    /// Checks the status of the election timer.
    pub fn needs_election(&self) -> bool {
        self.state.election_elapsed >= self.state.election_timeout
    }

    /// Set the current term.
    pub fn term(&mut self, term: Term) {
        self.state.voted_for = None;
        self.state.current_term = term;

        self.role.term(term);
    }

    pub fn is_voter(&self) -> bool {
        self.membership.is_voter(self.id)
    }

    pub(crate) fn reset_election_timer(&mut self) {
        self.state.election_elapsed = 0;
        self.state.election_timeout = self.config.randomized_election_ticks();
    }

    pub fn log_command(&self, cmd: &Command) {
        match cmd {
            Command::Tick => {}
            Command::Heartbeat { .. } => {}
            Command::HeartbeatResponse { .. } => {}
            Command::AppendEntries { entries, .. } if entries.is_empty() => {}
            _ => {
                tracing::debug!(group = self.group, id = self.id, "start command {}", cmd);
            }
        };
    }

    pub fn send(&self, to: NodeId, cmd: Command) -> Result<()> {
        let msg = Message::new(self.group, Address::Peer(self.id), Address::Peer(to), cmd);
        self.rpc_tx.send(msg).map_err(RaftError::from)?;
        Ok(())
    }

    /// Send a command to every other member of the group, voters of both configurations included.
    pub fn send_all(&self, cmd: Command) -> Result<()> {
        for peer in self.membership.node_ids() {
            if peer != self.id {
                self.send(peer, cmd.clone())?;
            }
        }
        Ok(())
    }

    /// Answer a client request. Local clients are answered through the event loop, remote ones
    /// over the network.
    pub fn respond(
        &self,
        address: &Address,
        id: ClientRequestId,
        res: std::result::Result<Response, RaftError>,
    ) -> Result<()> {
        let to = match address {
            Address::Peer(peer) if *peer != self.id => Address::Peer(*peer),
            _ => Address::Client,
        };
        let msg = Message::new(
            self.group,
            Address::Peer(self.id),
            to,
            Command::ClientResponse { id, res },
        );
        self.rpc_tx.send(msg).map_err(RaftError::from)?;
        Ok(())
    }

    /// Acknowledge that a request from `address` now sits in the log at `index`.
    pub fn accept(&self, address: &Address, id: ClientRequestId, index: LogIndex, term: Term) -> Result<()> {
        match address {
            Address::Peer(peer) if *peer != self.id => {
                self.send(*peer, Command::ProposalAccepted { id, index, term })
            }
            _ => {
                self.fsm_tx.send(Instruction::Notify { id, index, term })?;
                Ok(())
            }
        }
    }

    /// Hand every committed entry not yet sent to the fsm driver.
    pub(crate) fn apply_committed(&mut self) -> Result<()> {
        if self.state.commit_index <= self.state.last_applied {
            return Ok(());
        }
        let start = self.state.last_applied + 1;
        let end = self.state.commit_index;
        let entries = self.log.range(start, end)?;
        if let Some(last) = entries.last() {
            self.state.last_applied = last.index;
            self.fsm_tx.send(Instruction::Apply { entries })?;
        }
        Ok(())
    }

    /// Recompute the effective membership from the log after entries were appended or removed.
    pub(crate) fn refresh_membership(&mut self) -> Result<()> {
        let (index, membership) = self.log.latest_membership()?;
        if index != self.membership_index || membership != self.membership {
            tracing::info!(group = self.group, id = self.id, ?membership, "membership changed");
            self.membership = membership;
            self.membership_index = index;
        }
        Ok(())
    }

    /// Write term, vote and commit to the store if they changed since the last write.
    pub(crate) fn persist_hard_state(&mut self) -> Result<()> {
        let hard_state = self.state.hard_state();
        if hard_state != self.persisted {
            self.log.set_hard_state(hard_state.clone())?;
            self.persisted = hard_state;
        }
        Ok(())
    }

    /// Record a snapshot produced by the fsm driver and drop the entries it covers, keeping
    /// `compaction_overhead` entries behind it so slightly lagging followers avoid a transfer.
    pub(crate) fn apply_snapshot_created(&mut self, index: LogIndex, term: Term, data: Vec<u8>) -> Result<()> {
        let current = self.log.snapshot().map(|meta| meta.index).unwrap_or(0);
        if index <= current {
            return Ok(());
        }
        let membership = self.log.membership_at(index)?;
        self.log.save_snapshot(SnapshotMeta { index, term, membership }, data)?;
        let compact_to = index.saturating_sub(self.config.compaction_overhead);
        if compact_to > 0 {
            self.log.compact(compact_to)?;
        }
        tracing::debug!(group = self.group, id = self.id, index, compact_to, "snapshot stored");
        Ok(())
    }

    /// Handle a vote request from a candidate with a term no greater than ours.
    pub(crate) fn apply_vote_request(
        &mut self,
        term: Term,
        candidate_id: NodeId,
        last_term: Term,
        last_index: LogIndex,
    ) -> Result<bool> {
        let up_to_date = (last_term, last_index) >= (self.log.last_term(), self.log.last_index());
        let can_vote = self.state.voted_for.map_or(true, |v| v == candidate_id);
        let granted = term == self.state.current_term && can_vote && up_to_date;
        if granted {
            self.state.voted_for = Some(candidate_id);
            self.persist_hard_state()?;
        }
        self.send(
            candidate_id,
            Command::VoteResponse {
                term: self.state.current_term,
                from: self.id,
                granted,
            },
        )?;
        Ok(granted)
    }

    /// Answer a leader with a stale term so it learns about the newer one.
    pub(crate) fn reject_stale(&self, leader_id: NodeId) -> Result<()> {
        self.send(
            leader_id,
            Command::AppendResponse {
                node_id: self.id,
                term: self.state.current_term,
                index: self.log.last_index(),
                success: false,
            },
        )
    }

    pub(crate) fn deny_vote(&self, candidate_id: NodeId) -> Result<()> {
        self.send(
            candidate_id,
            Command::VoteResponse {
                term: self.state.current_term,
                from: self.id,
                granted: false,
            },
        )
    }

    /// Pass a client command on to the leader, answering `NoLeader` when there is none.
    pub(crate) fn forward(&self, leader: Option<NodeId>, cmd: Command) -> Result<()> {
        let origin = |address: Address| match address {
            Address::Peer(peer) => Address::Peer(peer),
            _ => Address::Peer(self.id),
        };
        let (id, address, forwarded) = match cmd {
            Command::ClientRequest { id, address, proposal } => (
                id,
                address.clone(),
                Command::ClientRequest { id, address: origin(address), proposal },
            ),
            Command::ReadIndex { id, address } => (
                id,
                address.clone(),
                Command::ReadIndex { id, address: origin(address) },
            ),
            Command::ChangeMembership { id, address, change } => (
                id,
                address.clone(),
                Command::ChangeMembership { id, address: origin(address), change },
            ),
            Command::TransferLeader { id, address, target } => (
                id,
                address.clone(),
                Command::TransferLeader { id, address: origin(address), target },
            ),
            _ => return Ok(()),
        };
        match leader {
            Some(leader) if leader != self.id => self.send(leader, forwarded),
            _ => self.respond(&address, id, Err(RaftError::NoLeader)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

/// Handle to some variant of the state machine. Commands should always be dispatched to the
/// state machine via [`Apply`]. The concrete variant of the state machine should not be matched
/// on directly, as state transitions are handled entirely .
// Since applying command to the state machine can potentially result in any state transition,
// the result that we get back needs to be general to the possible return types -- easiest
// way here is just to store the differently sized structs per state in an enum, which will be
// sized to the largest variant.
#[derive(Debug)]
pub enum RaftHandle {
    /// An instance of the state machine in the follower role.
    Follower(Raft<Follower>),
    /// An instance of the state machine in the candidate role.
    Candidate(Raft<Candidate>),
    /// An instance of the state machine in the leader role.
    Leader(Raft<Leader>),
}

/// How a group's raft instance comes up.
#[derive(Debug, Clone)]
pub enum Bootstrap {
    /// Create the group with these initial voters. Ignored if the log already has state.
    Initial(Membership),
    /// Join an existing group, or restart from local state.
    Join,
}

impl RaftHandle {
    /// Obtain a new instance of raft initialized in the follower state, restoring any persisted
    /// state from the log.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: NodeId,
        group: GroupId,
        config: RaftConfig,
        log: RaftLog,
        bootstrap: Bootstrap,
        applied: LogIndex,
        rpc_tx: UnboundedSender<Message>,
        fsm_tx: UnboundedSender<Instruction>,
    ) -> Result<RaftHandle> {
        let raft = Raft::<Follower>::new(id, group, config, log, bootstrap, applied, rpc_tx, fsm_tx)?;
        Ok(RaftHandle::Follower(raft))
    }

    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower(_))
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate(_))
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader(_))
    }

    pub fn id(&self) -> NodeId {
        match self {
            RaftHandle::Follower(raft) => raft.id,
            RaftHandle::Candidate(raft) => raft.id,
            RaftHandle::Leader(raft) => raft.id,
        }
    }

    pub fn state(&self) -> &State {
        match self {
            RaftHandle::Follower(raft) => &raft.state,
            RaftHandle::Candidate(raft) => &raft.state,
            RaftHandle::Leader(raft) => &raft.state,
        }
    }

    pub fn membership(&self) -> &Membership {
        match self {
            RaftHandle::Follower(raft) => &raft.membership,
            RaftHandle::Candidate(raft) => &raft.membership,
            RaftHandle::Leader(raft) => &raft.membership,
        }
    }

    /// The leader this instance currently recognizes.
    pub fn leader(&self) -> Option<NodeId> {
        match self {
            RaftHandle::Follower(raft) => raft.role.leader_id,
            RaftHandle::Candidate(_) => None,
            RaftHandle::Leader(raft) => Some(raft.id),
        }
    }

    /// A leader is ready to serve once an entry of its own term has committed.
    pub fn is_ready_leader(&self) -> bool {
        match self {
            RaftHandle::Leader(raft) => raft.committed_in_term(),
            _ => false,
        }
    }

    fn current_term(&self) -> Term {
        self.state().current_term
    }

    /// Whether this node heard from a live leader recently enough to ignore disruptive votes.
    fn in_lease(&self) -> bool {
        match self {
            RaftHandle::Follower(raft) => {
                raft.config.check_quorum
                    && raft.role.leader_id.is_some()
                    && raft.state.election_elapsed < raft.config.election_ticks()
            }
            RaftHandle::Leader(raft) => raft.config.check_quorum,
            RaftHandle::Candidate(_) => false,
        }
    }

    fn into_follower(self) -> Result<Raft<Follower>> {
        Ok(match self {
            RaftHandle::Follower(raft) => raft,
            RaftHandle::Candidate(raft) => Raft::from(raft),
            RaftHandle::Leader(raft) => raft.step_down()?,
        })
    }

    fn persist_hard_state(&mut self) -> Result<()> {
        match self {
            RaftHandle::Follower(raft) => raft.persist_hard_state(),
            RaftHandle::Candidate(raft) => raft.persist_hard_state(),
            RaftHandle::Leader(raft) => raft.persist_hard_state(),
        }
    }

    fn dispatch(self, cmd: Command) -> Result<RaftHandle> {
        match self {
            RaftHandle::Follower(raft) => raft.apply(cmd),
            RaftHandle::Candidate(raft) => raft.apply(cmd),
            RaftHandle::Leader(raft) => raft.apply(cmd),
        }
    }
}

impl Apply for RaftHandle {
    fn apply(self, cmd: Command) -> Result<RaftHandle> {
        let handle = match cmd.term() {
            Some(term) if term > self.current_term() => {
                let disruptive = matches!(cmd, Command::VoteRequest { transfer: false, .. });
                if disruptive && self.in_lease() {
                    tracing::debug!(id = self.id(), term, "ignoring vote request inside leader lease");
                    return Ok(self);
                }
                let mut follower = self.into_follower()?;
                follower.term(term);
                follower.role.leader_id = cmd.leader();
                follower.reset_election_timer();
                RaftHandle::Follower(follower).dispatch(cmd)?
            }
            _ => self.dispatch(cmd)?,
        };

        let mut handle = handle;
        handle.persist_hard_state()?;
        Ok(handle)
    }
}

/// Applying a command is the basic way the state machine is moved forward. Each role implements
/// trait to handle how it responds (or does not respond) to particular commands.
pub trait Apply {
    /// Apply a command to the raft state machine, which may result in a new raft state. Errors
    /// should occur for only truly exceptional conditions, and are provided to allow the wrapping
    /// server containing this state machine to shut down gracefully.
    fn apply(self, cmd: Command) -> Result<RaftHandle>;
}

/// Proposals waiting for a leader to commit an entry of its own term before they can be read.
pub(crate) type PendingReads = VecDeque<(ClientRequestId, Address)>;
