use std::collections::{HashSet, VecDeque};

use crate::error::Result;
use crate::raft::candidate::Candidate;
use crate::raft::error::RaftError;
use crate::raft::follower::Follower;
use crate::raft::fsm::Instruction;
use crate::raft::membership::ConfigChange;
use crate::raft::progress::ReplicationProgress;
use crate::raft::rpc::{Address, Proposal, Response};
use crate::raft::{
    Apply, ClientRequestId, Command, EntryType, LogIndex, NodeId, PendingReads, Raft, RaftHandle,
    RaftRole, Role, Term,
};

/// A read-index request waiting for a quorum to confirm this node is still leader.
#[derive(Debug)]
pub struct ReadRequest {
    id: ClientRequestId,
    address: Address,
    seq: u64,
    index: LogIndex,
    acks: HashSet<NodeId>,
}

#[derive(Debug)]
pub struct Transfer {
    target: NodeId,
    elapsed: u64,
}

#[derive(Debug)]
pub struct Leader {
    pub progress: ReplicationProgress,
    /// Ticks since the last heartbeat.
    pub heartbeat_elapsed: u64,
    /// Index of the entry appended on election. Reads wait until it commits.
    pub noop_index: LogIndex,
    read_seq: u64,
    reads: VecDeque<ReadRequest>,
    waiting_reads: PendingReads,
    transfer: Option<Transfer>,
}

impl Role for Leader {
    fn term(&mut self, _term: Term) {}

    fn role(&self) -> RaftRole {
        RaftRole::Leader
    }
}

impl Raft<Leader> {
    pub(crate) fn on_transition(mut self) -> Result<RaftHandle> {
        let term = self.state.current_term;
        self.role.noop_index = self.log.append(term, EntryType::Control)?;
        self.replicate_all()?;
        self.maybe_commit()?;
        self.settle()
    }

    /// Whether an entry of the current term has committed.
    pub(crate) fn committed_in_term(&self) -> bool {
        self.state.commit_index >= self.role.noop_index
    }

    fn peers(&self) -> Vec<NodeId> {
        self.role.progress.node_ids()
    }

    #[tracing::instrument(level = "trace", skip(self), fields(group = self.group, id = self.id))]
    pub(crate) fn heartbeat(&mut self) -> Result<()> {
        self.role.heartbeat_elapsed = 0;
        for peer in self.peers() {
            let commit_index = self.state.commit_index.min(self.role.progress.matched(peer));
            self.send(
                peer,
                Command::Heartbeat {
                    term: self.state.current_term,
                    commit_index,
                    leader_id: self.id,
                    read_seq: self.role.read_seq,
                },
            )?;
        }
        Ok(())
    }

    fn replicate_all(&mut self) -> Result<()> {
        for peer in self.peers() {
            self.replicate(peer)?;
        }
        Ok(())
    }

    /// Send the peer whatever it is missing, or the latest snapshot if the entries it needs were
    /// compacted away.
    fn replicate(&mut self, peer: NodeId) -> Result<()> {
        let next = match self.role.progress.get(peer) {
            Some(progress) if progress.is_active() => progress.next(),
            _ => return Ok(()),
        };
        let last_index = self.log.last_index();
        let next = next.min(last_index + 1);
        let prev_log_index = next - 1;

        let prev_log_term = match self.log.term(prev_log_index)? {
            Some(term) => term,
            None => return self.send_snapshot(peer),
        };
        if next > last_index && self.role.progress.matched(peer) >= last_index {
            return Ok(());
        }

        let end = last_index.min(next + self.config.max_append_entries - 1);
        let entries = self.log.range(next, end)?;
        let sent = prev_log_index + entries.len() as u64;
        self.send(
            peer,
            Command::AppendEntries {
                term: self.state.current_term,
                leader_id: self.id,
                prev_log_index,
                prev_log_term,
                entries,
                commit_index: self.state.commit_index,
            },
        )?;
        self.role.progress.sent(peer, sent);
        Ok(())
    }

    fn send_snapshot(&mut self, peer: NodeId) -> Result<()> {
        match self.log.snapshot_data()? {
            Some((meta, data)) => {
                tracing::info!(group = self.group, id = self.id, peer, index = meta.index, "sending snapshot");
                let index = meta.index;
                self.send(
                    peer,
                    Command::InstallSnapshot {
                        term: self.state.current_term,
                        leader_id: self.id,
                        meta,
                        data,
                    },
                )?;
                self.role.progress.snapshot_sent(peer, index);
            }
            None => {
                tracing::warn!(group = self.group, id = self.id, peer, "peer needs compacted entries but no snapshot exists");
            }
        }
        Ok(())
    }

    /// Advance the commit index to the highest index stored on a quorum, as long as it belongs
    /// to the current term.
    fn maybe_commit(&mut self) -> Result<()> {
        let last_index = self.log.last_index();
        let id = self.id;
        let progress = &self.role.progress;
        let quorum_index = self.membership.committed_index(|node| {
            if node == id {
                last_index
            } else {
                progress.matched(node)
            }
        });
        if quorum_index <= self.state.commit_index
            || self.log.term(quorum_index)? != Some(self.state.current_term)
        {
            return Ok(());
        }

        tracing::trace!(group = self.group, quorum_index, "commit");
        self.state.commit_index = quorum_index;
        self.apply_committed()?;

        if self.membership.is_joint() && self.membership_index <= quorum_index {
            let membership = self.membership.leave_joint();
            tracing::info!(group = self.group, id = self.id, ?membership, "leaving joint configuration");
            self.log
                .append(self.state.current_term, EntryType::Config { membership })?;
            self.on_membership_change()?;
        }

        if self.committed_in_term() {
            while let Some((id, address)) = self.role.waiting_reads.pop_front() {
                self.read_index(id, address)?;
            }
        }
        Ok(())
    }

    fn on_membership_change(&mut self) -> Result<()> {
        self.refresh_membership()?;
        let peers: Vec<NodeId> = self
            .membership
            .node_ids()
            .into_iter()
            .filter(|node| *node != self.id)
            .collect();
        self.role.progress.sync(&peers, self.log.last_index());
        self.replicate_all()?;
        self.maybe_commit()
    }

    /// Step down once a configuration without this node has committed.
    fn settle(self) -> Result<RaftHandle> {
        let removed = !self.membership.is_joint()
            && self.membership_index <= self.state.commit_index
            && !self.is_voter();
        if removed {
            tracing::info!(group = self.group, id = self.id, "removed from group, stepping down");
            return Ok(RaftHandle::Follower(self.step_down()?));
        }
        Ok(RaftHandle::Leader(self))
    }

    /// Hand every pending request an error and become a follower of the same term.
    pub(crate) fn step_down(mut self) -> Result<Raft<Follower>> {
        let reads: Vec<(ClientRequestId, Address)> = self
            .role
            .reads
            .drain(..)
            .map(|read| (read.id, read.address))
            .chain(self.role.waiting_reads.drain(..))
            .collect();
        for (id, address) in reads {
            self.respond(&address, id, Err(RaftError::Aborted))?;
        }
        let mut raft: Raft<Follower> = Raft::from(self);
        raft.reset_election_timer();
        Ok(raft)
    }

    fn propose(&mut self, id: ClientRequestId, address: Address, proposal: Proposal) -> Result<()> {
        if self.role.transfer.is_some() {
            return self.respond(&address, id, Err(RaftError::NoLeader));
        }
        let term = self.state.current_term;
        let session = proposal.session();
        let index = self.log.append(
            term,
            EntryType::Entry {
                data: proposal.get(),
                session,
            },
        )?;
        self.accept(&address, id, index, term)?;
        self.replicate_all()?;
        self.maybe_commit()
    }

    fn read_index(&mut self, id: ClientRequestId, address: Address) -> Result<()> {
        if !self.committed_in_term() {
            self.role.waiting_reads.push_back((id, address));
            return Ok(());
        }
        let index = self.state.commit_index;
        if self.peers().is_empty() {
            return self.respond(&address, id, Ok(Response::ReadIndex(index)));
        }
        self.role.read_seq += 1;
        let mut acks = HashSet::new();
        acks.insert(self.id);
        self.role.reads.push_back(ReadRequest {
            id,
            address,
            seq: self.role.read_seq,
            index,
            acks,
        });
        self.heartbeat()
    }

    fn ack_reads(&mut self, from: NodeId, seq: u64) -> Result<()> {
        for read in self.role.reads.iter_mut() {
            if read.seq <= seq {
                read.acks.insert(from);
            }
        }
        while let Some(read) = self.role.reads.front() {
            if !self.membership.has_quorum(|node| read.acks.contains(&node)) {
                break;
            }
            if let Some(read) = self.role.reads.pop_front() {
                self.respond(&read.address, read.id, Ok(Response::ReadIndex(read.index)))?;
            }
        }
        Ok(())
    }

    fn change_membership(
        &mut self,
        id: ClientRequestId,
        address: Address,
        change: ConfigChange,
    ) -> Result<()> {
        if self.membership.is_joint() || self.membership_index > self.state.commit_index {
            return self.respond(&address, id, Err(RaftError::ConfigChangeInFlight));
        }
        let membership = match self.membership.enter_joint(&change) {
            Ok(membership) => membership,
            Err(err) => {
                tracing::warn!(group = self.group, ?change, %err, "rejected membership change");
                return self.respond(&address, id, Err(RaftError::Rejected));
            }
        };
        tracing::info!(group = self.group, id = self.id, ?change, "entering joint configuration");
        let term = self.state.current_term;
        let index = self.log.append(term, EntryType::Config { membership })?;
        self.accept(&address, id, index, term)?;
        self.on_membership_change()
    }

    fn transfer_leader(&mut self, id: ClientRequestId, address: Address, target: NodeId) -> Result<()> {
        if target == self.id {
            return self.respond(&address, id, Ok(Response::Done));
        }
        if !self.membership.is_voter(target) {
            return self.respond(&address, id, Err(RaftError::Rejected));
        }
        tracing::info!(group = self.group, id = self.id, target, "transferring leadership");
        self.role.transfer = Some(Transfer { target, elapsed: 0 });
        self.maybe_send_timeout_now(target)?;
        self.replicate(target)?;
        self.respond(&address, id, Ok(Response::Done))
    }

    fn maybe_send_timeout_now(&mut self, peer: NodeId) -> Result<()> {
        let caught_up = self.role.progress.matched(peer) >= self.log.last_index();
        if matches!(&self.role.transfer, Some(t) if t.target == peer) && caught_up {
            self.send(
                peer,
                Command::TimeoutNow {
                    term: self.state.current_term,
                    leader_id: self.id,
                },
            )?;
        }
        Ok(())
    }

    /// Step down if a quorum was not heard from during the last election timeout.
    fn check_quorum(self) -> Result<RaftHandle> {
        let mut raft = self;
        let mut active = raft.role.progress.take_active();
        active.insert(raft.id);
        if raft.config.check_quorum && !raft.membership.has_quorum(|node| active.contains(&node)) {
            tracing::warn!(group = raft.group, id = raft.id, "lost contact with quorum, stepping down");
            return Ok(RaftHandle::Follower(raft.step_down()?));
        }
        if let Some(transfer) = &mut raft.role.transfer {
            transfer.elapsed += raft.config.election_ticks();
            if transfer.elapsed > raft.config.election_ticks() {
                tracing::info!(group = raft.group, target = transfer.target, "leadership transfer timed out");
                raft.role.transfer = None;
            }
        }
        Ok(RaftHandle::Leader(raft))
    }
}

impl Apply for Raft<Leader> {
    #[tracing::instrument(level = "trace", skip(self), fields(group = self.group, id = self.id))]
    fn apply(mut self, cmd: Command) -> Result<RaftHandle> {
        self.log_command(&cmd);

        if matches!(cmd.term(), Some(term) if term < self.state.current_term) {
            match cmd {
                Command::AppendEntries { leader_id, .. }
                | Command::Heartbeat { leader_id, .. }
                | Command::InstallSnapshot { leader_id, .. } => self.reject_stale(leader_id)?,
                Command::VoteRequest { candidate_id, .. } => self.deny_vote(candidate_id)?,
                _ => {}
            }
            return Ok(RaftHandle::Leader(self));
        }

        match cmd {
            Command::Tick => {
                self.role.heartbeat_elapsed += 1;
                if self.role.heartbeat_elapsed >= self.config.heartbeat_ticks() {
                    self.heartbeat()?;
                }
                self.state.election_elapsed += 1;
                if self.state.election_elapsed >= self.config.election_ticks() {
                    self.state.election_elapsed = 0;
                    return self.check_quorum();
                }
                Ok(RaftHandle::Leader(self))
            }
            Command::AppendResponse {
                node_id,
                index,
                success,
                ..
            } => {
                self.role.progress.mark_active(node_id);
                if success {
                    self.role.progress.advance(node_id, index);
                    self.maybe_commit()?;
                    self.maybe_send_timeout_now(node_id)?;
                } else {
                    self.role.progress.reject(node_id, index);
                }
                self.replicate(node_id)?;
                self.settle()
            }
            Command::HeartbeatResponse {
                from,
                read_seq,
                last_index,
                ..
            } => {
                self.role.progress.mark_active(from);
                self.role.progress.resume(from);
                if last_index < self.log.last_index()
                    || self.role.progress.matched(from) < self.log.last_index()
                {
                    self.replicate(from)?;
                }
                self.ack_reads(from, read_seq)?;
                Ok(RaftHandle::Leader(self))
            }
            Command::SnapshotResponse { from, index, .. } => {
                self.role.progress.mark_active(from);
                self.role.progress.advance(from, index);
                self.maybe_commit()?;
                self.replicate(from)?;
                self.settle()
            }
            Command::VoteRequest { candidate_id, .. } => {
                self.deny_vote(candidate_id)?;
                Ok(RaftHandle::Leader(self))
            }
            Command::ClientRequest {
                id,
                address,
                proposal,
            } => {
                self.propose(id, address, proposal)?;
                Ok(RaftHandle::Leader(self))
            }
            Command::ReadIndex { id, address } => {
                self.read_index(id, address)?;
                Ok(RaftHandle::Leader(self))
            }
            Command::ChangeMembership {
                id,
                address,
                change,
            } => {
                self.change_membership(id, address, change)?;
                self.settle()
            }
            Command::TransferLeader {
                id,
                address,
                target,
            } => {
                self.transfer_leader(id, address, target)?;
                Ok(RaftHandle::Leader(self))
            }
            Command::ProposalAccepted { id, index, term } => {
                self.fsm_tx
                    .send(Instruction::Notify { id, index, term })
                    .map_err(RaftError::from)?;
                Ok(RaftHandle::Leader(self))
            }
            Command::SnapshotCreated { index, term, data } => {
                self.apply_snapshot_created(index, term, data)?;
                Ok(RaftHandle::Leader(self))
            }
            _ => Ok(RaftHandle::Leader(self)),
        }
    }
}

impl From<Raft<Candidate>> for Raft<Leader> {
    fn from(val: Raft<Candidate>) -> Raft<Leader> {
        let peers: Vec<NodeId> = val
            .membership
            .node_ids()
            .into_iter()
            .filter(|node| *node != val.id)
            .collect();
        let progress = ReplicationProgress::new(peers, val.log.last_index());
        let mut state = val.state;
        state.election_elapsed = 0;
        Raft {
            id: val.id,
            group: val.group,
            state,
            role: Leader {
                progress,
                heartbeat_elapsed: 0,
                noop_index: u64::MAX,
                read_seq: 0,
                reads: VecDeque::new(),
                waiting_reads: VecDeque::new(),
                transfer: None,
            },
            config: val.config,
            log: val.log,
            membership: val.membership,
            membership_index: val.membership_index,
            persisted: val.persisted,
            rpc_tx: val.rpc_tx,
            fsm_tx: val.fsm_tx,
        }
    }
}

impl From<Raft<Leader>> for Raft<Follower> {
    fn from(val: Raft<Leader>) -> Raft<Follower> {
        Raft {
            id: val.id,
            group: val.group,
            state: val.state,
            role: Follower { leader_id: None },
            config: val.config,
            log: val.log,
            membership: val.membership,
            membership_index: val.membership_index,
            persisted: val.persisted,
            rpc_tx: val.rpc_tx,
            fsm_tx: val.fsm_tx,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::UnboundedReceiver;
    use uuid::Uuid;

    use crate::raft::fsm::Instruction;
    use crate::raft::membership::ConfigChange;
    use crate::raft::rpc::{Address, Message, Proposal, Response};
    use crate::raft::test::{new_follower, voters};
    use crate::raft::{Apply, Command, RaftHandle};

    fn leader(
        ids: &[u64],
    ) -> (RaftHandle, UnboundedReceiver<Message>, UnboundedReceiver<Instruction>) {
        let (follower, rpc_rx, fsm_rx) = new_follower(1, voters(ids));
        let mut raft = follower.apply(Command::Timeout).unwrap();
        for peer in ids.iter().filter(|id| **id != 1) {
            raft = raft
                .apply(Command::VoteResponse {
                    term: 1,
                    from: *peer,
                    granted: true,
                })
                .unwrap();
        }
        assert!(raft.is_leader());
        (raft, rpc_rx, fsm_rx)
    }

    fn drain<T>(rx: &mut UnboundedReceiver<T>) -> Vec<T> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn ack(raft: RaftHandle, from: u64, index: u64) -> RaftHandle {
        raft.apply(Command::AppendResponse {
            node_id: from,
            term: 1,
            index,
            success: true,
        })
        .unwrap()
    }

    #[test]
    #[tracing_test::traced_test]
    fn single_node_commits_immediately() {
        let (leader, _rpc_rx, mut fsm_rx) = leader(&[1]);
        assert!(leader.is_ready_leader());
        let id = Uuid::new_v4();
        let leader = leader
            .apply(Command::ClientRequest {
                id,
                address: Address::Client,
                proposal: Proposal::new(b"x".to_vec()),
            })
            .unwrap();
        assert_eq!(leader.state().commit_index, 3);
        let notified = drain(&mut fsm_rx)
            .into_iter()
            .any(|i| matches!(i, Instruction::Notify { id: n, index: 3, term: 1 } if n == id));
        assert!(notified);
    }

    #[test]
    fn commits_on_quorum() {
        let (leader, _rpc_rx, _fsm_rx) = leader(&[1, 2, 3]);
        assert!(!leader.is_ready_leader());
        // noop at index 2
        let leader = ack(leader, 2, 2);
        assert_eq!(leader.state().commit_index, 2);
        assert!(leader.is_ready_leader());
    }

    #[test]
    fn read_index_waits_for_quorum() {
        let (leader, mut rpc_rx, _fsm_rx) = leader(&[1, 2, 3]);
        let leader = ack(leader, 2, 2);
        drain(&mut rpc_rx);

        let id = Uuid::new_v4();
        let leader = leader
            .apply(Command::ReadIndex {
                id,
                address: Address::Client,
            })
            .unwrap();
        let seq = drain(&mut rpc_rx)
            .into_iter()
            .find_map(|msg| match msg.command {
                Command::Heartbeat { read_seq, .. } => Some(read_seq),
                _ => None,
            })
            .unwrap();
        let _leader = leader
            .apply(Command::HeartbeatResponse {
                term: 1,
                from: 3,
                read_seq: seq,
                last_index: 2,
            })
            .unwrap();
        let responses: Vec<_> = drain(&mut rpc_rx)
            .into_iter()
            .filter_map(|msg| match msg.command {
                Command::ClientResponse { id: r, res } if r == id => Some(res),
                _ => None,
            })
            .collect();
        assert_eq!(responses, vec![Ok(Response::ReadIndex(2))]);
    }

    #[test]
    fn membership_change_goes_through_joint() {
        let (leader, _rpc_rx, _fsm_rx) = leader(&[1, 2, 3]);
        let leader = ack(leader, 2, 2);
        let leader = leader
            .apply(Command::ChangeMembership {
                id: Uuid::new_v4(),
                address: Address::Client,
                change: ConfigChange::AddNode {
                    id: 4,
                    address: "127.0.0.1:4".into(),
                },
            })
            .unwrap();
        assert!(leader.membership().is_joint());

        // a second change is refused until the first completes
        let leader = leader
            .apply(Command::ChangeMembership {
                id: Uuid::new_v4(),
                address: Address::Client,
                change: ConfigChange::RemoveNode { id: 2 },
            })
            .unwrap();
        assert!(leader.membership().voters.contains_key(&4));
        assert!(leader.membership().voters.contains_key(&2));

        // joint entry at 3 needs majorities of {1,2,3} and {1,2,3,4}
        let leader = ack(leader, 2, 3);
        let leader = ack(leader, 3, 3);
        assert!(!leader.membership().is_joint());
        assert_eq!(leader.membership().node_ids(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn steps_down_on_higher_term() {
        let (leader, _rpc_rx, _fsm_rx) = leader(&[1, 2, 3]);
        let follower = leader
            .apply(Command::AppendResponse {
                node_id: 2,
                term: 5,
                index: 0,
                success: false,
            })
            .unwrap();
        assert!(follower.is_follower());
        assert_eq!(follower.state().current_term, 5);
    }

    #[test]
    fn steps_down_without_quorum() {
        let (mut leader, _rpc_rx, _fsm_rx) = leader(&[1, 2, 3]);
        for _ in 0..10 {
            leader = leader.apply(Command::Tick).unwrap();
        }
        assert!(leader.is_follower());
    }

    #[test]
    #[tracing_test::traced_test]
    fn transfer_sends_timeout_now_when_caught_up() {
        let (leader, mut rpc_rx, _fsm_rx) = leader(&[1, 2, 3]);
        let leader = ack(leader, 2, 2);
        drain(&mut rpc_rx);
        let _leader = leader
            .apply(Command::TransferLeader {
                id: Uuid::new_v4(),
                address: Address::Client,
                target: 2,
            })
            .unwrap();
        let sent = drain(&mut rpc_rx)
            .into_iter()
            .any(|msg| msg.to == Address::Peer(2) && matches!(msg.command, Command::TimeoutNow { .. }));
        assert!(sent);
    }
}
