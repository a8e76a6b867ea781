use tokio::sync::mpsc::UnboundedSender;

use crate::error::Result;
use crate::raft::candidate::Candidate;
use crate::raft::config::RaftConfig;
use crate::raft::error::RaftError;
use crate::raft::fsm::Instruction;
use crate::raft::log::RaftLog;
use crate::raft::rpc::Message;
use crate::raft::store::SnapshotMeta;
use crate::raft::{
    Apply, Bootstrap, Command, Entry, EntryType, GroupId, LogIndex, NodeId, Raft, RaftHandle,
    RaftRole, Role, State, Term,
};

#[derive(Debug)]
pub struct Follower {
    /// The leader of the current term, once heard from.
    pub leader_id: Option<NodeId>,
}

impl Role for Follower {
    fn term(&mut self, _term: Term) {
        self.leader_id = None;
    }

    fn role(&self) -> RaftRole {
        RaftRole::Follower
    }
}

impl Raft<Follower> {
    /// Restore a group replica from its log. `applied` is the index the state machine reported
    /// when it was opened; committed entries past it are handed to the fsm driver again.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: NodeId,
        group: GroupId,
        config: RaftConfig,
        mut log: RaftLog,
        bootstrap: Bootstrap,
        applied: LogIndex,
        rpc_tx: UnboundedSender<Message>,
        fsm_tx: UnboundedSender<Instruction>,
    ) -> Result<Raft<Follower>> {
        let mut hard_state = log.hard_state()?;
        if let Bootstrap::Initial(membership) = bootstrap {
            if log.is_empty() && hard_state.term == 0 {
                tracing::info!(group, id, ?membership, "bootstrapping group");
                log.append(0, EntryType::Config { membership })?;
                hard_state.commit = 1;
                log.set_hard_state(hard_state.clone())?;
            }
        }

        let (membership_index, membership) = log.latest_membership()?;
        let mut last_applied = applied;
        if let Some(meta) = log.snapshot().cloned() {
            if applied < meta.index && applied < log.first_index().saturating_sub(1) {
                if let Some((meta, data)) = log.snapshot_data()? {
                    tracing::info!(group, id, index = meta.index, "state machine is behind the log, restoring snapshot");
                    fsm_tx.send(Instruction::Restore { index: meta.index, data }).map_err(RaftError::from)?;
                    last_applied = meta.index;
                }
            }
        }
        let commit_index = hard_state.commit.max(last_applied).min(log.last_index());

        // stagger the first election so the lowest id campaigns first
        let rank = membership.node_ids().iter().position(|n| *n == id).unwrap_or(0) as u64;
        let election_timeout = if hard_state.term == 0 {
            config.election_ticks() + rank * 3
        } else {
            config.randomized_election_ticks()
        };

        let mut raft = Raft {
            id,
            group,
            state: State {
                current_term: hard_state.term,
                voted_for: hard_state.voted_for,
                commit_index,
                last_applied,
                election_elapsed: 0,
                election_timeout,
            },
            role: Follower { leader_id: None },
            config,
            log,
            membership,
            membership_index,
            persisted: hard_state,
            rpc_tx,
            fsm_tx,
        };
        raft.apply_committed()?;
        raft.persist_hard_state()?;
        Ok(raft)
    }

    fn campaign(self, transfer: bool) -> Result<RaftHandle> {
        if !self.is_voter() {
            let mut raft = self;
            raft.reset_election_timer();
            return Ok(RaftHandle::Follower(raft));
        }
        let raft: Raft<Candidate> = Raft::from(self);
        raft.seek_election(transfer)
    }

    /// Append entries from the leader, returning the last index known to match its log.
    fn append_entries(
        &mut self,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<Entry>,
        leader_commit: LogIndex,
    ) -> Result<Option<LogIndex>> {
        // committed entries are identical on every replica
        let matches = prev_log_index <= self.state.commit_index
            || self.log.term(prev_log_index)? == Some(prev_log_term);
        if !matches {
            return Ok(None);
        }

        let last_new = prev_log_index + entries.len() as u64;
        let mut pending = Vec::new();
        for entry in entries {
            if !pending.is_empty() {
                pending.push(entry);
                continue;
            }
            if entry.index <= self.state.commit_index
                || self.log.term(entry.index)? == Some(entry.term)
            {
                continue;
            }
            pending.push(entry);
        }
        if let Some(first) = pending.first() {
            let first_index = first.index;
            if first_index <= self.log.last_index() {
                tracing::debug!(group = self.group, id = self.id, first_index, "truncating conflicting entries");
                self.log.truncate(first_index)?;
            }
            let has_config = pending
                .iter()
                .any(|e| matches!(e.entry_type, EntryType::Config { .. }));
            self.log.extend(pending)?;
            if has_config || self.membership_index >= first_index {
                self.refresh_membership()?;
            }
        }

        let commit = leader_commit.min(last_new);
        if commit > self.state.commit_index {
            self.state.commit_index = commit;
            self.apply_committed()?;
        }
        Ok(Some(last_new))
    }

    fn install_snapshot(&mut self, meta: SnapshotMeta, data: Vec<u8>) -> Result<LogIndex> {
        if meta.index <= self.state.commit_index {
            return Ok(self.state.commit_index);
        }
        let index = meta.index;
        tracing::info!(group = self.group, id = self.id, index, "installing snapshot from leader");
        self.membership = meta.membership.clone();
        self.membership_index = index;
        self.log.restore(meta, data.clone())?;
        self.state.commit_index = index;
        self.state.last_applied = index;
        self.fsm_tx
            .send(Instruction::Restore { index, data })
            .map_err(RaftError::from)?;
        Ok(index)
    }
}

impl Apply for Raft<Follower> {
    #[tracing::instrument(level = "trace", skip(self), fields(group = self.group, id = self.id))]
    fn apply(mut self, cmd: Command) -> Result<RaftHandle> {
        self.log_command(&cmd);
        match cmd {
            Command::Tick => {
                self.state.election_elapsed += 1;
                if self.needs_election() {
                    return self.campaign(false);
                }
                Ok(RaftHandle::Follower(self))
            }
            Command::Timeout => self.campaign(false),
            Command::TimeoutNow { term, .. } if term == self.state.current_term => {
                tracing::info!(group = self.group, id = self.id, "leadership handed over, campaigning");
                self.campaign(true)
            }
            Command::VoteRequest {
                term,
                candidate_id,
                last_term,
                last_index,
                ..
            } => {
                if term < self.state.current_term {
                    self.deny_vote(candidate_id)?;
                    return Ok(RaftHandle::Follower(self));
                }
                if self.apply_vote_request(term, candidate_id, last_term, last_index)? {
                    self.reset_election_timer();
                }
                Ok(RaftHandle::Follower(self))
            }
            Command::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                commit_index,
            } => {
                if term < self.state.current_term {
                    self.reject_stale(leader_id)?;
                    return Ok(RaftHandle::Follower(self));
                }
                self.role.leader_id = Some(leader_id);
                self.reset_election_timer();

                let res = self.append_entries(prev_log_index, prev_log_term, entries, commit_index)?;
                let (index, success) = match res {
                    Some(index) => (index, true),
                    None => (prev_log_index.saturating_sub(1).min(self.log.last_index()), false),
                };
                self.send(
                    leader_id,
                    Command::AppendResponse {
                        node_id: self.id,
                        term: self.state.current_term,
                        index,
                        success,
                    },
                )?;
                Ok(RaftHandle::Follower(self))
            }
            Command::Heartbeat {
                term,
                commit_index,
                leader_id,
                read_seq,
            } => {
                if term < self.state.current_term {
                    self.reject_stale(leader_id)?;
                    return Ok(RaftHandle::Follower(self));
                }
                self.role.leader_id = Some(leader_id);
                self.reset_election_timer();

                let commit = commit_index.min(self.log.last_index());
                if commit > self.state.commit_index {
                    self.state.commit_index = commit;
                    self.apply_committed()?;
                }
                self.send(
                    leader_id,
                    Command::HeartbeatResponse {
                        term: self.state.current_term,
                        from: self.id,
                        read_seq,
                        last_index: self.log.last_index(),
                    },
                )?;
                Ok(RaftHandle::Follower(self))
            }
            Command::InstallSnapshot {
                term,
                leader_id,
                meta,
                data,
            } => {
                if term < self.state.current_term {
                    self.send(
                        leader_id,
                        Command::SnapshotResponse {
                            term: self.state.current_term,
                            from: self.id,
                            index: 0,
                        },
                    )?;
                    return Ok(RaftHandle::Follower(self));
                }
                self.role.leader_id = Some(leader_id);
                self.reset_election_timer();
                let index = self.install_snapshot(meta, data)?;
                self.send(
                    leader_id,
                    Command::SnapshotResponse {
                        term: self.state.current_term,
                        from: self.id,
                        index,
                    },
                )?;
                Ok(RaftHandle::Follower(self))
            }
            Command::ClientRequest { .. }
            | Command::ReadIndex { .. }
            | Command::ChangeMembership { .. }
            | Command::TransferLeader { .. } => {
                self.forward(self.role.leader_id, cmd)?;
                Ok(RaftHandle::Follower(self))
            }
            Command::ProposalAccepted { id, index, term } => {
                self.fsm_tx
                    .send(Instruction::Notify { id, index, term })
                    .map_err(RaftError::from)?;
                Ok(RaftHandle::Follower(self))
            }
            Command::SnapshotCreated { index, term, data } => {
                self.apply_snapshot_created(index, term, data)?;
                Ok(RaftHandle::Follower(self))
            }
            _ => Ok(RaftHandle::Follower(self)),
        }
    }
}

impl From<Raft<Follower>> for Raft<Candidate> {
    fn from(val: Raft<Follower>) -> Raft<Candidate> {
        let election = crate::raft::election::Election::new(val.membership.clone());
        Raft {
            id: val.id,
            group: val.group,
            state: val.state,
            role: Candidate { election },
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
    use crate::raft::test::{new_follower, voters};
    use crate::raft::{Apply, Command, Entry, EntryType, RaftHandle};

    #[test]
    fn follower_to_candidate() {
        let (follower, _rpc_rx, _fsm_rx) = new_follower(1, voters(&[1, 2, 3]));
        let id = follower.id();
        match follower.apply(Command::Timeout).unwrap() {
            RaftHandle::Candidate(candidate) => assert_eq!(id, candidate.id),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn follower_to_leader_single_node_cluster() {
        let (follower, _rpc_rx, _fsm_rx) = new_follower(1, voters(&[1]));
        let id = follower.id();
        match follower.apply(Command::Timeout).unwrap() {
            RaftHandle::Leader(leader) => assert_eq!(id, leader.id),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn follower_noop() {
        let (follower, _rpc_rx, _fsm_rx) = new_follower(1, voters(&[1, 2, 3]));
        let id = follower.id();
        match follower.apply(Command::Noop).unwrap() {
            RaftHandle::Follower(follower) => assert_eq!(id, follower.id),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn non_voter_never_campaigns() {
        let (follower, _rpc_rx, _fsm_rx) = new_follower(4, voters(&[1, 2, 3]));
        let follower = follower.apply(Command::Timeout).unwrap();
        assert!(follower.is_follower());
    }

    #[test]
    fn appends_and_commits_entries() {
        let (follower, mut rpc_rx, _fsm_rx) = new_follower(2, voters(&[1, 2, 3]));
        let entry = Entry {
            entry_type: EntryType::Entry {
                data: b"x".to_vec(),
                session: None,
            },
            term: 1,
            index: 2,
        };
        let follower = follower
            .apply(Command::AppendEntries {
                term: 1,
                leader_id: 1,
                prev_log_index: 1,
                prev_log_term: 0,
                entries: vec![entry],
                commit_index: 2,
            })
            .unwrap();
        assert_eq!(follower.state().commit_index, 2);
        assert_eq!(follower.leader(), Some(1));

        let msg = rpc_rx.try_recv().unwrap();
        assert_eq!(
            msg.command,
            Command::AppendResponse {
                node_id: 2,
                term: 1,
                index: 2,
                success: true
            }
        );
    }

    #[test]
    fn rejects_mismatched_prev_entry() {
        let (follower, mut rpc_rx, _fsm_rx) = new_follower(2, voters(&[1, 2, 3]));
        let follower = follower
            .apply(Command::AppendEntries {
                term: 1,
                leader_id: 1,
                prev_log_index: 5,
                prev_log_term: 1,
                entries: vec![],
                commit_index: 5,
            })
            .unwrap();
        assert_eq!(follower.state().commit_index, 1);
        match rpc_rx.try_recv().unwrap().command {
            Command::AppendResponse { success, index, .. } => {
                assert!(!success);
                assert_eq!(index, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn grants_one_vote_per_term() {
        let (follower, mut rpc_rx, _fsm_rx) = new_follower(2, voters(&[1, 2, 3]));
        let follower = follower
            .apply(Command::VoteRequest {
                term: 1,
                candidate_id: 1,
                last_term: 0,
                last_index: 1,
                transfer: false,
            })
            .unwrap();
        let follower = follower
            .apply(Command::VoteRequest {
                term: 1,
                candidate_id: 3,
                last_term: 0,
                last_index: 1,
                transfer: false,
            })
            .unwrap();
        assert_eq!(follower.state().voted_for, Some(1));
        let granted: Vec<bool> = std::iter::from_fn(|| rpc_rx.try_recv().ok())
            .filter_map(|msg| match msg.command {
                Command::VoteResponse { granted, .. } => Some(granted),
                _ => None,
            })
            .collect();
        assert_eq!(granted, vec![true, false]);
    }

    #[test]
    fn denies_vote_to_stale_log() {
        let (follower, _rpc_rx, _fsm_rx) = new_follower(2, voters(&[1, 2, 3]));
        let follower = follower
            .apply(Command::VoteRequest {
                term: 1,
                candidate_id: 1,
                last_term: 0,
                last_index: 0,
                transfer: false,
            })
            .unwrap();
        assert_eq!(follower.state().voted_for, None);
    }
}
