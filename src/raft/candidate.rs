use crate::error::Result;
use crate::raft::election::{Election, ElectionStatus};
use crate::raft::error::RaftError;
use crate::raft::follower::Follower;
use crate::raft::fsm::Instruction;
use crate::raft::{Apply, Command, Raft, RaftHandle, RaftRole, Role, Term};

#[derive(Debug)]
pub struct Candidate {
    pub election: Election,
}

impl Raft<Candidate> {
    /// Start a new term and ask every voter for its vote. `transfer` marks an election the
    /// previous leader asked for, which peers honor even while they still trust that leader.
    #[tracing::instrument(level = "debug", skip(self), fields(group = self.group, id = self.id))]
    pub(crate) fn seek_election(mut self, transfer: bool) -> Result<RaftHandle> {
        let term = self.state.current_term + 1;
        self.term(term);
        self.state.voted_for = Some(self.id);
        self.reset_election_timer();
        self.role.election = Election::new(self.membership.clone());
        self.persist_hard_state()?;
        tracing::info!(term, "starting election");

        let from = self.id;
        self.send_all(Command::VoteRequest {
            term,
            candidate_id: from,
            last_term: self.log.last_term(),
            last_index: self.log.last_index(),
            transfer,
        })?;

        // Vote for self,
        self.apply(Command::VoteResponse {
            from,
            term,
            granted: true,
        })
    }
}

impl Role for Candidate {
    fn term(&mut self, _term: Term) {
        self.election.reset();
    }

    fn role(&self) -> RaftRole {
        RaftRole::Candidate
    }
}

impl Apply for Raft<Candidate> {
    #[tracing::instrument(level = "trace", skip(self), fields(group = self.group, id = self.id))]
    fn apply(mut self, cmd: Command) -> Result<RaftHandle> {
        self.log_command(&cmd);

        match cmd {
            Command::Tick => {
                self.state.election_elapsed += 1;
                if self.needs_election() {
                    tracing::debug!("election timed out");
                    return self.seek_election(false);
                }

                Ok(RaftHandle::Candidate(self))
            }
            Command::Timeout => self.seek_election(false),
            Command::VoteRequest { candidate_id, .. } => {
                // already voted for ourselves this term
                self.deny_vote(candidate_id)?;
                Ok(RaftHandle::Candidate(self))
            }
            Command::VoteResponse {
                granted,
                from,
                term,
            } => {
                if term != self.state.current_term {
                    return Ok(RaftHandle::Candidate(self));
                }
                self.role.election.vote(from, granted);
                match self.role.election.election_status() {
                    ElectionStatus::Elected => {
                        tracing::info!(group = self.group, id = self.id, term, "i have been elected leader");
                        let raft = Raft::from(self);
                        raft.on_transition()
                    }
                    ElectionStatus::Voting => Ok(RaftHandle::Candidate(self)),
                    ElectionStatus::Defeated => {
                        tracing::info!(group = self.group, id = self.id, term, "i have been defeated");
                        Ok(RaftHandle::Follower(Raft::from(self)))
                    }
                }
            }
            // While waiting for votes, a candidate may receive an AppendEntries RPC from another
            // server claiming to be leader. If the leader’s term is at least as large as the
            // candidate’s current term, then the candidate recognizes the leader as legitimate
            // and returns to follower state.
            Command::AppendEntries { term, leader_id, .. }
            | Command::Heartbeat { term, leader_id, .. }
            | Command::InstallSnapshot { term, leader_id, .. } => {
                if term < self.state.current_term {
                    self.reject_stale(leader_id)?;
                    return Ok(RaftHandle::Candidate(self));
                }
                let mut raft: Raft<Follower> = Raft::from(self);
                raft.role.leader_id = Some(leader_id);
                raft.apply(cmd)
            }
            Command::ClientRequest { .. }
            | Command::ReadIndex { .. }
            | Command::ChangeMembership { .. }
            | Command::TransferLeader { .. } => {
                self.forward(None, cmd)?;
                Ok(RaftHandle::Candidate(self))
            }
            Command::ProposalAccepted { id, index, term } => {
                self.fsm_tx
                    .send(Instruction::Notify { id, index, term })
                    .map_err(RaftError::from)?;
                Ok(RaftHandle::Candidate(self))
            }
            Command::SnapshotCreated { index, term, data } => {
                self.apply_snapshot_created(index, term, data)?;
                Ok(RaftHandle::Candidate(self))
            }
            _ => Ok(RaftHandle::Candidate(self)),
        }
    }
}

impl From<Raft<Candidate>> for Raft<Follower> {
    fn from(val: Raft<Candidate>) -> Raft<Follower> {
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
