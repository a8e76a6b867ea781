use std::collections::HashMap;

use crate::raft::membership::Membership;
use crate::raft::NodeId;

#[derive(Debug)]
pub struct Election {
    membership: Membership,
    votes: HashMap<NodeId, bool>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ElectionStatus {
    Elected,
    Voting,
    Defeated,
}

impl Election {
    pub fn new(membership: Membership) -> Election {
        let mut election = Election {
            membership,
            votes: HashMap::new(),
        };

        election.reset();
        election
    }

    pub fn reset(&mut self) {
        self.votes.clear();
    }

    pub fn vote(&mut self, id: NodeId, vote: bool) {
        if self.membership.is_voter(id) {
            self.votes.insert(id, vote);
        }
    }

    pub fn election_status(&self) -> ElectionStatus {
        if self
            .membership
            .has_quorum(|id| self.votes.get(&id) == Some(&true))
        {
            ElectionStatus::Elected
        } else if self
            .membership
            .quorum_impossible(|id| self.votes.get(&id) == Some(&false))
        {
            ElectionStatus::Defeated
        } else {
            ElectionStatus::Voting
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn election(ids: &[NodeId]) -> Election {
        Election::new(Membership::new(
            ids.iter().map(|id| (*id, String::new())).collect(),
        ))
    }

    #[test]
    fn single_node_elected() {
        let mut election = election(&[1]);
        election.vote(1, true);
        assert_eq!(election.election_status(), ElectionStatus::Elected);
    }

    #[test]
    fn majority() {
        let mut election = election(&[1, 2, 3]);
        election.vote(1, true);
        assert_eq!(election.election_status(), ElectionStatus::Voting);
        election.vote(3, true);
        assert_eq!(election.election_status(), ElectionStatus::Elected);
    }

    #[test]
    fn defeated() {
        let mut election = election(&[1, 2, 3]);
        election.vote(1, true);
        election.vote(2, false);
        election.vote(3, false);
        assert_eq!(election.election_status(), ElectionStatus::Defeated);
    }

    #[test]
    fn ignores_non_voters() {
        let mut election = election(&[1, 2, 3]);
        election.vote(1, true);
        election.vote(9, true);
        assert_eq!(election.election_status(), ElectionStatus::Voting);
    }
}
