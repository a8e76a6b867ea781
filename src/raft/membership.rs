//! Group configuration with joint consensus. A change first moves the group into a joint
//! configuration where decisions need a majority of both the outgoing and the incoming voters,
//! and once that configuration commits the leader appends the incoming voters alone.

use std::collections::BTreeMap;

use crate::error::{FurrowError, Result};
use crate::raft::{LogIndex, NodeId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigChange {
    AddNode { id: NodeId, address: String },
    RemoveNode { id: NodeId },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    /// Voters of the current, or incoming when joint, configuration with their raft addresses.
    pub voters: BTreeMap<NodeId, String>,
    /// Voters of the configuration being left.
    pub outgoing: Option<BTreeMap<NodeId, String>>,
}

impl Membership {
    pub fn new(voters: BTreeMap<NodeId, String>) -> Self {
        Membership {
            voters,
            outgoing: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.voters.is_empty() && self.outgoing.is_none()
    }

    pub fn is_joint(&self) -> bool {
        self.outgoing.is_some()
    }

    pub fn is_voter(&self, id: NodeId) -> bool {
        self.voters.contains_key(&id)
            || self.outgoing.as_ref().map_or(false, |o| o.contains_key(&id))
    }

    /// Every node that takes part in decisions, ascending.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.voters.keys().copied().collect();
        if let Some(outgoing) = &self.outgoing {
            ids.extend(outgoing.keys().copied());
            ids.sort_unstable();
            ids.dedup();
        }
        ids
    }

    pub fn address(&self, id: NodeId) -> Option<&str> {
        self.voters
            .get(&id)
            .or_else(|| self.outgoing.as_ref().and_then(|o| o.get(&id)))
            .map(String::as_str)
    }

    /// All known (id, address) pairs.
    pub fn addresses(&self) -> BTreeMap<NodeId, String> {
        let mut all = self.outgoing.clone().unwrap_or_default();
        all.extend(self.voters.clone());
        all
    }

    /// Whether the nodes accepted by `acked` form a majority of every active configuration.
    pub fn has_quorum<F: Fn(NodeId) -> bool>(&self, acked: F) -> bool {
        let majority = |voters: &BTreeMap<NodeId, String>| {
            let count = voters.keys().filter(|id| acked(**id)).count();
            count > voters.len() / 2
        };
        majority(&self.voters) && self.outgoing.as_ref().map_or(true, majority)
    }

    /// Whether the nodes rejected by `rejected` make a majority impossible in some configuration.
    pub fn quorum_impossible<F: Fn(NodeId) -> bool>(&self, rejected: F) -> bool {
        let impossible = |voters: &BTreeMap<NodeId, String>| {
            let count = voters.keys().filter(|id| rejected(**id)).count();
            voters.len() - count <= voters.len() / 2
        };
        impossible(&self.voters) || self.outgoing.as_ref().map_or(false, impossible)
    }

    /// The highest index stored on a majority of every active configuration.
    pub fn committed_index<F: Fn(NodeId) -> LogIndex>(&self, matched: F) -> LogIndex {
        let quorum_index = |voters: &BTreeMap<NodeId, String>| {
            let mut indices: Vec<LogIndex> = voters.keys().map(|id| matched(*id)).collect();
            if indices.is_empty() {
                return 0;
            }
            indices.sort_by(|a, b| b.cmp(a));
            indices[indices.len() / 2]
        };
        let incoming = quorum_index(&self.voters);
        match &self.outgoing {
            Some(outgoing) => incoming.min(quorum_index(outgoing)),
            None => incoming,
        }
    }

    /// The joint configuration that applies `change`.
    pub fn enter_joint(&self, change: &ConfigChange) -> Result<Membership> {
        if self.is_joint() {
            return Err(FurrowError::ConfigChangeInFlight);
        }
        let mut incoming = self.voters.clone();
        match change {
            ConfigChange::AddNode { id, address } => {
                incoming.insert(*id, address.clone());
            }
            ConfigChange::RemoveNode { id } => {
                incoming.remove(id);
            }
        }
        if incoming.is_empty() {
            return Err(FurrowError::InvalidConfig("cannot remove the last voter".into()));
        }
        Ok(Membership {
            voters: incoming,
            outgoing: Some(self.voters.clone()),
        })
    }

    pub fn leave_joint(&self) -> Membership {
        Membership::new(self.voters.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voters(ids: &[NodeId]) -> Membership {
        Membership::new(ids.iter().map(|id| (*id, format!("127.0.0.1:{}", id))).collect())
    }

    #[test]
    fn committed_index_single_config() {
        let membership = voters(&[1, 2, 3]);
        let matched = |id| match id {
            1 => 5,
            2 => 4,
            _ => 1,
        };
        assert_eq!(membership.committed_index(matched), 4);
    }

    #[test]
    fn joint_requires_both_majorities() {
        let membership = voters(&[1, 2, 3])
            .enter_joint(&ConfigChange::AddNode {
                id: 4,
                address: "127.0.0.1:4".into(),
            })
            .unwrap();
        assert!(membership.is_joint());
        assert_eq!(membership.node_ids(), vec![1, 2, 3, 4]);

        // 1 and 2 are a majority of the old config but not of {1, 2, 3, 4}
        assert!(!membership.has_quorum(|id| id == 1 || id == 2));
        assert!(membership.has_quorum(|id| id != 4));
        assert_eq!(membership.committed_index(|id| if id <= 2 { 7 } else { 3 }), 3);
    }

    #[test]
    fn one_change_at_a_time() {
        let joint = voters(&[1, 2, 3])
            .enter_joint(&ConfigChange::RemoveNode { id: 3 })
            .unwrap();
        let res = joint.enter_joint(&ConfigChange::RemoveNode { id: 2 });
        assert_eq!(res, Err(FurrowError::ConfigChangeInFlight));

        let left = joint.leave_joint();
        assert!(!left.is_joint());
        assert_eq!(left.node_ids(), vec![1, 2]);
    }

    #[test]
    fn quorum_impossible() {
        let membership = voters(&[1, 2, 3]);
        assert!(!membership.quorum_impossible(|id| id == 2));
        assert!(membership.quorum_impossible(|id| id != 1));
    }
}
