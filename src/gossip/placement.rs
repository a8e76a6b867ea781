use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use crate::gossip::ring::Ring;
use crate::host::LeaderListener;
use crate::raft::{GroupId, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlacementState {
    /// This node does not know yet that the system group holds its ID.
    Bootstrapping,
    Assigned,
}

#[derive(Debug)]
struct Inner {
    state: PlacementState,
    node_id: NodeId,
    ring: Ring,
    nodes: BTreeMap<NodeId, String>,
    leaders: HashMap<GroupId, NodeId>,
    /// Groups whose leadership was requested for a node and has not moved there yet.
    targets: HashMap<GroupId, NodeId>,
    /// Last node chosen for each placed group.
    placed: HashMap<GroupId, NodeId>,
}

impl Inner {
    /// Weights are the groups each node leads plus those on their way to it.
    fn reweigh(&mut self) {
        let mut load: HashMap<NodeId, u64> = HashMap::new();
        for node in self.leaders.values() {
            *load.entry(*node).or_default() += 1;
        }
        for (group, node) in &self.targets {
            if self.leaders.get(group) != Some(node) {
                *load.entry(*node).or_default() += 1;
            }
        }
        for (id, address) in &self.nodes {
            self.ring.set_weight(address, load.get(id).copied().unwrap_or(0));
        }
    }
}

/// Tracks which node leads which group and chooses initial leaders for new groups. Installed on
/// the host as its leader listener.
#[derive(Debug)]
pub struct Placement {
    inner: Mutex<Inner>,
}

impl Placement {
    pub fn new(virtual_nodes: usize) -> Placement {
        Placement {
            inner: Mutex::new(Inner {
                state: PlacementState::Bootstrapping,
                node_id: 0,
                ring: Ring::new(virtual_nodes),
                nodes: BTreeMap::new(),
                leaders: HashMap::new(),
                targets: HashMap::new(),
                placed: HashMap::new(),
            }),
        }
    }

    pub fn state(&self) -> PlacementState {
        self.inner.lock().state
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.lock().node_id
    }

    /// Records that the system group holds `node_id` for this node. Returns whether this moved the
    /// node out of bootstrapping; an assigned node stays assigned.
    pub fn assign(&self, node_id: NodeId) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == PlacementState::Assigned {
            return false;
        }
        inner.state = PlacementState::Assigned;
        inner.node_id = node_id;
        tracing::info!(node_id, "placement assigned");
        true
    }

    pub fn add_node(&self, id: NodeId, address: &str) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.nodes.insert(id, address.to_string()) {
            if old != address {
                inner.ring.remove(&old);
            }
        }
        inner.ring.add(address);
        inner.reweigh();
    }

    pub fn remove_node(&self, id: NodeId) {
        let mut inner = self.inner.lock();
        if let Some(address) = inner.nodes.remove(&id) {
            inner.ring.remove(&address);
        }
    }

    pub fn nodes(&self) -> BTreeMap<NodeId, String> {
        self.inner.lock().nodes.clone()
    }

    pub fn weight(&self, id: NodeId) -> Option<u64> {
        let inner = self.inner.lock();
        let address = inner.nodes.get(&id)?;
        inner.ring.weight(address)
    }

    pub fn leader(&self, group: GroupId) -> Option<NodeId> {
        self.inner.lock().leaders.get(&group).copied()
    }

    /// The node [`Placement::pick`] last chose to lead `group`.
    pub fn placed(&self, group: GroupId) -> Option<NodeId> {
        self.inner.lock().placed.get(&group).copied()
    }

    /// Whether `group` still waits for leadership to reach its chosen node.
    pub fn is_pending(&self, group: GroupId) -> bool {
        self.inner.lock().targets.contains_key(&group)
    }

    /// Chooses the least loaded node to lead `group` and counts the group against it.
    pub fn pick(&self, group: GroupId) -> Option<NodeId> {
        let mut inner = self.inner.lock();
        let address = inner.ring.get_least(&group.to_string())?.to_string();
        let id = inner
            .nodes
            .iter()
            .find(|(_, a)| **a == address)
            .map(|(id, _)| *id)?;
        inner.targets.insert(group, id);
        inner.placed.insert(group, id);
        inner.reweigh();
        tracing::debug!(group, node = id, "placed group leader");
        Some(id)
    }
}

impl LeaderListener for Placement {
    fn on_leader_change(&self, group: GroupId, leader: Option<NodeId>) {
        let mut inner = self.inner.lock();
        match leader {
            Some(leader) => {
                inner.leaders.insert(group, leader);
                if inner.targets.get(&group) == Some(&leader) {
                    inner.targets.remove(&group);
                }
            }
            None => {
                inner.leaders.remove(&group);
            }
        }
        inner.reweigh();
    }
}
