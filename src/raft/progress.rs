use std::collections::{HashMap, HashSet, VecDeque};

use crate::raft::{LogIndex, NodeId};

/// Leader-side view of how far each peer's log matches its own.
#[derive(Debug)]
pub struct ReplicationProgress {
    progress: HashMap<NodeId, NodeProgress>,
}

impl ReplicationProgress {
    pub fn new(nodes: Vec<NodeId>, last_index: LogIndex) -> ReplicationProgress {
        let mut progress = HashMap::new();
        for node_id in nodes {
            progress.insert(node_id, NodeProgress::new(node_id, last_index));
        }
        ReplicationProgress { progress }
    }

    pub fn get(&self, node_id: NodeId) -> Option<&NodeProgress> {
        self.progress.get(&node_id)
    }

    pub fn remove(&mut self, node_id: NodeId) -> Option<NodeProgress> {
        self.progress.remove(&node_id)
    }

    pub fn insert(&mut self, node_id: NodeId, last_index: LogIndex) {
        self.progress
            .insert(node_id, NodeProgress::new(node_id, last_index));
    }

    /// Track exactly `nodes`, keeping the state of peers already known.
    pub fn sync(&mut self, nodes: &[NodeId], last_index: LogIndex) {
        self.progress.retain(|id, _| nodes.contains(id));
        for id in nodes {
            if !self.progress.contains_key(id) {
                self.insert(*id, last_index);
            }
        }
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.progress.keys().copied().collect()
    }

    pub fn matched(&self, node_id: NodeId) -> LogIndex {
        self.progress.get(&node_id).map_or(0, NodeProgress::matched)
    }

    fn update<F: FnOnce(NodeProgress) -> NodeProgress>(&mut self, node_id: NodeId, f: F) {
        if let Some(node) = self.progress.remove(&node_id) {
            self.progress.insert(node_id, f(node));
        }
    }

    /// Record a successful append up to `index`.
    pub fn advance(&mut self, node_id: NodeId, index: LogIndex) {
        self.update(node_id, |node| node.advance(index));
    }

    /// Record a rejected append. `hint` is the last index the peer holds.
    pub fn reject(&mut self, node_id: NodeId, hint: LogIndex) {
        self.update(node_id, |node| node.reject(hint));
    }

    /// Record that entries up to `last` were sent.
    pub fn sent(&mut self, node_id: NodeId, last: LogIndex) {
        if let Some(node) = self.progress.get_mut(&node_id) {
            node.sent(last);
        }
    }

    pub fn snapshot_sent(&mut self, node_id: NodeId, index: LogIndex) {
        self.update(node_id, |node| node.into_snapshot(index));
    }

    /// The peer answered a heartbeat, so a paused probe may try again.
    pub fn resume(&mut self, node_id: NodeId) {
        if let Some(NodeProgress::Probe(progress)) = self.progress.get_mut(&node_id) {
            progress.state.reset();
        }
    }

    pub fn mark_active(&mut self, node_id: NodeId) {
        if let Some(node) = self.progress.get_mut(&node_id) {
            node.set_active(true);
        }
    }

    /// Peers heard from since the last call, clearing the flags.
    pub fn take_active(&mut self) -> HashSet<NodeId> {
        let mut active = HashSet::new();
        for (id, node) in self.progress.iter_mut() {
            if node.is_recent() {
                active.insert(*id);
            }
            node.set_active(false);
        }
        active
    }
}

#[derive(Debug)]
pub enum NodeProgress {
    Probe(Progress<Probe>),
    Replicate(Progress<Replicate>),
    Snapshot(Progress<Snapshot>),
}

impl NodeProgress {
    pub fn new(node_id: NodeId, last_index: LogIndex) -> NodeProgress {
        NodeProgress::Probe(Progress::new(node_id, last_index))
    }

    /// Advance the progress to the provided index.
    pub fn advance(self, idx: LogIndex) -> Self {
        match self {
            NodeProgress::Probe(mut prog) => {
                prog.increment(idx);
                Self::Replicate(Progress::from(prog))
            }
            NodeProgress::Replicate(mut prog) => {
                prog.increment(idx);
                prog.state.free(idx);
                Self::Replicate(prog)
            }
            NodeProgress::Snapshot(mut prog) => {
                prog.increment(idx);
                if prog.matched >= prog.state.pending {
                    Self::Probe(Progress::from(prog))
                } else {
                    Self::Snapshot(prog)
                }
            }
        }
    }

    pub fn reject(self, hint: LogIndex) -> Self {
        match self {
            NodeProgress::Probe(mut prog) => {
                prog.decrement(hint);
                prog.state.reset();
                Self::Probe(prog)
            }
            NodeProgress::Replicate(prog) => {
                let mut prog = Progress::<Probe>::from(prog);
                prog.decrement(hint);
                Self::Probe(prog)
            }
            NodeProgress::Snapshot(prog) => Self::Snapshot(prog),
        }
    }

    fn into_snapshot(self, index: LogIndex) -> Self {
        let (node_id, active, matched) = match &self {
            NodeProgress::Probe(p) => (p.node_id, p.active, p.matched),
            NodeProgress::Replicate(p) => (p.node_id, p.active, p.matched),
            NodeProgress::Snapshot(p) => (p.node_id, p.active, p.matched),
        };
        NodeProgress::Snapshot(Progress {
            node_id,
            state: Snapshot { pending: index },
            active,
            matched,
            next: index + 1,
        })
    }

    fn sent(&mut self, last: LogIndex) {
        match self {
            NodeProgress::Probe(prog) => prog.state.paused = true,
            NodeProgress::Replicate(prog) => {
                if last >= prog.next {
                    prog.state.inflight.push_back(last);
                    prog.next = last + 1;
                }
            }
            NodeProgress::Snapshot(_) => {}
        }
    }

    /// Whether more entries may be sent to the peer right now.
    pub fn is_active(&self) -> bool {
        match self {
            NodeProgress::Probe(prog) => prog.is_active(),
            NodeProgress::Replicate(prog) => prog.is_active(),
            NodeProgress::Snapshot(prog) => prog.is_active(),
        }
    }

    pub fn matched(&self) -> LogIndex {
        match self {
            NodeProgress::Probe(prog) => prog.matched,
            NodeProgress::Replicate(prog) => prog.matched,
            NodeProgress::Snapshot(prog) => prog.matched,
        }
    }

    pub fn next(&self) -> LogIndex {
        match self {
            NodeProgress::Probe(prog) => prog.next,
            NodeProgress::Replicate(prog) => prog.next,
            NodeProgress::Snapshot(prog) => prog.next,
        }
    }

    fn is_recent(&self) -> bool {
        match self {
            NodeProgress::Probe(prog) => prog.active,
            NodeProgress::Replicate(prog) => prog.active,
            NodeProgress::Snapshot(prog) => prog.active,
        }
    }

    fn set_active(&mut self, active: bool) {
        match self {
            NodeProgress::Probe(prog) => prog.active = active,
            NodeProgress::Replicate(prog) => prog.active = active,
            NodeProgress::Snapshot(prog) => prog.active = active,
        }
    }
}

pub trait ProgressState {
    fn reset(&mut self);
}

pub const MAX_INFLIGHT: usize = 5;

#[derive(Debug)]
pub struct Progress<T: ProgressState> {
    pub node_id: NodeId,
    pub state: T,
    /// Heard from the peer since the last quorum check.
    pub active: bool,
    /// Highest index known to match the leader's log.
    pub matched: LogIndex,
    /// Next index to send.
    pub next: LogIndex,
}

impl<T: ProgressState> Progress<T> {
    pub fn reset(&mut self) {
        self.active = false;
        self.state.reset();
    }

    pub fn increment(&mut self, index: LogIndex) -> bool {
        let updated = if self.matched < index {
            self.matched = index;
            true
        } else {
            false
        };

        if self.next < index + 1 {
            self.next = index + 1;
        }

        updated
    }

    fn decrement(&mut self, hint: LogIndex) {
        let next = (hint + 1).min(self.next.saturating_sub(1));
        self.next = next.max(self.matched + 1).max(1);
    }
}

#[derive(Debug)]
pub struct Probe {
    paused: bool,
}

impl ProgressState for Probe {
    fn reset(&mut self) {
        self.paused = false
    }
}

impl Progress<Probe> {
    fn new(node_id: NodeId, last_index: LogIndex) -> Progress<Probe> {
        Progress {
            node_id,
            state: Probe { paused: false },
            active: false,
            matched: 0,
            next: last_index + 1,
        }
    }

    fn is_active(&self) -> bool {
        !self.state.paused
    }
}

impl From<Progress<Replicate>> for Progress<Probe> {
    fn from(progress: Progress<Replicate>) -> Self {
        Progress {
            node_id: progress.node_id,
            state: Probe { paused: false },
            active: progress.active,
            matched: progress.matched,
            next: progress.matched + 1,
        }
    }
}

impl From<Progress<Snapshot>> for Progress<Probe> {
    fn from(progress: Progress<Snapshot>) -> Self {
        Progress {
            node_id: progress.node_id,
            state: Probe { paused: false },
            active: progress.active,
            matched: progress.matched,
            next: progress.matched + 1,
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct Snapshot {
    /// Index of the snapshot in flight. Replication is halted until the peer acknowledges it.
    pub pending: LogIndex,
}

impl ProgressState for Snapshot {
    fn reset(&mut self) {}
}

impl Progress<Snapshot> {
    pub fn is_active(&self) -> bool {
        false
    }
}

#[derive(Debug)]
pub struct Replicate {
    pub inflight: VecDeque<LogIndex>,
}

impl Replicate {
    fn free(&mut self, index: LogIndex) {
        while matches!(self.inflight.front(), Some(i) if *i <= index) {
            self.inflight.pop_front();
        }
    }
}

impl ProgressState for Replicate {
    fn reset(&mut self) {
        self.inflight.clear();
    }
}

impl Progress<Replicate> {
    /// The replication is active as long as there are empty spots in the inflight buffer.
    pub fn is_active(&self) -> bool {
        self.state.inflight.len() < MAX_INFLIGHT
    }
}

impl From<Progress<Probe>> for Progress<Replicate> {
    fn from(progress: Progress<Probe>) -> Self {
        Progress {
            node_id: progress.node_id,
            state: Replicate {
                inflight: VecDeque::with_capacity(MAX_INFLIGHT),
            },
            active: progress.active,
            matched: progress.matched,
            next: progress.next,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::raft::progress::{NodeProgress, ReplicationProgress, MAX_INFLIGHT};

    #[test]
    fn starts_active() {
        let progress = NodeProgress::new(0, 0);
        assert!(progress.is_active());
    }

    #[test]
    fn starts_in_probe() {
        match NodeProgress::new(0, 0) {
            NodeProgress::Probe(_) => {}
            _ => panic!(),
        }
    }

    #[test]
    fn increments_to_higher() {
        let progress = NodeProgress::new(0, 0);
        let progress = progress.advance(666);
        assert!(progress.is_active());
        assert_eq!(progress.matched(), 666);
        assert_eq!(progress.next(), 667);
    }

    #[test]
    fn probe_pauses_until_answered() {
        let mut progress = ReplicationProgress::new(vec![2], 10);
        progress.sent(2, 10);
        assert!(!progress.get(2).unwrap().is_active());
        progress.resume(2);
        assert!(progress.get(2).unwrap().is_active());
    }

    #[test]
    fn reject_backs_off_to_hint() {
        let mut progress = ReplicationProgress::new(vec![2], 10);
        progress.reject(2, 4);
        assert_eq!(progress.get(2).unwrap().next(), 5);
    }

    #[test]
    fn replicate_limits_inflight() {
        let mut progress = ReplicationProgress::new(vec![2], 0);
        progress.advance(2, 1);
        for i in 0..MAX_INFLIGHT as u64 {
            assert!(progress.get(2).unwrap().is_active());
            progress.sent(2, 2 + i);
        }
        assert!(!progress.get(2).unwrap().is_active());
        progress.advance(2, 3);
        assert!(progress.get(2).unwrap().is_active());
    }

    #[test]
    fn snapshot_then_probe() {
        let mut progress = ReplicationProgress::new(vec![2], 30);
        progress.snapshot_sent(2, 20);
        assert!(!progress.get(2).unwrap().is_active());
        progress.advance(2, 20);
        match progress.get(2).unwrap() {
            NodeProgress::Probe(p) => assert_eq!(p.next, 21),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn active_flags() {
        let mut progress = ReplicationProgress::new(vec![2, 3], 0);
        progress.mark_active(3);
        let active = progress.take_active();
        assert!(active.contains(&3) && !active.contains(&2));
        assert!(progress.take_active().is_empty());
    }
}
