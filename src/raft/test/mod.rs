use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::raft::config::RaftConfig;
use crate::raft::fsm::Instruction;
use crate::raft::log::RaftLog;
use crate::raft::membership::Membership;
use crate::raft::rpc::Message;
use crate::raft::store::MemoryStore;
use crate::raft::{Bootstrap, NodeId, RaftHandle};

pub fn voters(ids: &[NodeId]) -> Membership {
    Membership::new(
        ids.iter()
            .map(|id| (*id, format!("127.0.0.1:{}", 7000 + id)))
            .collect(),
    )
}

/// A replica of group 1 bootstrapped with `membership`, backed by memory.
pub fn new_follower(
    id: NodeId,
    membership: Membership,
) -> (RaftHandle, UnboundedReceiver<Message>, UnboundedReceiver<Instruction>) {
    let (rpc_tx, rpc_rx) = mpsc::unbounded_channel();
    let (fsm_tx, fsm_rx) = mpsc::unbounded_channel();
    let log = RaftLog::new(Box::new(MemoryStore::new())).unwrap();
    let bootstrap = if membership.is_voter(id) {
        Bootstrap::Initial(membership)
    } else {
        Bootstrap::Join
    };
    let raft = RaftHandle::new(
        id,
        1,
        RaftConfig::default(),
        log,
        bootstrap,
        0,
        rpc_tx,
        fsm_tx,
    )
    .unwrap();
    (raft, rpc_rx, fsm_rx)
}

#[test]
fn restart_restores_hard_state() {
    let (rpc_tx, _rpc_rx) = mpsc::unbounded_channel();
    let (fsm_tx, _fsm_rx) = mpsc::unbounded_channel();
    let mut store = MemoryStore::new();
    crate::raft::store::Store::set_hard_state(
        &mut store,
        &crate::raft::store::HardState {
            term: 3,
            voted_for: Some(2),
            commit: 0,
        },
    )
    .unwrap();
    let log = RaftLog::new(Box::new(store)).unwrap();
    let raft = RaftHandle::new(1, 1, RaftConfig::default(), log, Bootstrap::Join, 0, rpc_tx, fsm_tx)
        .unwrap();
    assert_eq!(raft.state().current_term, 3);
    assert_eq!(raft.state().voted_for, Some(2));
    assert!(raft.membership().is_empty());
}
