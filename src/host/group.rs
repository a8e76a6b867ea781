use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};

use crate::machine::MachineKind;
use crate::raft::fsm::Fsm;
use crate::raft::server::{GroupStatus, Request, ResponseTx, Server};
use crate::raft::tcp::AddressBook;
use crate::raft::{GroupId, LogIndex, NodeId};

/// Notified whenever the leader of a hosted group changes.
pub trait LeaderListener: Send + Sync {
    fn on_leader_change(&self, group: GroupId, leader: Option<NodeId>);
}

/// A group replica running on this host.
pub(crate) struct GroupHandle {
    pub kind: MachineKind,
    pub client_tx: mpsc::Sender<(Request, ResponseTx)>,
    pub status: watch::Receiver<GroupStatus>,
    pub applied: watch::Receiver<LogIndex>,
    pub fsm: Arc<dyn Fsm>,
    pub shutdown: broadcast::Sender<()>,
    pub server: Mutex<Option<Server>>,
}

/// Follows a group's status: records member addresses for the transport and reports leader
/// changes. Ends when the group stops.
pub(crate) async fn watch_status(
    group: GroupId,
    mut status: watch::Receiver<GroupStatus>,
    addresses: AddressBook,
    listener: Option<Arc<dyn LeaderListener>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut leader = None;
    loop {
        let current = status.borrow_and_update().clone();
        {
            let mut book = addresses.write();
            for (id, address) in current.membership.addresses() {
                if book.get(&id) != Some(&address) {
                    book.insert(id, address);
                }
            }
        }
        if current.leader != leader {
            leader = current.leader;
            tracing::info!(group, ?leader, term = current.term, "leader changed");
            if let Some(listener) = &listener {
                listener.on_leader_change(group, leader);
            }
        }

        tokio::select! {
            _ = shutdown.recv() => break,
            changed = status.changed() => if changed.is_err() {
                break;
            },
        }
    }
    tracing::debug!(group, "status watcher stopped");
}
