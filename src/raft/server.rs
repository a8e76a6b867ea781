//! Runs one replica of a group: the raft state machine driven by a tick timer, the fsm driver, and
//! the plumbing between them, the node's transport, and local clients.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::RemoteHandle;
use futures::FutureExt;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{mpsc, oneshot, watch};
use tracing_futures::Instrument;
use uuid::Uuid;

use crate::error::Result;
use crate::raft::config::RaftConfig;
use crate::raft::error::RaftError;
use crate::raft::fsm::{self, Fsm};
use crate::raft::log::RaftLog;
use crate::raft::membership::{ConfigChange, Membership};
use crate::raft::rpc::{Address, Message, Proposal, Response};
use crate::raft::{
    Apply, Bootstrap, ClientRequestId, Command, GroupId, LogIndex, NodeId, RaftHandle, Term,
};

pub type ResponseTx = oneshot::Sender<std::result::Result<Response, RaftError>>;

/// A request from a local client to the group.
#[derive(Debug)]
pub enum Request {
    Propose(Proposal),
    ReadIndex,
    ChangeMembership(ConfigChange),
    TransferLeader(NodeId),
}

impl Request {
    fn into_command(self, id: ClientRequestId) -> Command {
        let address = Address::Client;
        match self {
            Request::Propose(proposal) => Command::ClientRequest {
                id,
                address,
                proposal,
            },
            Request::ReadIndex => Command::ReadIndex { id, address },
            Request::ChangeMembership(change) => Command::ChangeMembership {
                id,
                address,
                change,
            },
            Request::TransferLeader(target) => Command::TransferLeader {
                id,
                address,
                target,
            },
        }
    }
}

/// What a replica currently knows about its group.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GroupStatus {
    pub leader: Option<NodeId>,
    /// This replica is leader and has committed an entry of its term.
    pub ready: bool,
    pub term: Term,
    pub commit: LogIndex,
    pub membership: Membership,
}

impl GroupStatus {
    fn of(raft: &RaftHandle) -> Self {
        GroupStatus {
            leader: raft.leader(),
            ready: raft.is_ready_leader(),
            term: raft.state().current_term,
            commit: raft.state().commit_index,
            membership: raft.membership().clone(),
        }
    }
}

pub struct ServerRunOpts {
    pub id: NodeId,
    pub group: GroupId,
    pub config: RaftConfig,
    pub log: RaftLog,
    pub bootstrap: Bootstrap,
    pub fsm: Arc<dyn Fsm>,
    /// Messages for other nodes.
    pub tcp_tx: UnboundedSender<Message>,
    /// Messages for this group from other nodes.
    pub tcp_rx: UnboundedReceiver<Message>,
    pub client_rx: mpsc::Receiver<(Request, ResponseTx)>,
    pub shutdown: tokio::sync::broadcast::Sender<()>,
}

/// A running replica. Dropping it stops the replica's tasks.
pub struct Server {
    pub status: watch::Receiver<GroupStatus>,
    pub applied: watch::Receiver<LogIndex>,
    event_loop: RemoteHandle<Result<RaftHandle>>,
    driver: RemoteHandle<Result<Arc<dyn Fsm>>>,
}

impl Server {
    pub fn run(opts: ServerRunOpts) -> Result<Server> {
        let ServerRunOpts {
            id,
            group,
            config,
            log,
            bootstrap,
            fsm,
            tcp_tx,
            tcp_rx,
            client_rx,
            shutdown,
        } = opts;
        let span = tracing::info_span!("group", group, node = id);

        let applied = fsm.open()?;
        let (rpc_tx, rpc_rx) = mpsc::unbounded_channel();

        // state machine driver
        let (fsm_tx, fsm_rx) = mpsc::unbounded_channel();
        let (applied_tx, applied_rx) = watch::channel(applied);
        let driver = fsm::Driver::new(
            group,
            fsm_rx,
            rpc_tx.clone(),
            fsm,
            applied_tx,
            config.snapshot_entries,
        );
        let (task, driver) = driver
            .run(shutdown.subscribe())
            .instrument(span.clone())
            .remote_handle();
        tokio::spawn(task);

        // main event loop
        let tick = config.tick();
        let raft = RaftHandle::new(id, group, config, log, bootstrap, applied, rpc_tx, fsm_tx)?;
        let (status_tx, status_rx) = watch::channel(GroupStatus::of(&raft));
        let (task, event_loop) = event_loop(
            shutdown.subscribe(),
            raft,
            tick,
            tcp_tx,
            rpc_rx,
            tcp_rx,
            client_rx,
            status_tx,
        )
        .instrument(span)
        .remote_handle();
        tokio::spawn(task);

        Ok(Server {
            status: status_rx,
            applied: applied_rx,
            event_loop,
            driver,
        })
    }

    /// Wait for both tasks to stop after a shutdown signal.
    pub async fn join(self) -> Result<(RaftHandle, Arc<dyn Fsm>)> {
        let (raft, fsm) = tokio::join!(self.event_loop, self.driver);
        Ok((raft?, fsm?))
    }
}

#[allow(clippy::too_many_arguments)]
async fn event_loop(
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
    mut raft: RaftHandle,
    tick: std::time::Duration,
    tcp_tx: UnboundedSender<Message>,
    mut rpc_rx: UnboundedReceiver<Message>,
    mut tcp_rx: UnboundedReceiver<Message>,
    mut client_rx: mpsc::Receiver<(Request, ResponseTx)>,
    status_tx: watch::Sender<GroupStatus>,
) -> Result<RaftHandle> {
    let mut step_interval = tokio::time::interval(tick);
    let mut requests = HashMap::<ClientRequestId, ResponseTx>::new();

    loop {
        tokio::select! {
            // shutdown
            _ = shutdown.recv() => break,
            // tick state machine
            _ = step_interval.tick() => {
                raft = raft.apply(Command::Tick)?;
                // callers that gave up
                requests.retain(|_, tx| !tx.is_closed());
            },
            // intra-cluster communication
            Some(msg) = tcp_rx.recv() => match msg.command {
                Command::ClientResponse { id, res } => resolve(&mut requests, id, res),
                command => raft = raft.apply(command)?,
            },
            // outgoing messages from raft
            Some(msg) = rpc_rx.recv() => {
                match msg {
                    Message { to: Address::Peer(_), .. } => tcp_tx.send(msg).map_err(RaftError::from)?,
                    Message { to: Address::Local, .. } => raft = raft.apply(msg.command)?,
                    Message { to: Address::Client, command: Command::ClientResponse { id, res }, .. } => {
                        resolve(&mut requests, id, res)
                    }
                    _ => tracing::warn!(?msg, "unexpected message"),
                }
            },
            // incoming messages from clients
            Some((request, res)) = client_rx.recv() => {
                let id = Uuid::new_v4();
                requests.insert(id, res);
                raft = raft.apply(request.into_command(id))?;
            },
        }

        let status = GroupStatus::of(&raft);
        if *status_tx.borrow() != status {
            status_tx.send_replace(status);
        }
    }

    Ok(raft)
}

fn resolve(
    requests: &mut HashMap<ClientRequestId, ResponseTx>,
    id: ClientRequestId,
    res: std::result::Result<Response, RaftError>,
) {
    match requests.remove(&id) {
        // the caller may have timed out already
        Some(tx) => {
            let _ = tx.send(res);
        }
        None => tracing::trace!(%id, "response for unknown request"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tempfile::tempdir;
    use tokio::sync::{mpsc, oneshot};

    use super::*;
    use crate::machine::{Envelope, ServerMachine};
    use crate::raft::store::MemoryStore;
    use crate::raft::test::voters;

    fn fast_config() -> RaftConfig {
        RaftConfig {
            rtt_millis: 10,
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn single_replica_elects_itself_and_applies() -> Result<()> {
        let dir = tempdir()?;
        let fsm: Arc<dyn Fsm> = Arc::new(ServerMachine::new(dir.path(), 7, 1));
        let (tcp_tx, _tcp_out) = mpsc::unbounded_channel();
        let (_tcp_in, tcp_rx) = mpsc::unbounded_channel();
        let (client_tx, client_rx) = mpsc::channel(16);
        let (shutdown, _) = tokio::sync::broadcast::channel(1);

        let mut server = Server::run(ServerRunOpts {
            id: 1,
            group: 7,
            config: fast_config(),
            log: RaftLog::new(Box::new(MemoryStore::new()))?,
            bootstrap: Bootstrap::Initial(voters(&[1])),
            fsm: fsm.clone(),
            tcp_tx,
            tcp_rx,
            client_rx,
            shutdown: shutdown.clone(),
        })?;

        tokio::time::timeout(Duration::from_secs(5), async {
            while !server.status.borrow().ready {
                server.status.changed().await.unwrap();
            }
        })
        .await?;
        assert_eq!(server.status.borrow().leader, Some(1));

        let body = serde_json::to_vec(&serde_json::json!({"id": 7, "farmRefs": []}))?;
        let (tx, rx) = oneshot::channel();
        client_tx
            .send((Request::Propose(Proposal::new(Envelope::update(body).encode()?)), tx))
            .await
            .unwrap();
        let res = rx.await?;
        assert!(matches!(res, Ok(Response::Applied { .. })));
        assert!(fsm.applied_index() >= 3);

        shutdown.send(()).unwrap();
        let (raft, _) = server.join().await?;
        assert!(raft.is_leader());
        Ok(())
    }
}
