//! A node's host for replica groups. The host owns the raft log storage and the transport shared by
//! every group on the node, starts groups on demand, and routes proposals and reads to them.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::error::{FurrowError, Result};
use crate::machine::{MachineKind, Query};
use crate::raft::config::RaftConfig;
use crate::raft::error::RaftError;
use crate::raft::log::RaftLog;
use crate::raft::membership::{ConfigChange, Membership};
use crate::raft::rpc::{Proposal, Response};
use crate::raft::server::{Request, Server, ServerRunOpts};
use crate::raft::store::SledStore;
use crate::raft::tcp::{self, AddressBook, Router};
use crate::raft::{Bootstrap, GroupId, LogIndex, NodeId, Term};
use crate::storage::Engine;
use crate::util::Shutdown;

mod group;
mod session;

use group::GroupHandle;
pub use group::LeaderListener;
pub use session::Session;

/// Pause between attempts while a group has no leader.
const RETRY_INTERVAL: Duration = Duration::from_millis(50);
/// Pause between membership change attempts while another change is in flight.
const CONFIG_CHANGE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct HostOpts {
    pub id: NodeId,
    /// Raft listen address, `host:port`.
    pub address: String,
    pub data_dir: PathBuf,
    pub raft: RaftConfig,
    pub propose_timeout: Duration,
    pub read_timeout: Duration,
}

/// What the host reports about one of its groups.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupInfo {
    pub group: GroupId,
    pub kind: MachineKind,
    pub leader: Option<NodeId>,
    pub is_leader: bool,
    pub term: Term,
    pub commit: LogIndex,
    pub applied: LogIndex,
    pub membership: Membership,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterInfo {
    pub node_id: NodeId,
    pub address: String,
    pub groups: Vec<GroupInfo>,
}

pub struct Host {
    id: NodeId,
    address: String,
    data_dir: PathBuf,
    raft: RaftConfig,
    propose_timeout: Duration,
    read_timeout: Duration,
    engine: Engine,
    router: Router,
    addresses: AddressBook,
    tcp_tx: mpsc::UnboundedSender<crate::raft::rpc::Message>,
    groups: RwLock<HashMap<GroupId, Arc<GroupHandle>>>,
    sessions: RwLock<HashMap<GroupId, Session>>,
    listener: Option<Arc<dyn LeaderListener>>,
    shutdown: Shutdown,
    start_lock: Mutex<()>,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("groups", &self.groups.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Host {
    /// Binds the raft listener and starts the node-wide transport. Groups are started separately.
    pub async fn start(opts: HostOpts, listener: Option<Arc<dyn LeaderListener>>) -> Result<Arc<Host>> {
        opts.raft.validate()?;
        let engine = Engine::open(opts.data_dir.join("nodehost").join("wal"))?;
        let tcp = TcpListener::bind(&opts.address).await?;
        tracing::info!(id = opts.id, address = %opts.address, "host listening");

        let shutdown = Shutdown::new();
        let router: Router = Default::default();
        let addresses: AddressBook = Default::default();
        addresses.write().insert(opts.id, opts.address.clone());
        let (tcp_tx, tcp_rx) = mpsc::unbounded_channel();

        let span = tracing::info_span!("host", node = opts.id);
        tokio::spawn(
            tcp::receive_task(shutdown.subscribe(), tcp, router.clone()).instrument(span.clone()),
        );
        tokio::spawn(
            tcp::send_task(shutdown.subscribe(), opts.id, addresses.clone(), tcp_rx)
                .instrument(span),
        );

        Ok(Arc::new(Host {
            id: opts.id,
            address: opts.address,
            data_dir: opts.data_dir,
            raft: opts.raft,
            propose_timeout: opts.propose_timeout,
            read_timeout: opts.read_timeout,
            engine,
            router,
            addresses,
            tcp_tx,
            groups: Default::default(),
            sessions: Default::default(),
            listener,
            shutdown,
            start_lock: Mutex::new(()),
        }))
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn propose_timeout(&self) -> Duration {
        self.propose_timeout
    }

    pub fn has_group(&self, group: GroupId) -> bool {
        self.groups.read().contains_key(&group)
    }

    /// Records the raft address of a node so messages can reach it before any shared group's
    /// membership names it.
    pub fn add_peer(&self, id: NodeId, address: &str) {
        self.addresses.write().insert(id, address.to_string());
    }

    pub fn peer_address(&self, id: NodeId) -> Option<String> {
        self.addresses.read().get(&id).cloned()
    }

    pub fn node_for_address(&self, address: &str) -> Option<NodeId> {
        self.addresses
            .read()
            .iter()
            .find(|(_, a)| a.as_str() == address)
            .map(|(id, _)| *id)
    }

    /// Boots a replica of `group` on this node. A group that already has a log on disk resumes from
    /// it and ignores `bootstrap`. Starting a running group is a no-op.
    #[tracing::instrument(level = "debug", skip(self, bootstrap), fields(node = self.id))]
    pub fn start_group(&self, group: GroupId, kind: MachineKind, bootstrap: Bootstrap) -> Result<()> {
        let _starting = self.start_lock.lock();
        if self.has_group(group) {
            return Ok(());
        }
        if let Bootstrap::Initial(membership) = &bootstrap {
            let mut book = self.addresses.write();
            for (id, address) in membership.addresses() {
                book.insert(id, address);
            }
        }

        let log = RaftLog::new(Box::new(SledStore::open(&self.engine, group)?))?;
        let fsm = kind.create(&self.data_dir, group, self.id);
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (client_tx, client_rx) = mpsc::channel(self.raft.proposal_queue);
        let (shutdown, _) = broadcast::channel(1);

        let server = Server::run(ServerRunOpts {
            id: self.id,
            group,
            config: self.raft.clone(),
            log,
            bootstrap,
            fsm: fsm.clone(),
            tcp_tx: self.tcp_tx.clone(),
            tcp_rx: in_rx,
            client_rx,
            shutdown: shutdown.clone(),
        })?;
        self.router.write().insert(group, in_tx);

        tokio::spawn(group::watch_status(
            group,
            server.status.clone(),
            self.addresses.clone(),
            self.listener.clone(),
            shutdown.subscribe(),
        ));

        let handle = GroupHandle {
            kind,
            client_tx,
            status: server.status.clone(),
            applied: server.applied.clone(),
            fsm,
            shutdown,
            server: Mutex::new(Some(server)),
        };
        self.sessions.write().insert(group, Session::new());
        self.groups.write().insert(group, Arc::new(handle));
        tracing::info!(group, ?kind, "started group");
        Ok(())
    }

    /// Stops the local replica of `group` and closes its state machine.
    pub async fn stop_group(&self, group: GroupId) -> Result<()> {
        let handle = self
            .groups
            .write()
            .remove(&group)
            .ok_or(FurrowError::GroupMissing(group))?;
        self.sessions.write().remove(&group);
        self.router.write().remove(&group);
        Self::stop_handle(group, handle).await
    }

    async fn stop_handle(group: GroupId, handle: Arc<GroupHandle>) -> Result<()> {
        // the receivers are gone if the group already stopped
        let _ = handle.shutdown.send(());
        let server = handle.server.lock().take();
        if let Some(server) = server {
            server.join().await?;
        }
        handle.fsm.close()?;
        tracing::info!(group, "stopped group");
        Ok(())
    }

    /// Stops every group and the transport.
    pub async fn stop(&self) -> Result<()> {
        let groups: Vec<(GroupId, Arc<GroupHandle>)> = self.groups.write().drain().collect();
        self.sessions.write().clear();
        self.router.write().clear();
        for (group, handle) in groups {
            if let Err(err) = Self::stop_handle(group, handle).await {
                tracing::warn!(group, %err, "failed to stop group cleanly");
            }
        }
        self.shutdown.shutdown();
        self.engine.flush()?;
        Ok(())
    }

    fn group(&self, group: GroupId) -> Result<Arc<GroupHandle>> {
        self.groups
            .read()
            .get(&group)
            .cloned()
            .ok_or(FurrowError::GroupMissing(group))
    }

    /// Longest a single attempt waits for an answer: the upper bound of a randomized election
    /// timeout. A request forwarded to a leader that died is never answered, and by then the group
    /// has had the chance to elect a new one.
    fn attempt_timeout(&self) -> Duration {
        self.raft.tick() * (2 * self.raft.election_ticks()).max(1) as u32
    }

    /// Hands a request to the group's replica and waits for its answer. The outer error covers
    /// admission; the inner one is the group's verdict. An attempt that goes unanswered reports
    /// `NoLeader` so callers retry it.
    async fn call(
        &self,
        group: GroupId,
        request: Request,
    ) -> Result<std::result::Result<Response, RaftError>> {
        let handle = self.group(group)?;
        let (tx, rx) = oneshot::channel();
        handle.client_tx.try_send((request, tx))?;
        match tokio::time::timeout(self.attempt_timeout(), rx).await {
            Ok(res) => Ok(res?),
            Err(_) => {
                tracing::debug!(group, "request unanswered, retrying");
                Ok(Err(RaftError::NoLeader))
            }
        }
    }

    /// Proposes `data` to `group`, returning once the entry is applied on this node. Retries while
    /// the group has no leader, until the propose timeout expires. Every attempt carries the same
    /// session tag, so an entry committed by an earlier attempt is applied once.
    pub async fn propose(&self, group: GroupId, data: Vec<u8>) -> Result<LogIndex> {
        self.propose_with_timeout(group, data, self.propose_timeout).await
    }

    #[tracing::instrument(level = "trace", skip(self, data), fields(node = self.id))]
    pub async fn propose_with_timeout(
        &self,
        group: GroupId,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<LogIndex> {
        let proposal = {
            let sessions = self.sessions.read();
            let session = sessions.get(&group).ok_or(FurrowError::ClusterOffline)?;
            Proposal::with_session(data, session.next())
        };
        with_deadline(timeout, async {
            loop {
                match self.call(group, Request::Propose(proposal.clone())).await? {
                    Ok(res) => return Ok(res.index().unwrap_or_default()),
                    // a new leader truncated the entry
                    Err(RaftError::NoLeader | RaftError::Aborted) => {
                        tokio::time::sleep(RETRY_INTERVAL).await
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        })
        .await
    }

    /// Reads through a fresh read index: waits until this replica applied everything committed
    /// before the read was issued, then queries the state machine.
    #[tracing::instrument(level = "trace", skip(self), fields(node = self.id))]
    pub async fn linearizable_read(&self, group: GroupId, query: &Query) -> Result<Vec<u8>> {
        let handle = self.group(group)?;
        with_deadline(self.read_timeout, async {
            let index = loop {
                match self.call(group, Request::ReadIndex).await? {
                    Ok(res) => break res.index().unwrap_or_default(),
                    Err(RaftError::NoLeader) => tokio::time::sleep(RETRY_INTERVAL).await,
                    Err(err) => return Err(err.into_read_error()),
                }
            };
            let mut applied = handle.applied.clone();
            while *applied.borrow_and_update() < index {
                applied
                    .changed()
                    .await
                    .map_err(|_| FurrowError::ReadTerminated)?;
            }
            handle.fsm.lookup(query)
        })
        .await
    }

    /// Queries the local replica at whatever it has applied.
    pub async fn local_read(&self, group: GroupId, query: &Query) -> Result<Vec<u8>> {
        let handle = self.group(group)?;
        handle.fsm.lookup(query)
    }

    pub fn leader_id(&self, group: GroupId) -> Result<(Option<NodeId>, bool)> {
        let handle = self.group(group)?;
        let status = handle.status.borrow();
        Ok((status.leader, status.leader.is_some()))
    }

    pub fn is_leader(&self, group: GroupId) -> bool {
        matches!(self.leader_id(group), Ok((Some(leader), _)) if leader == self.id)
    }

    pub fn membership(&self, group: GroupId) -> Result<Membership> {
        let handle = self.group(group)?;
        let membership = handle.status.borrow().membership.clone();
        Ok(membership)
    }

    pub fn applied_index(&self, group: GroupId) -> Result<LogIndex> {
        let handle = self.group(group)?;
        let applied = *handle.applied.borrow();
        Ok(applied)
    }

    /// Waits until `group` knows a leader.
    pub async fn wait_for_ready(&self, group: GroupId, timeout: Duration) -> Result<NodeId> {
        let handle = self.group(group)?;
        let mut status = handle.status.clone();
        with_deadline(timeout, async move {
            loop {
                if let Some(leader) = status.borrow_and_update().leader {
                    return Ok(leader);
                }
                status.changed().await.map_err(|_| FurrowError::Terminated)?;
            }
        })
        .await
    }

    /// Waits until this replica is leader of `group` and has committed an entry of its term.
    pub async fn wait_for_leadership(&self, group: GroupId, timeout: Duration) -> Result<()> {
        let handle = self.group(group)?;
        let mut status = handle.status.clone();
        with_deadline(timeout, async move {
            while !status.borrow_and_update().ready {
                status.changed().await.map_err(|_| FurrowError::Terminated)?;
            }
            Ok(())
        })
        .await
    }

    pub async fn add_member(&self, group: GroupId, id: NodeId, address: &str) -> Result<()> {
        self.add_peer(id, address);
        let change = ConfigChange::AddNode {
            id,
            address: address.to_string(),
        };
        self.change_membership(group, change).await
    }

    pub async fn remove_member(&self, group: GroupId, id: NodeId) -> Result<()> {
        self.change_membership(group, ConfigChange::RemoveNode { id }).await
    }

    #[tracing::instrument(level = "debug", skip(self), fields(node = self.id))]
    async fn change_membership(&self, group: GroupId, change: ConfigChange) -> Result<()> {
        with_deadline(self.propose_timeout, async {
            loop {
                match self
                    .call(group, Request::ChangeMembership(change.clone()))
                    .await?
                {
                    Ok(_) => return Ok(()),
                    Err(RaftError::ConfigChangeInFlight) => {
                        tracing::debug!(group, "membership change in flight, retrying");
                        tokio::time::sleep(CONFIG_CHANGE_BACKOFF).await
                    }
                    Err(RaftError::NoLeader) => tokio::time::sleep(RETRY_INTERVAL).await,
                    Err(err) => return Err(err.into()),
                }
            }
        })
        .await
    }

    /// Asks the leader of `group` to hand leadership to `target`. Best effort: success means the
    /// leader accepted the request, not that the transfer completed.
    pub async fn transfer_leadership(&self, group: GroupId, target: NodeId) -> Result<()> {
        with_deadline(self.propose_timeout, async {
            loop {
                match self.call(group, Request::TransferLeader(target)).await? {
                    Ok(_) => return Ok(()),
                    Err(RaftError::NoLeader) => tokio::time::sleep(RETRY_INTERVAL).await,
                    Err(err) => return Err(err.into()),
                }
            }
        })
        .await
    }

    pub fn group_info(&self, group: GroupId) -> Result<GroupInfo> {
        let handle = self.group(group)?;
        let status = handle.status.borrow().clone();
        let applied = *handle.applied.borrow();
        Ok(GroupInfo {
            group,
            kind: handle.kind,
            is_leader: status.leader == Some(self.id),
            leader: status.leader,
            term: status.term,
            commit: status.commit,
            applied,
            membership: status.membership,
        })
    }

    pub fn cluster_info(&self) -> ClusterInfo {
        let ids: Vec<GroupId> = self.groups.read().keys().copied().collect();
        let mut groups: Vec<GroupInfo> = ids
            .into_iter()
            .filter_map(|group| self.group_info(group).ok())
            .collect();
        groups.sort_by_key(|info| info.group);
        ClusterInfo {
            node_id: self.id,
            address: self.address.clone(),
            groups,
        }
    }

    /// Every group this host runs, with the kind of machine it replicates.
    pub fn groups(&self) -> BTreeMap<GroupId, MachineKind> {
        self.groups
            .read()
            .iter()
            .map(|(group, handle)| (*group, handle.kind))
            .collect()
    }
}

async fn with_deadline<T, F>(timeout: Duration, f: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout_at(Instant::now() + timeout, f)
        .await
        .map_err(|_| FurrowError::Timeout)?
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn free_address() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    }

    pub fn opts(id: NodeId, dir: &Path) -> HostOpts {
        HostOpts {
            id,
            address: free_address(),
            data_dir: dir.to_path_buf(),
            raft: RaftConfig {
                rtt_millis: 10,
                ..Default::default()
            },
            propose_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
        }
    }

    pub fn single(host: &Host) -> Membership {
        Membership::new(BTreeMap::from([(host.id(), host.address().to_string())]))
    }

    /// A host of one node with fast ticks.
    pub async fn single_node(dir: &Path) -> Result<Arc<Host>> {
        Host::start(opts(1, dir), None).await
    }

    /// Starts `group` with this host as its only voter and waits for it to lead.
    pub async fn start(host: &Host, group: GroupId, kind: MachineKind) -> Result<()> {
        host.start_group(group, kind, Bootstrap::Initial(single(host)))?;
        host.wait_for_leadership(group, Duration::from_secs(5)).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::testing::{free_address, opts, single};
    use super::*;
    use crate::machine::Envelope;

    fn org(id: u64, name: &str) -> Vec<u8> {
        let body = serde_json::to_vec(&json!({"id": id, "name": name})).unwrap();
        Envelope::update(body).encode().unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[tracing_test::traced_test]
    async fn propose_and_read() -> Result<()> {
        let dir = tempdir()?;
        let host = Host::start(opts(1, dir.path()), None).await?;
        host.start_group(2, MachineKind::Organization, Bootstrap::Initial(single(&host)))?;
        host.wait_for_leadership(2, Duration::from_secs(5)).await?;
        assert_eq!(host.leader_id(2)?, (Some(1), true));

        host.propose(2, org(5, "acme")).await?;
        let local = host.local_read(2, &Query::id(5)).await?;
        let quorum = host.linearizable_read(2, &Query::id(5)).await?;
        assert_eq!(local, quorum);
        assert_eq!(host.linearizable_read(2, &Query::Count).await?, b"1".to_vec());

        let info = host.cluster_info();
        assert_eq!(info.groups.len(), 1);
        assert!(info.groups[0].is_leader);
        assert!(info.groups[0].applied >= 3);
        host.stop().await?;
        Ok(())
    }

    #[tokio::test]
    async fn missing_group() -> Result<()> {
        let dir = tempdir()?;
        let host = Host::start(opts(1, dir.path()), None).await?;
        assert_eq!(
            host.propose(9, vec![]).await,
            Err(FurrowError::ClusterOffline)
        );
        assert_eq!(
            host.local_read(9, &Query::Wildcard).await,
            Err(FurrowError::GroupMissing(9))
        );
        host.stop().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restart_resumes_from_disk() -> Result<()> {
        let dir = tempdir()?;
        let mut config = opts(1, dir.path());
        {
            let host = Host::start(config.clone(), None).await?;
            host.start_group(2, MachineKind::Organization, Bootstrap::Initial(single(&host)))?;
            host.wait_for_leadership(2, Duration::from_secs(5)).await?;
            host.propose(2, org(1, "a")).await?;
            host.stop().await?;
        }
        config.address = free_address();
        let host = Host::start(config, None).await?;
        host.start_group(2, MachineKind::Organization, Bootstrap::Join)?;
        host.wait_for_leadership(2, Duration::from_secs(5)).await?;
        assert!(host.local_read(2, &Query::id(1)).await.is_ok());
        host.stop().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn propose_survives_leader_loss() -> Result<()> {
        let dirs = [tempdir()?, tempdir()?, tempdir()?];
        let mut hosts = Vec::new();
        for (i, dir) in dirs.iter().enumerate() {
            hosts.push(Host::start(opts(i as NodeId + 1, dir.path()), None).await?);
        }
        let membership = Membership::new(
            hosts
                .iter()
                .map(|host| (host.id(), host.address().to_string()))
                .collect(),
        );
        for host in &hosts {
            host.start_group(2, MachineKind::Organization, Bootstrap::Initial(membership.clone()))?;
        }
        let leader = hosts[0].wait_for_ready(2, Duration::from_secs(5)).await?;
        hosts[0].propose(2, org(1, "before")).await?;

        let dead = hosts.remove((leader - 1) as usize);
        dead.stop().await?;

        // the survivors still name the dead leader until they time it out
        let started = Instant::now();
        let index = hosts[0]
            .propose_with_timeout(2, org(2, "after"), Duration::from_secs(5))
            .await?;
        assert!(index > 0);
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(hosts[1].linearizable_read(2, &Query::id(2)).await.is_ok());

        for host in hosts {
            host.stop().await?;
        }
        Ok(())
    }

    struct Recorder(Mutex<Vec<(GroupId, Option<NodeId>)>>);

    impl LeaderListener for Recorder {
        fn on_leader_change(&self, group: GroupId, leader: Option<NodeId>) {
            self.0.lock().push((group, leader));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reports_leader_changes() -> Result<()> {
        let dir = tempdir()?;
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let listener: Arc<dyn LeaderListener> = recorder.clone();
        let host = Host::start(opts(1, dir.path()), Some(listener)).await?;
        host.start_group(3, MachineKind::Role, Bootstrap::Initial(single(&host)))?;
        host.wait_for_ready(3, Duration::from_secs(5)).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(recorder.0.lock().contains(&(3, Some(1))));
        host.stop().await?;
        Ok(())
    }
}
