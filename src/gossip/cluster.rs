//! Bringing a node into the cluster and the gossip event loop that keeps it there.
//!
//! Bootstrap nodes wait until the configured number of members gossip, then create the system
//! group and the well known record groups with those members as voters. Any other node announces
//! itself as available until the system-group leader admits it under a fresh node ID, then joins
//! the system group. Once running, every node reacts to provisioning requests by starting the
//! groups of the new farm; the system-group leader also places their initial leaders.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::config::{Channels, ClusterConfig, FurrowConfig};
use crate::error::{FurrowError, Result};
use crate::facade::Datastore;
use crate::gossip::event::{
    ClusterEvent, GossipEvent, ProvisionRequest, WorkerAssigned, WorkerAvailable,
};
use crate::gossip::placement::Placement;
use crate::gossip::{Gossip, GossipOpts};
use crate::host::{Host, HostOpts, LeaderListener};
use crate::ids;
use crate::machine::MachineKind;
use crate::provision::{Initializer, Provisioner};
use crate::raft::membership::Membership;
use crate::raft::{Bootstrap, GroupId, NodeId};
use crate::util::Shutdown;

/// File under the data directory holding the node ID the system group assigned.
const NODE_ID_FILE: &str = "NODE_ID";
/// File under the data directory listing the groups this node hosts.
const CATALOG_FILE: &str = "groups.json";
/// Pause between announcements while waiting for admission.
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const TRANSFER_RETRY: Duration = Duration::from_secs(1);

/// A running node: gossip, the raft host, placement, the record facades and the event loop.
pub struct Node {
    pub config: FurrowConfig,
    pub gossip: Arc<Gossip>,
    pub host: Arc<Host>,
    pub placement: Arc<Placement>,
    pub datastore: Datastore,
    pub provisioner: Provisioner,
    shutdown: Shutdown,
    event_loop: JoinHandle<()>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.host.id())
            .field("gossip", &self.gossip)
            .finish()
    }
}

impl Node {
    /// Joins the cluster described by `config` and starts the event loop.
    pub async fn start(
        config: FurrowConfig,
        channels: Channels,
        initializer: Arc<dyn Initializer>,
    ) -> Result<Node> {
        config.validate()?;
        let cluster = &config.cluster;
        let ids = cluster.cluster_ids();
        std::fs::create_dir_all(&cluster.data_dir)?;

        let placement = Arc::new(Placement::new(cluster.virtual_nodes));
        let (gossip, mut events) = Gossip::start(GossipOpts {
            bind: cluster.gossip_address(),
            raft_address: cluster.raft_address(),
            peers: cluster.gossip_peers.clone(),
            interval: cluster.gossip_interval(),
            suspect_timeout: cluster.suspect_timeout(),
            dead_timeout: cluster.dead_timeout(),
        })
        .await?;
        let listener: Arc<dyn LeaderListener> = placement.clone();

        let host = if cluster.is_bootstrap() {
            bootstrap(&config, &gossip, listener).await?
        } else {
            join(&config, &gossip, &mut events, listener).await?
        };
        resume_catalog(&host)?;

        let membership = wait_for_membership(&host, ids.system, cluster.join_timeout()).await?;
        for (id, address) in membership.addresses() {
            placement.add_node(id, &address);
        }
        placement.assign(host.id());
        if cluster.is_bootstrap() {
            place_system_leader(&host, cluster).await;
        }

        let shutdown = Shutdown::new();
        let handlers = Handlers {
            config: cluster.clone(),
            host: host.clone(),
            gossip: gossip.clone(),
            placement: placement.clone(),
            channels: channels.clone(),
            initializer,
        };
        let span = tracing::info_span!("cluster", node = host.id());
        let event_loop = tokio::spawn(
            event_loop(handlers, events, shutdown.subscribe()).instrument(span),
        );

        let datastore = Datastore::new(host.clone(), ids, channels);
        let provisioner = Provisioner::new(gossip.clone(), host.clone(), cluster.join_timeout());
        tracing::info!(node = host.id(), groups = host.groups().len(), "node started");
        Ok(Node {
            config,
            gossip,
            host,
            placement,
            datastore,
            provisioner,
            shutdown,
            event_loop,
        })
    }

    pub fn id(&self) -> NodeId {
        self.host.id()
    }

    /// Leaves gossip, stops the event loop and every group.
    pub async fn stop(self) -> Result<()> {
        self.gossip.leave().await?;
        self.shutdown.shutdown();
        if let Err(err) = self.event_loop.await {
            tracing::warn!(%err, "cluster loop ended abnormally");
        }
        self.host.stop().await
    }
}

fn host_opts(config: &FurrowConfig, id: NodeId) -> HostOpts {
    HostOpts {
        id,
        address: config.cluster.raft_address(),
        data_dir: config.cluster.data_dir.clone(),
        raft: config.raft.clone(),
        propose_timeout: config.cluster.propose_timeout(),
        read_timeout: config.cluster.read_timeout(),
    }
}

/// Groups every bootstrap node creates, with the machine each replicates.
fn well_known_groups(config: &ClusterConfig) -> Vec<(GroupId, MachineKind)> {
    let ids = config.cluster_ids();
    vec![
        (ids.system, MachineKind::Server),
        (ids.organization, MachineKind::Organization),
        (ids.user, MachineKind::User),
        (ids.role, MachineKind::Role),
        (ids.algorithm, MachineKind::Algorithm),
        (ids.registration, MachineKind::Registration),
        (ids.customer, MachineKind::Customer),
        (ids::event_log_id(ids.system), MachineKind::EventLog),
    ]
}

/// Initial voters of a bootstrapped cluster. Node IDs are positions in `raft_peers`, from 1.
pub fn bootstrap_membership(config: &ClusterConfig) -> Membership {
    let voters: BTreeMap<NodeId, String> = config
        .raft_peers
        .iter()
        .enumerate()
        .map(|(i, address)| (i as NodeId + 1, address.clone()))
        .collect();
    Membership::new(voters)
}

async fn bootstrap(
    config: &FurrowConfig,
    gossip: &Gossip,
    listener: Arc<dyn LeaderListener>,
) -> Result<Arc<Host>> {
    let cluster = &config.cluster;
    let host = Host::start(host_opts(config, cluster.node_id), Some(listener)).await?;
    write_node_id(&cluster.data_dir, cluster.node_id)?;
    gossip.join(cluster.bootstrap, cluster.join_timeout()).await?;

    let membership = bootstrap_membership(cluster);
    for (group, kind) in well_known_groups(cluster) {
        host.start_group(group, kind, Bootstrap::Initial(membership.clone()))?;
    }
    save_catalog(&host)?;
    let leader = host
        .wait_for_ready(cluster.system_cluster_id, cluster.join_timeout())
        .await?;
    tracing::info!(leader, "system group ready");
    Ok(host)
}

/// Moves system-group leadership to the requested node, best effort within the join timeout.
async fn place_system_leader(host: &Host, config: &ClusterConfig) {
    let requested = config.requested_leader_id;
    if requested == 0 {
        return;
    }
    let system = config.system_cluster_id;
    let deadline = Instant::now() + config.join_timeout();
    let mut last_request: Option<Instant> = None;
    while Instant::now() < deadline {
        if let Ok((Some(leader), _)) = host.leader_id(system) {
            if leader == requested {
                tracing::info!(leader, "system group led by requested node");
                return;
            }
            let due = last_request.map_or(true, |at| at.elapsed() >= TRANSFER_RETRY);
            if leader == host.id() && due {
                tracing::info!(from = leader, to = requested, "transferring system group leadership");
                if let Err(err) = host.transfer_leadership(system, requested).await {
                    tracing::warn!(%err, "leadership transfer request failed");
                }
                last_request = Some(Instant::now());
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    tracing::warn!(requested, "system group leadership did not reach the requested node");
}

async fn join(
    config: &FurrowConfig,
    gossip: &Gossip,
    events: &mut mpsc::Receiver<GossipEvent>,
    listener: Arc<dyn LeaderListener>,
) -> Result<Arc<Host>> {
    let cluster = &config.cluster;
    let known = match read_node_id(&cluster.data_dir)? {
        Some(id) => Some(id),
        None if cluster.node_id != 0 => Some(cluster.node_id),
        None => None,
    };
    let (id, peers) = match known {
        Some(id) => {
            tracing::info!(id, "rejoining with known node id");
            (id, BTreeMap::new())
        }
        None => {
            let assigned = await_assignment(cluster, gossip, events).await?;
            (assigned.node_id, assigned.members)
        }
    };
    write_node_id(&cluster.data_dir, id)?;

    let host = Host::start(host_opts(config, id), Some(listener)).await?;
    for (peer, address) in &peers {
        host.add_peer(*peer, address);
    }
    host.start_group(cluster.system_cluster_id, MachineKind::Server, Bootstrap::Join)?;
    save_catalog(&host)?;
    Ok(host)
}

/// Announces this node until the system-group leader admits it.
async fn await_assignment(
    cluster: &ClusterConfig,
    gossip: &Gossip,
    events: &mut mpsc::Receiver<GossipEvent>,
) -> Result<WorkerAssigned> {
    gossip.join(2, cluster.join_timeout()).await?;
    let address = cluster.raft_address();
    let announce = ClusterEvent::WorkerAvailable(WorkerAvailable {
        raft_address: address.clone(),
    });
    let deadline = Instant::now() + cluster.join_timeout();
    loop {
        if Instant::now() >= deadline {
            return Err(FurrowError::Timeout);
        }
        gossip.user_event(&announce).await?;
        let wait = tokio::time::sleep(ANNOUNCE_INTERVAL);
        tokio::pin!(wait);
        loop {
            tokio::select! {
                _ = &mut wait => break,
                event = events.recv() => match event {
                    Some(GossipEvent::User(user)) => match ClusterEvent::decode(&user.name, &user.payload) {
                        Ok(ClusterEvent::WorkerAssigned(assigned)) if assigned.raft_address == address => {
                            tracing::info!(id = assigned.node_id, "admitted to the system group");
                            return Ok(assigned);
                        }
                        Ok(event) => tracing::debug!(?event, "ignoring event before admission"),
                        Err(err) => tracing::warn!(%err, "undecodable user event"),
                    },
                    Some(_) => {}
                    None => return Err(FurrowError::Terminated),
                },
            }
        }
    }
}

/// Waits until the system group's membership lists this node.
async fn wait_for_membership(host: &Host, system: GroupId, timeout: Duration) -> Result<Membership> {
    let deadline = Instant::now() + timeout;
    loop {
        let membership = host.membership(system)?;
        if membership.is_voter(host.id()) {
            return Ok(membership);
        }
        if Instant::now() >= deadline {
            return Err(FurrowError::Timeout);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn read_node_id(data_dir: &Path) -> Result<Option<NodeId>> {
    match std::fs::read_to_string(data_dir.join(NODE_ID_FILE)) {
        Ok(contents) => contents
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| FurrowError::internal(format!("corrupt {} file", NODE_ID_FILE))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn write_node_id(data_dir: &Path, id: NodeId) -> Result<()> {
    std::fs::write(data_dir.join(NODE_ID_FILE), id.to_string())?;
    Ok(())
}

/// Persists the groups this host runs so a restart resumes them.
fn save_catalog(host: &Host) -> Result<()> {
    let path = host.data_dir().join(CATALOG_FILE);
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_vec(&host.groups())?)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

/// Restarts every cataloged group not running yet. Their logs are on disk, so they resume.
fn resume_catalog(host: &Host) -> Result<()> {
    let path = host.data_dir().join(CATALOG_FILE);
    let catalog: BTreeMap<GroupId, MachineKind> = match std::fs::read(&path) {
        Ok(bytes) => serde_json::from_slice(&bytes)?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    for (group, kind) in catalog {
        if !host.has_group(group) {
            tracing::info!(group, ?kind, "resuming group");
            host.start_group(group, kind, Bootstrap::Join)?;
        }
    }
    Ok(())
}

#[derive(Clone)]
struct Handlers {
    config: ClusterConfig,
    host: Arc<Host>,
    gossip: Arc<Gossip>,
    placement: Arc<Placement>,
    channels: Channels,
    initializer: Arc<dyn Initializer>,
}

/// Consumes gossip events one at a time. Admissions and assignments are handled in arrival
/// order, so concurrent workers never get the same ID.
async fn event_loop(
    handlers: Handlers,
    mut events: mpsc::Receiver<GossipEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.recv() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            GossipEvent::MemberJoin(member) => {
                tracing::info!(member = %member.name, raft = %member.raft_address, "member joined")
            }
            GossipEvent::MemberLeave(member) => tracing::info!(member = %member.name, "member left"),
            GossipEvent::MemberFailed(member) => tracing::warn!(member = %member.name, "member failed"),
            GossipEvent::User(user) => match ClusterEvent::decode(&user.name, &user.payload) {
                Ok(event) => {
                    let span = tracing::debug_span!("user_event", name = event.name());
                    handlers.dispatch(event).instrument(span).await;
                }
                Err(err) => tracing::warn!(%err, name = %user.name, "undecodable user event"),
            },
        }
    }
    tracing::debug!("cluster loop complete");
}

impl Handlers {
    /// Provisioning waits on groups that are still electing, so it runs on its own task and the
    /// loop moves on.
    async fn dispatch(&self, event: ClusterEvent) -> Option<JoinHandle<()>> {
        let res = match event {
            ClusterEvent::WorkerAvailable(worker) => self.worker_available(worker).await,
            ClusterEvent::WorkerAssigned(assigned) => {
                self.worker_assigned(assigned);
                Ok(())
            }
            ClusterEvent::ProvisionRequest(request) => {
                let handlers = self.clone();
                let task = async move {
                    if let Err(err) = handlers.provision(request).await {
                        tracing::warn!(%err, "provisioning failed");
                    }
                };
                return Some(tokio::spawn(task.in_current_span()));
            }
        };
        if let Err(err) = res {
            tracing::warn!(%err, "user event handler failed");
        }
        None
    }

    /// Admits a worker into the system group. Only the system-group leader acts.
    async fn worker_available(&self, worker: WorkerAvailable) -> Result<()> {
        let system = self.config.system_cluster_id;
        if !self.host.is_leader(system) {
            return Ok(());
        }
        let membership = self.host.membership(system)?;
        let known = membership
            .addresses()
            .into_iter()
            .find(|(_, address)| *address == worker.raft_address)
            .map(|(id, _)| id);

        let node_id = match known {
            Some(id) => {
                tracing::debug!(id, address = %worker.raft_address, "worker already admitted");
                id
            }
            None => {
                if membership.voters.len() >= self.config.max_nodes {
                    tracing::warn!(
                        address = %worker.raft_address,
                        max_nodes = self.config.max_nodes,
                        "system group is full, not admitting worker"
                    );
                    return Ok(());
                }
                let id = membership.node_ids().last().copied().unwrap_or(0) + 1;
                tracing::info!(id, address = %worker.raft_address, "admitting worker");
                self.host.add_member(system, id, &worker.raft_address).await?;
                self.placement.add_node(id, &worker.raft_address);
                id
            }
        };

        let members = self.host.membership(system)?.voters;
        let assigned = ClusterEvent::WorkerAssigned(WorkerAssigned {
            node_id,
            raft_address: worker.raft_address,
            members,
        });
        self.gossip.user_event(&assigned).await
    }

    fn worker_assigned(&self, assigned: WorkerAssigned) {
        if assigned.raft_address == self.host.address() {
            return;
        }
        self.host.add_peer(assigned.node_id, &assigned.raft_address);
        self.placement.add_node(assigned.node_id, &assigned.raft_address);
        for (id, address) in &assigned.members {
            if *id != self.host.id() {
                self.host.add_peer(*id, address);
                self.placement.add_node(*id, address);
            }
        }
    }

    /// Starts the groups of a new farm on this node. The system-group leader also hands the
    /// aggregate to the provisioner channel and places the config and state group leaders.
    async fn provision(&self, request: ProvisionRequest) -> Result<()> {
        let system = self.config.system_cluster_id;
        let timeout = self.config.join_timeout();
        self.host.wait_for_ready(system, timeout).await?;
        let membership = self.host.membership(system)?;
        if !membership.is_voter(self.host.id()) {
            tracing::debug!(farm = %request.farm_name, "not a system group voter, skipping provisioning");
            return Ok(());
        }

        let farm = self.initializer.build_config(&request)?;
        let voters = Membership::new(membership.voters.clone());
        let mut groups = vec![
            (request.config_id, MachineKind::Farm),
            (request.state_id, MachineKind::FarmState),
            (ids::event_log_id(request.config_id), MachineKind::EventLog),
        ];
        for device in &farm.devices {
            groups.push((ids::device_data_id(farm.id, device.id), MachineKind::DeviceData));
        }
        for (group, kind) in groups {
            self.host
                .start_group(group, kind, Bootstrap::Initial(voters.clone()))?;
        }
        save_catalog(&self.host)?;
        tracing::info!(farm = %request.farm_name, config = request.config_id, state = request.state_id, "provisioned farm groups");

        if !self.host.is_leader(system) {
            return Ok(());
        }
        let farm_id = farm.id;
        if self.channels.provisioner.send(farm).await.is_err() {
            tracing::warn!(farm = farm_id, "provisioner channel closed");
        }
        if self.channels.ticker_provisioner.send(farm_id).await.is_err() {
            tracing::warn!(farm = farm_id, "ticker provisioner channel closed");
        }
        for group in [request.config_id, request.state_id] {
            let target = match self.placement.pick(group) {
                Some(target) => target,
                None => continue,
            };
            let leader = self.host.wait_for_ready(group, timeout).await?;
            if leader != target {
                tracing::debug!(group, from = leader, to = target, "placing group leader");
                self.host.transfer_leadership(group, target).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::event::UserEvent;

    #[test]
    fn bootstrap_ids_follow_peer_order() {
        let config = ClusterConfig {
            raft_peers: vec!["a:1".to_string(), "b:1".to_string(), "c:1".to_string()],
            ..Default::default()
        };
        let membership = bootstrap_membership(&config);
        assert_eq!(membership.node_ids(), vec![1, 2, 3]);
        assert_eq!(membership.address(3), Some("c:1"));
    }

    #[test]
    fn well_known_groups_are_distinct() {
        let groups = well_known_groups(&ClusterConfig::default());
        let mut ids: Vec<GroupId> = groups.iter().map(|(g, _)| *g).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), groups.len());
        assert_eq!(groups[0], (420, MachineKind::Server));
    }

    fn user(event: &ClusterEvent) -> Result<GossipEvent> {
        Ok(GossipEvent::User(UserEvent {
            name: event.name().to_string(),
            payload: event.payload()?,
        }))
    }

    fn assigned(node_id: NodeId, port: u16) -> ClusterEvent {
        ClusterEvent::WorkerAssigned(WorkerAssigned {
            node_id,
            raft_address: format!("127.0.0.1:{}", port),
            members: BTreeMap::new(),
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn user_events_apply_in_arrival_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let host = crate::host::testing::single_node(dir.path()).await?;
        let (gossip, _events) = Gossip::start(GossipOpts {
            bind: "127.0.0.1:0".to_string(),
            raft_address: host.address().to_string(),
            peers: vec![],
            interval: Duration::from_millis(20),
            suspect_timeout: Duration::from_millis(200),
            dead_timeout: Duration::from_millis(400),
        })
        .await?;
        let placement = Arc::new(Placement::new(10));
        let (channels, _receivers) = Channels::new();
        let handlers = Handlers {
            config: ClusterConfig::default(),
            host: host.clone(),
            gossip: gossip.clone(),
            placement: placement.clone(),
            channels,
            initializer: Arc::new(crate::provision::DefaultInitializer::default()),
        };

        let (tx, rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tx.send(user(&assigned(5, 7005))?).await.unwrap();
        tx.send(user(&assigned(6, 7006))?).await.unwrap();
        // node 5 moved; the later assignment wins
        tx.send(user(&assigned(5, 7015))?).await.unwrap();
        drop(tx);
        event_loop(handlers.clone(), rx, shutdown_rx).await;

        assert_eq!(host.peer_address(5).as_deref(), Some("127.0.0.1:7015"));
        assert_eq!(host.peer_address(6).as_deref(), Some("127.0.0.1:7006"));
        let nodes = placement.nodes();
        assert_eq!(nodes.keys().copied().collect::<Vec<_>>(), vec![5, 6]);
        assert_eq!(nodes[&5], "127.0.0.1:7015");

        // provisioning runs beside the loop; without a system group it gives up
        let provision = ClusterEvent::ProvisionRequest(ProvisionRequest {
            farm_name: "north".to_string(),
            org_id: 1,
            config_id: ids::farm_id(1, "north"),
            state_id: ids::state_id("north", ids::farm_id(1, "north")),
            user_id: 1,
            role_id: 1,
            config_store: String::new(),
            state_store: String::new(),
            data_store: String::new(),
            consistency: Default::default(),
        });
        let task = handlers.dispatch(provision).await.unwrap();
        task.await.unwrap();
        assert!(!host.has_group(ids::farm_id(1, "north")));

        gossip.leave().await?;
        host.stop().await?;
        Ok(())
    }

    #[test]
    fn node_id_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert_eq!(read_node_id(dir.path())?, None);
        write_node_id(dir.path(), 4)?;
        assert_eq!(read_node_id(dir.path())?, Some(4));
        Ok(())
    }
}
