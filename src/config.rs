use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::{FurrowError, Result};
use crate::model::FarmConfig;
use crate::raft::config::RaftConfig;
use crate::raft::{GroupId, NodeId};

/// Capacity of the outbound provisioning channels.
pub const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct FurrowConfig {
    pub cluster: ClusterConfig,
    pub raft: RaftConfig,
    pub log: LogConfig,
}

impl FurrowConfig {
    pub fn validate(&self) -> Result<()> {
        self.cluster.validate()?;
        self.raft.validate()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    /// ID of this node in the system group, 0 when the bootstrap leader assigns one.
    pub node_id: NodeId,
    pub data_dir: PathBuf,
    /// Host used for both the gossip and the raft listener.
    pub listen: String,
    pub gossip_port: u16,
    pub raft_port: u16,
    pub gossip_peers: Vec<String>,
    /// Raft addresses of the initial members, in node ID order, when bootstrapping.
    pub raft_peers: Vec<String>,
    /// 0 to join an existing cluster, otherwise the size of the cluster to bootstrap.
    pub bootstrap: usize,
    pub max_nodes: usize,
    pub virtual_nodes: usize,
    pub requested_leader_id: NodeId,
    pub system_cluster_id: GroupId,
    pub organization_cluster_id: GroupId,
    pub user_cluster_id: GroupId,
    pub role_cluster_id: GroupId,
    pub algorithm_cluster_id: GroupId,
    pub registration_cluster_id: GroupId,
    pub customer_cluster_id: GroupId,
    /// Milliseconds.
    pub propose_timeout: u64,
    pub read_timeout: u64,
    pub join_timeout: u64,
    pub gossip_interval: u64,
    pub suspect_timeout: u64,
    pub dead_timeout: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            node_id: 0,
            data_dir: PathBuf::from("data"),
            listen: "127.0.0.1".to_string(),
            gossip_port: 7946,
            raft_port: 60020,
            gossip_peers: vec![],
            raft_peers: vec![],
            bootstrap: 0,
            max_nodes: 9,
            virtual_nodes: 10,
            requested_leader_id: 0,
            system_cluster_id: 420,
            organization_cluster_id: 101,
            role_cluster_id: 103,
            user_cluster_id: 104,
            algorithm_cluster_id: 105,
            registration_cluster_id: 106,
            customer_cluster_id: 107,
            propose_timeout: 5_000,
            read_timeout: 5_000,
            join_timeout: 60_000,
            gossip_interval: 200,
            suspect_timeout: 2_000,
            dead_timeout: 10_000,
        }
    }
}

/// The well known groups every node hosts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClusterIds {
    pub system: GroupId,
    pub organization: GroupId,
    pub user: GroupId,
    pub role: GroupId,
    pub algorithm: GroupId,
    pub registration: GroupId,
    pub customer: GroupId,
}

impl ClusterIds {
    pub fn all(&self) -> [GroupId; 7] {
        [
            self.system,
            self.organization,
            self.user,
            self.role,
            self.algorithm,
            self.registration,
            self.customer,
        ]
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(FurrowError::InvalidConfig(msg));
        if self.bootstrap != 0 && !(3..=9).contains(&self.bootstrap) {
            return invalid(format!("bootstrap must be 0 or between 3 and 9, got {}", self.bootstrap));
        }
        if self.max_nodes < self.bootstrap {
            return invalid("max_nodes cannot be lower than bootstrap".to_string());
        }
        if self.virtual_nodes == 0 {
            return invalid("virtual_nodes cannot be 0".to_string());
        }
        let ids = self.cluster_ids().all();
        if ids.contains(&0) {
            return invalid("cluster ids cannot be 0".to_string());
        }
        if ids.iter().collect::<HashSet<_>>().len() != ids.len() {
            return invalid("cluster ids must be distinct".to_string());
        }
        if self.bootstrap > 0 {
            if self.raft_peers.len() != self.bootstrap {
                return invalid(format!(
                    "bootstrapping {} nodes needs as many raft peers, got {}",
                    self.bootstrap,
                    self.raft_peers.len()
                ));
            }
            if self.node_id == 0 || self.node_id as usize > self.bootstrap {
                return invalid(format!("bootstrap node id {} out of range", self.node_id));
            }
            if self.requested_leader_id as usize > self.bootstrap {
                return invalid(format!(
                    "requested leader {} is not a bootstrap node",
                    self.requested_leader_id
                ));
            }
        }
        if self.propose_timeout == 0 || self.read_timeout == 0 {
            return invalid("timeouts cannot be 0".to_string());
        }
        Ok(())
    }

    pub fn cluster_ids(&self) -> ClusterIds {
        ClusterIds {
            system: self.system_cluster_id,
            organization: self.organization_cluster_id,
            user: self.user_cluster_id,
            role: self.role_cluster_id,
            algorithm: self.algorithm_cluster_id,
            registration: self.registration_cluster_id,
            customer: self.customer_cluster_id,
        }
    }

    pub fn raft_address(&self) -> String {
        format!("{}:{}", self.listen, self.raft_port)
    }

    pub fn gossip_address(&self) -> String {
        format!("{}:{}", self.listen, self.gossip_port)
    }

    pub fn is_bootstrap(&self) -> bool {
        self.bootstrap > 0
    }

    pub fn propose_timeout(&self) -> Duration {
        Duration::from_millis(self.propose_timeout)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout)
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval)
    }

    pub fn suspect_timeout(&self) -> Duration {
        Duration::from_millis(self.suspect_timeout)
    }

    pub fn dead_timeout(&self) -> Duration {
        Duration::from_millis(self.dead_timeout)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Directory for daily rolling log files. Logs go to stdout only when unset.
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
            directory: None,
            file_prefix: "furrow.log".to_string(),
        }
    }
}

/// Loads the configuration file at `path`, overridden by `FURROW__SECTION__KEY` environment
/// variables.
pub fn load<P: AsRef<Path>>(path: P) -> Result<FurrowConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::from(path.as_ref()))
        .add_source(
            config::Environment::with_prefix("FURROW")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    let config: FurrowConfig = settings.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

/// Outbound channels to collaborators outside the core.
#[derive(Clone, Debug)]
pub struct Channels {
    /// Seed aggregates of newly provisioned farms, to be saved through the farm facade.
    pub provisioner: mpsc::Sender<FarmConfig>,
    /// IDs of deleted farms.
    pub deprovisioner: mpsc::Sender<GroupId>,
    /// IDs of farms whose schedules should start ticking.
    pub ticker_provisioner: mpsc::Sender<GroupId>,
}

#[derive(Debug)]
pub struct ChannelReceivers {
    pub provisioner: mpsc::Receiver<FarmConfig>,
    pub deprovisioner: mpsc::Receiver<GroupId>,
    pub ticker_provisioner: mpsc::Receiver<GroupId>,
}

impl Channels {
    pub fn new() -> (Channels, ChannelReceivers) {
        let (provisioner, provisioner_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (deprovisioner, deprovisioner_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (ticker_provisioner, ticker_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Channels {
                provisioner,
                deprovisioner,
                ticker_provisioner,
            },
            ChannelReceivers {
                provisioner: provisioner_rx,
                deprovisioner: deprovisioner_rx,
                ticker_provisioner: ticker_rx,
            },
        )
    }
}
