//! Creating the groups a new farm needs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{FurrowError, Result};
use crate::facade::FarmDao;
use crate::gossip::{ClusterEvent, Gossip, ProvisionRequest};
use crate::host::Host;
use crate::ids::{self, IdGenerator};
use crate::model::{
    Consistency, Device, DeviceSetting, FarmConfig, Role, User, SERVER_DEVICE,
};
use crate::raft::{GroupId, NodeId};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What a caller asks for when provisioning a farm.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionParams {
    pub org_id: u64,
    pub farm_name: String,
    pub user_id: u64,
    pub role_id: u64,
    #[serde(default)]
    pub config_store: String,
    #[serde(default)]
    pub state_store: String,
    #[serde(default)]
    pub data_store: String,
    #[serde(default)]
    pub consistency: Consistency,
}

impl ProvisionParams {
    /// The request gossiped to every node, with the farm's group IDs derived.
    pub fn request(&self) -> ProvisionRequest {
        let config_id = ids::farm_id(self.org_id, &self.farm_name);
        ProvisionRequest {
            farm_name: self.farm_name.clone(),
            org_id: self.org_id,
            config_id,
            state_id: ids::state_id(&self.farm_name, config_id),
            user_id: self.user_id,
            role_id: self.role_id,
            config_store: self.config_store.clone(),
            state_store: self.state_store.clone(),
            data_store: self.data_store.clone(),
            consistency: self.consistency,
        }
    }
}

/// Builds the seed aggregate of a newly provisioned farm.
pub trait Initializer: Send + Sync {
    fn build_config(&self, request: &ProvisionRequest) -> Result<FarmConfig>;
}

/// Seeds a farm with its server device, whose settings carry the farm-wide options, and the
/// provisioning user.
#[derive(Debug, Clone)]
pub struct DefaultInitializer {
    pub mode: String,
    pub interval: u64,
    pub timezone: String,
    ids: IdGenerator,
}

impl Default for DefaultInitializer {
    fn default() -> Self {
        DefaultInitializer {
            mode: "virtual".to_string(),
            interval: 60,
            timezone: "UTC".to_string(),
            ids: IdGenerator::new(),
        }
    }
}

impl Initializer for DefaultInitializer {
    fn build_config(&self, request: &ProvisionRequest) -> Result<FarmConfig> {
        if request.farm_name.is_empty() {
            return Err(FurrowError::InvalidConfig("farm name cannot be empty".to_string()));
        }
        let farm_id = request.config_id;
        let device_id = self.ids.new_id(&format!("{}-{}", farm_id, SERVER_DEVICE));
        let interval = self.interval.to_string();
        let mut settings: Vec<DeviceSetting> = [
            ("name", request.farm_name.as_str()),
            ("mode", self.mode.as_str()),
            ("interval", interval.as_str()),
            ("timezone", self.timezone.as_str()),
        ]
        .iter()
        .map(|(key, value)| DeviceSetting {
            id: self.ids.new_id(&format!("{}-{}", device_id, key)),
            device_id,
            key: key.to_string(),
            value: value.to_string(),
        })
        .collect();
        settings.sort_by_key(|s| s.id);

        let mut farm = FarmConfig {
            id: farm_id,
            org_id: request.org_id,
            name: request.farm_name.clone(),
            mode: self.mode.clone(),
            interval: self.interval,
            timezone: self.timezone.clone(),
            consistency: request.consistency,
            config_group: request.config_id,
            state_group: request.state_id,
            ..Default::default()
        };
        farm.put_device(Device {
            id: device_id,
            device_type: SERVER_DEVICE.to_string(),
            description: "farm controller".to_string(),
            enable: true,
            settings,
            ..Default::default()
        });
        if request.user_id != 0 {
            let mut user = User {
                id: request.user_id,
                org_id: request.org_id,
                ..Default::default()
            };
            if request.role_id != 0 {
                user.roles.push(Role {
                    id: request.role_id,
                    ..Default::default()
                });
            }
            farm.put_user(user);
        }
        Ok(farm)
    }
}

/// Provisions farms by gossiping a request and waiting for the new groups to elect leaders.
#[derive(Debug, Clone)]
pub struct Provisioner {
    gossip: Arc<Gossip>,
    host: Arc<Host>,
    timeout: Duration,
}

impl Provisioner {
    pub fn new(gossip: Arc<Gossip>, host: Arc<Host>, timeout: Duration) -> Self {
        Provisioner {
            gossip,
            host,
            timeout,
        }
    }

    /// Returns once the farm's config and state groups run here and know a leader. The first save
    /// of the aggregate is left to the provisioner channel's consumer.
    #[tracing::instrument(level = "info", skip(self, params), fields(farm = %params.farm_name))]
    pub async fn provision(&self, params: &ProvisionParams) -> Result<ProvisionRequest> {
        let request = params.request();
        self.gossip
            .user_event(&ClusterEvent::ProvisionRequest(request.clone()))
            .await?;
        let deadline = Instant::now() + self.timeout;
        for group in [request.config_id, request.state_id] {
            let leader = self.wait_for_group(group, deadline).await?;
            tracing::debug!(group, leader, "farm group ready");
        }
        Ok(request)
    }

    async fn wait_for_group(&self, group: GroupId, deadline: Instant) -> Result<NodeId> {
        while !self.host.has_group(group) {
            if Instant::now() >= deadline {
                return Err(FurrowError::Timeout);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.host.wait_for_ready(group, remaining).await
    }
}

/// Saves every aggregate published on the provisioner channel through the farm facade, until
/// the channel closes.
pub async fn consume_provisioned(mut farms_rx: mpsc::Receiver<FarmConfig>, farms: FarmDao) {
    while let Some(mut farm) = farms_rx.recv().await {
        let farm_id = farm.id;
        match farms.save(&mut farm).await {
            Ok(()) => tracing::info!(farm = farm_id, "saved provisioned farm"),
            Err(err @ FurrowError::PartialSaveConsistencyWarning(_)) => {
                tracing::warn!(farm = farm_id, %err, "provisioned farm saved with stale references")
            }
            Err(err) => tracing::error!(farm = farm_id, %err, "failed to save provisioned farm"),
        }
    }
}
