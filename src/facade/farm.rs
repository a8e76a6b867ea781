use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::Channels;
use crate::error::{FurrowError, Result};
use crate::facade::RecordDao;
use crate::host::Host;
use crate::ids::{self, IdGenerator};
use crate::model::{
    Channel, Condition, Consistency, Device, FarmConfig, Metric, Schedule, ServerRecord, User,
    Workflow, WorkflowStep,
};
use crate::raft::GroupId;

type FarmLocks = Arc<parking_lot::Mutex<HashMap<GroupId, Arc<Mutex<()>>>>>;

/// Facade over farm aggregates. Each farm lives in its own group under the farm's ID. Nested
/// entities are changed by rewriting the whole aggregate, serialized per farm inside this process.
#[derive(Clone)]
pub struct FarmDao {
    host: Arc<Host>,
    server: RecordDao<ServerRecord>,
    users: RecordDao<User>,
    channels: Channels,
    ids: IdGenerator,
    locks: FarmLocks,
}

impl std::fmt::Debug for FarmDao {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FarmDao {{ server: {:?} }}", self.server)
    }
}

fn partial(what: &str, err: FurrowError) -> FurrowError {
    tracing::warn!(what, %err, "farm saved but reference update failed");
    FurrowError::PartialSaveConsistencyWarning(format!("{}: {}", what, err))
}

impl FarmDao {
    pub fn new(
        host: Arc<Host>,
        server: RecordDao<ServerRecord>,
        users: RecordDao<User>,
        channels: Channels,
    ) -> Self {
        FarmDao {
            host,
            server,
            users,
            channels,
            ids: IdGenerator::new(),
            locks: Default::default(),
        }
    }

    fn farms(&self, farm_id: GroupId) -> RecordDao<FarmConfig> {
        RecordDao::new(self.host.clone(), farm_id)
    }

    fn lock(&self, farm_id: GroupId) -> Arc<Mutex<()>> {
        self.locks.lock().entry(farm_id).or_default().clone()
    }

    pub async fn get(&self, farm_id: GroupId, level: Consistency) -> Result<FarmConfig> {
        self.farms(farm_id).get(farm_id, level).await
    }

    /// Every farm referenced by the server record that this node hosts.
    pub async fn get_all(&self, level: Consistency) -> Result<Vec<FarmConfig>> {
        let server = self.server.get_server(level).await?;
        let mut farms = Vec::with_capacity(server.farm_refs.len());
        for farm_id in server.farm_refs {
            match self.get(farm_id, level).await {
                Ok(farm) => farms.push(farm),
                Err(FurrowError::NotFound) | Err(FurrowError::GroupMissing(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(farms)
    }

    /// Stores the aggregate, then records the farm on the server record and on every embedded
    /// user. Reference failures surface as a consistency warning: the farm itself is saved.
    pub async fn save(&self, farm: &mut FarmConfig) -> Result<()> {
        if farm.id == 0 {
            farm.id = ids::farm_id(farm.org_id, &farm.name);
        }
        {
            let lock = self.lock(farm.id);
            let _guard = lock.lock().await;
            self.farms(farm.id).save(farm).await?;
        }
        self.add_refs(farm).await
    }

    async fn add_refs(&self, farm: &FarmConfig) -> Result<()> {
        let mut server = self
            .server
            .get_server(Consistency::Quorum)
            .await
            .map_err(|e| partial("server", e))?;
        if server.add_farm_ref(farm.id) {
            self.server
                .save(&mut server)
                .await
                .map_err(|e| partial("server", e))?;
        }

        for user in farm.users.iter().filter(|u| u.id != 0) {
            let mut stored = match self.users.reload(user, Consistency::Quorum).await {
                Ok(stored) => stored,
                Err(FurrowError::NotFound) => {
                    tracing::debug!(farm = farm.id, user = user.id, "embedded user is not stored");
                    continue;
                }
                Err(err) => return Err(partial("user", err)),
            };
            if stored.add_farm_ref(farm.id) {
                self.users
                    .save(&mut stored)
                    .await
                    .map_err(|e| partial("user", e))?;
            }
        }
        Ok(())
    }

    /// Deletes the aggregate and its references, and tells the deprovisioner. A farm without an ID
    /// is found under the ID its save would have derived.
    pub async fn delete(&self, farm: &FarmConfig) -> Result<()> {
        let mut farm = farm.clone();
        if farm.id == 0 {
            farm.id = ids::farm_id(farm.org_id, &farm.name);
        }
        let farm = &farm;
        {
            let lock = self.lock(farm.id);
            let _guard = lock.lock().await;
            self.farms(farm.id).delete(farm).await?;
        }

        let mut server = self
            .server
            .get_server(Consistency::Quorum)
            .await
            .map_err(|e| partial("server", e))?;
        if server.remove_farm_ref(farm.id) {
            self.server
                .save(&mut server)
                .await
                .map_err(|e| partial("server", e))?;
        }
        for user in farm.users.iter().filter(|u| u.id != 0) {
            match self.users.reload(user, Consistency::Quorum).await {
                Ok(mut stored) if stored.farm_refs.contains(&farm.id) => {
                    stored.farm_refs.retain(|id| *id != farm.id);
                    self.users
                        .save(&mut stored)
                        .await
                        .map_err(|e| partial("user", e))?;
                }
                Ok(_) | Err(FurrowError::NotFound) => {}
                Err(err) => return Err(partial("user", err)),
            }
        }

        if let Err(err) = self.channels.deprovisioner.try_send(farm.id) {
            tracing::warn!(farm = farm.id, %err, "could not publish deprovisioned farm");
        }
        Ok(())
    }

    /// Read-modify-write of one aggregate under the farm's lock.
    pub async fn update<F>(&self, farm_id: GroupId, change: F) -> Result<FarmConfig>
    where
        F: FnOnce(&mut FarmConfig) -> Result<()>,
    {
        let lock = self.lock(farm_id);
        let _guard = lock.lock().await;
        let farms = self.farms(farm_id);
        let mut farm = farms.get(farm_id, Consistency::Local).await?;
        change(&mut farm)?;
        farms.save(&mut farm).await?;
        Ok(farm)
    }

    fn assign(&self, id: &mut u64, identity: String) {
        if *id == 0 {
            *id = self.ids.new_id(&identity);
        }
    }

    pub async fn save_device(&self, farm_id: GroupId, mut device: Device) -> Result<FarmConfig> {
        self.assign(&mut device.id, format!("{}-{}", farm_id, device.device_type));
        self.update(farm_id, move |farm| {
            farm.put_device(device);
            Ok(())
        })
        .await
    }

    pub async fn delete_device(&self, farm_id: GroupId, device_id: u64) -> Result<FarmConfig> {
        self.update(farm_id, |farm| farm.delete_device(device_id)).await
    }

    pub async fn set_device_setting(
        &self,
        farm_id: GroupId,
        device_id: u64,
        key: &str,
        value: &str,
    ) -> Result<FarmConfig> {
        let id = self.ids.new_id(&format!("{}-{}", device_id, key));
        self.update(farm_id, |farm| farm.set_device_setting(device_id, id, key, value))
            .await
    }

    pub async fn save_metric(&self, farm_id: GroupId, mut metric: Metric) -> Result<FarmConfig> {
        self.assign(&mut metric.id, format!("{}-{}", metric.device_id, metric.key));
        self.update(farm_id, move |farm| farm.put_metric(metric)).await
    }

    pub async fn delete_metric(&self, farm_id: GroupId, device_id: u64, id: u64) -> Result<FarmConfig> {
        self.update(farm_id, |farm| farm.delete_metric(device_id, id)).await
    }

    pub async fn save_channel(&self, farm_id: GroupId, mut channel: Channel) -> Result<FarmConfig> {
        self.assign(
            &mut channel.id,
            format!("{}-{}-{}", channel.device_id, channel.channel_id, channel.name),
        );
        self.update(farm_id, move |farm| farm.put_channel(channel)).await
    }

    pub async fn delete_channel(&self, farm_id: GroupId, id: u64) -> Result<FarmConfig> {
        self.update(farm_id, |farm| farm.delete_channel(id)).await
    }

    pub async fn save_condition(&self, farm_id: GroupId, mut condition: Condition) -> Result<FarmConfig> {
        self.assign(
            &mut condition.id,
            format!(
                "{}-{}-{}-{}",
                condition.channel_id, condition.metric_id, condition.comparator, condition.threshold
            ),
        );
        self.update(farm_id, move |farm| farm.put_condition(condition)).await
    }

    pub async fn delete_condition(&self, farm_id: GroupId, channel_id: u64, id: u64) -> Result<FarmConfig> {
        self.update(farm_id, |farm| farm.delete_condition(channel_id, id)).await
    }

    pub async fn save_schedule(&self, farm_id: GroupId, mut schedule: Schedule) -> Result<FarmConfig> {
        self.assign(
            &mut schedule.id,
            format!("{}-{}-{}", schedule.channel_id, schedule.start_date, schedule.frequency),
        );
        self.update(farm_id, move |farm| farm.put_schedule(schedule)).await
    }

    pub async fn delete_schedule(&self, farm_id: GroupId, channel_id: u64, id: u64) -> Result<FarmConfig> {
        self.update(farm_id, |farm| farm.delete_schedule(channel_id, id)).await
    }

    pub async fn save_workflow(&self, farm_id: GroupId, mut workflow: Workflow) -> Result<FarmConfig> {
        self.assign(&mut workflow.id, format!("{}-{}", farm_id, workflow.name));
        self.update(farm_id, move |farm| {
            farm.put_workflow(workflow);
            Ok(())
        })
        .await
    }

    pub async fn delete_workflow(&self, farm_id: GroupId, id: u64) -> Result<FarmConfig> {
        self.update(farm_id, |farm| farm.delete_workflow(id)).await
    }

    pub async fn save_workflow_step(&self, farm_id: GroupId, mut step: WorkflowStep) -> Result<FarmConfig> {
        self.assign(
            &mut step.id,
            format!("{}-{}-{}", step.workflow_id, step.device_id, step.channel_id),
        );
        self.update(farm_id, move |farm| farm.put_workflow_step(step)).await
    }

    pub async fn delete_workflow_step(&self, farm_id: GroupId, workflow_id: u64, id: u64) -> Result<FarmConfig> {
        self.update(farm_id, |farm| farm.delete_workflow_step(workflow_id, id)).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::tempdir;

    use super::*;
    use crate::host::testing;
    use crate::machine::MachineKind;
    use crate::model::{Role, SERVER_DEVICE};

    const SYSTEM: GroupId = 420;
    const USERS: GroupId = 104;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn save_updates_references() -> Result<()> {
        let dir = tempdir()?;
        let host = testing::single_node(dir.path()).await?;
        testing::start(&host, SYSTEM, MachineKind::Server).await?;
        testing::start(&host, USERS, MachineKind::User).await?;
        let (channels, mut receivers) = Channels::new();
        let users = RecordDao::<User>::new(host.clone(), USERS);
        let farms = FarmDao::new(
            host.clone(),
            RecordDao::new(host.clone(), SYSTEM),
            users.clone(),
            channels,
        );

        let mut owner = User::new("root@localhost");
        owner.roles.push(Role::new("admin"));
        users.save(&mut owner).await?;

        let mut farm = FarmConfig::new(1, "north");
        farm.users.push(owner.clone());
        let farm_id = ids::farm_id(1, "north");
        testing::start(&host, farm_id, MachineKind::Farm).await?;
        farms.save(&mut farm).await?;
        assert_eq!(farm.id, farm_id);

        let server = farms.server.get_server(Consistency::Quorum).await?;
        assert_eq!(server.farm_refs, vec![farm_id]);
        let stored = users.get(owner.id, Consistency::Quorum).await?;
        assert_eq!(stored.farm_refs, vec![farm_id]);

        // a template without an ID resolves to the stored farm
        farms.delete(&FarmConfig::new(1, "north")).await?;
        assert_eq!(receivers.deprovisioner.recv().await, Some(farm_id));
        assert_eq!(farms.get(farm_id, Consistency::Local).await, Err(FurrowError::NotFound));
        let server = farms.server.get_server(Consistency::Quorum).await?;
        assert!(server.farm_refs.is_empty());
        host.stop().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn nested_updates_rewrite_the_aggregate() -> Result<()> {
        let dir = tempdir()?;
        let host = testing::single_node(dir.path()).await?;
        testing::start(&host, SYSTEM, MachineKind::Server).await?;
        let (channels, _receivers) = Channels::new();
        let farms = FarmDao::new(
            host.clone(),
            RecordDao::new(host.clone(), SYSTEM),
            RecordDao::new(host.clone(), USERS),
            channels,
        );

        let mut farm = FarmConfig::new(1, "south");
        farm.id = ids::farm_id(1, "south");
        testing::start(&host, farm.id, MachineKind::Farm).await?;
        farms.save(&mut farm).await?;

        let farm_id = farm.id;
        let updated = farms
            .save_device(
                farm_id,
                Device {
                    device_type: SERVER_DEVICE.to_string(),
                    ..Default::default()
                },
            )
            .await?;
        let device_id = updated.devices[0].id;
        assert_ne!(device_id, 0);

        farms
            .save_channel(
                farm_id,
                Channel {
                    device_id,
                    name: "pump".to_string(),
                    ..Default::default()
                },
            )
            .await?;
        farms.set_device_setting(farm_id, device_id, "mode", "virtual").await?;

        let mut stored = tokio::time::timeout(Duration::from_secs(5), farms.get(farm_id, Consistency::Quorum)).await??;
        assert_eq!(stored.devices[0].channels[0].name, "pump");
        stored.parse_settings();
        assert_eq!(stored.mode, "virtual");

        assert_eq!(
            farms.delete_channel(farm_id, 12345).await,
            Err(FurrowError::NotFound)
        );
        host.stop().await?;
        Ok(())
    }
}
