//! The farm aggregate. A farm group stores the whole configuration of one farm, devices and their
//! nested channels, metrics, conditions and schedules, workflows and the embedded users, under the
//! farm's ID.

use crate::error::{FurrowError, Result};
use crate::model::{remove, upsert, Consistency, Nested, Record, User};

/// Device type that carries farm-wide settings.
pub const SERVER_DEVICE: &str = "server";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FarmConfig {
    pub id: u64,
    pub org_id: u64,
    pub name: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub interval: u64,
    #[serde(default)]
    pub timezone: String,
    #[serde(default)]
    pub consistency: Consistency,
    #[serde(default)]
    pub replicas: u32,
    #[serde(default)]
    pub config_group: u64,
    #[serde(default)]
    pub state_group: u64,
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub workflows: Vec<Workflow>,
    #[serde(default)]
    pub users: Vec<User>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: u64,
    pub farm_id: u64,
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub notify: bool,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub hardware_version: String,
    #[serde(default)]
    pub firmware_version: String,
    #[serde(default)]
    pub settings: Vec<DeviceSetting>,
    #[serde(default)]
    pub metrics: Vec<Metric>,
    #[serde(default)]
    pub channels: Vec<Channel>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSetting {
    pub id: u64,
    pub device_id: u64,
    pub key: String,
    pub value: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    pub id: u64,
    pub device_id: u64,
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub data_type: i32,
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub notify: bool,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub alarm_low: f64,
    #[serde(default)]
    pub alarm_high: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: u64,
    pub device_id: u64,
    #[serde(default)]
    pub channel_id: i32,
    pub name: String,
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub notify: bool,
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub debounce: u64,
    #[serde(default)]
    pub backoff: u64,
    #[serde(default)]
    pub algorithm_id: u64,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub schedules: Vec<Schedule>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub id: u64,
    pub channel_id: u64,
    pub metric_id: u64,
    pub comparator: String,
    pub threshold: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: u64,
    pub channel_id: u64,
    #[serde(default)]
    pub start_date: u64,
    #[serde(default)]
    pub end_date: Option<u64>,
    #[serde(default)]
    pub frequency: i32,
    #[serde(default)]
    pub interval: i32,
    #[serde(default)]
    pub count: i32,
    #[serde(default)]
    pub days: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: u64,
    pub farm_id: u64,
    pub name: String,
    #[serde(default)]
    pub last_completed: Option<u64>,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub id: u64,
    pub workflow_id: u64,
    pub device_id: u64,
    pub channel_id: u64,
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub wait: u64,
    #[serde(default)]
    pub state: i32,
}

macro_rules! nested {
    ($($ty:ty),*) => {
        $(
            impl Nested for $ty {
                fn entity_id(&self) -> u64 {
                    self.id
                }
            }
        )*
    };
}

nested!(Device, DeviceSetting, Metric, Channel, Condition, Schedule, Workflow, WorkflowStep);

fn missing(what: &str, id: u64) -> FurrowError {
    tracing::debug!(what, id, "nested entity not found");
    FurrowError::NotFound
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "true" | "1" | "on" | "yes")
}

impl FarmConfig {
    pub fn new(org_id: u64, name: &str) -> FarmConfig {
        FarmConfig {
            org_id,
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Applies the key/value settings stored on devices to the typed fields they describe.
    /// Settings of the server device configure the farm; `{type}.enable`, `{type}.notify` and
    /// `{type}.uri` configure the device of that type. Unknown keys are left alone.
    pub fn parse_settings(&mut self) {
        let mut farm_settings = Vec::new();
        for device in &self.devices {
            if device.device_type == SERVER_DEVICE {
                farm_settings.extend(device.settings.iter().cloned());
            }
        }
        for setting in farm_settings {
            match setting.key.as_str() {
                "name" => self.name = setting.value.clone(),
                "mode" => self.mode = setting.value.clone(),
                "timezone" => self.timezone = setting.value.clone(),
                "interval" => match setting.value.trim().parse() {
                    Ok(interval) => self.interval = interval,
                    Err(_) => tracing::warn!(farm = self.id, value = %setting.value, "invalid interval setting"),
                },
                _ => {}
            }
        }

        for device in &mut self.devices {
            let prefix = format!("{}.", device.device_type);
            let settings = device.settings.clone();
            for setting in settings {
                match setting.key.strip_prefix(&prefix) {
                    Some("enable") => device.enable = parse_flag(&setting.value),
                    Some("notify") => device.notify = parse_flag(&setting.value),
                    Some("uri") => device.uri = setting.value.clone(),
                    _ => {}
                }
            }
            device.settings.sort_by_key(|s| s.id);
        }
    }

    pub fn device(&self, id: u64) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn device_by_type(&self, device_type: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.device_type == device_type)
    }

    fn device_mut(&mut self, id: u64) -> Result<&mut Device> {
        self.devices
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| missing("device", id))
    }

    fn channel_mut(&mut self, id: u64) -> Result<&mut Channel> {
        self.devices
            .iter_mut()
            .flat_map(|d| d.channels.iter_mut())
            .find(|c| c.id == id)
            .ok_or_else(|| missing("channel", id))
    }

    fn workflow_mut(&mut self, id: u64) -> Result<&mut Workflow> {
        self.workflows
            .iter_mut()
            .find(|w| w.id == id)
            .ok_or_else(|| missing("workflow", id))
    }

    pub fn channel(&self, id: u64) -> Option<&Channel> {
        self.devices
            .iter()
            .flat_map(|d| d.channels.iter())
            .find(|c| c.id == id)
    }

    pub fn put_device(&mut self, mut device: Device) {
        device.farm_id = self.id;
        upsert(&mut self.devices, device);
    }

    pub fn delete_device(&mut self, id: u64) -> Result<()> {
        if remove(&mut self.devices, id) {
            Ok(())
        } else {
            Err(missing("device", id))
        }
    }

    /// Sets a device setting by key, creating it with `id` if absent.
    pub fn set_device_setting(&mut self, device_id: u64, id: u64, key: &str, value: &str) -> Result<()> {
        let device = self.device_mut(device_id)?;
        match device.settings.iter_mut().find(|s| s.key == key) {
            Some(setting) => setting.value = value.to_string(),
            None => device.settings.push(DeviceSetting {
                id,
                device_id,
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
        Ok(())
    }

    pub fn put_metric(&mut self, metric: Metric) -> Result<()> {
        let device = self.device_mut(metric.device_id)?;
        upsert(&mut device.metrics, metric);
        Ok(())
    }

    pub fn delete_metric(&mut self, device_id: u64, id: u64) -> Result<()> {
        let device = self.device_mut(device_id)?;
        if remove(&mut device.metrics, id) {
            Ok(())
        } else {
            Err(missing("metric", id))
        }
    }

    pub fn put_channel(&mut self, channel: Channel) -> Result<()> {
        let device = self.device_mut(channel.device_id)?;
        upsert(&mut device.channels, channel);
        Ok(())
    }

    pub fn delete_channel(&mut self, id: u64) -> Result<()> {
        let removed = self
            .devices
            .iter_mut()
            .any(|device| remove(&mut device.channels, id));
        if removed {
            Ok(())
        } else {
            Err(missing("channel", id))
        }
    }

    pub fn put_condition(&mut self, condition: Condition) -> Result<()> {
        let channel = self.channel_mut(condition.channel_id)?;
        upsert(&mut channel.conditions, condition);
        Ok(())
    }

    pub fn delete_condition(&mut self, channel_id: u64, id: u64) -> Result<()> {
        let channel = self.channel_mut(channel_id)?;
        if remove(&mut channel.conditions, id) {
            Ok(())
        } else {
            Err(missing("condition", id))
        }
    }

    pub fn put_schedule(&mut self, schedule: Schedule) -> Result<()> {
        let channel = self.channel_mut(schedule.channel_id)?;
        upsert(&mut channel.schedules, schedule);
        Ok(())
    }

    pub fn delete_schedule(&mut self, channel_id: u64, id: u64) -> Result<()> {
        let channel = self.channel_mut(channel_id)?;
        if remove(&mut channel.schedules, id) {
            Ok(())
        } else {
            Err(missing("schedule", id))
        }
    }

    pub fn put_workflow(&mut self, mut workflow: Workflow) {
        workflow.farm_id = self.id;
        upsert(&mut self.workflows, workflow);
    }

    pub fn delete_workflow(&mut self, id: u64) -> Result<()> {
        if remove(&mut self.workflows, id) {
            Ok(())
        } else {
            Err(missing("workflow", id))
        }
    }

    pub fn put_workflow_step(&mut self, step: WorkflowStep) -> Result<()> {
        let workflow = self.workflow_mut(step.workflow_id)?;
        upsert(&mut workflow.steps, step);
        Ok(())
    }

    pub fn delete_workflow_step(&mut self, workflow_id: u64, id: u64) -> Result<()> {
        let workflow = self.workflow_mut(workflow_id)?;
        if remove(&mut workflow.steps, id) {
            Ok(())
        } else {
            Err(missing("workflow step", id))
        }
    }

    pub fn put_user(&mut self, user: User) {
        upsert(&mut self.users, user);
    }
}

impl Record for FarmConfig {
    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn identity(&self) -> String {
        format!("{}-{}", self.org_id, self.name)
    }
}
