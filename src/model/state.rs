use std::collections::BTreeMap;

use crate::model::Record;

/// Live readings and channel states of one device.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub channels: Vec<i32>,
    #[serde(default)]
    pub timestamp: u64,
}

/// Operational state of a farm, replicated by the farm's state group and keyed by farm ID.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FarmState {
    pub id: u64,
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceState>,
}

impl FarmState {
    pub fn new(farm_id: u64) -> FarmState {
        FarmState {
            id: farm_id,
            devices: BTreeMap::new(),
        }
    }

    pub fn set_metric(&mut self, device: &str, key: &str, value: f64) {
        self.devices
            .entry(device.to_string())
            .or_default()
            .metrics
            .insert(key.to_string(), value);
    }
}

impl Record for FarmState {
    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn identity(&self) -> String {
        format!("{}-state", self.id)
    }
}

/// Latest readings of one device, replicated by the device's data group.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeviceData {
    pub device_id: u64,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub timestamp: u64,
}

impl Record for DeviceData {
    fn id(&self) -> u64 {
        self.device_id
    }

    fn set_id(&mut self, id: u64) {
        self.device_id = id;
    }

    fn identity(&self) -> String {
        format!("{}-data", self.device_id)
    }
}
