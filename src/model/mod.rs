//! Domain records stored by the state machines. Every record is JSON encoded and carries the ID the
//! machine's key rule reads back out of the body.

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::machine::Query;

mod account;
mod event;
mod farm;
mod server;
mod state;

pub use account::{Algorithm, Customer, Organization, Registration, Role, User};
pub use event::EventLog;
pub use farm::{
    Channel, Condition, Device, DeviceSetting, FarmConfig, Metric, Schedule, Workflow,
    WorkflowStep, SERVER_DEVICE,
};
pub use server::ServerRecord;
pub use state::{DeviceData, DeviceState, FarmState};

pub trait Record: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {
    fn id(&self) -> u64;

    fn set_id(&mut self, id: u64);

    /// Stable string a missing ID is derived from.
    fn identity(&self) -> String;

    /// The point query that reads this record back.
    fn query(&self) -> Query {
        Query::id(self.id())
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Decodes the JSON array a wildcard or range query returns.
    fn decode_all(bytes: &[u8]) -> Result<Vec<Self>> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Read consistency requested by facade callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Consistency {
    /// Read the local replica at its applied index.
    #[default]
    Local,
    /// Read through a fresh read index.
    Quorum,
}

/// Entities nested in an aggregate, looked up by ID.
pub trait Nested {
    fn entity_id(&self) -> u64;
}

/// Replaces the entity with the same ID, or appends it.
pub fn upsert<T: Nested>(items: &mut Vec<T>, item: T) {
    match items.iter_mut().find(|existing| existing.entity_id() == item.entity_id()) {
        Some(existing) => *existing = item,
        None => items.push(item),
    }
}

/// Removes the entity with `id`, reporting whether it existed.
pub fn remove<T: Nested>(items: &mut Vec<T>, id: u64) -> bool {
    let before = items.len();
    items.retain(|item| item.entity_id() != id);
    items.len() != before
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
