//! Cluster user events. Each travels as a named gossip event with a JSON payload; the names are
//! stable across releases.

use std::collections::BTreeMap;

use crate::error::{FurrowError, Result};
use crate::gossip::member::Member;
use crate::model::Consistency;
use crate::raft::{GroupId, NodeId};

pub const WORKER_AVAILABLE: &str = "worker-available";
pub const WORKER_ASSIGNED: &str = "worker-assigned";
pub const PROVISION_REQUEST: &str = "provision-request";

/// A node without a system-group ID announcing its raft address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerAvailable {
    pub raft_address: String,
}

/// The system-group leader admitted a worker under `node_id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerAssigned {
    pub node_id: NodeId,
    pub raft_address: String,
    /// System-group voters after the admission, so the worker can reach its peers.
    #[serde(default)]
    pub members: BTreeMap<NodeId, String>,
}

/// Create the groups of a new farm.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    pub farm_name: String,
    pub org_id: u64,
    pub config_id: GroupId,
    pub state_id: GroupId,
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

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterEvent {
    WorkerAvailable(WorkerAvailable),
    WorkerAssigned(WorkerAssigned),
    ProvisionRequest(ProvisionRequest),
}

impl ClusterEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClusterEvent::WorkerAvailable(_) => WORKER_AVAILABLE,
            ClusterEvent::WorkerAssigned(_) => WORKER_ASSIGNED,
            ClusterEvent::ProvisionRequest(_) => PROVISION_REQUEST,
        }
    }

    pub fn payload(&self) -> Result<Vec<u8>> {
        let payload = match self {
            ClusterEvent::WorkerAvailable(e) => serde_json::to_vec(e)?,
            ClusterEvent::WorkerAssigned(e) => serde_json::to_vec(e)?,
            ClusterEvent::ProvisionRequest(e) => serde_json::to_vec(e)?,
        };
        Ok(payload)
    }

    pub fn decode(name: &str, payload: &[u8]) -> Result<ClusterEvent> {
        match name {
            WORKER_AVAILABLE => Ok(ClusterEvent::WorkerAvailable(serde_json::from_slice(payload)?)),
            WORKER_ASSIGNED => Ok(ClusterEvent::WorkerAssigned(serde_json::from_slice(payload)?)),
            PROVISION_REQUEST => Ok(ClusterEvent::ProvisionRequest(serde_json::from_slice(payload)?)),
            other => Err(FurrowError::serialization(format!("unknown user event {}", other))),
        }
    }
}

/// A named event with an opaque payload, as it travels through gossip.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEvent {
    pub name: String,
    pub payload: Vec<u8>,
}

/// What the gossip layer reports to the cluster loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GossipEvent {
    MemberJoin(Member),
    MemberLeave(Member),
    MemberFailed(Member),
    User(UserEvent),
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn payloads_are_camel_case_json() {
        let event = ClusterEvent::WorkerAssigned(WorkerAssigned {
            node_id: 4,
            raft_address: "10.0.0.4:60020".to_string(),
            members: BTreeMap::from([(1, "10.0.0.1:60020".to_string())]),
        });
        let payload: serde_json::Value = serde_json::from_slice(&event.payload().unwrap()).unwrap();
        assert_eq!(
            payload,
            json!({"nodeId": 4, "raftAddress": "10.0.0.4:60020", "members": {"1": "10.0.0.1:60020"}})
        );
        assert_eq!(event.name(), "worker-assigned");
    }

    #[test]
    fn decode_by_name() {
        let payload = br#"{"farmName":"north","orgId":1,"configId":2,"stateId":3,"userId":4,"roleId":5}"#;
        match ClusterEvent::decode(PROVISION_REQUEST, payload).unwrap() {
            ClusterEvent::ProvisionRequest(request) => {
                assert_eq!(request.farm_name, "north");
                assert_eq!(request.consistency, Consistency::Local);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(ClusterEvent::decode("member-join", b"{}").is_err());
    }
}
