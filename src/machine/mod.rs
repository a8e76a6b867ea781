//! Typed on-disk state machines. Every record kind is a [`DiskKv`] parameterized by the rule that
//! derives storage keys from record bodies.

use std::path::Path;
use std::sync::Arc;

use crate::raft::fsm::Fsm;
use crate::raft::{GroupId, NodeId};

mod diskkv;
mod envelope;
pub mod keys;
mod query;
pub mod snapshot;

pub use diskkv::DiskKv;
pub use envelope::{Envelope, Op};
pub use keys::{KeyRule, APPLIED_INDEX_KEY};
pub use query::Query;

pub type ServerMachine = DiskKv<keys::ServerKeys>;
pub type OrganizationMachine = DiskKv<keys::OrganizationKeys>;
pub type UserMachine = DiskKv<keys::UserKeys>;
pub type RoleMachine = DiskKv<keys::RoleKeys>;
pub type AlgorithmMachine = DiskKv<keys::AlgorithmKeys>;
pub type CustomerMachine = DiskKv<keys::CustomerKeys>;
pub type RegistrationMachine = DiskKv<keys::RegistrationKeys>;
pub type FarmMachine = DiskKv<keys::FarmKeys>;
pub type FarmStateMachine = DiskKv<keys::FarmStateKeys>;
pub type EventLogMachine = DiskKv<keys::EventLogKeys>;
pub type DeviceDataMachine = DiskKv<keys::DeviceDataKeys>;

/// Selects the machine type a group replicates. Groups are started from a kind so that the host
/// and the gossip layer can name machines in messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineKind {
    Server,
    Organization,
    User,
    Role,
    Algorithm,
    Customer,
    Registration,
    Farm,
    FarmState,
    EventLog,
    DeviceData,
}

impl MachineKind {
    pub fn create<P: AsRef<Path>>(self, data_dir: P, group: GroupId, node: NodeId) -> Arc<dyn Fsm> {
        let dir = data_dir.as_ref();
        match self {
            MachineKind::Server => Arc::new(ServerMachine::new(dir, group, node)),
            MachineKind::Organization => Arc::new(OrganizationMachine::new(dir, group, node)),
            MachineKind::User => Arc::new(UserMachine::new(dir, group, node)),
            MachineKind::Role => Arc::new(RoleMachine::new(dir, group, node)),
            MachineKind::Algorithm => Arc::new(AlgorithmMachine::new(dir, group, node)),
            MachineKind::Customer => Arc::new(CustomerMachine::new(dir, group, node)),
            MachineKind::Registration => Arc::new(RegistrationMachine::new(dir, group, node)),
            MachineKind::Farm => Arc::new(FarmMachine::new(dir, group, node)),
            MachineKind::FarmState => Arc::new(FarmStateMachine::new(dir, group, node)),
            MachineKind::EventLog => Arc::new(EventLogMachine::new(dir, group, node)),
            MachineKind::DeviceData => Arc::new(DeviceDataMachine::new(dir, group, node)),
        }
    }
}
