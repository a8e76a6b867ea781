//! Record facades. Each facade translates domain records into proposals and queries against the
//! group that stores them, picking the read path from the requested consistency.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::config::{Channels, ClusterIds};
use crate::error::{FurrowError, Result};
use crate::host::Host;
use crate::ids::{self, IdGenerator};
use crate::machine::{Envelope, Query};
use crate::model::{
    Algorithm, Consistency, Customer, DeviceData, FarmState, Organization, Record, Registration,
    Role, ServerRecord, User,
};
use crate::raft::GroupId;

mod event;
mod farm;

pub use event::EventLogDao;
pub use farm::FarmDao;

/// Get, save, delete and scan records of one kind stored in one group.
pub struct RecordDao<T: Record> {
    host: Arc<Host>,
    group: GroupId,
    ids: IdGenerator,
    _record: PhantomData<T>,
}

impl<T: Record> Clone for RecordDao<T> {
    fn clone(&self) -> Self {
        RecordDao::new(self.host.clone(), self.group)
    }
}

impl<T: Record> std::fmt::Debug for RecordDao<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RecordDao {{ group: {} }}", self.group)
    }
}

impl<T: Record> RecordDao<T> {
    pub fn new(host: Arc<Host>, group: GroupId) -> Self {
        RecordDao {
            host,
            group,
            ids: IdGenerator::new(),
            _record: PhantomData,
        }
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    pub(crate) async fn read(&self, query: &Query, level: Consistency) -> Result<Vec<u8>> {
        match level {
            Consistency::Local => self.host.local_read(self.group, query).await,
            Consistency::Quorum => self.host.linearizable_read(self.group, query).await,
        }
    }

    /// Reads the record stored under `id`. Machines keyed by something else, such as customers by
    /// email, are read with [`RecordDao::reload`].
    pub async fn get(&self, id: u64, level: Consistency) -> Result<T> {
        self.get_by(&Query::id(id), level).await
    }

    /// Reads the stored copy of `record` through the record's own key.
    pub async fn reload(&self, record: &T, level: Consistency) -> Result<T> {
        let mut record = record.clone();
        self.derive_id(&mut record);
        self.get_by(&record.query(), level).await
    }

    pub async fn get_by(&self, query: &Query, level: Consistency) -> Result<T> {
        let bytes = self.read(query, level).await?;
        T::decode(&bytes)
    }

    fn derive_id(&self, record: &mut T) {
        if record.id() == 0 {
            record.set_id(self.ids.new_id(&record.identity()));
        }
    }

    /// Stores the record, deriving its ID first when it has none.
    pub async fn save(&self, record: &mut T) -> Result<()> {
        self.derive_id(record);
        let envelope = Envelope::update(record.encode()?);
        self.host.propose(self.group, envelope.encode()?).await?;
        Ok(())
    }

    /// Removes the record, deriving its ID the way [`RecordDao::save`] does.
    pub async fn delete(&self, record: &T) -> Result<()> {
        let mut record = record.clone();
        self.derive_id(&mut record);
        let envelope = Envelope::delete(record.encode()?);
        self.host.propose(self.group, envelope.encode()?).await?;
        Ok(())
    }

    /// Every record in key order. An empty group yields an empty list.
    pub async fn get_all(&self, level: Consistency) -> Result<Vec<T>> {
        let bytes = self.read(&Query::Wildcard, level).await?;
        T::decode_all(&bytes)
    }

    pub async fn count(&self, level: Consistency) -> Result<u64> {
        let bytes = self.read(&Query::Count, level).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Records with `start <= key < end`, for machines keyed by sequence.
    pub async fn get_range(&self, start: u64, end: u64, level: Consistency) -> Result<Vec<T>> {
        let bytes = self.read(&Query::range(start, end), level).await?;
        T::decode_all(&bytes)
    }

    /// First record matching `predicate`, by full scan.
    pub async fn find<F>(&self, level: Consistency, predicate: F) -> Result<T>
    where
        F: Fn(&T) -> bool,
    {
        self.get_all(level)
            .await?
            .into_iter()
            .find(|record| predicate(record))
            .ok_or(FurrowError::NotFound)
    }
}

impl RecordDao<User> {
    pub async fn get_by_email(&self, email: &str, level: Consistency) -> Result<User> {
        self.find(level, |user| user.email == email).await
    }
}

impl RecordDao<Role> {
    pub async fn get_by_name(&self, name: &str, level: Consistency) -> Result<Role> {
        self.find(level, |role| role.name == name).await
    }
}

impl RecordDao<Organization> {
    pub async fn get_by_name(&self, name: &str, level: Consistency) -> Result<Organization> {
        self.find(level, |org| org.name == name).await
    }
}

impl RecordDao<Algorithm> {
    pub async fn get_by_name(&self, name: &str, level: Consistency) -> Result<Algorithm> {
        self.find(level, |algorithm| algorithm.name == name).await
    }
}

impl RecordDao<Customer> {
    pub async fn get_by_email(&self, email: &str, level: Consistency) -> Result<Customer> {
        let template = Customer {
            email: email.to_string(),
            ..Default::default()
        };
        self.reload(&template, level).await
    }
}

impl RecordDao<Registration> {
    pub async fn get_by_email(&self, email: &str, level: Consistency) -> Result<Registration> {
        self.find(level, |registration| registration.email == email).await
    }
}

impl RecordDao<ServerRecord> {
    /// The system record, or an empty one before anything was stored.
    pub async fn get_server(&self, level: Consistency) -> Result<ServerRecord> {
        match self.get(self.group, level).await {
            Err(FurrowError::NotFound) => Ok(ServerRecord::new(self.group)),
            res => res,
        }
    }
}

/// Every facade a node serves, bound to one host.
#[derive(Debug, Clone)]
pub struct Datastore {
    host: Arc<Host>,
    pub ids: ClusterIds,
    pub server: RecordDao<ServerRecord>,
    pub organizations: RecordDao<Organization>,
    pub users: RecordDao<User>,
    pub roles: RecordDao<Role>,
    pub algorithms: RecordDao<Algorithm>,
    pub customers: RecordDao<Customer>,
    pub registrations: RecordDao<Registration>,
    pub farms: FarmDao,
}

impl Datastore {
    pub fn new(host: Arc<Host>, ids: ClusterIds, channels: Channels) -> Self {
        let server = RecordDao::new(host.clone(), ids.system);
        let users = RecordDao::new(host.clone(), ids.user);
        Datastore {
            farms: FarmDao::new(host.clone(), server.clone(), users.clone(), channels),
            organizations: RecordDao::new(host.clone(), ids.organization),
            roles: RecordDao::new(host.clone(), ids.role),
            algorithms: RecordDao::new(host.clone(), ids.algorithm),
            customers: RecordDao::new(host.clone(), ids.customer),
            registrations: RecordDao::new(host.clone(), ids.registration),
            server,
            users,
            host,
            ids,
        }
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    pub fn farm_state(&self, state_group: GroupId) -> RecordDao<FarmState> {
        RecordDao::new(self.host.clone(), state_group)
    }

    /// The event log of a farm, or of the whole system for the system group ID.
    pub fn event_log(&self, scope: GroupId) -> EventLogDao {
        EventLogDao::new(RecordDao::new(self.host.clone(), ids::event_log_id(scope)))
    }

    pub fn device_data(&self, farm_id: GroupId, device_id: u64) -> RecordDao<DeviceData> {
        RecordDao::new(self.host.clone(), ids::device_data_id(farm_id, device_id))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::host::testing;
    use crate::machine::MachineKind;

    const ORGS: GroupId = 101;
    const CUSTOMERS: GroupId = 106;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delete_derives_a_missing_id() -> Result<()> {
        let dir = tempdir()?;
        let host = testing::single_node(dir.path()).await?;
        testing::start(&host, ORGS, MachineKind::Organization).await?;
        let orgs = RecordDao::<Organization>::new(host.clone(), ORGS);

        let mut acme = Organization::new("acme");
        orgs.save(&mut acme).await?;
        assert_ne!(acme.id, 0);
        assert_eq!(orgs.count(Consistency::Quorum).await?, 1);

        orgs.delete(&Organization::new("acme")).await?;
        assert_eq!(orgs.count(Consistency::Quorum).await?, 0);
        assert_eq!(orgs.get(acme.id, Consistency::Local).await, Err(FurrowError::NotFound));
        host.stop().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn customers_are_read_by_email() -> Result<()> {
        let dir = tempdir()?;
        let host = testing::single_node(dir.path()).await?;
        testing::start(&host, CUSTOMERS, MachineKind::Customer).await?;
        let customers = RecordDao::<Customer>::new(host.clone(), CUSTOMERS);

        let mut customer = Customer {
            email: "billing@acme.io".to_string(),
            name: "Acme".to_string(),
            ..Default::default()
        };
        customers.save(&mut customer).await?;

        let stored = customers.reload(&customer, Consistency::Quorum).await?;
        assert_eq!(stored, customer);
        let by_email = customers
            .get_by_email("billing@acme.io", Consistency::Local)
            .await?;
        assert_eq!(by_email.name, "Acme");
        assert_eq!(
            customers.get_by_email("nobody@acme.io", Consistency::Local).await,
            Err(FurrowError::NotFound)
        );
        host.stop().await?;
        Ok(())
    }
}
