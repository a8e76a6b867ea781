//! Key derivation rules. A rule turns the JSON body of a proposal into the storage key it lives
//! under; every machine type picks one.

use crate::error::{FurrowError, Result};
use crate::raft::{GroupId, LogIndex};

/// Reserved key holding the last applied log index. No rule may produce it.
pub const APPLIED_INDEX_KEY: &[u8] = b"__applied_index__";

pub trait KeyRule: Send + Sync + 'static {
    /// Machine kind, for logs.
    const KIND: &'static str;

    /// Whether the machine answers [`Query::Range`](super::Query::Range).
    const RANGED: bool = false;

    fn key(group: GroupId, index: LogIndex, body: &[u8]) -> Result<Vec<u8>>;
}

#[derive(Deserialize)]
struct IdField {
    id: u64,
}

#[derive(Deserialize)]
struct EmailField {
    email: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceField {
    device_id: u64,
}

fn id_key(body: &[u8]) -> Result<Vec<u8>> {
    let field: IdField = serde_json::from_slice(body)?;
    Ok(field.id.to_be_bytes().to_vec())
}

macro_rules! id_keyed {
    ($($name:ident => $kind:literal),* $(,)?) => {
        $(
            #[derive(Debug)]
            pub struct $name;

            impl KeyRule for $name {
                const KIND: &'static str = $kind;

                fn key(_group: GroupId, _index: LogIndex, body: &[u8]) -> Result<Vec<u8>> {
                    id_key(body)
                }
            }
        )*
    };
}

id_keyed! {
    OrganizationKeys => "organization",
    UserKeys => "user",
    RoleKeys => "role",
    AlgorithmKeys => "algorithm",
    RegistrationKeys => "registration",
    FarmKeys => "farm",
    FarmStateKeys => "farm-state",
}

/// The system group holds one server record, stored under the group's own ID.
#[derive(Debug)]
pub struct ServerKeys;

impl KeyRule for ServerKeys {
    const KIND: &'static str = "server";

    fn key(group: GroupId, _index: LogIndex, _body: &[u8]) -> Result<Vec<u8>> {
        Ok(group.to_be_bytes().to_vec())
    }
}

#[derive(Debug)]
pub struct CustomerKeys;

impl KeyRule for CustomerKeys {
    const KIND: &'static str = "customer";

    fn key(_group: GroupId, _index: LogIndex, body: &[u8]) -> Result<Vec<u8>> {
        let field: EmailField = serde_json::from_slice(body)?;
        let key = field.email.into_bytes();
        if key.is_empty() || key == APPLIED_INDEX_KEY {
            return Err(FurrowError::serialization("customer email is not a valid key"));
        }
        Ok(key)
    }
}

/// Events are keyed by the log index that appended them, so keys follow append order.
#[derive(Debug)]
pub struct EventLogKeys;

impl KeyRule for EventLogKeys {
    const KIND: &'static str = "event-log";
    const RANGED: bool = true;

    fn key(_group: GroupId, index: LogIndex, _body: &[u8]) -> Result<Vec<u8>> {
        Ok(index.to_be_bytes().to_vec())
    }
}

#[derive(Debug)]
pub struct DeviceDataKeys;

impl KeyRule for DeviceDataKeys {
    const KIND: &'static str = "device-data";
    const RANGED: bool = true;

    fn key(_group: GroupId, _index: LogIndex, body: &[u8]) -> Result<Vec<u8>> {
        let field: DeviceField = serde_json::from_slice(body)?;
        Ok(field.device_id.to_be_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_rules_read_the_id_field() {
        let key = OrganizationKeys::key(1, 5, br#"{"id": 9, "name": "acme"}"#).unwrap();
        assert_eq!(key, 9u64.to_be_bytes().to_vec());
        assert!(UserKeys::key(1, 5, br#"{"name": "x"}"#).is_err());
    }

    #[test]
    fn server_rule_ignores_body() {
        assert_eq!(ServerKeys::key(420, 3, b"{}").unwrap(), 420u64.to_be_bytes().to_vec());
    }

    #[test]
    fn customer_rule_uses_email() {
        let key = CustomerKeys::key(1, 1, br#"{"id": 2, "email": "a@b.c"}"#).unwrap();
        assert_eq!(key, b"a@b.c");
        assert!(CustomerKeys::key(1, 1, br#"{"email": "__applied_index__"}"#).is_err());
    }

    #[test]
    fn event_log_rule_uses_index() {
        assert_eq!(EventLogKeys::key(1, 17, b"{}").unwrap(), 17u64.to_be_bytes().to_vec());
        assert!(EventLogKeys::RANGED);
        assert!(!FarmKeys::RANGED);
    }

    #[test]
    fn device_rule_uses_device_id() {
        let key = DeviceDataKeys::key(1, 1, br#"{"deviceId": 3, "metrics": {}}"#).unwrap();
        assert_eq!(key, 3u64.to_be_bytes().to_vec());
    }
}
