//! Deterministic identifiers. Record IDs and per-farm group IDs are FNV-1a 64 hashes of stable
//! strings, so every node derives the same ID from the same inputs across restarts.

use crate::raft::GroupId;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Derives record and group identifiers from string keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdGenerator;

impl IdGenerator {
    pub fn new() -> Self {
        IdGenerator
    }

    pub fn new_id(&self, key: &str) -> u64 {
        fnv1a(key.as_bytes())
    }

    pub fn new_string_id(&self, key: &str) -> String {
        self.new_id(key).to_string()
    }

    pub fn uint64_bytes(&self, id: u64) -> Vec<u8> {
        id.to_be_bytes().to_vec()
    }
}

pub fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

pub fn farm_id(org_id: u64, farm_name: &str) -> GroupId {
    fnv1a(format!("{}-{}", org_id, farm_name).as_bytes())
}

pub fn state_id(farm_name: &str, farm_id: GroupId) -> GroupId {
    fnv1a(format!("{}-{}", farm_name, farm_id).as_bytes())
}

/// Event-log group for a farm, or for the system group when `scope` is the system cluster ID.
pub fn event_log_id(scope: GroupId) -> GroupId {
    fnv1a(format!("{}-eventlog", scope).as_bytes())
}

pub fn device_data_id(farm_id: GroupId, device_id: u64) -> GroupId {
    fnv1a(format!("{}-{}-devicedata", farm_id, device_id).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_reference_vectors() {
        assert_eq!(fnv1a(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a(b"a"), 0xaf63dc4c8601ec8c);
        assert_eq!(fnv1a(b"foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn derived_ids_are_stable() {
        let farm = farm_id(7, "north");
        assert_eq!(farm, farm_id(7, "north"));
        assert_ne!(farm, farm_id(8, "north"));
        assert_eq!(state_id("north", farm), fnv1a(format!("north-{}", farm).as_bytes()));
        assert_ne!(event_log_id(farm), event_log_id(420));
    }

    #[test]
    fn uint64_bytes_are_big_endian() {
        let ids = IdGenerator::new();
        assert_eq!(ids.uint64_bytes(1), vec![0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(ids.new_string_id("x"), ids.new_id("x").to_string());
    }
}
