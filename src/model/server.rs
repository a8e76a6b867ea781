use crate::model::Record;

/// The single record of the system group: which farms and organizations exist cluster-wide.
/// It is stored under the system group's own ID.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub id: u64,
    #[serde(default)]
    pub farm_refs: Vec<u64>,
    #[serde(default)]
    pub org_refs: Vec<u64>,
}

impl ServerRecord {
    pub fn new(system_group: u64) -> ServerRecord {
        ServerRecord {
            id: system_group,
            ..Default::default()
        }
    }

    /// Adds a farm reference, returning false if it was already present.
    pub fn add_farm_ref(&mut self, farm_id: u64) -> bool {
        if self.farm_refs.contains(&farm_id) {
            return false;
        }
        self.farm_refs.push(farm_id);
        true
    }

    pub fn remove_farm_ref(&mut self, farm_id: u64) -> bool {
        let before = self.farm_refs.len();
        self.farm_refs.retain(|id| *id != farm_id);
        before != self.farm_refs.len()
    }
}

impl Record for ServerRecord {
    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn identity(&self) -> String {
        "server".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn farm_refs() {
        let mut server = ServerRecord::new(420);
        assert!(server.add_farm_ref(1));
        assert!(!server.add_farm_ref(1));
        assert!(server.remove_farm_ref(1));
        assert!(!server.remove_farm_ref(1));
    }
}
