use crate::model::{now_millis, Record};

/// An entry of a farm's (or the system's) event log. The log machine keys events by the index
/// that appended them, so the ID only identifies the event inside its body.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct EventLog {
    pub id: u64,
    pub farm_id: u64,
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub event_type: String,
    pub message: String,
    /// Milliseconds since the unix epoch.
    pub timestamp: u64,
}

impl EventLog {
    pub fn new(farm_id: u64, level: &str, event_type: &str, message: &str) -> EventLog {
        EventLog {
            id: 0,
            farm_id,
            level: level.to_string(),
            event_type: event_type.to_string(),
            message: message.to_string(),
            timestamp: now_millis(),
        }
    }
}

impl Record for EventLog {
    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn identity(&self) -> String {
        format!("{}-{}-{}", self.farm_id, self.timestamp, self.message)
    }
}
