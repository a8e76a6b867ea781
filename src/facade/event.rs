use crate::error::Result;
use crate::facade::RecordDao;
use crate::model::{Consistency, EventLog};

/// Append-only event log of one farm. Events are stored in append order; pages are served newest
/// first.
#[derive(Debug, Clone)]
pub struct EventLogDao {
    events: RecordDao<EventLog>,
}

impl EventLogDao {
    pub fn new(events: RecordDao<EventLog>) -> Self {
        EventLogDao { events }
    }

    pub fn group(&self) -> u64 {
        self.events.group()
    }

    pub async fn save(&self, event: &mut EventLog) -> Result<()> {
        self.events.save(event).await
    }

    /// Number of events. The machine counts by scanning its keys.
    pub async fn count(&self, level: Consistency) -> Result<u64> {
        self.events.count(level).await
    }

    /// Every event in append order.
    pub async fn get_all(&self, level: Consistency) -> Result<Vec<EventLog>> {
        self.events.get_all(level).await
    }

    pub async fn get_all_desc(&self, level: Consistency) -> Result<Vec<EventLog>> {
        let mut events = self.get_all(level).await?;
        events.reverse();
        Ok(events)
    }

    /// Events whose append index is in `[start, end)`.
    pub async fn get_range(&self, start: u64, end: u64, level: Consistency) -> Result<Vec<EventLog>> {
        self.events.get_range(start, end, level).await
    }

    /// One page of events, newest first. Pages start at 1; page 0 is treated as page 1.
    pub async fn get_page(&self, page: usize, size: usize, level: Consistency) -> Result<Vec<EventLog>> {
        let events = self.get_all(level).await?;
        Ok(paginate(events, page, size))
    }
}

fn paginate(mut events: Vec<EventLog>, page: usize, size: usize) -> Vec<EventLog> {
    events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    let page = page.max(1);
    let low = (page - 1).saturating_mul(size);
    if low >= events.len() {
        return vec![];
    }
    let high = low.saturating_add(size).min(events.len());
    events.drain(low..high).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(timestamp: u64) -> EventLog {
        EventLog {
            timestamp,
            message: format!("at {}", timestamp),
            ..Default::default()
        }
    }

    #[test]
    fn pages_newest_first() {
        let events = vec![event(1), event(3), event(2)];
        let page = paginate(events, 1, 10);
        let stamps: Vec<u64> = page.iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![3, 2, 1]);
    }

    #[test]
    fn page_zero_is_first_page() {
        let events: Vec<EventLog> = (1..=5).map(event).collect();
        assert_eq!(paginate(events.clone(), 0, 2), paginate(events, 1, 2));
    }

    #[test]
    fn page_bounds() {
        let events: Vec<EventLog> = (1..=5).map(event).collect();
        let last = paginate(events.clone(), 3, 2);
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].timestamp, 1);
        assert!(paginate(events.clone(), 4, 2).is_empty());
        assert!(paginate(events, 1, 0).is_empty());
    }
}
