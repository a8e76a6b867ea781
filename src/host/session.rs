use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

use crate::raft::SessionTag;

/// At-most-once session of this host on one group. Every proposal takes the next series; a retry
/// of the same proposal reuses its tag so the group applies it once.
#[derive(Debug)]
pub struct Session {
    client_id: u64,
    series: AtomicU64,
}

impl Session {
    pub fn new() -> Session {
        Session {
            client_id: rand::thread_rng().gen(),
            series: AtomicU64::new(0),
        }
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn next(&self) -> SessionTag {
        SessionTag {
            client_id: self.client_id,
            series_id: self.series.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Session::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn series_increase() {
        let session = Session::new();
        let a = session.next();
        let b = session.next();
        assert_eq!(a.client_id, b.client_id);
        assert_eq!(a.series_id + 1, b.series_id);
    }
}
