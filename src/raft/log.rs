use std::fmt::{Debug, Formatter};

use crate::error::{FurrowError, Result};
use crate::raft::membership::Membership;
use crate::raft::store::{HardState, SnapshotMeta, Store};
use crate::raft::{Entry, EntryType, LogIndex, Term};

/// A group's replicated log. Caches the positions needed on every message and delegates
/// durability to a [`Store`].
pub struct RaftLog {
    store: Box<dyn Store>,
    last_index: LogIndex,
    last_term: Term,
    /// Last entry removed by compaction or replaced by a snapshot.
    offset: (LogIndex, Term),
    snapshot: Option<SnapshotMeta>,
}

impl Debug for RaftLog {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RaftLog {{ offset: {:?}, last: ({}, {}) }}",
            self.offset, self.last_index, self.last_term
        )
    }
}

impl RaftLog {
    pub fn new(store: Box<dyn Store>) -> Result<Self> {
        let offset = store.offset()?;
        let snapshot = store.snapshot()?.map(|(meta, _)| meta);
        let (last_index, last_term) = match store.last_index()? {
            Some(index) if index > offset.0 => {
                let entry = store
                    .get(index)?
                    .ok_or_else(|| FurrowError::Storage(format!("missing log entry {}", index)))?;
                (entry.index, entry.term)
            }
            _ => offset,
        };
        Ok(RaftLog {
            store,
            last_index,
            last_term,
            offset,
            snapshot,
        })
    }

    pub fn hard_state(&self) -> Result<HardState> {
        self.store.hard_state()
    }

    pub fn set_hard_state(&mut self, state: HardState) -> Result<()> {
        self.store.set_hard_state(&state)
    }

    pub fn last_index(&self) -> LogIndex {
        self.last_index
    }

    pub fn last_term(&self) -> Term {
        self.last_term
    }

    pub fn next_index(&self) -> LogIndex {
        self.last_index + 1
    }

    /// The first index still held as an entry.
    pub fn first_index(&self) -> LogIndex {
        self.offset.0 + 1
    }

    pub fn is_empty(&self) -> bool {
        self.last_index == 0
    }

    /// Term of the entry at `index`, if it is known.
    pub fn term(&self, index: LogIndex) -> Result<Option<Term>> {
        if index == self.offset.0 {
            return Ok(Some(self.offset.1));
        }
        if index < self.offset.0 || index > self.last_index {
            return Ok(None);
        }
        Ok(self.store.get(index)?.map(|entry| entry.term))
    }

    pub fn get(&self, index: LogIndex) -> Result<Option<Entry>> {
        if index < self.first_index() || index > self.last_index {
            return Ok(None);
        }
        self.store.get(index)
    }

    /// Entries in `start..=end`, clamped to what the log holds.
    pub fn range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<Entry>> {
        let start = start.max(self.first_index());
        let end = end.min(self.last_index);
        self.store.get_range(start, end)
    }

    /// Append an entry of `entry_type` at the next index.
    pub fn append(&mut self, term: Term, entry_type: EntryType) -> Result<LogIndex> {
        let entry = Entry {
            entry_type,
            term,
            index: self.next_index(),
        };
        self.extend(vec![entry])?;
        Ok(self.last_index)
    }

    /// Append entries that directly follow the last entry.
    pub fn extend(&mut self, entries: Vec<Entry>) -> Result<()> {
        let mut expected = self.next_index();
        for entry in &entries {
            if entry.index != expected {
                return Err(FurrowError::internal(format!(
                    "log gap: expected index {}, got {}",
                    expected, entry.index
                )));
            }
            expected += 1;
        }
        if let Some(last) = entries.last() {
            self.store.append(&entries)?;
            self.last_index = last.index;
            self.last_term = last.term;
        }
        Ok(())
    }

    /// Drop every entry at or after `index`.
    pub fn truncate(&mut self, index: LogIndex) -> Result<()> {
        if index > self.last_index {
            return Ok(());
        }
        if index <= self.offset.0 {
            return Err(FurrowError::internal(format!(
                "cannot truncate compacted index {}",
                index
            )));
        }
        self.store.truncate(index)?;
        self.last_index = index - 1;
        self.last_term = self.term(self.last_index)?.unwrap_or(self.offset.1);
        Ok(())
    }

    /// Drop every entry up to and including `index`.
    pub fn compact(&mut self, index: LogIndex) -> Result<()> {
        if index <= self.offset.0 || index > self.last_index {
            return Ok(());
        }
        let term = self
            .term(index)?
            .ok_or_else(|| FurrowError::Storage(format!("missing log entry {}", index)))?;
        self.store.compact(index, term)?;
        self.offset = (index, term);
        Ok(())
    }

    pub fn snapshot(&self) -> Option<&SnapshotMeta> {
        self.snapshot.as_ref()
    }

    pub fn snapshot_data(&self) -> Result<Option<(SnapshotMeta, Vec<u8>)>> {
        self.store.snapshot()
    }

    pub fn save_snapshot(&mut self, meta: SnapshotMeta, data: Vec<u8>) -> Result<()> {
        self.store.set_snapshot(&meta, &data)?;
        self.snapshot = Some(meta);
        Ok(())
    }

    /// Replace the whole log with a snapshot received from the leader.
    pub fn restore(&mut self, meta: SnapshotMeta, data: Vec<u8>) -> Result<()> {
        self.store.truncate(0)?;
        self.store.compact(meta.index, meta.term)?;
        self.offset = (meta.index, meta.term);
        self.last_index = meta.index;
        self.last_term = meta.term;
        self.save_snapshot(meta, data)
    }

    /// The configuration of the latest entry at or before `index`.
    pub fn membership_at(&self, index: LogIndex) -> Result<Membership> {
        let entries = self.range(self.first_index(), index)?;
        for entry in entries.into_iter().rev() {
            if let EntryType::Config { membership } = entry.entry_type {
                return Ok(membership);
            }
        }
        Ok(self
            .snapshot
            .as_ref()
            .map(|meta| meta.membership.clone())
            .unwrap_or_default())
    }

    /// The configuration in effect, with the index of the entry that holds it.
    pub fn latest_membership(&self) -> Result<(LogIndex, Membership)> {
        let entries = self.range(self.first_index(), self.last_index)?;
        for entry in entries.into_iter().rev() {
            if let EntryType::Config { membership } = entry.entry_type {
                return Ok((entry.index, membership));
            }
        }
        Ok(self
            .snapshot
            .as_ref()
            .map(|meta| (meta.index, meta.membership.clone()))
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::store::MemoryStore;
    use std::collections::BTreeMap;

    fn log() -> RaftLog {
        RaftLog::new(Box::new(MemoryStore::new())).unwrap()
    }

    fn data() -> EntryType {
        EntryType::Entry {
            data: vec![1],
            session: None,
        }
    }

    #[test]
    fn append_and_term() {
        let mut log = log();
        assert!(log.is_empty());
        assert_eq!(log.append(1, data()).unwrap(), 1);
        assert_eq!(log.append(2, data()).unwrap(), 2);
        assert_eq!(log.term(0).unwrap(), Some(0));
        assert_eq!(log.term(2).unwrap(), Some(2));
        assert_eq!(log.term(3).unwrap(), None);
        assert_eq!(log.last_term(), 2);
    }

    #[test]
    fn rejects_gaps() {
        let mut log = log();
        let res = log.extend(vec![Entry {
            entry_type: data(),
            term: 1,
            index: 2,
        }]);
        assert!(res.is_err());
    }

    #[test]
    fn truncate_then_append() {
        let mut log = log();
        for term in 1..=3 {
            log.append(term, data()).unwrap();
        }
        log.truncate(2).unwrap();
        assert_eq!(log.last_index(), 1);
        assert_eq!(log.last_term(), 1);
        assert_eq!(log.append(5, data()).unwrap(), 2);
    }

    #[test]
    fn compaction_keeps_term_of_offset() {
        let mut log = log();
        for term in 1..=4 {
            log.append(term, data()).unwrap();
        }
        log.compact(2).unwrap();
        assert_eq!(log.first_index(), 3);
        assert_eq!(log.term(2).unwrap(), Some(2));
        assert_eq!(log.term(1).unwrap(), None);
        assert!(log.get(2).unwrap().is_none());
        assert_eq!(log.range(1, 4).unwrap().len(), 2);
    }

    #[test]
    fn membership_tracks_latest_config() {
        let mut log = log();
        let mut voters = BTreeMap::new();
        voters.insert(1, "a".to_string());
        let first = Membership::new(voters.clone());
        log.append(0, EntryType::Config { membership: first.clone() }).unwrap();
        log.append(1, data()).unwrap();
        voters.insert(2, "b".to_string());
        let second = Membership::new(voters);
        log.append(1, EntryType::Config { membership: second.clone() }).unwrap();

        assert_eq!(log.latest_membership().unwrap(), (3, second));
        assert_eq!(log.membership_at(2).unwrap(), first);
    }

    #[test]
    fn restore_replaces_log() {
        let mut log = log();
        log.append(1, data()).unwrap();
        let meta = SnapshotMeta {
            index: 9,
            term: 3,
            membership: Membership::default(),
        };
        log.restore(meta, vec![]).unwrap();
        assert_eq!(log.last_index(), 9);
        assert_eq!(log.first_index(), 10);
        assert_eq!(log.term(9).unwrap(), Some(3));
        assert_eq!(log.snapshot().unwrap().index, 9);
    }
}
