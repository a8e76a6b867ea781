//! Durable raft state: hard state, log entries and the latest snapshot of a group.

use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};

use crate::error::Result;
use crate::raft::membership::Membership;
use crate::raft::{Entry, GroupId, LogIndex, NodeId, Term};
use crate::storage::Engine;

/// The part of a replica's state that must survive restarts before it answers any message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: Term,
    pub voted_for: Option<NodeId>,
    pub commit: LogIndex,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub index: LogIndex,
    pub term: Term,
    /// Configuration in effect at `index`.
    pub membership: Membership,
}

pub trait Store: Send + Debug {
    fn hard_state(&self) -> Result<HardState>;

    fn set_hard_state(&mut self, state: &HardState) -> Result<()>;

    /// Write entries at their own indices, replacing whatever was there.
    fn append(&mut self, entries: &[Entry]) -> Result<()>;

    fn get(&self, index: LogIndex) -> Result<Option<Entry>>;

    /// Entries in `start..=end` that are still stored.
    fn get_range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<Entry>>;

    /// Remove every entry at or after `index`.
    fn truncate(&mut self, index: LogIndex) -> Result<()>;

    /// Remove every entry up to and including `index`, remembering its term.
    fn compact(&mut self, index: LogIndex, term: Term) -> Result<()>;

    /// The last removed (index, term); (0, 0) for a log that was never compacted.
    fn offset(&self) -> Result<(LogIndex, Term)>;

    fn last_index(&self) -> Result<Option<LogIndex>>;

    fn snapshot(&self) -> Result<Option<(SnapshotMeta, Vec<u8>)>>;

    fn set_snapshot(&mut self, meta: &SnapshotMeta, data: &[u8]) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    hard_state: HardState,
    log: BTreeMap<LogIndex, Entry>,
    offset: (LogIndex, Term),
    snapshot: Option<(SnapshotMeta, Vec<u8>)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn hard_state(&self) -> Result<HardState> {
        Ok(self.hard_state.clone())
    }

    fn set_hard_state(&mut self, state: &HardState) -> Result<()> {
        self.hard_state = state.clone();
        Ok(())
    }

    fn append(&mut self, entries: &[Entry]) -> Result<()> {
        for entry in entries {
            self.log.insert(entry.index, entry.clone());
        }
        Ok(())
    }

    fn get(&self, index: LogIndex) -> Result<Option<Entry>> {
        Ok(self.log.get(&index).cloned())
    }

    fn get_range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<Entry>> {
        if start > end {
            return Ok(vec![]);
        }
        Ok(self.log.range(start..=end).map(|(_, e)| e.clone()).collect())
    }

    fn truncate(&mut self, index: LogIndex) -> Result<()> {
        self.log.split_off(&index);
        Ok(())
    }

    fn compact(&mut self, index: LogIndex, term: Term) -> Result<()> {
        self.log = self.log.split_off(&(index + 1));
        self.offset = (index, term);
        Ok(())
    }

    fn offset(&self) -> Result<(LogIndex, Term)> {
        Ok(self.offset)
    }

    fn last_index(&self) -> Result<Option<LogIndex>> {
        Ok(self.log.keys().next_back().copied())
    }

    fn snapshot(&self) -> Result<Option<(SnapshotMeta, Vec<u8>)>> {
        Ok(self.snapshot.clone())
    }

    fn set_snapshot(&mut self, meta: &SnapshotMeta, data: &[u8]) -> Result<()> {
        self.snapshot = Some((meta.clone(), data.to_vec()));
        Ok(())
    }
}

const HARD_STATE: &str = "hard_state";
const OFFSET: &str = "offset";
const SNAPSHOT_META: &str = "snapshot_meta";
const SNAPSHOT_DATA: &str = "snapshot_data";

/// A group's log kept in two trees of the node's shared raft database.
#[derive(Clone)]
pub struct SledStore {
    group: GroupId,
    entries: sled::Tree,
    meta: sled::Tree,
}

impl Debug for SledStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SledStore {{ group: {} }}", self.group)
    }
}

impl SledStore {
    pub fn open(engine: &Engine, group: GroupId) -> Result<Self> {
        Ok(SledStore {
            group,
            entries: engine.tree(format!("raft-{}-entries", group))?,
            meta: engine.tree(format!("raft-{}-meta", group))?,
        })
    }

    fn get_meta<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.meta.get(key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn insert_meta<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.meta.insert(key, bincode::serialize(value)?)?;
        Ok(())
    }
}

impl Store for SledStore {
    fn hard_state(&self) -> Result<HardState> {
        Ok(self.get_meta(HARD_STATE)?.unwrap_or_default())
    }

    fn set_hard_state(&mut self, state: &HardState) -> Result<()> {
        self.insert_meta(HARD_STATE, state)?;
        self.meta.flush()?;
        Ok(())
    }

    fn append(&mut self, entries: &[Entry]) -> Result<()> {
        let mut batch = sled::Batch::default();
        for entry in entries {
            batch.insert(entry.index.to_be_bytes().to_vec(), bincode::serialize(entry)?);
        }
        self.entries.apply_batch(batch)?;
        self.entries.flush()?;
        Ok(())
    }

    fn get(&self, index: LogIndex) -> Result<Option<Entry>> {
        match self.entries.get(index.to_be_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_range(&self, start: LogIndex, end: LogIndex) -> Result<Vec<Entry>> {
        if start > end {
            return Ok(vec![]);
        }
        self.entries
            .range(start.to_be_bytes()..=end.to_be_bytes())
            .map(|kv| {
                let (_, bytes) = kv?;
                Ok(bincode::deserialize(&bytes)?)
            })
            .collect()
    }

    fn truncate(&mut self, index: LogIndex) -> Result<()> {
        let mut batch = sled::Batch::default();
        for kv in self.entries.range(index.to_be_bytes()..) {
            let (key, _) = kv?;
            batch.remove(key);
        }
        self.entries.apply_batch(batch)?;
        Ok(())
    }

    fn compact(&mut self, index: LogIndex, term: Term) -> Result<()> {
        let mut batch = sled::Batch::default();
        for kv in self.entries.range(..=index.to_be_bytes()) {
            let (key, _) = kv?;
            batch.remove(key);
        }
        self.entries.apply_batch(batch)?;
        self.insert_meta(OFFSET, &(index, term))?;
        Ok(())
    }

    fn offset(&self) -> Result<(LogIndex, Term)> {
        Ok(self.get_meta(OFFSET)?.unwrap_or((0, 0)))
    }

    fn last_index(&self) -> Result<Option<LogIndex>> {
        match self.entries.last()? {
            Some((key, _)) => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&key);
                Ok(Some(u64::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    fn snapshot(&self) -> Result<Option<(SnapshotMeta, Vec<u8>)>> {
        let meta: Option<SnapshotMeta> = self.get_meta(SNAPSHOT_META)?;
        match (meta, self.meta.get(SNAPSHOT_DATA)?) {
            (Some(meta), Some(data)) => Ok(Some((meta, data.to_vec()))),
            _ => Ok(None),
        }
    }

    fn set_snapshot(&mut self, meta: &SnapshotMeta, data: &[u8]) -> Result<()> {
        let mut batch = sled::Batch::default();
        batch.insert(SNAPSHOT_META, bincode::serialize(meta)?);
        batch.insert(SNAPSHOT_DATA, data);
        self.meta.apply_batch(batch)?;
        self.meta.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::EntryType;
    use tempfile::tempdir;

    fn entry(index: LogIndex, term: Term) -> Entry {
        Entry {
            entry_type: EntryType::Control,
            term,
            index,
        }
    }

    fn exercise<S: Store>(mut store: S) {
        store
            .append(&[entry(1, 1), entry(2, 1), entry(3, 2)])
            .unwrap();
        assert_eq!(store.last_index().unwrap(), Some(3));
        assert_eq!(store.get_range(2, 3).unwrap().len(), 2);

        store.truncate(3).unwrap();
        assert_eq!(store.last_index().unwrap(), Some(2));

        store.compact(1, 1).unwrap();
        assert!(store.get(1).unwrap().is_none());
        assert_eq!(store.offset().unwrap(), (1, 1));
        assert_eq!(store.get(2).unwrap(), Some(entry(2, 1)));

        let state = HardState {
            term: 4,
            voted_for: Some(2),
            commit: 2,
        };
        store.set_hard_state(&state).unwrap();
        assert_eq!(store.hard_state().unwrap(), state);
    }

    #[test]
    fn memory_store() {
        exercise(MemoryStore::new());
    }

    #[test]
    fn sled_store() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path()).unwrap();
        exercise(SledStore::open(&engine, 7).unwrap());
    }

    #[test]
    fn sled_store_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let engine = Engine::open(dir.path()).unwrap();
            let mut store = SledStore::open(&engine, 1).unwrap();
            store.append(&[entry(1, 1)]).unwrap();
            let meta = SnapshotMeta {
                index: 1,
                term: 1,
                membership: Membership::default(),
            };
            store.set_snapshot(&meta, b"data").unwrap();
            engine.flush().unwrap();
        }
        let engine = Engine::open(dir.path()).unwrap();
        let store = SledStore::open(&engine, 1).unwrap();
        assert_eq!(store.last_index().unwrap(), Some(1));
        let (meta, data) = store.snapshot().unwrap().unwrap();
        assert_eq!(meta.index, 1);
        assert_eq!(data, b"data".to_vec());
    }
}
