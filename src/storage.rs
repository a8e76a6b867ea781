//! Ordered key/value storage shared by the raft log and every state machine.
//!
//! The engine is a thin layer over [sled]: writes are collected into a [`WriteBatch`] and applied
//! atomically, optionally followed by a flush so the batch is durable before the call returns.
//! Iteration is in ascending key order. Snapshots freeze the keyspace by holding reference counted
//! views of every pair, which avoids copying the values themselves.

use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};

use sled::IVec;

use crate::error::{FurrowError, Result};

#[derive(Clone)]
pub struct Engine {
    path: PathBuf,
    db: sled::Db,
}

impl Debug for Engine {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Engine {{ path: {:?} }}", self.path)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    pub sync: bool,
}

impl WriteOptions {
    pub fn sync() -> Self {
        WriteOptions { sync: true }
    }
}

/// A set of puts and deletes applied atomically by [`Engine::apply`].
#[derive(Default)]
pub struct WriteBatch {
    batch: sled::Batch,
    len: usize,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put<K: AsRef<[u8]>, V: AsRef<[u8]>>(&mut self, key: K, value: V) {
        self.batch.insert(key.as_ref(), value.as_ref());
        self.len += 1;
    }

    pub fn delete<K: AsRef<[u8]>>(&mut self, key: K) {
        self.batch.remove(key.as_ref());
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Point-in-time view of the keyspace. Later writes to the engine are not visible through it.
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    entries: Vec<(IVec, IVec)>,
}

impl EngineSnapshot {
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_ref(), v.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Engine {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let db = sled::open(&path)?;
        tracing::debug!(?path, "opened storage engine");
        Ok(Engine { path, db })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get<K: AsRef<[u8]>>(&self, key: K) -> Result<Option<IVec>> {
        Ok(self.db.get(key.as_ref())?)
    }

    pub fn put<K: AsRef<[u8]>, V: AsRef<[u8]>>(&self, key: K, value: V) -> Result<()> {
        self.db.insert(key.as_ref(), value.as_ref())?;
        Ok(())
    }

    pub fn apply(&self, batch: WriteBatch, opts: WriteOptions) -> Result<()> {
        self.db.apply_batch(batch.batch)?;
        if opts.sync {
            self.db.flush()?;
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<(IVec, IVec)>> {
        self.db.iter().map(|kv| kv.map_err(FurrowError::from))
    }

    pub fn range<K: AsRef<[u8]>>(
        &self,
        start: K,
        end: K,
    ) -> impl Iterator<Item = Result<(IVec, IVec)>> {
        self.db
            .range(start.as_ref()..end.as_ref())
            .map(|kv| kv.map_err(FurrowError::from))
    }

    pub fn snapshot(&self) -> Result<EngineSnapshot> {
        let entries = self.iter().collect::<Result<Vec<_>>>()?;
        Ok(EngineSnapshot { entries })
    }

    /// Opens a named keyspace sharing this engine's files. The raft log keeps one per group.
    pub fn tree<N: AsRef<[u8]>>(&self, name: N) -> Result<sled::Tree> {
        Ok(self.db.open_tree(name)?)
    }

    pub fn drop_tree<N: AsRef<[u8]>>(&self, name: N) -> Result<bool> {
        Ok(self.db.drop_tree(name)?)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn batch_is_atomic_and_ordered() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path()).unwrap();
        let mut batch = WriteBatch::new();
        batch.put(3u64.to_be_bytes(), "c");
        batch.put(1u64.to_be_bytes(), "a");
        batch.put(2u64.to_be_bytes(), "b");
        assert_eq!(batch.len(), 3);
        engine.apply(batch, WriteOptions::sync()).unwrap();

        let values: Vec<Vec<u8>> = engine
            .iter()
            .map(|kv| kv.unwrap().1.to_vec())
            .collect();
        assert_eq!(values, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn delete_in_batch() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path()).unwrap();
        engine.put("k", "v").unwrap();
        let mut batch = WriteBatch::new();
        batch.delete("k");
        engine.apply(batch, WriteOptions::default()).unwrap();
        assert!(engine.get("k").unwrap().is_none());
    }

    #[test]
    fn snapshot_is_frozen() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path()).unwrap();
        engine.put("a", "1").unwrap();
        let snapshot = engine.snapshot().unwrap();
        engine.put("b", "2").unwrap();
        engine.put("a", "3").unwrap();

        let pairs: Vec<(Vec<u8>, Vec<u8>)> = snapshot
            .iter()
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect();
        assert_eq!(pairs, vec![(b"a".to_vec(), b"1".to_vec())]);
    }

    #[test]
    fn range_all() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path()).unwrap();
        for i in 0u64..4 {
            engine.put(i.to_be_bytes(), "").unwrap();
        }
        let count = engine
            .range(1u64.to_be_bytes(), 3u64.to_be_bytes())
            .count();
        assert_eq!(count, 2);
    }
}
