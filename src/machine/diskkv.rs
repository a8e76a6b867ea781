use std::fmt::{self, Debug, Formatter};
use std::fs;
use std::io::{Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use rand::Rng;

use crate::error::{FurrowError, Result};
use crate::machine::envelope::{Envelope, Op};
use crate::machine::keys::{KeyRule, APPLIED_INDEX_KEY};
use crate::machine::query::Query;
use crate::machine::snapshot::{self, PairReader};
use crate::raft::fsm::{Fsm, Input};
use crate::raft::{GroupId, LogIndex, NodeId};
use crate::storage::{Engine, EngineSnapshot, WriteBatch, WriteOptions};

const POINTER_FILE: &str = "CURRENT";
const POINTER_TMP_FILE: &str = "CURRENT.tmp";

struct Inner {
    engine: Engine,
    token: String,
    applied: LogIndex,
}

/// An on-disk keyed record store replicated by one group. Each `(group, node)` pair owns a
/// directory holding a `CURRENT` pointer file that names the live storage directory; installing a
/// snapshot writes a fresh directory and swaps the pointer.
pub struct DiskKv<R: KeyRule> {
    group: GroupId,
    node: NodeId,
    dir: PathBuf,
    inner: RwLock<Option<Inner>>,
    _rule: PhantomData<R>,
}

impl<R: KeyRule> Debug for DiskKv<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskKv")
            .field("kind", &R::KIND)
            .field("group", &self.group)
            .field("node", &self.node)
            .field("applied", &self.applied_index())
            .finish()
    }
}

impl<R: KeyRule> DiskKv<R> {
    pub fn new<P: AsRef<Path>>(data_dir: P, group: GroupId, node: NodeId) -> Self {
        let dir = data_dir.as_ref().join(format!("{}_{}", group, node));
        DiskKv {
            group,
            node,
            dir,
            inner: RwLock::new(None),
            _rule: PhantomData,
        }
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The storage directory the pointer currently names, once open.
    pub fn current_dir(&self) -> Option<PathBuf> {
        self.inner
            .read()
            .as_ref()
            .map(|inner| self.dir.join(&inner.token))
    }

    fn stage(&self, batch: &mut WriteBatch, index: LogIndex, data: &[u8]) -> Result<()> {
        let envelope = Envelope::decode(data)?;
        let key = R::key(self.group, index, &envelope.body)?;
        match envelope.op {
            Op::Update => batch.put(key, &envelope.body),
            Op::Delete => batch.delete(key),
        }
        Ok(())
    }

    fn collect<I>(&self, pairs: I) -> Result<Vec<u8>>
    where
        I: Iterator<Item = Result<(sled::IVec, sled::IVec)>>,
    {
        let mut out = vec![b'['];
        let mut first = true;
        for pair in pairs {
            let (key, val) = pair?;
            if &key[..] == APPLIED_INDEX_KEY {
                continue;
            }
            if !first {
                out.push(b',');
            }
            out.extend_from_slice(&val);
            first = false;
        }
        out.push(b']');
        Ok(out)
    }
}

fn not_open() -> FurrowError {
    FurrowError::internal("state machine is not open")
}

fn new_token() -> String {
    format!("{:016x}", rand::thread_rng().gen::<u64>())
}

fn read_pointer(dir: &Path) -> Result<Option<String>> {
    match fs::read_to_string(dir.join(POINTER_FILE)) {
        Ok(token) => {
            let token = token.trim().to_string();
            if token.is_empty() || !dir.join(&token).exists() {
                Ok(None)
            } else {
                Ok(Some(token))
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn write_pointer(dir: &Path, token: &str) -> Result<()> {
    let tmp = dir.join(POINTER_TMP_FILE);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(token.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, dir.join(POINTER_FILE))?;
    fs::File::open(dir)?.sync_all()?;
    Ok(())
}

fn read_applied(engine: &Engine) -> Result<LogIndex> {
    match engine.get(APPLIED_INDEX_KEY)? {
        Some(bytes) => {
            let bytes = <[u8; 8]>::try_from(&bytes[..])
                .map_err(|_| FurrowError::Storage("corrupt applied index".to_string()))?;
            Ok(u64::from_be_bytes(bytes))
        }
        None => Ok(0),
    }
}

impl<R: KeyRule> Fsm for DiskKv<R> {
    fn open(&self) -> Result<LogIndex> {
        let mut inner = self.inner.write();
        if let Some(inner) = inner.as_ref() {
            return Ok(inner.applied);
        }
        fs::create_dir_all(&self.dir)?;
        let token = match read_pointer(&self.dir)? {
            Some(token) => token,
            None => {
                let token = new_token();
                write_pointer(&self.dir, &token)?;
                token
            }
        };
        let engine = Engine::open(self.dir.join(&token))?;
        let applied = read_applied(&engine)?;
        tracing::debug!(kind = R::KIND, group = self.group, node = self.node, %token, applied, "opened state machine");
        *inner = Some(Inner {
            engine,
            token,
            applied,
        });
        Ok(applied)
    }

    fn update(&self, inputs: &[Input]) -> Result<()> {
        let last = match inputs.last() {
            Some(input) => input.index,
            None => return Ok(()),
        };
        let mut guard = self.inner.write();
        let inner = guard.as_mut().ok_or_else(not_open)?;
        if inner.applied >= last {
            return Err(FurrowError::BackwardAppliedIndex {
                current: inner.applied,
                recovered: last,
            });
        }

        let mut batch = WriteBatch::new();
        for input in inputs {
            let data = match &input.data {
                Some(data) => data,
                None => continue,
            };
            // every replica skips the same malformed entries
            if let Err(err) = self.stage(&mut batch, input.index, data) {
                tracing::warn!(kind = R::KIND, group = self.group, index = input.index, %err, "skipping malformed entry");
            }
        }
        batch.put(APPLIED_INDEX_KEY, last.to_be_bytes());
        inner.engine.apply(batch, WriteOptions::sync())?;
        inner.applied = last;
        Ok(())
    }

    fn lookup(&self, query: &Query) -> Result<Vec<u8>> {
        let guard = self.inner.read();
        let inner = guard.as_ref().ok_or_else(not_open)?;
        match query {
            Query::Point(key) => {
                if key.as_slice() == APPLIED_INDEX_KEY {
                    return Err(FurrowError::NotFound);
                }
                inner
                    .engine
                    .get(key)?
                    .map(|val| val.to_vec())
                    .ok_or(FurrowError::NotFound)
            }
            Query::Wildcard => self.collect(inner.engine.iter()),
            Query::Count => {
                let mut count = 0u64;
                for pair in inner.engine.iter() {
                    let (key, _) = pair?;
                    if &key[..] != APPLIED_INDEX_KEY {
                        count += 1;
                    }
                }
                Ok(serde_json::to_vec(&count)?)
            }
            Query::Range { start, end } if R::RANGED => {
                self.collect(inner.engine.range(start, end))
            }
            Query::Range { .. } => Err(FurrowError::UnsupportedQuery),
        }
    }

    fn prepare_snapshot(&self) -> Result<EngineSnapshot> {
        let guard = self.inner.read();
        let inner = guard.as_ref().ok_or_else(not_open)?;
        inner.engine.snapshot()
    }

    fn save_snapshot(&self, snapshot: &EngineSnapshot, writer: &mut dyn Write) -> Result<()> {
        snapshot::write_pairs(writer, snapshot.len() as u64, snapshot.iter())
    }

    fn recover_from_snapshot(&self, reader: &mut dyn Read) -> Result<()> {
        let mut guard = self.inner.write();
        let current = guard.as_ref().map(|inner| inner.applied).unwrap_or(0);
        fs::create_dir_all(&self.dir)?;

        let token = new_token();
        let path = self.dir.join(&token);
        let engine = Engine::open(&path)?;
        let mut batch = WriteBatch::new();
        for pair in PairReader::new(reader)? {
            let pair = pair?;
            batch.put(pair.key, pair.val);
        }
        engine.apply(batch, WriteOptions::sync())?;

        let recovered = read_applied(&engine)?;
        if recovered < current {
            drop(engine);
            fs::remove_dir_all(&path)?;
            return Err(FurrowError::BackwardAppliedIndex { current, recovered });
        }

        write_pointer(&self.dir, &token)?;
        let previous = guard.replace(Inner {
            engine,
            token,
            applied: recovered,
        });
        if let Some(previous) = previous {
            let old = self.dir.join(&previous.token);
            drop(previous);
            fs::remove_dir_all(old)?;
        }
        tracing::info!(kind = R::KIND, group = self.group, node = self.node, current, recovered, "recovered from snapshot");
        Ok(())
    }

    fn applied_index(&self) -> LogIndex {
        self.inner
            .read()
            .as_ref()
            .map(|inner| inner.applied)
            .unwrap_or(0)
    }

    fn sync(&self) -> Result<()> {
        match self.inner.read().as_ref() {
            Some(inner) => inner.engine.flush(),
            None => Ok(()),
        }
    }

    fn close(&self) -> Result<()> {
        if let Some(inner) = self.inner.write().take() {
            inner.engine.flush()?;
            tracing::debug!(kind = R::KIND, group = self.group, node = self.node, "closed state machine");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::machine::keys::{EventLogKeys, OrganizationKeys};

    type Orgs = DiskKv<OrganizationKeys>;

    fn update(index: LogIndex, body: serde_json::Value) -> Input {
        let body = serde_json::to_vec(&body).unwrap();
        Input {
            index,
            data: Some(Envelope::update(body).encode().unwrap()),
        }
    }

    fn delete(index: LogIndex, body: serde_json::Value) -> Input {
        let body = serde_json::to_vec(&body).unwrap();
        Input {
            index,
            data: Some(Envelope::delete(body).encode().unwrap()),
        }
    }

    fn user_pairs<R: KeyRule>(machine: &DiskKv<R>) -> Vec<(Vec<u8>, Vec<u8>)> {
        let snapshot = machine.prepare_snapshot().unwrap();
        snapshot
            .iter()
            .filter(|(k, _)| *k != APPLIED_INDEX_KEY)
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect()
    }

    #[test]
    fn point_lookup_after_update() -> Result<()> {
        let dir = tempdir()?;
        let orgs = Orgs::new(dir.path(), 2, 1);
        assert_eq!(orgs.open()?, 0);
        orgs.update(&[update(1, json!({"id": 5, "name": "acme"}))])?;

        let value: serde_json::Value = serde_json::from_slice(&orgs.lookup(&Query::id(5))?)?;
        assert_eq!(value, json!({"id": 5, "name": "acme"}));
        assert_eq!(orgs.applied_index(), 1);
        Ok(())
    }

    #[test]
    fn applied_index_survives_reopen() -> Result<()> {
        let dir = tempdir()?;
        {
            let orgs = Orgs::new(dir.path(), 2, 1);
            orgs.open()?;
            orgs.update(&[
                update(1, json!({"id": 1})),
                Input { index: 2, data: None },
            ])?;
            orgs.close()?;
        }
        let orgs = Orgs::new(dir.path(), 2, 1);
        assert_eq!(orgs.open()?, 2);
        assert!(orgs.lookup(&Query::id(1)).is_ok());
        Ok(())
    }

    #[test]
    fn repeated_update_is_idempotent() -> Result<()> {
        let dir = tempdir()?;
        let orgs = Orgs::new(dir.path(), 2, 1);
        orgs.open()?;
        orgs.update(&[update(1, json!({"id": 1, "name": "a"}))])?;
        let once = user_pairs(&orgs);
        orgs.update(&[update(2, json!({"id": 1, "name": "a"}))])?;
        assert_eq!(user_pairs(&orgs), once);
        Ok(())
    }

    #[test]
    fn delete_then_read() -> Result<()> {
        let dir = tempdir()?;
        let orgs = Orgs::new(dir.path(), 2, 1);
        orgs.open()?;
        orgs.update(&[update(1, json!({"id": 3}))])?;
        orgs.update(&[delete(2, json!({"id": 3}))])?;
        assert_eq!(orgs.lookup(&Query::id(3)), Err(FurrowError::NotFound));
        Ok(())
    }

    #[test]
    fn wildcard_and_count_skip_reserved_key() -> Result<()> {
        let dir = tempdir()?;
        let orgs = Orgs::new(dir.path(), 2, 1);
        orgs.open()?;
        assert_eq!(orgs.lookup(&Query::Wildcard)?, b"[]".to_vec());
        assert_eq!(orgs.lookup(&Query::Count)?, b"0".to_vec());

        orgs.update(&[update(1, json!({"id": 2})), update(2, json!({"id": 1}))])?;
        let all: Vec<serde_json::Value> = serde_json::from_slice(&orgs.lookup(&Query::Wildcard)?)?;
        assert_eq!(all, vec![json!({"id": 1}), json!({"id": 2})]);
        assert_eq!(orgs.lookup(&Query::Count)?, b"2".to_vec());
        assert_eq!(orgs.lookup(&Query::key(APPLIED_INDEX_KEY)), Err(FurrowError::NotFound));
        Ok(())
    }

    #[test]
    fn range_only_on_history_machines() -> Result<()> {
        let dir = tempdir()?;
        let events = DiskKv::<EventLogKeys>::new(dir.path(), 9, 1);
        events.open()?;
        events.update(&[
            update(1, json!({"message": "a"})),
            update(2, json!({"message": "b"})),
            update(3, json!({"message": "c"})),
        ])?;
        let page: Vec<serde_json::Value> =
            serde_json::from_slice(&events.lookup(&Query::range(2, 4))?)?;
        assert_eq!(page, vec![json!({"message": "b"}), json!({"message": "c"})]);

        let orgs = Orgs::new(dir.path(), 2, 1);
        orgs.open()?;
        assert_eq!(orgs.lookup(&Query::range(0, 10)), Err(FurrowError::UnsupportedQuery));
        Ok(())
    }

    #[test]
    fn rejects_already_applied_batch() -> Result<()> {
        let dir = tempdir()?;
        let orgs = Orgs::new(dir.path(), 2, 1);
        orgs.open()?;
        orgs.update(&[update(4, json!({"id": 1}))])?;
        assert!(matches!(
            orgs.update(&[update(4, json!({"id": 2}))]),
            Err(FurrowError::BackwardAppliedIndex { current: 4, recovered: 4 })
        ));
        assert_eq!(orgs.lookup(&Query::id(2)), Err(FurrowError::NotFound));
        Ok(())
    }

    #[test]
    fn malformed_entry_only_advances_index() -> Result<()> {
        let dir = tempdir()?;
        let orgs = Orgs::new(dir.path(), 2, 1);
        orgs.open()?;
        orgs.update(&[Input {
            index: 1,
            data: Some(b"garbage".to_vec()),
        }])?;
        assert_eq!(orgs.applied_index(), 1);
        assert_eq!(orgs.lookup(&Query::Count)?, b"0".to_vec());
        Ok(())
    }

    #[test]
    fn snapshot_recovery_swaps_directory() -> Result<()> {
        let dir = tempdir()?;
        let source = Orgs::new(dir.path().join("source"), 2, 1);
        source.open()?;
        source.update(&[update(1, json!({"id": 1})), update(2, json!({"id": 2}))])?;
        let mut stream = Vec::new();
        source.save_snapshot(&source.prepare_snapshot()?, &mut stream)?;

        let target = Orgs::new(dir.path().join("target"), 2, 2);
        target.open()?;
        let before = target.current_dir().unwrap();
        target.recover_from_snapshot(&mut stream.as_slice())?;

        assert_eq!(target.applied_index(), 2);
        assert_eq!(user_pairs(&target), user_pairs(&source));
        assert!(!before.exists());
        let after = target.current_dir().unwrap();
        assert!(after.exists());

        // the pointer survives a restart
        target.close()?;
        let reopened = Orgs::new(dir.path().join("target"), 2, 2);
        assert_eq!(reopened.open()?, 2);
        assert_eq!(reopened.current_dir(), Some(after));
        Ok(())
    }

    #[test]
    fn recovery_never_moves_backwards() -> Result<()> {
        let dir = tempdir()?;
        let source = Orgs::new(dir.path().join("source"), 2, 1);
        source.open()?;
        source.update(&[update(1, json!({"id": 1}))])?;
        let mut stream = Vec::new();
        source.save_snapshot(&source.prepare_snapshot()?, &mut stream)?;

        let target = Orgs::new(dir.path().join("target"), 2, 2);
        target.open()?;
        target.update(&[update(5, json!({"id": 9}))])?;
        assert_eq!(
            target.recover_from_snapshot(&mut stream.as_slice()),
            Err(FurrowError::BackwardAppliedIndex { current: 5, recovered: 1 })
        );
        assert!(target.lookup(&Query::id(9)).is_ok());
        Ok(())
    }
}
