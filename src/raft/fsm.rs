//! The bridge between a group's log and its state machine. The driver receives committed entries
//! from the raft instance, applies them in order, answers the clients waiting on them, and takes
//! periodic snapshots that allow the log to be compacted.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::error::{FurrowError, Result};
use crate::machine::Query;
use crate::raft::error::RaftError;
use crate::raft::rpc::{self, Address, Message, Response};
use crate::raft::{ClientRequestId, Command, Entry, EntryType, GroupId, LogIndex, Term};
use crate::storage::EngineSnapshot;

/// A committed entry as seen by a state machine. `data` is `None` for entries that only move the
/// applied index forward (leader no-ops, configuration changes, duplicate session writes).
#[derive(Debug, Clone, PartialEq)]
pub struct Input {
    pub index: LogIndex,
    pub data: Option<Vec<u8>>,
}

/// A replicated state machine persisted on local disk.
pub trait Fsm: Send + Sync + fmt::Debug {
    /// Open the underlying storage, returning the last applied index.
    fn open(&self) -> Result<LogIndex>;

    /// Apply a batch of committed entries atomically.
    fn update(&self, inputs: &[Input]) -> Result<()>;

    fn lookup(&self, query: &Query) -> Result<Vec<u8>>;

    fn prepare_snapshot(&self) -> Result<EngineSnapshot>;

    fn save_snapshot(&self, snapshot: &EngineSnapshot, writer: &mut dyn Write) -> Result<()>;

    fn recover_from_snapshot(&self, reader: &mut dyn Read) -> Result<()>;

    fn applied_index(&self) -> LogIndex;

    fn sync(&self) -> Result<()>;

    fn close(&self) -> Result<()>;
}

#[derive(Debug)]
pub enum Instruction {
    Apply {
        entries: Vec<Entry>,
    },
    /// A local client waits for the entry the leader placed at `index` in `term`.
    Notify {
        id: ClientRequestId,
        index: LogIndex,
        term: Term,
    },
    /// Replace the state machine with a snapshot received from the leader.
    Restore {
        index: LogIndex,
        data: Vec<u8>,
    },
}

const RESULT_CACHE: usize = 4096;
const SESSION_WINDOW: usize = 1024;

/// Called when a state machine can no longer be trusted to match its log.
pub type FatalHandler = Arc<dyn Fn(GroupId, &FurrowError) + Send + Sync>;

/// Ends the process. A panic here would only end the driver task.
fn abort_process(group: GroupId, err: &FurrowError) {
    tracing::error!(group, %err, "state machine failed, aborting");
    std::process::abort();
}

pub struct Driver {
    group: GroupId,
    fsm_rx: mpsc::UnboundedReceiver<Instruction>,
    rpc_tx: mpsc::UnboundedSender<rpc::Message>,
    fsm: Arc<dyn Fsm>,
    applied_tx: watch::Sender<LogIndex>,
    snapshot_entries: u64,
    since_snapshot: u64,
    notifications: HashMap<LogIndex, Vec<(ClientRequestId, Term)>>,
    /// Terms of recently applied entries, for notifications that arrive after the apply.
    applied_terms: BTreeMap<LogIndex, Term>,
    /// Recently applied series per client session.
    sessions: HashMap<u64, BTreeSet<u64>>,
    fatal: FatalHandler,
}

impl Driver {
    pub fn new(
        group: GroupId,
        fsm_rx: mpsc::UnboundedReceiver<Instruction>,
        rpc_tx: mpsc::UnboundedSender<rpc::Message>,
        fsm: Arc<dyn Fsm>,
        applied_tx: watch::Sender<LogIndex>,
        snapshot_entries: u64,
    ) -> Self {
        Self {
            group,
            fsm_rx,
            rpc_tx,
            fsm,
            applied_tx,
            snapshot_entries,
            since_snapshot: 0,
            notifications: HashMap::new(),
            applied_terms: BTreeMap::new(),
            sessions: HashMap::new(),
            fatal: Arc::new(abort_process),
        }
    }

    /// Replaces what happens on an unrecoverable state machine failure.
    pub fn on_fatal(mut self, handler: FatalHandler) -> Self {
        self.fatal = handler;
        self
    }

    fn fail(&self, err: FurrowError) -> FurrowError {
        (self.fatal)(self.group, &err);
        err
    }

    pub async fn run(mut self, mut shutdown: tokio::sync::broadcast::Receiver<()>) -> Result<Arc<dyn Fsm>> {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,

                instruction = self.fsm_rx.recv() => match instruction {
                    Some(Instruction::Apply { entries }) => self.apply(entries)?,
                    Some(Instruction::Notify { id, index, term }) => self.notify(id, index, term)?,
                    Some(Instruction::Restore { index, data }) => self.restore(index, data)?,
                    None => break,
                },
            }
        }

        if let Err(err) = self.fsm.sync() {
            tracing::error!(group = self.group, %err, "failed to sync state machine on shutdown");
        }
        Ok(self.fsm)
    }

    fn respond(&self, id: ClientRequestId, res: std::result::Result<Response, RaftError>) -> Result<()> {
        self.rpc_tx
            .send(Message::new(
                self.group,
                Address::Local,
                Address::Client,
                Command::ClientResponse { id, res },
            ))
            .map_err(RaftError::from)?;
        Ok(())
    }

    fn is_duplicate(&mut self, client_id: u64, series_id: u64) -> bool {
        let applied = self.sessions.entry(client_id).or_default();
        if !applied.insert(series_id) {
            return true;
        }
        while applied.len() > SESSION_WINDOW {
            let oldest = *applied.iter().next().unwrap_or(&series_id);
            applied.remove(&oldest);
        }
        false
    }

    pub fn apply(&mut self, entries: Vec<Entry>) -> Result<()> {
        let applied = self.fsm.applied_index();
        let entries: Vec<Entry> = entries.into_iter().filter(|e| e.index > applied).collect();
        let last = match entries.last() {
            Some(last) => (last.index, last.term),
            None => return Ok(()),
        };

        let mut inputs = Vec::with_capacity(entries.len());
        for entry in &entries {
            let data = match &entry.entry_type {
                EntryType::Entry { data, session } => match session {
                    Some(tag) if self.is_duplicate(tag.client_id, tag.series_id) => {
                        tracing::debug!(group = self.group, index = entry.index, ?tag, "skipping duplicate proposal");
                        None
                    }
                    _ => Some(data.clone()),
                },
                EntryType::Control | EntryType::Config { .. } => None,
            };
            inputs.push(Input {
                index: entry.index,
                data,
            });
        }

        if let Err(err) = self.fsm.update(&inputs) {
            tracing::error!(group = self.group, %err, "state machine update failed");
            return Err(self.fail(err));
        }

        for entry in &entries {
            self.applied_terms.insert(entry.index, entry.term);
            if let Some(waiters) = self.notifications.remove(&entry.index) {
                for (id, term) in waiters {
                    self.respond(id, applied_result(entry.index, entry.term, term))?;
                }
            }
        }
        while self.applied_terms.len() > RESULT_CACHE {
            let oldest = self.applied_terms.keys().next().copied().unwrap_or(last.0);
            self.applied_terms.remove(&oldest);
        }
        self.applied_tx.send_replace(last.0);

        self.since_snapshot += entries.len() as u64;
        if self.snapshot_entries > 0 && self.since_snapshot >= self.snapshot_entries {
            self.since_snapshot = 0;
            self.snapshot(last.0, last.1)?;
        }
        Ok(())
    }

    fn snapshot(&self, index: LogIndex, term: Term) -> Result<()> {
        let snapshot = self.fsm.prepare_snapshot()?;
        let mut data = Vec::new();
        self.fsm.save_snapshot(&snapshot, &mut data)?;
        tracing::debug!(group = self.group, index, size = data.len(), "created snapshot");
        self.rpc_tx
            .send(Message::new(
                self.group,
                Address::Local,
                Address::Local,
                Command::SnapshotCreated { index, term, data },
            ))
            .map_err(RaftError::from)?;
        Ok(())
    }

    fn notify(&mut self, id: ClientRequestId, index: LogIndex, term: Term) -> Result<()> {
        if index > self.fsm.applied_index() {
            self.notifications.entry(index).or_default().push((id, term));
            return Ok(());
        }
        let res = match self.applied_terms.get(&index) {
            Some(applied) => applied_result(index, *applied, term),
            None => Err(RaftError::Aborted),
        };
        self.respond(id, res)
    }

    fn restore(&mut self, index: LogIndex, data: Vec<u8>) -> Result<()> {
        tracing::info!(group = self.group, index, "restoring state machine from snapshot");
        match self.fsm.recover_from_snapshot(&mut data.as_slice()) {
            Ok(()) => {}
            Err(err @ FurrowError::BackwardAppliedIndex { .. }) => {
                tracing::error!(group = self.group, %err, "snapshot would move the applied index backwards");
                return Err(self.fail(err));
            }
            Err(err) => {
                tracing::error!(group = self.group, %err, "failed to recover from snapshot");
                return Err(self.fail(err));
            }
        }
        self.applied_terms.clear();
        self.since_snapshot = 0;
        let stale: Vec<LogIndex> = self
            .notifications
            .keys()
            .copied()
            .filter(|i| *i <= index)
            .collect();
        for i in stale {
            for (id, _) in self.notifications.remove(&i).unwrap_or_default() {
                self.respond(id, Err(RaftError::Aborted))?;
            }
        }
        self.applied_tx.send_replace(self.fsm.applied_index());
        Ok(())
    }
}

fn applied_result(index: LogIndex, applied: Term, expected: Term) -> std::result::Result<Response, RaftError> {
    if applied == expected {
        Ok(Response::Applied { index })
    } else {
        Err(RaftError::Aborted)
    }
}

#[cfg(test)]
mod test {
    use parking_lot::Mutex;
    use tokio::sync::mpsc::unbounded_channel;
    use uuid::Uuid;

    use super::*;
    use crate::raft::SessionTag;

    #[derive(Debug, Default)]
    pub struct TestFsm {
        applied: Mutex<(LogIndex, Vec<Vec<u8>>)>,
        broken: bool,
    }

    impl Fsm for TestFsm {
        fn open(&self) -> Result<LogIndex> {
            Ok(self.applied.lock().0)
        }

        fn update(&self, inputs: &[Input]) -> Result<()> {
            if self.broken {
                return Err(FurrowError::Storage("disk gone".into()));
            }
            let mut applied = self.applied.lock();
            for input in inputs {
                if let Some(data) = &input.data {
                    applied.1.push(data.clone());
                }
                applied.0 = input.index;
            }
            Ok(())
        }

        fn lookup(&self, _query: &Query) -> Result<Vec<u8>> {
            Ok(self.applied.lock().1.concat())
        }

        fn prepare_snapshot(&self) -> Result<EngineSnapshot> {
            Err(FurrowError::UnsupportedQuery)
        }

        fn save_snapshot(&self, _: &EngineSnapshot, _: &mut dyn Write) -> Result<()> {
            Ok(())
        }

        fn recover_from_snapshot(&self, _: &mut dyn Read) -> Result<()> {
            if self.broken {
                return Err(FurrowError::BackwardAppliedIndex {
                    current: 5,
                    recovered: 3,
                });
            }
            Ok(())
        }

        fn applied_index(&self) -> LogIndex {
            self.applied.lock().0
        }

        fn sync(&self) -> Result<()> {
            Ok(())
        }

        fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn entry(index: LogIndex, term: Term, data: &str, session: Option<SessionTag>) -> Entry {
        Entry {
            entry_type: EntryType::Entry {
                data: data.as_bytes().to_vec(),
                session,
            },
            term,
            index,
        }
    }

    #[tokio::test]
    async fn transition() -> Result<()> {
        let fsm = Arc::new(TestFsm::default());

        let (tx, rx) = unbounded_channel();
        let (rpc_tx, mut rpc_rx) = unbounded_channel();
        let (applied_tx, applied_rx) = watch::channel(0);
        let driver = Driver::new(1, rx, rpc_tx, fsm.clone(), applied_tx, 0);

        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
        let id = Uuid::new_v4();
        tx.send(Instruction::Notify { id, index: 1, term: 1 }).unwrap();
        tx.send(Instruction::Apply {
            entries: vec![entry(1, 1, "B", None)],
        })
        .unwrap();

        let handle = tokio::spawn(driver.run(shutdown_rx));
        let msg = rpc_rx.recv().await.unwrap();
        assert_eq!(
            msg.command,
            Command::ClientResponse {
                id,
                res: Ok(Response::Applied { index: 1 })
            }
        );
        assert_eq!(*applied_rx.borrow(), 1);
        shutdown_tx.send(()).unwrap();
        handle.await??;

        assert_eq!(fsm.lookup(&Query::Wildcard)?, b"B".to_vec());
        Ok(())
    }

    #[tokio::test]
    async fn overwritten_entry_aborts() -> Result<()> {
        let fsm = Arc::new(TestFsm::default());
        let (_tx, rx) = unbounded_channel();
        let (rpc_tx, mut rpc_rx) = unbounded_channel();
        let (applied_tx, _applied_rx) = watch::channel(0);
        let mut driver = Driver::new(1, rx, rpc_tx, fsm, applied_tx, 0);

        let id = Uuid::new_v4();
        driver.notify(id, 1, 1)?;
        driver.apply(vec![entry(1, 2, "A", None)])?;
        match rpc_rx.try_recv().unwrap().command {
            Command::ClientResponse { res, .. } => assert_eq!(res, Err(RaftError::Aborted)),
            other => panic!("unexpected {:?}", other),
        }

        // notification after the apply is answered from the cache
        let late = Uuid::new_v4();
        driver.notify(late, 1, 2)?;
        match rpc_rx.try_recv().unwrap().command {
            Command::ClientResponse { id, res } => {
                assert_eq!(id, late);
                assert_eq!(res, Ok(Response::Applied { index: 1 }));
            }
            other => panic!("unexpected {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_session_series_applied_once() -> Result<()> {
        let fsm = Arc::new(TestFsm::default());
        let (_tx, rx) = unbounded_channel();
        let (rpc_tx, _rpc_rx) = unbounded_channel();
        let (applied_tx, _applied_rx) = watch::channel(0);
        let mut driver = Driver::new(1, rx, rpc_tx, fsm.clone(), applied_tx, 0);

        let tag = SessionTag {
            client_id: 9,
            series_id: 1,
        };
        driver.apply(vec![entry(1, 1, "A", Some(tag)), entry(2, 1, "A", Some(tag))])?;
        assert_eq!(fsm.lookup(&Query::Wildcard)?, b"A".to_vec());
        assert_eq!(fsm.applied_index(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn unrecoverable_failures_are_fatal() -> Result<()> {
        let fsm = Arc::new(TestFsm {
            broken: true,
            ..Default::default()
        });
        let (tx, rx) = unbounded_channel();
        let (rpc_tx, _rpc_rx) = unbounded_channel();
        let (applied_tx, applied_rx) = watch::channel(0);
        let failures = Arc::new(Mutex::new(Vec::new()));
        let recorded = failures.clone();
        let mut driver = Driver::new(7, rx, rpc_tx, fsm.clone(), applied_tx, 0).on_fatal(Arc::new(
            move |group: GroupId, err: &FurrowError| recorded.lock().push((group, err.clone())),
        ));

        let res = driver.restore(3, vec![]);
        assert!(matches!(res, Err(FurrowError::BackwardAppliedIndex { .. })));
        assert_eq!(
            failures.lock()[0],
            (7, FurrowError::BackwardAppliedIndex { current: 5, recovered: 3 })
        );

        // the driver stops instead of applying past the failure
        let (_shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
        tx.send(Instruction::Apply {
            entries: vec![entry(1, 1, "A", None)],
        })
        .unwrap();
        let res = tokio::spawn(driver.run(shutdown_rx)).await.unwrap();
        assert!(matches!(res, Err(FurrowError::Storage(_))));
        assert_eq!(failures.lock().len(), 2);
        assert_eq!(*applied_rx.borrow(), 0);
        Ok(())
    }
}
