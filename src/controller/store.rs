//! Durable versioned state store
//!
//! An in-memory ordered map of JSON records backed by the commit log in
//! [`super::wal`] and a periodic snapshot. Every commit gets the next global
//! revision; each key remembers the revision it was last written at.
//!
//! Layout under the state directory:
//! - `store.wal`  committed transactions since the last snapshot
//! - `store.snap` full map at some revision

use super::wal::{read_snapshot, write_snapshot, Mutation, Wal};
use crate::common::{Error, Result};
use futures_util::Stream;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

const WAL_FILE: &str = "store.wal";
const SNAP_FILE: &str = "store.snap";
const WATCH_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned {
    pub value: Value,
    pub revision: u64,
}

/// Precondition on a key's current revision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    Any,
    Absent,
    Revision(u64),
}

/// One operation of an atomic transaction
#[derive(Debug, Clone)]
pub enum TxnOp {
    Put {
        key: String,
        value: Value,
        expect: Expect,
    },
    Delete {
        key: String,
        expect: Expect,
    },
    /// Assert a precondition without writing
    Check { key: String, expect: Expect },
}

impl TxnOp {
    pub fn put<T: Serialize>(key: impl Into<String>, value: &T) -> Result<Self> {
        Ok(TxnOp::Put {
            key: key.into(),
            value: serde_json::to_value(value)?,
            expect: Expect::Any,
        })
    }

    pub fn put_if<T: Serialize>(key: impl Into<String>, expect: Expect, value: &T) -> Result<Self> {
        Ok(TxnOp::Put {
            key: key.into(),
            value: serde_json::to_value(value)?,
            expect,
        })
    }

    pub fn delete(key: impl Into<String>) -> Self {
        TxnOp::Delete {
            key: key.into(),
            expect: Expect::Any,
        }
    }

    fn key(&self) -> &str {
        match self {
            TxnOp::Put { key, .. } | TxnOp::Delete { key, .. } | TxnOp::Check { key, .. } => key,
        }
    }

    fn expect(&self) -> Expect {
        match self {
            TxnOp::Put { expect, .. } | TxnOp::Delete { expect, .. } | TxnOp::Check { expect, .. } => {
                *expect
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchKind {
    Put,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    pub revision: u64,
    pub key: String,
    pub kind: WatchKind,
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    revision: u64,
    entries: BTreeMap<String, Versioned>,
}

struct Inner {
    data: BTreeMap<String, Versioned>,
    revision: u64,
    wal: Option<Wal>,
    commits_since_snapshot: u64,
}

pub struct StateStore {
    inner: Mutex<Inner>,
    dir: Option<PathBuf>,
    snapshot_every: u64,
    events: broadcast::Sender<WatchEvent>,
}

impl StateStore {
    /// Open (or create) a durable store under `dir`.
    pub fn open(dir: impl AsRef<Path>, snapshot_every: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let (mut data, mut revision) = match read_snapshot::<SnapshotFile>(&dir.join(SNAP_FILE))? {
            Some(snap) => (snap.entries, snap.revision),
            None => (BTreeMap::new(), 0),
        };
        let snapshot_revision = revision;

        let mut replayed = 0u64;
        Wal::replay(dir.join(WAL_FILE), |entry| {
            // entries already folded into the snapshot
            if entry.revision <= snapshot_revision {
                return Ok(());
            }
            for mutation in entry.mutations {
                apply(&mut data, mutation, entry.revision);
            }
            revision = entry.revision;
            replayed += 1;
            Ok(())
        })?;

        let wal = Wal::open(dir.join(WAL_FILE))?;

        tracing::info!(
            dir = %dir.display(),
            revision,
            keys = data.len(),
            replayed,
            "state store opened"
        );

        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Ok(Self {
            inner: Mutex::new(Inner {
                data,
                revision,
                wal: Some(wal),
                commits_since_snapshot: replayed,
            }),
            dir: Some(dir),
            snapshot_every: snapshot_every.max(1),
            events,
        })
    }

    /// Volatile store for tests and dry runs.
    pub fn in_memory() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                data: BTreeMap::new(),
                revision: 0,
                wal: None,
                commits_since_snapshot: 0,
            }),
            dir: None,
            snapshot_every: u64::MAX,
            events,
        }
    }

    pub fn revision(&self) -> u64 {
        self.inner.lock().revision
    }

    pub fn get(&self, key: &str) -> Option<Versioned> {
        self.inner.lock().data.get(key).cloned()
    }

    /// Typed read returning the record and its revision.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<(T, u64)>> {
        match self.get(key) {
            Some(v) => {
                let record = serde_json::from_value(v.value)
                    .map_err(|e| Error::Corrupted(format!("{}: {}", key, e)))?;
                Ok(Some((record, v.revision)))
            }
            None => Ok(None),
        }
    }

    pub fn list_prefix(&self, prefix: &str) -> Vec<(String, Versioned)> {
        let inner = self.inner.lock();
        inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn list_as<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<(T, u64)>> {
        self.list_prefix(prefix)
            .into_iter()
            .map(|(key, v)| {
                serde_json::from_value(v.value)
                    .map(|record| (record, v.revision))
                    .map_err(|e| Error::Corrupted(format!("{}: {}", key, e)))
            })
            .collect()
    }

    /// Conditional single-key write; returns the new revision.
    pub fn put_if<T: Serialize>(&self, key: &str, expect: Expect, value: &T) -> Result<u64> {
        self.atomic(vec![TxnOp::put_if(key, expect, value)?])
    }

    pub fn delete_if(&self, key: &str, expect: Expect) -> Result<u64> {
        self.atomic(vec![TxnOp::Delete {
            key: key.to_string(),
            expect,
        }])
    }

    /// Commit all operations or none; returns the new revision.
    pub fn atomic(&self, ops: Vec<TxnOp>) -> Result<u64> {
        let (revision, events) = {
            let mut inner = self.inner.lock();

            for op in &ops {
                check(&inner.data, op.key(), op.expect())?;
            }

            let mutations: Vec<Mutation> = ops
                .into_iter()
                .filter_map(|op| match op {
                    TxnOp::Put { key, value, .. } => Some(Mutation::Put { key, value }),
                    TxnOp::Delete { key, .. } => Some(Mutation::Delete { key }),
                    TxnOp::Check { .. } => None,
                })
                .collect();

            if mutations.is_empty() {
                return Ok(inner.revision);
            }

            let revision = inner.revision + 1;
            if let Some(wal) = inner.wal.as_mut() {
                wal.append(revision, &mutations)?;
            }

            let events: Vec<WatchEvent> = mutations
                .iter()
                .map(|m| match m {
                    Mutation::Put { key, value } => WatchEvent {
                        revision,
                        key: key.clone(),
                        kind: WatchKind::Put,
                        value: Some(value.clone()),
                    },
                    Mutation::Delete { key } => WatchEvent {
                        revision,
                        key: key.clone(),
                        kind: WatchKind::Delete,
                        value: None,
                    },
                })
                .collect();

            for mutation in mutations {
                apply(&mut inner.data, mutation, revision);
            }
            inner.revision = revision;
            inner.commits_since_snapshot += 1;

            if inner.commits_since_snapshot >= self.snapshot_every {
                if let Err(e) = self.compact_locked(&mut inner) {
                    // the commit itself is durable in the log
                    tracing::warn!(error = %e, "state store compaction failed");
                }
            }

            (revision, events)
        };

        for event in events {
            let _ = self.events.send(event);
        }
        Ok(revision)
    }

    /// Stream of changes under `prefix`, starting after the current revision.
    pub fn watch(&self, prefix: &str) -> impl Stream<Item = WatchEvent> + Send + 'static {
        let prefix = prefix.to_string();
        BroadcastStream::new(self.events.subscribe()).filter_map(move |event| match event {
            Ok(event) if event.key.starts_with(&prefix) => Some(event),
            Ok(_) => None,
            Err(lagged) => {
                tracing::warn!(error = %lagged, "watch subscriber lagged");
                None
            }
        })
    }

    /// Write a snapshot and truncate the log.
    pub fn compact(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.compact_locked(&mut inner)
    }

    fn compact_locked(&self, inner: &mut Inner) -> Result<()> {
        let Some(dir) = self.dir.as_ref() else {
            return Ok(());
        };

        let snap = SnapshotFile {
            revision: inner.revision,
            entries: inner.data.clone(),
        };
        write_snapshot(&dir.join(SNAP_FILE), &snap)?;
        if let Some(wal) = inner.wal.as_mut() {
            wal.truncate()?;
        }
        inner.commits_since_snapshot = 0;

        tracing::debug!(revision = inner.revision, keys = inner.data.len(), "state store compacted");
        Ok(())
    }

    /// Flush the log to disk.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(wal) = inner.wal.as_mut() {
            wal.sync()?;
        }
        Ok(())
    }
}

fn check(data: &BTreeMap<String, Versioned>, key: &str, expect: Expect) -> Result<()> {
    let current = data.get(key).map(|v| v.revision);
    match (expect, current) {
        (Expect::Any, _) => Ok(()),
        (Expect::Absent, None) => Ok(()),
        (Expect::Absent, Some(_)) => Err(Error::AlreadyExists(key.to_string())),
        (Expect::Revision(expected), Some(current)) if expected == current => Ok(()),
        (Expect::Revision(expected), current) => Err(Error::ConflictStale {
            key: key.to_string(),
            expected,
            current: current.unwrap_or(0),
        }),
    }
}

fn apply(data: &mut BTreeMap<String, Versioned>, mutation: Mutation, revision: u64) {
    match mutation {
        Mutation::Put { key, value } => {
            data.insert(key, Versioned { value, revision });
        }
        Mutation::Delete { key } => {
            data.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_put_if_revision_conflict() {
        let store = StateStore::in_memory();
        let rev = store.put_if("nodes/A", Expect::Absent, &json!({"n": 1})).unwrap();
        assert_eq!(rev, 1);

        let err = store
            .put_if("nodes/A", Expect::Absent, &json!({"n": 2}))
            .unwrap_err();
        assert!(err.is_already_exists());

        store
            .put_if("nodes/A", Expect::Revision(1), &json!({"n": 2}))
            .unwrap();
        let err = store
            .put_if("nodes/A", Expect::Revision(1), &json!({"n": 3}))
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ConflictStale);
        assert_eq!(store.get("nodes/A").unwrap().value, json!({"n": 2}));
    }

    #[test]
    fn test_atomic_all_or_nothing() {
        let store = StateStore::in_memory();
        store.put_if("a", Expect::Any, &json!(1)).unwrap();

        let result = store.atomic(vec![
            TxnOp::put("b", &json!(2)).unwrap(),
            TxnOp::Check {
                key: "a".into(),
                expect: Expect::Revision(99),
            },
        ]);
        assert!(result.is_err());
        assert!(store.get("b").is_none());
        assert_eq!(store.revision(), 1);
    }

    #[test]
    fn test_list_prefix_is_scoped() {
        let store = StateStore::in_memory();
        store.put_if("pools/A/p1", Expect::Any, &json!(1)).unwrap();
        store.put_if("pools/A/p2", Expect::Any, &json!(2)).unwrap();
        store.put_if("pools/AB/p1", Expect::Any, &json!(3)).unwrap();
        store.put_if("resources/r0", Expect::Any, &json!(4)).unwrap();

        let keys: Vec<String> = store
            .list_prefix("pools/A/")
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["pools/A/p1", "pools/A/p2"]);
    }

    #[test]
    fn test_reopen_replays_log_and_snapshot() {
        let dir = tempdir().unwrap();
        {
            let store = StateStore::open(dir.path(), 3).unwrap();
            for i in 0..5 {
                store
                    .put_if(&format!("k/{}", i), Expect::Any, &json!(i))
                    .unwrap();
            }
            store.delete_if("k/0", Expect::Any).unwrap();
        }

        let store = StateStore::open(dir.path(), 3).unwrap();
        assert_eq!(store.revision(), 6);
        assert!(store.get("k/0").is_none());
        assert_eq!(store.get("k/4").unwrap().revision, 5);
        assert_eq!(store.list_prefix("k/").len(), 4);
    }

    #[tokio::test]
    async fn test_watch_filters_by_prefix() {
        let store = StateStore::in_memory();
        let mut stream = Box::pin(store.watch("nodes/"));

        store.put_if("resources/r0", Expect::Any, &json!(1)).unwrap();
        store.put_if("nodes/A", Expect::Any, &json!(2)).unwrap();

        let event = stream.next().await.unwrap();
        assert_eq!(event.key, "nodes/A");
        assert_eq!(event.kind, WatchKind::Put);
        assert_eq!(event.revision, 2);
    }
}
