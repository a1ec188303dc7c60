//! Durable checkpoint storage (`.ratchet/checkpoints/<run-id>.json`).
//!
//! One record per run holds the next node to execute, the envelope to hand
//! it, and a sequence number. Writers must present the sequence number they
//! last observed; a mismatch means a second writer got there first and the
//! save is refused.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use crate::core::ids::{NodeRef, RunId};
use crate::core::types::StateEnvelope;
use crate::error::StoreError;

/// Record format written by this build. Newer formats are refused on load.
pub const CHECKPOINT_FORMAT: u32 = 1;

/// A committed `(node, state)` pair for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub run_id: RunId,
    pub seq: u64,
    pub node: NodeRef,
    pub state: StateEnvelope,
    pub saved_at_unix_ms: u64,
}

/// Keyed durable storage for checkpoints. Writes for distinct runs never
/// interact; writes for one run are serialized.
pub trait CheckpointStore: Send + Sync {
    /// Commit `(node, state)` for `run_id`, returning the new sequence number.
    ///
    /// `expected_seq` is the sequence the caller last observed (0 if it has
    /// never seen a checkpoint for this run).
    fn save(
        &self,
        run_id: &RunId,
        expected_seq: u64,
        node: &NodeRef,
        state: &StateEnvelope,
    ) -> Result<u64, StoreError>;

    fn load(&self, run_id: &RunId) -> Result<Checkpoint, StoreError>;

    /// Remove the checkpoint for `run_id`. Missing records are not an error.
    fn clear(&self, run_id: &RunId) -> Result<(), StoreError>;
}

#[derive(Debug, Serialize)]
struct RecordOut<'a> {
    format: u32,
    run_id: &'a RunId,
    seq: u64,
    node: &'a NodeRef,
    state: &'a StateEnvelope,
    saved_at_unix_ms: u64,
    #[serde(flatten)]
    extra: &'a Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RecordIn {
    format: u32,
    run_id: RunId,
    seq: u64,
    node: NodeRef,
    state: StateEnvelope,
    #[serde(default)]
    saved_at_unix_ms: u64,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Checkpoint store backed by one JSON file per run.
#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    locks: Mutex<HashMap<RunId, Arc<Mutex<()>>>>,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, run_id: &RunId) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    fn tmp_path_for(&self, run_id: &RunId) -> PathBuf {
        self.dir.join(format!(".{run_id}.json.tmp"))
    }

    fn lock_for(&self, run_id: &RunId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(run_id.clone()).or_default())
    }

    fn read_record(&self, run_id: &RunId) -> Result<RecordIn, StoreError> {
        let path = self.path_for(run_id);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == IoErrorKind::NotFound => {
                return Err(StoreError::NotFound(run_id.clone()));
            }
            Err(err) => return Err(StoreError::io("read checkpoint", &path, err)),
        };
        let record: RecordIn = serde_json::from_str(&contents).map_err(|err| StoreError::Corrupt {
            path: path.clone(),
            reason: err.to_string(),
        })?;
        if record.format > CHECKPOINT_FORMAT {
            return Err(StoreError::Corrupt {
                path,
                reason: format!(
                    "unsupported checkpoint format {} (this build writes {CHECKPOINT_FORMAT})",
                    record.format
                ),
            });
        }
        if &record.run_id != run_id {
            return Err(StoreError::Corrupt {
                path,
                reason: format!("record belongs to run {}", record.run_id),
            });
        }
        Ok(record)
    }
}

impl CheckpointStore for FileCheckpointStore {
    #[instrument(skip_all, fields(run_id = %run_id, node = %node, expected_seq))]
    fn save(
        &self,
        run_id: &RunId,
        expected_seq: u64,
        node: &NodeRef,
        state: &StateEnvelope,
    ) -> Result<u64, StoreError> {
        let lock = self.lock_for(run_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let (found, extra) = match self.read_record(run_id) {
            Ok(record) => (record.seq, record.extra),
            Err(StoreError::NotFound(_)) => (0, Map::new()),
            Err(err) => return Err(err),
        };
        if found != expected_seq {
            warn!(found, "refusing stale checkpoint write");
            return Err(StoreError::StaleSequence {
                run_id: run_id.clone(),
                expected: expected_seq,
                found,
            });
        }

        let seq = expected_seq + 1;
        let record = RecordOut {
            format: CHECKPOINT_FORMAT,
            run_id,
            seq,
            node,
            state,
            saved_at_unix_ms: unix_ms_now(),
            extra: &extra,
        };
        let mut buf = serde_json::to_vec_pretty(&record).map_err(|source| StoreError::Encode {
            run_id: run_id.clone(),
            source,
        })?;
        buf.push(b'\n');
        write_durable(&self.tmp_path_for(run_id), &self.path_for(run_id), &buf)?;
        debug!(seq, "checkpoint committed");
        Ok(seq)
    }

    #[instrument(skip_all, fields(run_id = %run_id))]
    fn load(&self, run_id: &RunId) -> Result<Checkpoint, StoreError> {
        let record = self.read_record(run_id)?;
        debug!(seq = record.seq, node = %record.node, "checkpoint loaded");
        Ok(Checkpoint {
            run_id: record.run_id,
            seq: record.seq,
            node: record.node,
            state: record.state,
            saved_at_unix_ms: record.saved_at_unix_ms,
        })
    }

    #[instrument(skip_all, fields(run_id = %run_id))]
    fn clear(&self, run_id: &RunId) -> Result<(), StoreError> {
        let lock = self.lock_for(run_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        for path in [self.path_for(run_id), self.tmp_path_for(run_id)] {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed"),
                Err(err) if err.kind() == IoErrorKind::NotFound => {}
                Err(err) => return Err(StoreError::io("remove checkpoint", path, err)),
            }
        }
        Ok(())
    }
}

/// Write `contents` to `tmp`, fsync, then rename over `path`.
///
/// A reader sees either the previous record or the new one, never a prefix.
fn write_durable(tmp: &Path, path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|err| StoreError::io("create directory", parent, err))?;

    let mut file = File::create(tmp).map_err(|err| StoreError::io("create temp checkpoint", tmp, err))?;
    file.write_all(contents)
        .map_err(|err| StoreError::io("write temp checkpoint", tmp, err))?;
    file.sync_all()
        .map_err(|err| StoreError::io("sync temp checkpoint", tmp, err))?;
    drop(file);

    fs::rename(tmp, path).map_err(|err| StoreError::io("replace checkpoint", path, err))?;
    // Persist the rename itself; not every platform can open a directory.
    if let Ok(dir) = File::open(parent) {
        if let Err(err) = dir.sync_all() {
            debug!(err = %err, "directory sync skipped");
        }
    }
    Ok(())
}

fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
