//! Undo ledger for the most recent batch.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, trace, warn};

use framemover_core::{BatchId, EngineError, OperationKind, UndoOutcome, UndoRecord};

/// On-disk form of the ledger.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LedgerFile {
    batch_id: Option<BatchId>,
    sealed: bool,
    records: Vec<UndoRecord>,
}

#[derive(Debug, Default, Clone)]
struct LedgerState {
    latest: Option<BatchId>,
    sealed: bool,
    records: Vec<UndoRecord>,
}

/// Append-only record of completed operations.
///
/// Only the most recently started batch is tracked: beginning a new batch
/// supersedes the previous batch's records. Appends are serialized by an
/// internal lock, so concurrent workers never lose records.
#[derive(Debug, Default)]
pub struct UndoLedger {
    state: Mutex<LedgerState>,
    path: Option<PathBuf>,
}

impl UndoLedger {
    /// Create a ledger that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load a persisted ledger, or start empty if the file does not exist.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let file: LedgerFile =
                    serde_json::from_str(&contents).map_err(|e| EngineError::Serialization {
                        message: format!("{}: {e}", path.display()),
                    })?;
                LedgerState {
                    latest: file.batch_id,
                    sealed: file.sealed,
                    records: file.records,
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => LedgerState::default(),
            Err(source) => return Err(EngineError::Ledger { path, source }),
        };

        Ok(Self {
            state: Mutex::new(state),
            path: Some(path),
        })
    }

    /// Start tracking a new batch, superseding older records.
    pub fn begin(&self, batch_id: BatchId) {
        let mut state = self.lock();
        if let Some(previous) = state.latest {
            if previous != batch_id && !state.records.is_empty() {
                debug!(batch = %batch_id, previous = %previous, dropped = state.records.len(), "superseding undo records");
            }
        }
        *state = LedgerState {
            latest: Some(batch_id),
            sealed: false,
            records: Vec::new(),
        };
    }

    /// Append a record for the batch being tracked.
    ///
    /// Returns false if the record belongs to a superseded batch.
    pub fn append(&self, record: UndoRecord) -> bool {
        let mut state = self.lock();
        if state.latest != Some(record.batch_id) || state.sealed {
            trace!(batch = %record.batch_id, "ignoring undo record for superseded batch");
            return false;
        }
        state.records.push(record);
        true
    }

    /// Mark a batch as finished and persist the ledger.
    pub async fn seal(&self, batch_id: BatchId) -> Result<(), EngineError> {
        let snapshot = {
            let mut state = self.lock();
            if state.latest != Some(batch_id) {
                return Ok(());
            }
            state.sealed = true;
            state.clone()
        };
        self.persist(&snapshot).await
    }

    /// Batch whose records the ledger currently holds.
    pub fn latest(&self) -> Option<BatchId> {
        self.lock().latest
    }

    /// Whether the tracked batch has finished.
    pub fn is_sealed(&self) -> bool {
        self.lock().sealed
    }

    /// Copy of the tracked records, oldest first.
    pub fn records(&self) -> Vec<UndoRecord> {
        self.lock().records.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    /// Consume the records of `batch_id` for an undo.
    ///
    /// Only the latest, sealed batch can be taken. Afterwards the ledger is
    /// empty and a second undo fails with `NoUndoableBatch`.
    pub async fn take(&self, batch_id: BatchId) -> Result<Vec<UndoRecord>, EngineError> {
        let (records, cleared) = {
            let mut state = self.lock();
            match state.latest {
                None => return Err(EngineError::NoUndoableBatch),
                Some(latest) if latest != batch_id => {
                    return Err(EngineError::NotLatestBatch {
                        requested: batch_id,
                        latest,
                    });
                }
                Some(_) if !state.sealed => return Err(EngineError::NoUndoableBatch),
                Some(_) => {}
            }
            let records = std::mem::take(&mut state.records);
            state.latest = None;
            state.sealed = false;
            (records, state.clone())
        };
        self.persist(&cleared).await?;
        Ok(records)
    }

    async fn persist(&self, state: &LedgerState) -> Result<(), EngineError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = LedgerFile {
            batch_id: state.latest,
            sealed: state.sealed,
            records: state.records.clone(),
        };
        let json = serde_json::to_string_pretty(&file).map_err(|e| EngineError::Serialization {
            message: e.to_string(),
        })?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| EngineError::Ledger {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json)
            .await
            .map_err(|source| EngineError::Ledger {
                path: tmp.clone(),
                source,
            })?;
        fs::rename(&tmp, path)
            .await
            .map_err(|source| EngineError::Ledger {
                path: path.clone(),
                source,
            })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Reverse undo records, newest first, continuing past failures.
///
/// Moves are moved back to their original path (never overwriting a file
/// that has since appeared there); copies are deleted, leaving the source
/// untouched. Returns one outcome per record in the order attempted.
pub async fn reverse_records(records: Vec<UndoRecord>) -> Vec<UndoOutcome> {
    let mut outcomes = Vec::with_capacity(records.len());
    let mut failed = 0usize;

    for record in records.into_iter().rev() {
        let result = match record.kind {
            OperationKind::Move => move_back(&record.new, &record.original).await,
            OperationKind::Copy => fs::remove_file(&record.new)
                .await
                .map_err(|e| format!("failed to delete {}: {e}", record.new.display())),
        };

        match result {
            Ok(()) => outcomes.push(UndoOutcome::success(record)),
            Err(error) => {
                warn!(path = %record.new.display(), error = %error, "undo step failed");
                failed += 1;
                outcomes.push(UndoOutcome::failure(record, error));
            }
        }
    }

    info!(reverted = outcomes.len() - failed, failed, "undo finished");
    outcomes
}

async fn move_back(from: &Path, to: &Path) -> Result<(), String> {
    if fs::symlink_metadata(to).await.is_ok() {
        return Err(format!("original path is occupied: {}", to.display()));
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| format!("failed to create {}: {e}", parent.display()))?;
    }

    match fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::CrossesDevices => {
            fs::copy(from, to)
                .await
                .map_err(|e| format!("failed to copy {} back: {e}", from.display()))?;
            fs::remove_file(from)
                .await
                .map_err(|e| format!("failed to remove {}: {e}", from.display()))
        }
        Err(e) => Err(format!(
            "failed to move {} back to {}: {e}",
            from.display(),
            to.display()
        )),
    }
}
