//! Public facade: submit batches, control them, observe and undo them.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use tokio::fs;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use framemover_core::{
    BatchId, BatchOperation, BatchOptions, BatchProgress, EngineConfig, EngineError, MappingItem,
    SequenceValidation, UndoOutcome,
};

use crate::batch::Batch;
use crate::broadcast::{ProgressBroadcaster, Subscription};
use crate::transfer::TransferOptions;
use crate::undo::{UndoLedger, reverse_records};
use crate::validate::validate_operations;

/// Batch file operation engine.
///
/// Batches are independent: each has its own controller, worker pool and
/// control gate. The engine only shares the progress broadcaster and the
/// undo ledger between them.
#[derive(Debug)]
pub struct TransferEngine {
    config: EngineConfig,
    batches: DashMap<BatchId, Arc<Batch>>,
    next_batch: AtomicU64,
    broadcaster: ProgressBroadcaster,
    ledger: Arc<UndoLedger>,
    heartbeat: OnceLock<JoinHandle<()>>,
}

impl TransferEngine {
    /// Create an engine with default settings and an in-memory ledger.
    pub fn new() -> Self {
        Self::from_parts(EngineConfig::default(), UndoLedger::in_memory())
    }

    /// Create an engine from a config, reloading the ledger if one is configured.
    pub fn with_config(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let ledger = match &config.ledger_path {
            Some(path) => UndoLedger::load(path)?,
            None => UndoLedger::in_memory(),
        };
        Ok(Self::from_parts(config, ledger))
    }

    fn from_parts(config: EngineConfig, ledger: UndoLedger) -> Self {
        // Ids stay unique across sessions sharing a ledger file.
        let first_id = ledger.latest().map_or(1, |id| id.0 + 1);
        let broadcaster =
            ProgressBroadcaster::new(config.subscriber_buffer, config.max_missed_heartbeats);
        Self {
            config,
            batches: DashMap::new(),
            next_batch: AtomicU64::new(first_id),
            broadcaster,
            ledger: Arc::new(ledger),
            heartbeat: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Submit a batch and start executing it.
    ///
    /// Items with a size of 0 are sized from the source file. An empty
    /// batch is rejected before any batch is created. If the destination
    /// root is unusable, the batch is created, fails every item and ends as
    /// `Failed`; the error carries its id and the undo ledger is left alone.
    pub async fn submit(
        &self,
        items: Vec<MappingItem>,
        options: BatchOptions,
    ) -> Result<BatchId, EngineError> {
        if items.is_empty() {
            return Err(EngineError::EmptyBatch);
        }
        let (file_concurrency, chunk_streams) = options.resolve(&self.config)?;
        self.ensure_heartbeat();

        let items = size_items(items).await;
        let id = BatchId(self.next_batch.fetch_add(1, Ordering::Relaxed));
        let batch = Batch::new(
            id,
            &items,
            file_concurrency,
            TransferOptions::from_config(&self.config, chunk_streams),
            self.config.eta_window(),
            self.broadcaster.clone(),
        );
        self.batches.insert(id, Arc::clone(&batch));

        // A batch that never runs leaves the previous batch undoable.
        if let Some(root) = &options.destination_root {
            if let Err(reason) = prepare_destination_root(root).await {
                batch.fail_precondition(&reason);
                return Err(EngineError::DestinationUnreachable {
                    batch_id: id,
                    path: root.clone(),
                    reason,
                });
            }
        }

        self.ledger.begin(id);
        batch.start(Arc::clone(&self.ledger))?;
        Ok(id)
    }

    /// Pause a running batch. In-flight transfers stop at the next chunk.
    pub fn pause(&self, batch_id: BatchId) -> Result<(), EngineError> {
        self.batch(batch_id)?.pause().map(|_| ())
    }

    pub fn resume(&self, batch_id: BatchId) -> Result<(), EngineError> {
        self.batch(batch_id)?.resume().map(|_| ())
    }

    /// Cancel a running or paused batch.
    pub fn cancel(&self, batch_id: BatchId) -> Result<(), EngineError> {
        self.batch(batch_id)?.cancel().map(|_| ())
    }

    /// Point-in-time progress for polling clients.
    pub fn progress(&self, batch_id: BatchId) -> Result<BatchProgress, EngineError> {
        Ok(self.batch(batch_id)?.snapshot())
    }

    /// Live progress stream; the first frame is the current snapshot.
    pub fn subscribe(&self, batch_id: BatchId) -> Result<Subscription, EngineError> {
        self.broadcaster
            .subscribe(batch_id)
            .ok_or(EngineError::BatchNotFound(batch_id))
    }

    /// Every operation of a batch with its status and error detail.
    pub fn list_operations(&self, batch_id: BatchId) -> Result<Vec<BatchOperation>, EngineError> {
        Ok(self.batch(batch_id)?.operations())
    }

    /// Wait for a batch to reach a terminal status.
    pub async fn wait(&self, batch_id: BatchId) -> Result<BatchProgress, EngineError> {
        let batch = self.batch(batch_id)?;
        Ok(batch.wait().await)
    }

    /// Ids of every batch submitted to this engine, oldest first.
    pub fn batch_ids(&self) -> Vec<BatchId> {
        let mut ids: Vec<BatchId> = self.batches.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    /// Release a finished batch's operations and progress topic.
    ///
    /// Afterwards the id is unknown to every query. Undo records are kept
    /// by the ledger, so a forgotten batch can still be undone.
    pub fn forget(&self, batch_id: BatchId) -> Result<(), EngineError> {
        let batch = self.batch(batch_id)?;
        let status = batch.status();
        if !status.is_terminal() {
            return Err(EngineError::NotTerminal { batch_id, status });
        }
        self.batches.remove(&batch_id);
        self.broadcaster.remove(batch_id);
        debug!(batch = %batch_id, "batch forgotten");
        Ok(())
    }

    /// Validate the image sequences of a terminal batch.
    pub async fn validate_sequences(
        &self,
        batch_id: BatchId,
    ) -> Result<Vec<SequenceValidation>, EngineError> {
        let batch = self.batch(batch_id)?;
        let status = batch.status();
        if !status.is_terminal() {
            return Err(EngineError::NotTerminal { batch_id, status });
        }
        let results = validate_operations(&batch.operations())?;
        debug!(batch = %batch_id, sequences = results.len(), "sequences validated");
        Ok(results)
    }

    /// Undo the most recently submitted batch.
    pub async fn undo_last_batch(&self) -> Result<Vec<UndoOutcome>, EngineError> {
        let latest = self.ledger.latest().ok_or(EngineError::NoUndoableBatch)?;
        self.undo_batch(latest).await
    }

    /// Undo a specific batch, which must be the latest one and terminal.
    pub async fn undo_batch(&self, batch_id: BatchId) -> Result<Vec<UndoOutcome>, EngineError> {
        if let Some(batch) = self.batches.get(&batch_id).map(|entry| Arc::clone(entry.value())) {
            let status = batch.status();
            if !status.is_terminal() {
                return Err(EngineError::NotTerminal { batch_id, status });
            }
            // Terminal is published just before the ledger is sealed.
            batch.wait().await;
        }

        let records = self.ledger.take(batch_id).await?;
        info!(batch = %batch_id, records = records.len(), "undoing batch");
        Ok(reverse_records(records).await)
    }

    fn batch(&self, batch_id: BatchId) -> Result<Arc<Batch>, EngineError> {
        self.batches
            .get(&batch_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(EngineError::BatchNotFound(batch_id))
    }

    fn ensure_heartbeat(&self) {
        self.heartbeat.get_or_init(|| {
            self.broadcaster
                .spawn_heartbeat(self.config.heartbeat_interval())
        });
    }
}

impl Default for TransferEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        if let Some(handle) = self.heartbeat.get() {
            handle.abort();
        }
    }
}

/// Fill in unknown sizes from the source files.
async fn size_items(items: Vec<MappingItem>) -> Vec<MappingItem> {
    let mut sized = Vec::with_capacity(items.len());
    for mut item in items {
        if item.size == 0 {
            // Unreadable sources keep size 0 and fail in the transfer itself.
            if let Ok(metadata) = fs::metadata(&item.source).await {
                item.size = metadata.len();
            }
        }
        sized.push(item);
    }
    sized
}

/// Make sure the destination root exists and is a directory.
async fn prepare_destination_root(root: &Path) -> Result<(), String> {
    match fs::metadata(root).await {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err("not a directory".to_string()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            fs::create_dir_all(root).await.map_err(|e| e.to_string())
        }
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use framemover_core::{BatchStatus, EngineConfig};
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let engine = TransferEngine::new();
        let result = engine.submit(Vec::new(), BatchOptions::default()).await;
        assert!(matches!(result, Err(EngineError::EmptyBatch)));
        assert!(engine.batch_ids().is_empty());
    }

    #[tokio::test]
    async fn test_zero_concurrency_rejected() {
        let engine = TransferEngine::new();
        let items = vec![MappingItem::copy(1, "/a", "/b", 1)];
        let result = engine
            .submit(items, BatchOptions::with_concurrency(0, 1))
            .await;
        assert!(matches!(result, Err(EngineError::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn test_unknown_batch() {
        let engine = TransferEngine::new();
        assert!(matches!(
            engine.pause(BatchId(9)),
            Err(EngineError::BatchNotFound(BatchId(9)))
        ));
        assert!(matches!(
            engine.subscribe(BatchId(9)),
            Err(EngineError::BatchNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_destination_root_is_a_file() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        std::fs::write(&root, b"not a dir").unwrap();
        let source = temp.path().join("a.txt");
        std::fs::write(&source, b"abc").unwrap();

        let engine = TransferEngine::new();
        let items = vec![MappingItem::copy(1, &source, root.join("a.txt"), 0)];
        let err = engine
            .submit(items, BatchOptions::default().destination_root(&root))
            .await
            .unwrap_err();

        let EngineError::DestinationUnreachable { batch_id, .. } = err else {
            panic!("unexpected error: {err}");
        };
        let progress = engine.progress(batch_id).unwrap();
        assert_eq!(progress.status, BatchStatus::Failed);
        assert_eq!(progress.failed_operations, 1);
        assert!(source.exists());
    }

    #[tokio::test]
    async fn test_missing_destination_root_is_created() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("new/root");
        let source = temp.path().join("a.txt");
        std::fs::write(&source, b"abc").unwrap();
        let outside = temp.path().join("elsewhere/a.txt");

        let engine = TransferEngine::new();
        let items = vec![MappingItem::copy(1, &source, &outside, 0)];
        let id = engine
            .submit(items, BatchOptions::default().destination_root(&root))
            .await
            .unwrap();

        assert_eq!(engine.wait(id).await.unwrap().status, BatchStatus::Completed);
        assert!(root.is_dir());
        assert_eq!(std::fs::read(&outside).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_sizes_derived_from_source() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("a.txt");
        std::fs::write(&source, vec![7u8; 1234]).unwrap();

        let engine = TransferEngine::new();
        let items = vec![MappingItem::copy(1, &source, temp.path().join("b.txt"), 0)];
        let id = engine.submit(items, BatchOptions::default()).await.unwrap();
        let progress = engine.wait(id).await.unwrap();

        assert_eq!(progress.total_bytes, 1234);
        assert_eq!(progress.processed_bytes, 1234);
        assert_eq!(progress.status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn test_ledger_path_continues_ids() {
        let temp = TempDir::new().unwrap();
        let ledger_path = temp.path().join("ledger.json");
        let config = EngineConfig::builder()
            .ledger_path(Some(ledger_path.clone()))
            .build()
            .unwrap();

        let source = temp.path().join("a.txt");
        std::fs::write(&source, b"abc").unwrap();
        let first = {
            let engine = TransferEngine::with_config(config.clone()).unwrap();
            let items = vec![MappingItem::copy(1, &source, temp.path().join("b.txt"), 0)];
            let id = engine.submit(items, BatchOptions::default()).await.unwrap();
            engine.wait(id).await.unwrap();
            id
        };

        let engine = TransferEngine::with_config(config).unwrap();
        let outcomes = engine.undo_last_batch().await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_success());
        assert_eq!(outcomes[0].record.batch_id, first);
        assert!(!temp.path().join("b.txt").exists());
        assert_eq!(std::fs::read(&source).unwrap(), b"abc");
    }
}
