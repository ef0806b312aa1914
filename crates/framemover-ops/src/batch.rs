//! Batch controller: lifecycle, progress aggregation and finalization.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use framemover_core::{
    BatchId, BatchOperation, BatchProgress, BatchStatus, EngineError, MappingItem,
    OperationStatus, UndoRecord,
};

use crate::broadcast::ProgressBroadcaster;
use crate::control::BatchControl;
use crate::pool::{WorkQueue, WorkerPool};
use crate::progress::ProgressTracker;
use crate::transfer::{ByteSink, TransferOptions, transfer};
use crate::undo::UndoLedger;

const CANCELLED: &str = "cancelled";

/// Everything mutated by workers, guarded by the batch's single lock.
#[derive(Debug)]
struct BatchState {
    status: BatchStatus,
    operations: Vec<BatchOperation>,
    tracker: ProgressTracker,
}

impl BatchState {
    fn transition(
        &mut self,
        batch_id: BatchId,
        action: &'static str,
        next: BatchStatus,
    ) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                batch_id,
                action,
                status: self.status,
            });
        }
        self.status = next;
        Ok(())
    }

    fn fail_operation(&mut self, index: usize, reason: &str) {
        let op = &mut self.operations[index];
        if op.status.is_terminal() {
            return;
        }
        op.fail(reason);
        self.tracker.record_failed();
    }
}

/// One submitted batch and its controller.
#[derive(Debug)]
pub(crate) struct Batch {
    id: BatchId,
    control: Arc<BatchControl>,
    queue: Arc<WorkQueue>,
    pool: WorkerPool,
    transfer: TransferOptions,
    state: Mutex<BatchState>,
    status_tx: watch::Sender<BatchStatus>,
    broadcaster: ProgressBroadcaster,
}

impl Batch {
    /// Create a pending batch with one operation per item.
    pub fn new(
        id: BatchId,
        items: &[MappingItem],
        file_concurrency: usize,
        transfer: TransferOptions,
        eta_window: Duration,
        broadcaster: ProgressBroadcaster,
    ) -> Arc<Self> {
        let operations: Vec<BatchOperation> = items
            .iter()
            .map(|item| BatchOperation::from_item(id, item))
            .collect();
        let total_bytes = operations.iter().map(|op| op.size).sum();
        let tracker = ProgressTracker::new(id, operations.len(), total_bytes, eta_window);
        let (status_tx, _) = watch::channel(BatchStatus::Pending);

        let batch = Arc::new(Self {
            id,
            control: Arc::new(BatchControl::new()),
            queue: Arc::new(WorkQueue::new(0..operations.len())),
            pool: WorkerPool::new(file_concurrency),
            transfer,
            state: Mutex::new(BatchState {
                status: BatchStatus::Pending,
                operations,
                tracker,
            }),
            status_tx,
            broadcaster,
        });

        // Register the topic so subscribers can attach before the first update.
        batch.publish(&batch.lock());
        batch
    }

    pub fn status(&self) -> BatchStatus {
        self.lock().status
    }

    /// Current progress snapshot.
    pub fn snapshot(&self) -> BatchProgress {
        let state = self.lock();
        self.snapshot_of(&state)
    }

    /// Copy of every operation with its current status.
    pub fn operations(&self) -> Vec<BatchOperation> {
        self.lock().operations.clone()
    }

    /// Move to `Running` and spawn the workers.
    pub fn start(self: &Arc<Self>, ledger: Arc<UndoLedger>) -> Result<(), EngineError> {
        let progress = {
            let mut state = self.lock();
            state.transition(self.id, "start", BatchStatus::Running)?;
            state.tracker.start();
            self.publish(&state)
        };
        info!(
            batch = %self.id,
            items = progress.total_operations,
            bytes = progress.total_bytes,
            workers = self.pool.width(),
            streams = self.transfer.chunk_streams,
            "batch started"
        );
        self.status_tx.send_replace(BatchStatus::Running);

        let batch = Arc::clone(self);
        tokio::spawn(async move { batch.run(ledger).await });
        Ok(())
    }

    /// Fail every item for a batch-level precondition and finish as `Failed`.
    pub fn fail_precondition(&self, reason: &str) -> BatchProgress {
        let progress = {
            let mut state = self.lock();
            // Pending -> Running -> Failed: no batch skips Running.
            let _ = state.transition(self.id, "start", BatchStatus::Running);
            state.tracker.start();
            self.queue.drain();
            for index in 0..state.operations.len() {
                state.fail_operation(index, reason);
            }
            let _ = state.transition(self.id, "fail", BatchStatus::Failed);
            self.publish(&state)
        };
        warn!(batch = %self.id, reason, "batch precondition failed");
        self.status_tx.send_replace(progress.status);
        progress
    }

    pub fn pause(&self) -> Result<BatchProgress, EngineError> {
        let progress = {
            let mut state = self.lock();
            if self.control.is_cancelled() {
                return Err(EngineError::InvalidTransition {
                    batch_id: self.id,
                    action: "pause",
                    status: state.status,
                });
            }
            state.transition(self.id, "pause", BatchStatus::Paused)?;
            self.control.pause();
            self.publish(&state)
        };
        info!(batch = %self.id, "batch paused");
        self.status_tx.send_replace(BatchStatus::Paused);
        Ok(progress)
    }

    pub fn resume(&self) -> Result<BatchProgress, EngineError> {
        let progress = {
            let mut state = self.lock();
            if self.control.is_cancelled() {
                return Err(EngineError::InvalidTransition {
                    batch_id: self.id,
                    action: "resume",
                    status: state.status,
                });
            }
            state.transition(self.id, "resume", BatchStatus::Running)?;
            self.control.resume();
            self.publish(&state)
        };
        info!(batch = %self.id, "batch resumed");
        self.status_tx.send_replace(BatchStatus::Running);
        Ok(progress)
    }

    /// Cancel the batch.
    ///
    /// Queued operations are failed immediately; in-flight ones stop at
    /// their next chunk boundary. The status becomes `Cancelled` once every
    /// worker has exited. Cancelling twice is a no-op.
    pub fn cancel(&self) -> Result<BatchProgress, EngineError> {
        let progress = {
            let mut state = self.lock();
            if !state.status.is_active() {
                return Err(EngineError::InvalidTransition {
                    batch_id: self.id,
                    action: "cancel",
                    status: state.status,
                });
            }
            if !self.control.is_cancelled() {
                self.control.cancel();
                let abandoned = self.queue.drain();
                debug!(batch = %self.id, abandoned = abandoned.len(), "abandoning queued operations");
                for index in abandoned {
                    state.fail_operation(index, CANCELLED);
                }
            }
            self.publish(&state)
        };
        info!(batch = %self.id, "batch cancel requested");
        Ok(progress)
    }

    /// Resolve once the batch is terminal.
    pub async fn wait(&self) -> BatchProgress {
        let mut status = self.status_tx.subscribe();
        loop {
            if status.borrow_and_update().is_terminal() {
                break;
            }
            if status.changed().await.is_err() {
                break;
            }
        }
        self.snapshot()
    }

    async fn run(self: Arc<Self>, ledger: Arc<UndoLedger>) {
        let batch = Arc::clone(&self);
        let job_ledger = Arc::clone(&ledger);
        self.pool
            .run(
                Arc::clone(&self.queue),
                Arc::clone(&self.control),
                move |index| {
                    let batch = Arc::clone(&batch);
                    let ledger = Arc::clone(&job_ledger);
                    async move { batch.execute(index, &ledger).await }
                },
            )
            .await;

        // A batch paused after its last item stays paused until resume or cancel.
        let progress = loop {
            let _ = self.control.checkpoint().await;
            if let Some(progress) = self.try_finalize() {
                break progress;
            }
        };

        if let Err(e) = ledger.seal(self.id).await {
            warn!(batch = %self.id, error = %e, "failed to persist undo ledger");
        }

        info!(
            batch = %self.id,
            status = %progress.status,
            completed = progress.completed_operations,
            failed = progress.failed_operations,
            elapsed_ms = progress.elapsed_ms,
            "batch finished"
        );
        self.status_tx.send_replace(progress.status);
        self.broadcaster.publish(progress);
    }

    /// Execute one queued operation on the calling worker.
    async fn execute(self: &Arc<Self>, index: usize, ledger: &UndoLedger) {
        let op = {
            let mut state = self.lock();
            let Some(op) = state.operations.get_mut(index) else {
                return;
            };
            // Abandoned by a cancel between dequeue and claim.
            if op.status != OperationStatus::Pending {
                return;
            }
            op.start();
            let op = op.clone();
            state.tracker.set_current_file(Some(op.source.clone()));
            self.publish(&state);
            op
        };

        let sink: Arc<dyn ByteSink> = Arc::clone(self) as Arc<dyn ByteSink>;
        let result = transfer(
            &op.source,
            &op.destination,
            op.kind,
            &self.transfer,
            &self.control,
            &sink,
        )
        .await;

        match result {
            Ok(bytes) => {
                // The ledger entry exists before the item is reported completed.
                ledger.append(UndoRecord::new(
                    self.id,
                    op.id,
                    &op.source,
                    &op.destination,
                    op.kind,
                ));
                debug!(batch = %self.id, item = %op.id, bytes, "operation completed");

                let mut state = self.lock();
                state.operations[index].complete();
                state.tracker.record_completed();
                self.publish(&state);
            }
            Err(e) => {
                if e.is_cancelled() {
                    debug!(batch = %self.id, item = %op.id, "operation cancelled");
                } else {
                    warn!(
                        batch = %self.id,
                        item = %op.id,
                        source = %op.source.display(),
                        destination = %op.destination.display(),
                        error = %e,
                        "operation failed"
                    );
                }

                let mut state = self.lock();
                state.fail_operation(index, &e.to_string());
                self.publish(&state);
            }
        }
    }

    /// Resolve the terminal status, unless the batch is paused without cancellation.
    fn try_finalize(&self) -> Option<BatchProgress> {
        let mut state = self.lock();
        let cancelled = self.control.is_cancelled();
        if state.status == BatchStatus::Paused && !cancelled {
            return None;
        }

        let reason = if cancelled { CANCELLED } else { "abandoned" };
        for index in self.queue.drain() {
            state.fail_operation(index, reason);
        }
        for index in 0..state.operations.len() {
            state.fail_operation(index, reason);
        }

        let next = if cancelled {
            BatchStatus::Cancelled
        } else if state.operations.iter().any(|op| op.status == OperationStatus::Failed) {
            BatchStatus::CompletedWithErrors
        } else {
            BatchStatus::Completed
        };
        if let Err(e) = state.transition(self.id, "finish", next) {
            warn!(batch = %self.id, error = %e, "unexpected terminal transition");
            state.status = next;
        }
        state.tracker.set_current_file(None);
        Some(self.snapshot_of(&state))
    }

    /// Publish under the batch lock so subscribers see snapshots in order.
    fn publish(&self, state: &BatchState) -> BatchProgress {
        let progress = self.snapshot_of(state);
        self.broadcaster.publish(progress.clone());
        progress
    }

    fn snapshot_of(&self, state: &BatchState) -> BatchProgress {
        state.tracker.snapshot(
            state.status,
            state.status == BatchStatus::Paused,
            self.control.is_cancelled(),
        )
    }

    fn lock(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ByteSink for Batch {
    fn record_bytes(&self, bytes: u64) {
        let progress = {
            let mut state = self.lock();
            state.tracker.record_bytes(bytes);
            self.publish(&state)
        };
        trace!(batch = %self.id, bytes, processed = progress.processed_bytes, "chunk written");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_batch(items: u64) -> Arc<Batch> {
        let items: Vec<MappingItem> = (1..=items)
            .map(|i| MappingItem::copy(i, format!("/src/{i}.exr"), format!("/dst/{i}.exr"), 10))
            .collect();
        Batch::new(
            BatchId(1),
            &items,
            2,
            TransferOptions::default(),
            Duration::from_secs(5),
            ProgressBroadcaster::new(8, 3),
        )
    }

    #[test]
    fn test_leftover_items_are_abandoned_without_cancel() {
        let batch = pending_batch(3);
        batch
            .lock()
            .transition(BatchId(1), "start", BatchStatus::Running)
            .unwrap();

        let progress = batch.try_finalize().unwrap();

        assert_eq!(progress.status, BatchStatus::CompletedWithErrors);
        assert_eq!(progress.failed_operations, 3);
        for op in batch.operations() {
            assert_eq!(op.error.as_deref(), Some("abandoned"));
        }
    }

    #[test]
    fn test_cancelled_leftovers_report_cancelled() {
        let batch = pending_batch(2);
        batch
            .lock()
            .transition(BatchId(1), "start", BatchStatus::Running)
            .unwrap();
        batch.cancel().unwrap();

        let progress = batch.try_finalize().unwrap();

        assert_eq!(progress.status, BatchStatus::Cancelled);
        for op in batch.operations() {
            assert_eq!(op.error.as_deref(), Some(CANCELLED));
        }
    }
}
