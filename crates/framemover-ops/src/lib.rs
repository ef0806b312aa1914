//! Batch file operation engine for framemover.
//!
//! This crate executes previously computed source to destination mappings as
//! move/copy operations with bounded concurrency, cooperative pause and
//! cancel, live progress fan-out, image-sequence validation and an undo
//! ledger for the most recent batch.
//!
//! # Example
//!
//! ```rust,no_run
//! use framemover_core::{BatchOptions, MappingItem};
//! use framemover_ops::TransferEngine;
//!
//! # async fn demo() -> Result<(), framemover_core::EngineError> {
//! let engine = TransferEngine::new();
//! let items = vec![MappingItem::move_to(1, "/in/a.exr", "/out/a.exr", 0)];
//! let batch = engine.submit(items, BatchOptions::with_concurrency(4, 2)).await?;
//!
//! let mut updates = engine.subscribe(batch)?;
//! while let Some(frame) = updates.recv().await {
//!     println!("{frame:?}");
//! }
//!
//! let results = engine.undo_last_batch().await?;
//! println!("reverted {} files", results.iter().filter(|r| r.is_success()).count());
//! # Ok(())
//! # }
//! ```

mod batch;
mod broadcast;
mod control;
mod engine;
mod pool;
mod progress;
mod transfer;
mod undo;
mod validate;

pub use broadcast::{ProgressBroadcaster, ProgressFrame, Subscription};
pub use control::BatchControl;
pub use engine::TransferEngine;
pub use pool::{WorkQueue, WorkerPool};
pub use progress::ThroughputWindow;
pub use transfer::{ByteSink, TransferOptions, transfer};
pub use undo::{UndoLedger, reverse_records};
pub use validate::{validate_operations, validate_plan};

// Re-export core types for convenience
pub use framemover_core::{
    BatchId, BatchOperation, BatchOptions, BatchProgress, BatchStatus, EngineConfig, EngineError,
    FrameSet, ItemId, MappingItem, OperationKind, OperationStatus, SequenceDescriptor,
    SequenceMember, SequenceStatus, SequenceValidation, TransferError, UndoOutcome, UndoRecord,
};
