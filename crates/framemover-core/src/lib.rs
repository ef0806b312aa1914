//! Core types and configuration for framemover.
//!
//! This crate provides the data model shared by the batch engine and its
//! callers: mapping items, per-item batch operations, aggregate progress,
//! sequence validation results, undo records, and the error taxonomy.

mod config;
mod error;
mod model;
mod progress;
mod sequence;
mod undo;

pub use config::{BatchOptions, EngineConfig, EngineConfigBuilder, MAX_CHUNK_STREAMS};
pub use error::{EngineError, TransferError};
pub use model::{BatchId, BatchOperation, ItemId, MappingItem, OperationKind, OperationStatus};
pub use progress::{BatchProgress, BatchStatus};
pub use sequence::{FrameSet, SequenceDescriptor, SequenceMember, SequenceStatus, SequenceValidation};
pub use undo::{UndoOutcome, UndoRecord};
