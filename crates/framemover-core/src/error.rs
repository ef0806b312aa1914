//! Error types for batch file operations.

use std::path::PathBuf;

use thiserror::Error;

use crate::model::BatchId;
use crate::progress::BatchStatus;

/// Errors returned synchronously by the engine's control surface.
///
/// Per-item transfer failures never appear here; they are recorded on the
/// batch operation and counted in the batch progress.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A batch was submitted without any items.
    #[error("Batch has no items")]
    EmptyBatch,

    /// The destination root cannot be reached or created.
    #[error("Destination root unreachable for batch {batch_id}: {path}: {reason}")]
    DestinationUnreachable {
        batch_id: BatchId,
        path: PathBuf,
        reason: String,
    },

    /// No batch with this id is known.
    #[error("Batch not found: {0}")]
    BatchNotFound(BatchId),

    /// A control request is not valid in the batch's current state.
    #[error("Cannot {action} batch {batch_id} while it is {status}")]
    InvalidTransition {
        batch_id: BatchId,
        action: &'static str,
        status: BatchStatus,
    },

    /// The batch has not reached a terminal status yet.
    #[error("Batch {batch_id} is not finished (status: {status})")]
    NotTerminal {
        batch_id: BatchId,
        status: BatchStatus,
    },

    /// A sequence still has members that have not finished.
    #[error("Sequence '{sequence}' is not ready: {pending} member(s) still pending")]
    SequenceNotReady { sequence: String, pending: usize },

    /// The ledger holds nothing to undo.
    #[error("No batch available to undo")]
    NoUndoableBatch,

    /// Undo was requested for a batch other than the most recent one.
    #[error("Batch {requested} cannot be undone; only the latest batch ({latest}) can")]
    NotLatestBatch { requested: BatchId, latest: BatchId },

    /// Invalid configuration or batch options.
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Reading or writing the persisted undo ledger failed.
    #[error("Undo ledger I/O error at {path}: {source}")]
    Ledger {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The persisted undo ledger could not be (de)serialized.
    #[error("Undo ledger format error: {message}")]
    Serialization { message: String },
}

impl EngineError {
    /// Create an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}

/// Failure of a single transfer unit.
///
/// The `Display` text is what gets stored on the failed batch operation.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The batch was cancelled before or during the transfer.
    #[error("cancelled")]
    Cancelled,

    /// Permission denied for a path.
    #[error("permission denied: {path}")]
    PermissionDenied { path: PathBuf },

    /// Path not found.
    #[error("not found: {path}")]
    NotFound { path: PathBuf },

    /// The destination already exists and is never overwritten.
    #[error("destination already exists: {path}")]
    AlreadyExists { path: PathBuf },

    /// The source is a directory or special file.
    #[error("not a regular file: {path}")]
    NotAFile { path: PathBuf },

    /// Written size does not match the source.
    #[error("size mismatch at {path}: expected {expected} bytes, found {actual}")]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    /// Generic I/O error.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TransferError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists { path },
            _ => Self::Io { path, source },
        }
    }

    /// Whether the failure was caused by cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
