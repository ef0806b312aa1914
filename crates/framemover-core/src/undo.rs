//! Undo ledger record types.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{BatchId, ItemId, OperationKind};

/// One completed operation, recorded so it can be reversed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoRecord {
    pub batch_id: BatchId,
    pub item_id: ItemId,
    /// Where the file was before the operation.
    pub original: PathBuf,
    /// Where the operation put it.
    pub new: PathBuf,
    /// The operation that was actually performed.
    pub kind: OperationKind,
    pub recorded_at: DateTime<Utc>,
}

impl UndoRecord {
    /// Create a new record stamped with the current time.
    pub fn new(
        batch_id: BatchId,
        item_id: ItemId,
        original: impl Into<PathBuf>,
        new: impl Into<PathBuf>,
        kind: OperationKind,
    ) -> Self {
        Self {
            batch_id,
            item_id,
            original: original.into(),
            new: new.into(),
            kind,
            recorded_at: Utc::now(),
        }
    }

    /// Get a description of how to undo this record.
    pub fn undo_description(&self) -> String {
        match self.kind {
            OperationKind::Move => format!(
                "Move {} back to {}",
                self.new.display(),
                self.original.display()
            ),
            OperationKind::Copy => format!("Delete copy {}", self.new.display()),
        }
    }
}

/// Result of reversing one undo record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoOutcome {
    pub record: UndoRecord,
    /// None on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UndoOutcome {
    /// A successful reversal.
    pub fn success(record: UndoRecord) -> Self {
        Self {
            record,
            error: None,
        }
    }

    /// A failed reversal.
    pub fn failure(record: UndoRecord, error: impl Into<String>) -> Self {
        Self {
            record,
            error: Some(error.into()),
        }
    }

    /// Whether the reversal succeeded.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
