//! Mapping items and per-item batch operations.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::sequence::SequenceMember;

/// Unique identifier for a batch within an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub u64);

impl BatchId {
    /// Create a new BatchId from a u64.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a mapping item, assigned by the mapping generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub u64);

impl ItemId {
    /// Create a new ItemId from a u64.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The file operation requested for a mapping item.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OperationKind {
    Move,
    Copy,
}

/// One source to destination mapping, as produced by the mapping generator.
///
/// The engine never mutates a mapping item; it derives a [`BatchOperation`]
/// from it at enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingItem {
    /// Unique id within the submitted list.
    pub id: ItemId,
    /// Path of the existing file.
    pub source: PathBuf,
    /// Computed destination path (full file path, not a directory).
    pub destination: PathBuf,
    /// Move or copy.
    pub kind: OperationKind,
    /// Size in bytes. Zero means unknown; the engine stats the source.
    #[serde(default)]
    pub size: u64,
    /// Sequence membership, if this file is one frame of a sequence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<SequenceMember>,
}

impl MappingItem {
    /// Create a copy mapping.
    pub fn copy(
        id: u64,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        size: u64,
    ) -> Self {
        Self {
            id: ItemId(id),
            source: source.into(),
            destination: destination.into(),
            kind: OperationKind::Copy,
            size,
            sequence: None,
        }
    }

    /// Create a move mapping.
    pub fn move_to(
        id: u64,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        size: u64,
    ) -> Self {
        Self {
            id: ItemId(id),
            source: source.into(),
            destination: destination.into(),
            kind: OperationKind::Move,
            size,
            sequence: None,
        }
    }

    /// Attach sequence membership.
    pub fn with_sequence(mut self, member: SequenceMember) -> Self {
        self.sequence = Some(member);
        self
    }
}

/// Execution status of a single batch operation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl OperationStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One unit of work inside a batch, created from a [`MappingItem`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOperation {
    pub id: ItemId,
    pub batch_id: BatchId,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub kind: OperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<SequenceMember>,
    pub size: u64,
    pub status: OperationStatus,
    /// Failure reason, set only when `status` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the operation reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchOperation {
    /// Create a pending operation for a mapping item.
    pub fn from_item(batch_id: BatchId, item: &MappingItem) -> Self {
        Self {
            id: item.id,
            batch_id,
            source: item.source.clone(),
            destination: item.destination.clone(),
            kind: item.kind,
            sequence: item.sequence.clone(),
            size: item.size,
            status: OperationStatus::Pending,
            error: None,
            completed_at: None,
        }
    }

    /// Whether this operation is one frame of a sequence.
    pub fn is_sequence(&self) -> bool {
        self.sequence.is_some()
    }

    /// Mark the operation as claimed by a worker.
    pub fn start(&mut self) {
        self.status = OperationStatus::Running;
    }

    /// Mark the operation as successfully finished.
    pub fn complete(&mut self) {
        self.status = OperationStatus::Completed;
        self.error = None;
        self.completed_at = Some(Utc::now());
    }

    /// Mark the operation as failed with a reason.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = OperationStatus::Failed;
        self.error = Some(reason.into());
        self.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_lifecycle() {
        let item = MappingItem::copy(7, "/src/a.exr", "/dst/a.exr", 1024);
        let mut op = BatchOperation::from_item(BatchId(1), &item);
        assert_eq!(op.status, OperationStatus::Pending);
        assert!(!op.is_sequence());

        op.start();
        assert_eq!(op.status, OperationStatus::Running);
        assert!(!op.status.is_terminal());

        op.fail("permission denied");
        assert!(op.status.is_terminal());
        assert_eq!(op.error.as_deref(), Some("permission denied"));
        assert!(op.completed_at.is_some());
    }

    #[test]
    fn test_operation_kind_strings() {
        assert_eq!(OperationKind::Move.to_string(), "move");
        assert_eq!("copy".parse::<OperationKind>().unwrap(), OperationKind::Copy);
    }
}
