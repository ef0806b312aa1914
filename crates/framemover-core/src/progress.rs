//! Batch status and aggregate progress types.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::model::BatchId;

/// Lifecycle status of a batch.
///
/// `Pending -> Running -> {Paused <-> Running} -> terminal`, where the
/// terminal states `Cancelled`, `Completed`, `CompletedWithErrors` and
/// `Failed` are absorbing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Paused,
    Cancelled,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl BatchStatus {
    /// Whether the batch has finished.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Completed | Self::CompletedWithErrors | Self::Failed
        )
    }

    /// Whether pause/resume/cancel may still act on the batch.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// Check whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Running | Paused, Cancelled) => true,
            (Running, Completed | CompletedWithErrors | Failed) => true,
            _ => false,
        }
    }
}

/// Point-in-time snapshot of a batch's aggregate progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub batch_id: BatchId,
    pub total_operations: usize,
    pub completed_operations: usize,
    pub failed_operations: usize,
    pub total_bytes: u64,
    pub processed_bytes: u64,
    /// Finished (completed + failed) over total, times 100, saturating at 100.
    pub percentage: f64,
    /// None until a full throughput window has been observed.
    pub eta_seconds: Option<u64>,
    pub status: BatchStatus,
    pub paused: bool,
    pub cancelled: bool,
    /// Most recently started file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_file: Option<PathBuf>,
    pub elapsed_ms: u64,
    pub bytes_per_second: f64,
}

impl BatchProgress {
    /// Create an empty snapshot for a batch that has not started.
    pub fn new(batch_id: BatchId, total_operations: usize, total_bytes: u64) -> Self {
        Self {
            batch_id,
            total_operations,
            completed_operations: 0,
            failed_operations: 0,
            total_bytes,
            processed_bytes: 0,
            percentage: 0.0,
            eta_seconds: None,
            status: BatchStatus::Pending,
            paused: false,
            cancelled: false,
            current_file: None,
            elapsed_ms: 0,
            bytes_per_second: 0.0,
        }
    }

    /// Percentage of operations finished, counted by item rather than bytes.
    pub fn percentage_of(completed: usize, total: usize) -> f64 {
        if total == 0 {
            return 0.0;
        }
        (completed as f64 / total as f64 * 100.0).min(100.0)
    }

    /// Operations that reached a terminal status.
    pub fn finished_operations(&self) -> usize {
        self.completed_operations + self.failed_operations
    }

    /// Whether the batch is over.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Get a human-readable summary of the batch.
    pub fn summary(&self) -> String {
        if self.failed_operations == 0 {
            format!(
                "Batch {} {}: {} of {} items",
                self.batch_id, self.status, self.completed_operations, self.total_operations
            )
        } else {
            format!(
                "Batch {} {}: {} of {} items, {} failed",
                self.batch_id,
                self.status,
                self.completed_operations,
                self.total_operations,
                self.failed_operations
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_absorb() {
        for terminal in [
            BatchStatus::Cancelled,
            BatchStatus::Completed,
            BatchStatus::CompletedWithErrors,
            BatchStatus::Failed,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(BatchStatus::Running));
            assert!(!terminal.can_transition_to(BatchStatus::Paused));
        }
    }

    #[test]
    fn test_pending_must_run_first() {
        assert!(BatchStatus::Pending.can_transition_to(BatchStatus::Running));
        assert!(!BatchStatus::Pending.can_transition_to(BatchStatus::Completed));
        assert!(!BatchStatus::Pending.can_transition_to(BatchStatus::Failed));
        assert!(!BatchStatus::Pending.can_transition_to(BatchStatus::Paused));
    }

    #[test]
    fn test_pause_cycle() {
        assert!(BatchStatus::Running.can_transition_to(BatchStatus::Paused));
        assert!(BatchStatus::Paused.can_transition_to(BatchStatus::Running));
        assert!(!BatchStatus::Paused.can_transition_to(BatchStatus::Completed));
    }

    #[test]
    fn test_percentage_saturates() {
        assert_eq!(BatchProgress::percentage_of(0, 0), 0.0);
        assert_eq!(BatchProgress::percentage_of(1, 4), 25.0);
        assert_eq!(BatchProgress::percentage_of(9, 4), 100.0);
    }

    #[test]
    fn test_summary() {
        let mut progress = BatchProgress::new(BatchId(3), 3, 0);
        progress.status = BatchStatus::CompletedWithErrors;
        progress.completed_operations = 2;
        progress.failed_operations = 1;
        assert_eq!(
            progress.summary(),
            "Batch 3 completed_with_errors: 2 of 3 items, 1 failed"
        );
    }
}
