//! Post-transfer image sequence validation.
//!
//! Validation is read-only and diagnostic: it reports missing frames but
//! never retries or repairs, so running it twice yields the same result.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use framemover_core::{
    BatchOperation, EngineError, MappingItem, OperationStatus, SequenceDescriptor,
    SequenceValidation,
};

/// Accumulates expected and present frames for one sequence group.
#[derive(Debug)]
struct Group<'a> {
    descriptor: &'a SequenceDescriptor,
    present: BTreeSet<u32>,
    pending: usize,
}

impl<'a> Group<'a> {
    fn new(descriptor: &'a SequenceDescriptor) -> Self {
        Self {
            descriptor,
            present: BTreeSet::new(),
            pending: 0,
        }
    }

    fn finish(self, name: &str) -> SequenceValidation {
        SequenceValidation::compute(name, &self.descriptor.frames.frames(), &self.present)
    }
}

/// Validate every sequence group in a finished batch.
///
/// A frame counts as present when its operation completed and the
/// destination file exists. Fails with `SequenceNotReady` if any member of
/// a group has not reached a terminal status.
pub fn validate_operations(
    operations: &[BatchOperation],
) -> Result<Vec<SequenceValidation>, EngineError> {
    let mut groups: BTreeMap<&str, Group<'_>> = BTreeMap::new();

    for op in operations {
        let Some(member) = &op.sequence else {
            continue;
        };
        let group = groups
            .entry(member.group())
            .or_insert_with(|| Group::new(&member.descriptor));

        if !op.status.is_terminal() {
            group.pending += 1;
        } else if op.status == OperationStatus::Completed && landed(&op.destination) {
            group.present.insert(member.frame);
        }
    }

    if let Some((name, group)) = groups.iter().find(|(_, group)| group.pending > 0) {
        return Err(EngineError::SequenceNotReady {
            sequence: name.to_string(),
            pending: group.pending,
        });
    }

    Ok(groups
        .into_iter()
        .map(|(name, group)| group.finish(name))
        .collect())
}

/// Validate a mapping plan against what is on disk at its destinations.
///
/// Used to check sequences outside of a batch, e.g. after a previous run.
pub fn validate_plan(items: &[MappingItem]) -> Vec<SequenceValidation> {
    let mut groups: BTreeMap<&str, Group<'_>> = BTreeMap::new();

    for item in items {
        let Some(member) = &item.sequence else {
            continue;
        };
        let group = groups
            .entry(member.group())
            .or_insert_with(|| Group::new(&member.descriptor));
        if landed(&item.destination) {
            group.present.insert(member.frame);
        }
    }

    groups
        .into_iter()
        .map(|(name, group)| group.finish(name))
        .collect()
}

fn landed(destination: &Path) -> bool {
    destination.is_file()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use framemover_core::{BatchId, FrameSet, SequenceMember, SequenceStatus};
    use tempfile::TempDir;

    use super::*;

    fn frame_op(dir: &Path, frame: u32, status: OperationStatus, write: bool) -> BatchOperation {
        let descriptor = SequenceDescriptor::new("shot", FrameSet::range(1, 10));
        let destination = dir.join(format!("shot.{frame:04}.exr"));
        if write {
            fs::write(&destination, b"frame").unwrap();
        }
        let item = MappingItem::copy(frame as u64, format!("/src/shot.{frame:04}.exr"), destination, 5)
            .with_sequence(SequenceMember::new(descriptor, frame));
        let mut op = BatchOperation::from_item(BatchId(1), &item);
        op.status = status;
        op
    }

    #[test]
    fn test_missing_frames_reported() {
        let temp = TempDir::new().unwrap();
        let mut ops = Vec::new();
        for frame in 1..=10 {
            let landed = [1, 2, 3, 5, 8].contains(&frame);
            let status = if landed {
                OperationStatus::Completed
            } else {
                OperationStatus::Failed
            };
            ops.push(frame_op(temp.path(), frame, status, landed));
        }

        let results = validate_operations(&ops).unwrap();
        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert_eq!(result.sequence, "shot");
        assert_eq!(result.missing_frames, vec![4, 6, 7, 9, 10]);
        assert!((result.integrity - 50.0).abs() < f64::EPSILON);
        assert_eq!(result.status, SequenceStatus::Incomplete);
    }

    #[test]
    fn test_completed_but_removed_frame_is_missing() {
        let temp = TempDir::new().unwrap();
        let ops = vec![frame_op(temp.path(), 1, OperationStatus::Completed, false)];

        let results = validate_operations(&ops).unwrap();
        assert_eq!(results[0].missing_frames.len(), 10);
    }

    #[test]
    fn test_not_ready_while_members_run() {
        let temp = TempDir::new().unwrap();
        let ops = vec![
            frame_op(temp.path(), 1, OperationStatus::Completed, true),
            frame_op(temp.path(), 2, OperationStatus::Running, false),
        ];

        let err = validate_operations(&ops).unwrap_err();
        assert!(matches!(err, EngineError::SequenceNotReady { pending: 1, .. }));
    }

    #[test]
    fn test_non_sequence_operations_ignored() {
        let item = MappingItem::copy(1, "/a", "/b", 1);
        let ops = vec![BatchOperation::from_item(BatchId(1), &item)];
        assert!(validate_operations(&ops).unwrap().is_empty());
    }

    #[test]
    fn test_validate_plan_checks_disk() {
        let temp = TempDir::new().unwrap();
        let descriptor = SequenceDescriptor::new("plate", FrameSet::List(vec![1, 2]));
        let items: Vec<MappingItem> = (1..=2)
            .map(|frame| {
                MappingItem::move_to(frame as u64, "/src", temp.path().join(format!("{frame}.dpx")), 0)
                    .with_sequence(SequenceMember::new(descriptor.clone(), frame))
            })
            .collect();
        fs::write(temp.path().join("1.dpx"), b"x").unwrap();

        let results = validate_plan(&items);
        assert_eq!(results[0].missing_frames, vec![2]);
        assert_eq!(results[0].actual_frames, 1);
    }
}
