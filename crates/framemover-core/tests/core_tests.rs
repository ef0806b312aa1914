use std::collections::BTreeSet;

use framemover_core::{
    BatchId, BatchOperation, BatchOptions, BatchProgress, BatchStatus, EngineConfig, EngineError,
    FrameSet, ItemId, MappingItem, OperationKind, OperationStatus, SequenceDescriptor,
    SequenceMember, SequenceStatus, SequenceValidation, TransferError, UndoOutcome, UndoRecord,
};

#[test]
fn test_batch_lifecycle_transitions() {
    use BatchStatus::*;

    assert!(Pending.can_transition_to(Running));
    assert!(Running.can_transition_to(Paused));
    assert!(Paused.can_transition_to(Running));
    assert!(Paused.can_transition_to(Cancelled));
    assert!(Running.can_transition_to(CompletedWithErrors));

    // Nothing skips running.
    for terminal in [Completed, CompletedWithErrors, Failed, Cancelled] {
        assert!(!Pending.can_transition_to(terminal));
    }
    // Terminal states are absorbing.
    for terminal in [Completed, CompletedWithErrors, Failed, Cancelled] {
        assert!(terminal.is_terminal());
        for next in [Pending, Running, Paused, Completed, Cancelled] {
            assert!(!terminal.can_transition_to(next));
        }
    }
    assert!(!Paused.can_transition_to(Completed));
}

#[test]
fn test_sequence_validation_half_present() {
    let descriptor = SequenceDescriptor::new("shot010", FrameSet::range(1, 10));
    let present: BTreeSet<u32> = [1, 2, 3, 5, 8].into_iter().collect();

    let result = SequenceValidation::compute("shot010", &descriptor.frames.frames(), &present);

    assert_eq!(result.expected_frames, 10);
    assert_eq!(result.actual_frames, 5);
    assert_eq!(result.missing_frames, vec![4, 6, 7, 9, 10]);
    assert!((result.integrity - 50.0).abs() < f64::EPSILON);
    assert_eq!(result.status, SequenceStatus::Incomplete);
    assert!(!result.is_complete());
}

#[test]
fn test_explicit_frame_list() {
    let frames = FrameSet::List(vec![10, 20, 20, 30]);
    assert_eq!(frames.len(), 3);

    let present: BTreeSet<u32> = [10, 20, 30, 40].into_iter().collect();
    let result = SequenceValidation::compute("plate", &frames.frames(), &present);
    assert!(result.is_complete());
    assert_eq!(result.actual_frames, 3);
}

#[test]
fn test_mapping_plan_json() {
    let json = r#"[
        {"id": 1, "source": "/in/a.0001.exr", "destination": "/out/a.0001.exr", "kind": "move",
         "sequence": {"descriptor": {"name": "a", "frames": {"range": {"start": 1, "end": 2}}}, "frame": 1}},
        {"id": 2, "source": "/in/notes.txt", "destination": "/out/notes.txt", "kind": "copy", "size": 12}
    ]"#;

    let items: Vec<MappingItem> = serde_json::from_str(json).unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].kind, OperationKind::Move);
    assert_eq!(items[0].size, 0);
    assert_eq!(items[0].sequence.as_ref().unwrap().group(), "a");
    assert_eq!(items[1].kind, OperationKind::Copy);
    assert_eq!(items[1].size, 12);
    assert!(items[1].sequence.is_none());
}

#[test]
fn test_operation_records_failure_detail() {
    let item = MappingItem::copy(7, "/in/a", "/out/a", 3);
    let mut op = BatchOperation::from_item(BatchId(2), &item);
    assert_eq!(op.id, ItemId(7));
    assert_eq!(op.status, OperationStatus::Pending);

    op.start();
    let error = TransferError::io("/out/a", std::io::Error::from(std::io::ErrorKind::PermissionDenied));
    op.fail(error.to_string());

    assert_eq!(op.status, OperationStatus::Failed);
    assert!(op.error.as_deref().unwrap().starts_with("permission denied"));
    assert!(op.completed_at.is_some());
}

#[test]
fn test_progress_json_is_camel_case() {
    let mut progress = BatchProgress::new(BatchId(3), 3, 300);
    progress.completed_operations = 2;
    progress.failed_operations = 1;
    progress.percentage = BatchProgress::percentage_of(3, 3);
    progress.status = BatchStatus::CompletedWithErrors;

    let value = serde_json::to_value(&progress).unwrap();
    assert_eq!(value["batchId"], 3);
    assert_eq!(value["failedOperations"], 1);
    assert_eq!(value["percentage"], 100.0);
    assert_eq!(value["status"], "completed_with_errors");
    assert!(value["etaSeconds"].is_null());
    assert_eq!(progress.summary(), "Batch 3 completed_with_errors: 2 of 3 items, 1 failed");
}

#[test]
fn test_config_validation() {
    let config = EngineConfig::default();
    assert!(config.validate().is_ok());

    assert!(EngineConfig::builder().chunk_size(0usize).build().is_err());

    let config = EngineConfig {
        file_concurrency: 0,
        ..EngineConfig::default()
    };
    assert!(matches!(config.validate(), Err(EngineError::InvalidConfig { .. })));

    let options = BatchOptions::with_concurrency(2, 0);
    assert!(options.resolve(&EngineConfig::default()).is_err());
    assert_eq!(BatchOptions::default().resolve(&EngineConfig::default()).unwrap(), (4, 4));
}

#[test]
fn test_undo_outcome() {
    let record = UndoRecord::new(BatchId(1), ItemId(1), "/in/a", "/out/a", OperationKind::Move);
    assert_eq!(record.undo_description(), "Move /out/a back to /in/a");

    let ok = UndoOutcome::success(record.clone());
    let failed = UndoOutcome::failure(record, "original path is occupied");
    assert!(ok.is_success());
    assert!(!failed.is_success());
}

#[test]
fn test_sequence_member_group() {
    let member = SequenceMember::new(SequenceDescriptor::new("bg", FrameSet::range(5, 1)), 3);
    assert_eq!(member.group(), "bg");
    assert!(member.descriptor.frames.is_empty());
}
