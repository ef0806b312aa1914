//! Image sequence descriptors and validation results.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use strum::Display;

/// The frames a sequence is expected to contain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameSet {
    /// Contiguous inclusive range.
    Range { start: u32, end: u32 },
    /// Explicit frame list (may contain gaps).
    List(Vec<u32>),
}

impl FrameSet {
    /// Create a contiguous inclusive frame range.
    pub fn range(start: u32, end: u32) -> Self {
        Self::Range { start, end }
    }

    /// Expand to the set of frame numbers.
    pub fn frames(&self) -> BTreeSet<u32> {
        match self {
            Self::Range { start, end } if start <= end => (*start..=*end).collect(),
            Self::Range { .. } => BTreeSet::new(),
            Self::List(frames) => frames.iter().copied().collect(),
        }
    }

    /// Number of distinct frames.
    pub fn len(&self) -> usize {
        match self {
            Self::Range { start, end } if start <= end => (end - start) as usize + 1,
            Self::Range { .. } => 0,
            Self::List(_) => self.frames().len(),
        }
    }

    /// Whether the set holds no frames.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Source-side description of a sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceDescriptor {
    /// Group id, typically the base name shared by all frames.
    pub name: String,
    /// Expected frames.
    pub frames: FrameSet,
}

impl SequenceDescriptor {
    /// Create a new descriptor.
    pub fn new(name: impl Into<String>, frames: FrameSet) -> Self {
        Self {
            name: name.into(),
            frames,
        }
    }
}

/// Membership of one file in a sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceMember {
    pub descriptor: SequenceDescriptor,
    /// Frame index of this file.
    pub frame: u32,
}

impl SequenceMember {
    /// Create a new member.
    pub fn new(descriptor: SequenceDescriptor, frame: u32) -> Self {
        Self { descriptor, frame }
    }

    /// Group id of the sequence.
    pub fn group(&self) -> &str {
        &self.descriptor.name
    }
}

/// Outcome of a sequence validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SequenceStatus {
    Complete,
    Incomplete,
}

/// Result of checking that every expected frame reached its destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceValidation {
    pub sequence: String,
    pub expected_frames: usize,
    pub actual_frames: usize,
    pub missing_frames: Vec<u32>,
    /// actual / expected * 100.
    pub integrity: f64,
    pub status: SequenceStatus,
}

impl SequenceValidation {
    /// Compare an expected frame set with the frames found at the destination.
    ///
    /// Frames present but not expected are ignored.
    pub fn compute(
        sequence: impl Into<String>,
        expected: &BTreeSet<u32>,
        present: &BTreeSet<u32>,
    ) -> Self {
        let missing_frames: Vec<u32> = expected.difference(present).copied().collect();
        let actual_frames = expected.len() - missing_frames.len();
        let integrity = if expected.is_empty() {
            100.0
        } else {
            actual_frames as f64 / expected.len() as f64 * 100.0
        };
        let status = if missing_frames.is_empty() {
            SequenceStatus::Complete
        } else {
            SequenceStatus::Incomplete
        };

        Self {
            sequence: sequence.into(),
            expected_frames: expected.len(),
            actual_frames,
            missing_frames,
            integrity,
            status,
        }
    }

    /// Whether every expected frame is present.
    pub fn is_complete(&self) -> bool {
        self.status == SequenceStatus::Complete
    }
}
