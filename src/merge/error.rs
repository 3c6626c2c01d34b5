use thiserror::Error;

use super::index::MergeSource;
use crate::fs::FsError;

/// Errors raised while planning or executing a partition merge.
#[derive(Debug, Error)]
pub enum MergeError {
    /// A timestamp sequence handed to the merge is not non-decreasing.
    #[error("{side:?} timestamps out of order at row {row}: {prev} > {next}")]
    MalformedTimestampOrder {
        /// Which input was malformed.
        side: MergeSource,
        /// Row whose timestamp is smaller than its predecessor.
        row: u64,
        /// Timestamp at `row - 1`.
        prev: i64,
        /// Timestamp at `row`.
        next: i64,
    },
    /// Row ranges overlap, are inverted or exceed their buffers.
    #[error("invalid merge range: {0}")]
    InvalidRange(String),
    /// A destination region cannot hold the merged output.
    #[error("destination {target} exhausted: need {needed} bytes, have {available}")]
    ResourceExhaustion {
        /// Destination file or logical target name.
        target: String,
        /// Bytes required.
        needed: usize,
        /// Bytes mapped.
        available: usize,
    },
    /// Storage layer failure.
    #[error(transparent)]
    Io(#[from] FsError),
    /// Column count, type or layout disagreement.
    #[error("structural mismatch: {0}")]
    StructuralMismatch(String),
    /// The commit was cancelled before it could be published.
    #[error("commit cancelled")]
    Cancelled,
}

/// Coarse failure class used for alerting and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Inputs violate the merge preconditions.
    PreconditionViolation,
    /// Destination space could not be provided.
    ResourceExhaustion,
    /// Storage failure.
    IoFailure,
    /// Programmer error: mismatched structure.
    StructuralMismatch,
    /// Cooperative cancellation.
    Cancelled,
}

impl MergeError {
    /// Failure class of this error.
    pub fn class(&self) -> FailureClass {
        match self {
            MergeError::MalformedTimestampOrder { .. } | MergeError::InvalidRange(_) => {
                FailureClass::PreconditionViolation
            }
            MergeError::ResourceExhaustion { .. } => FailureClass::ResourceExhaustion,
            MergeError::Io(_) => FailureClass::IoFailure,
            MergeError::StructuralMismatch(_) => FailureClass::StructuralMismatch,
            MergeError::Cancelled => FailureClass::Cancelled,
        }
    }

    /// Whether the failure should be reported to the alert sink.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, MergeError::Cancelled)
    }
}
