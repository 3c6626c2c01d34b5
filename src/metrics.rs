//! Merge metrics surface.
//!
//! Counters are updated from worker threads with relaxed atomics and read
//! through [`MergeMetrics::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

use crate::{merge::FailureClass, partition::open::PartitionMode};

/// Point-in-time copy of the merge counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct MergeMetricsSnapshot {
    /// Commits published.
    pub commits: u64,
    /// Commits rejected or rolled back.
    pub failed_commits: u64,
    /// Partitions finalized, whether or not their commit was published.
    pub partitions_finalized: u64,
    /// Partition merges rolled back.
    pub partitions_rolled_back: u64,
    /// Finalized partitions that took the append fast path.
    pub append_partitions: u64,
    /// Finalized partitions rewritten into a new generation.
    pub split_partitions: u64,
    /// Finalized partitions created from scratch.
    pub new_partitions: u64,
    /// Rows written to finalized partitions.
    pub rows_written: u64,
    /// Bytes written to finalized partitions, across all columns.
    pub bytes_written: u64,
    /// Failures classified as precondition violations.
    pub precondition_failures: u64,
    /// Failures classified as resource exhaustion.
    pub resource_failures: u64,
    /// Failures classified as I/O failures.
    pub io_failures: u64,
    /// Failures classified as structural mismatches.
    pub structural_failures: u64,
    /// Cancelled commits.
    pub cancellations: u64,
}

/// Shared merge counters.
#[derive(Debug, Default)]
pub struct MergeMetrics {
    commits: AtomicU64,
    failed_commits: AtomicU64,
    partitions_finalized: AtomicU64,
    partitions_rolled_back: AtomicU64,
    append_partitions: AtomicU64,
    split_partitions: AtomicU64,
    new_partitions: AtomicU64,
    rows_written: AtomicU64,
    bytes_written: AtomicU64,
    precondition_failures: AtomicU64,
    resource_failures: AtomicU64,
    io_failures: AtomicU64,
    structural_failures: AtomicU64,
    cancellations: AtomicU64,
}

impl MergeMetrics {
    /// Snapshot all counters.
    pub fn snapshot(&self) -> MergeMetricsSnapshot {
        MergeMetricsSnapshot {
            commits: self.commits.load(Ordering::Relaxed),
            failed_commits: self.failed_commits.load(Ordering::Relaxed),
            partitions_finalized: self.partitions_finalized.load(Ordering::Relaxed),
            partitions_rolled_back: self.partitions_rolled_back.load(Ordering::Relaxed),
            append_partitions: self.append_partitions.load(Ordering::Relaxed),
            split_partitions: self.split_partitions.load(Ordering::Relaxed),
            new_partitions: self.new_partitions.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            precondition_failures: self.precondition_failures.load(Ordering::Relaxed),
            resource_failures: self.resource_failures.load(Ordering::Relaxed),
            io_failures: self.io_failures.load(Ordering::Relaxed),
            structural_failures: self.structural_failures.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_partition(&self, mode: PartitionMode, rows: u64, bytes: u64) {
        self.partitions_finalized.fetch_add(1, Ordering::Relaxed);
        let counter = match mode {
            PartitionMode::New => &self.new_partitions,
            PartitionMode::Append => &self.append_partitions,
            PartitionMode::Split => &self.split_partitions,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.rows_written.fetch_add(rows, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.partitions_rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed_commit(&self, class: FailureClass) {
        self.failed_commits.fetch_add(1, Ordering::Relaxed);
        let counter = match class {
            FailureClass::PreconditionViolation => &self.precondition_failures,
            FailureClass::ResourceExhaustion => &self.resource_failures,
            FailureClass::IoFailure => &self.io_failures,
            FailureClass::StructuralMismatch => &self.structural_failures,
            FailureClass::Cancelled => &self.cancellations,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
