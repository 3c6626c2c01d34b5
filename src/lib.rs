#![deny(missing_docs)]
//! Out-of-order commit merge engine for a columnar time-series store.
//!
//! Staged rows, sorted by their designated timestamp, are merged into the
//! committed partitions of a table. Each partition is split into a prefix, a
//! merge zone and a suffix from its timestamp column alone; every column is
//! then merged independently on a worker pool and the partition finalizes
//! when the last column reports. A commit becomes visible by atomically
//! replacing the table's `_txn` file; until then every change can be rolled
//! back byte for byte.

mod alert;
/// Column types, layouts and the secondary index key log.
pub mod column;
mod engine;
/// Worker pool seam.
pub mod executor;
/// Storage abstraction over mapped column files.
pub mod fs;
/// Zone planning, merge index and per-column copy loops.
pub mod merge;
mod metrics;
mod observability;
mod option;
mod partition;
mod schema;
mod staging;
mod version;

#[cfg(test)]
mod test_util;

pub use crate::{
    alert::{AlertSink, LogAlertSink, MergeAlert},
    column::{ColumnKind, ColumnLayout, ColumnType},
    engine::{CommitError, CommitReceipt, Engine, PublishedPartition},
    metrics::{MergeMetrics, MergeMetricsSnapshot},
    option::{CommitMode, EngineOption},
    partition::open::{OpenColumnMode, PartitionMode},
    schema::{PartitionBy, SchemaError, TableSchema},
    staging::{CommitBatch, StagedColumn, StagedPartition, StagedRows, Value},
    version::{
        cleaner::CleanerError, codec::MetaError, PartitionMeta, TableSnapshot, TableState,
    },
};
