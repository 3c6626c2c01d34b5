use crate::{column::ColumnLayout, version::PartitionMeta};

/// One change applied to the table state by a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum VersionEdit {
    AddColumn(ColumnLayout),
    PutPartition(PartitionMeta),
    LatestTxn { txn: u64 },
}
