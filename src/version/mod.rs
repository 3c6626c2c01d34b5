//! Published table state.
//!
//! A [`TableState`] is an immutable version of the table: schema, committed
//! partitions and the transaction id of the `_txn` file it was read from or
//! written to. Readers hold it as a [`TableSnapshot`]. When the last handle to
//! a version goes away the cleaner is told, so that partition generations no
//! live version references can be deleted.

pub(crate) mod cleaner;
pub(crate) mod codec;
pub(crate) mod edit;

use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use flume::Sender;

use crate::{
    observability::log_error,
    schema::{SchemaError, TableSchema},
    version::{
        cleaner::CleanTag,
        codec::{MetaError, TxnRecord},
        edit::VersionEdit,
    },
};

/// Name of the transaction file inside the table directory.
pub(crate) const TXN_FILE: &str = "_txn";

/// Shared handle to a published table version.
pub type TableSnapshot = Arc<TableState>;

/// Committed state of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMeta {
    name: String,
    generation: u64,
    row_count: u64,
    min_timestamp: Option<i64>,
    max_timestamp: Option<i64>,
}

impl PartitionMeta {
    pub(crate) fn new(
        name: impl Into<String>,
        generation: u64,
        row_count: u64,
        min_timestamp: Option<i64>,
        max_timestamp: Option<i64>,
    ) -> Self {
        Self {
            name: name.into(),
            generation,
            row_count,
            min_timestamp,
            max_timestamp,
        }
    }

    /// Partition name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Transaction that created the partition directory.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Committed rows.
    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    /// Smallest committed timestamp.
    pub fn min_timestamp(&self) -> Option<i64> {
        self.min_timestamp
    }

    /// Largest committed timestamp.
    pub fn max_timestamp(&self) -> Option<i64> {
        self.max_timestamp
    }

    /// Directory name of this generation, relative to the table directory.
    pub fn dir_name(&self) -> String {
        Self::dir_name_of(&self.name, self.generation)
    }

    pub(crate) fn dir_name_of(name: &str, generation: u64) -> String {
        format!("{name}.{generation}")
    }
}

/// One published version of a table.
#[derive(Debug)]
pub struct TableState {
    txn: u64,
    schema: Arc<TableSchema>,
    partitions: BTreeMap<String, PartitionMeta>,
    clean_sender: Option<Sender<CleanTag>>,
}

impl TableState {
    pub(crate) fn new(schema: TableSchema, clean_sender: Option<Sender<CleanTag>>) -> Self {
        Self::registered(0, Arc::new(schema), BTreeMap::new(), clean_sender)
    }

    fn registered(
        txn: u64,
        schema: Arc<TableSchema>,
        partitions: BTreeMap<String, PartitionMeta>,
        clean_sender: Option<Sender<CleanTag>>,
    ) -> Self {
        if let Some(sender) = &clean_sender {
            if let Err(err) = sender.send(CleanTag::Add { txn, dirs: Vec::new() }) {
                log_error!(
                    component = "version",
                    event = "register_failed",
                    txn = txn,
                    error = %err,
                );
            }
        }
        Self {
            txn,
            schema,
            partitions,
            clean_sender,
        }
    }

    /// Transaction id of this version.
    pub fn txn(&self) -> u64 {
        self.txn
    }

    /// Table schema.
    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub(crate) fn schema_ref(&self) -> Arc<TableSchema> {
        self.schema.clone()
    }

    /// Committed partitions ordered by name.
    pub fn partitions(&self) -> impl Iterator<Item = &PartitionMeta> {
        self.partitions.values()
    }

    /// Partition named `name`, if committed.
    pub fn partition(&self, name: &str) -> Option<&PartitionMeta> {
        self.partitions.get(name)
    }

    /// Total committed rows.
    pub fn row_count(&self) -> u64 {
        self.partitions.values().map(PartitionMeta::row_count).sum()
    }

    /// Next version with `edits` applied.
    pub(crate) fn apply(&self, edits: Vec<VersionEdit>) -> Result<Self, SchemaError> {
        let mut txn = self.txn;
        let mut schema = self.schema.clone();
        let mut partitions = self.partitions.clone();
        for edit in edits {
            match edit {
                VersionEdit::AddColumn(column) => {
                    schema = Arc::new(schema.with_column(column)?);
                }
                VersionEdit::PutPartition(meta) => {
                    partitions.insert(meta.name().to_string(), meta);
                }
                VersionEdit::LatestTxn { txn: latest } => txn = latest,
            }
        }
        Ok(Self::registered(txn, schema, partitions, self.clean_sender.clone()))
    }

    /// Tell the cleaner that `dirs` stop being referenced once this version
    /// and every older one are released.
    pub(crate) fn retire(&self, dirs: Vec<PathBuf>) {
        if dirs.is_empty() {
            return;
        }
        if let Some(sender) = &self.clean_sender {
            if let Err(err) = sender.send(CleanTag::Add { txn: self.txn, dirs }) {
                log_error!(
                    component = "version",
                    event = "retire_failed",
                    txn = self.txn,
                    error = %err,
                );
            }
        }
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        codec::encode(self.txn, &self.schema, self.partitions.values())
    }

    pub(crate) fn decode(
        bytes: &[u8],
        clean_sender: Option<Sender<CleanTag>>,
    ) -> Result<Self, MetaError> {
        let TxnRecord {
            txn,
            schema,
            partitions,
        } = codec::decode(bytes)?;
        let partitions = partitions
            .into_iter()
            .map(|meta| (meta.name().to_string(), meta))
            .collect();
        Ok(Self::registered(txn, Arc::new(schema), partitions, clean_sender))
    }
}

impl Drop for TableState {
    fn drop(&mut self) {
        if let Some(sender) = &self.clean_sender {
            if let Err(err) = sender.send(CleanTag::Clean { txn: self.txn }) {
                log_error!(
                    component = "version",
                    event = "release_failed",
                    txn = self.txn,
                    error = %err,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        column::{ColumnLayout, ColumnType},
        schema::PartitionBy,
    };

    fn schema() -> TableSchema {
        TableSchema::new(
            vec![ColumnLayout::new("ts", ColumnType::Timestamp)],
            "ts",
            PartitionBy::Day,
        )
        .expect("schema")
    }

    #[test]
    fn apply_edits_and_round_trip() {
        let state = TableState::new(schema(), None);
        let next = state
            .apply(vec![
                VersionEdit::AddColumn(ColumnLayout::new("price", ColumnType::Double)),
                VersionEdit::PutPartition(PartitionMeta::new("1970-01-01", 1, 3, Some(1), Some(9))),
                VersionEdit::LatestTxn { txn: 1 },
            ])
            .expect("apply");
        assert_eq!(state.txn(), 0);
        assert_eq!(next.txn(), 1);
        assert_eq!(next.schema().columns().len(), 2);
        assert_eq!(next.row_count(), 3);
        assert_eq!(
            next.partition("1970-01-01").map(PartitionMeta::dir_name),
            Some("1970-01-01.1".to_string())
        );

        let decoded = TableState::decode(&next.encode(), None).expect("decode");
        assert_eq!(decoded.txn(), 1);
        assert_eq!(decoded.schema(), next.schema());
        assert_eq!(
            decoded.partitions().collect::<Vec<_>>(),
            next.partitions().collect::<Vec<_>>()
        );
    }

    #[test]
    fn versions_register_and_release_with_cleaner() {
        let (sender, receiver) = flume::unbounded();
        let state = TableState::new(schema(), Some(sender));
        state.retire(vec![PathBuf::from("t/p.0")]);
        drop(state);
        let tags: Vec<_> = receiver.drain().collect();
        assert!(matches!(tags[0], CleanTag::Add { txn: 0, ref dirs } if dirs.is_empty()));
        assert!(matches!(tags[1], CleanTag::Add { txn: 0, ref dirs } if dirs.len() == 1));
        assert!(matches!(tags[2], CleanTag::Clean { txn: 0 }));
    }
}
