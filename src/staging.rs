//! Staged input of a commit.
//!
//! A [`CommitBatch`] carries one [`StagedPartition`] per target partition.
//! Staged columns are raw column bytes in the on-disk encoding, sorted by the
//! designated timestamp. [`StagedRows`] builds such a batch from typed rows.

use std::collections::HashSet;

use crate::{
    column::{ColumnKind, ColumnType, VAR_NULL_LEN},
    fs::ReadRegion,
    merge::{MergeError, RowRange},
    schema::TableSchema,
};

/// Staged bytes of one column.
#[derive(Debug, Clone)]
pub enum StagedColumn {
    /// Element array of a fixed-width column.
    Fixed(ReadRegion),
    /// Offset and payload files of a variable-length column.
    Variable {
        /// One little-endian `u64` per row.
        offsets: ReadRegion,
        /// Length-prefixed elements.
        data: ReadRegion,
    },
}

impl StagedColumn {
    fn shape_matches(&self, kind: ColumnKind) -> bool {
        matches!(
            (self, kind),
            (StagedColumn::Fixed(_), ColumnKind::Fixed(_))
                | (StagedColumn::Variable { .. }, ColumnKind::Variable)
        )
    }
}

/// Staged rows destined for one partition.
#[derive(Debug, Clone)]
pub struct StagedPartition {
    name: String,
    columns: Vec<StagedColumn>,
    rows: RowRange,
}

impl StagedPartition {
    /// Rows `[0, row_count)` of `columns`, one entry per table column in
    /// schema order.
    pub fn new(name: impl Into<String>, row_count: u64, columns: Vec<StagedColumn>) -> Self {
        Self {
            name: name.into(),
            columns,
            rows: RowRange::new(0, row_count),
        }
    }

    /// Restrict the merge to `rows` of the staged buffers.
    pub fn with_rows(self, rows: RowRange) -> Self {
        Self { rows, ..self }
    }

    /// Partition name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Staged columns in schema order.
    pub fn columns(&self) -> &[StagedColumn] {
        &self.columns
    }

    /// Staged rows taking part in the merge.
    pub fn rows(&self) -> RowRange {
        self.rows
    }

    pub(crate) fn validate(&self, schema: &TableSchema) -> Result<(), MergeError> {
        if self.columns.len() != schema.columns().len() {
            return Err(MergeError::StructuralMismatch(format!(
                "partition {} staged {} columns, table has {}",
                self.name,
                self.columns.len(),
                schema.columns().len()
            )));
        }
        if self.rows.lo > self.rows.hi {
            return Err(MergeError::InvalidRange(format!(
                "partition {} staged rows [{}, {}) are inverted",
                self.name, self.rows.lo, self.rows.hi
            )));
        }
        for (layout, column) in schema.columns().iter().zip(&self.columns) {
            if !column.shape_matches(layout.kind()) {
                return Err(MergeError::StructuralMismatch(format!(
                    "column {} of partition {} staged with the wrong shape for {}",
                    layout.name(),
                    self.name,
                    layout.column_type()
                )));
            }
        }
        Ok(())
    }
}

/// Everything staged by one commit.
#[derive(Debug, Clone, Default)]
pub struct CommitBatch {
    partitions: Vec<StagedPartition>,
}

impl CommitBatch {
    /// Empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a staged partition.
    pub fn with_partition(mut self, partition: StagedPartition) -> Self {
        self.partitions.push(partition);
        self
    }

    /// Add a staged partition.
    pub fn push(&mut self, partition: StagedPartition) {
        self.partitions.push(partition);
    }

    /// Staged partitions.
    pub fn partitions(&self) -> &[StagedPartition] {
        &self.partitions
    }

    /// Whether nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.partitions.iter().all(|p| p.rows().is_empty())
    }

    pub(crate) fn validate(&self, schema: &TableSchema) -> Result<(), MergeError> {
        let mut names = HashSet::new();
        for partition in &self.partitions {
            if !names.insert(partition.name()) {
                return Err(MergeError::StructuralMismatch(format!(
                    "partition {} staged twice in one commit",
                    partition.name()
                )));
            }
            partition.validate(schema)?;
        }
        Ok(())
    }

    pub(crate) fn into_partitions(self) -> Vec<StagedPartition> {
        self.partitions
    }
}

/// A typed cell of a staged row.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Null of any type.
    Null,
    /// `Boolean` value.
    Boolean(bool),
    /// `Byte` value.
    Byte(i8),
    /// `Short` value.
    Short(i16),
    /// `Char` value.
    Char(u16),
    /// `Int` value.
    Int(i32),
    /// `Symbol` key.
    Symbol(i32),
    /// `Float` value.
    Float(f32),
    /// `Long` value.
    Long(i64),
    /// `Date` in milliseconds.
    Date(i64),
    /// `Timestamp` in microseconds.
    Timestamp(i64),
    /// `Double` value.
    Double(f64),
    /// `Long128` value.
    Long128(i128),
    /// `Long256` value as four little-endian words.
    Long256([i64; 4]),
    /// `String` value.
    String(String),
    /// `Binary` value.
    Binary(Vec<u8>),
}

impl Value {
    fn fits(&self, column_type: ColumnType) -> bool {
        matches!(
            (self, column_type),
            (Value::Null, _)
                | (Value::Boolean(_), ColumnType::Boolean)
                | (Value::Byte(_), ColumnType::Byte)
                | (Value::Short(_), ColumnType::Short)
                | (Value::Char(_), ColumnType::Char)
                | (Value::Int(_), ColumnType::Int)
                | (Value::Symbol(_), ColumnType::Symbol)
                | (Value::Float(_), ColumnType::Float)
                | (Value::Long(_), ColumnType::Long)
                | (Value::Date(_), ColumnType::Date)
                | (Value::Timestamp(_), ColumnType::Timestamp)
                | (Value::Double(_), ColumnType::Double)
                | (Value::Long128(_), ColumnType::Long128)
                | (Value::Long256(_), ColumnType::Long256)
                | (Value::String(_), ColumnType::String)
                | (Value::Binary(_), ColumnType::Binary)
        )
    }

    /// Encode a fixed-width value. Callers checked [`Value::fits`].
    fn write_fixed(&self, column_type: ColumnType, out: &mut Vec<u8>) {
        match self {
            Value::Boolean(v) => out.push(u8::from(*v)),
            Value::Byte(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Short(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Char(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Int(v) | Value::Symbol(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Long(v) | Value::Date(v) | Value::Timestamp(v) => {
                out.extend_from_slice(&v.to_le_bytes())
            }
            Value::Double(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Long128(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Long256(words) => {
                for word in words {
                    out.extend_from_slice(&word.to_le_bytes());
                }
            }
            Value::Null | Value::String(_) | Value::Binary(_) => {
                out.extend_from_slice(&column_type.null_value().unwrap_or_default())
            }
        }
    }

    fn var_payload(&self) -> Option<&[u8]> {
        match self {
            Value::String(v) => Some(v.as_bytes()),
            Value::Binary(v) => Some(v),
            _ => None,
        }
    }
}

/// Row-oriented builder for a [`CommitBatch`].
///
/// Rows may arrive in any timestamp order. [`StagedRows::into_batch`] sorts
/// them stably by the designated timestamp and splits them into partitions.
#[derive(Debug, Clone)]
pub struct StagedRows {
    schema: TableSchema,
    // Each row with the partition its timestamp falls into.
    rows: Vec<(String, Vec<Value>)>,
}

impl StagedRows {
    /// Builder for rows of `schema`.
    pub fn new(schema: &TableSchema) -> Self {
        Self {
            schema: schema.clone(),
            rows: Vec::new(),
        }
    }

    /// Stage one row, one value per column in schema order.
    pub fn push_row(&mut self, row: Vec<Value>) -> Result<(), MergeError> {
        let columns = self.schema.columns();
        if row.len() != columns.len() {
            return Err(MergeError::StructuralMismatch(format!(
                "row has {} values, table has {} columns",
                row.len(),
                columns.len()
            )));
        }
        for (layout, value) in columns.iter().zip(&row) {
            if !value.fits(layout.column_type()) {
                return Err(MergeError::StructuralMismatch(format!(
                    "value {value:?} does not fit column {} of type {}",
                    layout.name(),
                    layout.column_type()
                )));
            }
        }
        let Value::Timestamp(ts) = row[self.schema.timestamp_index()] else {
            return Err(MergeError::StructuralMismatch(format!(
                "designated timestamp {} cannot be null",
                self.schema.timestamp_column().name()
            )));
        };
        let partition = self
            .schema
            .partition_by()
            .partition_name(ts)
            .map_err(|err| MergeError::InvalidRange(err.to_string()))?;
        self.rows.push((partition, row));
        Ok(())
    }

    /// Rows staged so far.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no row is staged.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Sort, split by partition and encode.
    pub fn into_batch(self) -> CommitBatch {
        let Self { schema, mut rows } = self;
        let ts_index = schema.timestamp_index();
        rows.sort_by_key(|(_, row)| match row[ts_index] {
            Value::Timestamp(ts) => ts,
            _ => i64::MIN,
        });

        let mut batch = CommitBatch::new();
        let mut start = 0;
        while start < rows.len() {
            let name = &rows[start].0;
            let len = rows[start..]
                .iter()
                .take_while(|(partition, _)| partition == name)
                .count();
            let group = &rows[start..start + len];
            let columns = schema
                .columns()
                .iter()
                .enumerate()
                .map(|(i, layout)| {
                    encode_column(layout.column_type(), group.iter().map(|(_, row)| &row[i]))
                })
                .collect();
            batch.push(StagedPartition::new(name.clone(), len as u64, columns));
            start += len;
        }
        batch
    }
}

fn encode_column<'a>(
    column_type: ColumnType,
    values: impl Iterator<Item = &'a Value>,
) -> StagedColumn {
    match column_type.kind() {
        ColumnKind::Fixed(_) => {
            let mut data = Vec::new();
            for value in values {
                value.write_fixed(column_type, &mut data);
            }
            StagedColumn::Fixed(ReadRegion::from_vec(data))
        }
        ColumnKind::Variable => {
            let mut offsets = Vec::new();
            let mut data = Vec::new();
            for value in values {
                offsets.extend_from_slice(&(data.len() as u64).to_le_bytes());
                match value.var_payload() {
                    Some(payload) => {
                        column_type.encode_var_header(payload.len() as i64, &mut data);
                        data.extend_from_slice(payload);
                    }
                    None => column_type.encode_var_header(VAR_NULL_LEN, &mut data),
                }
            }
            StagedColumn::Variable {
                offsets: ReadRegion::from_vec(offsets),
                data: ReadRegion::from_vec(data),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        column::{read_offset, read_var_len, ColumnLayout},
        schema::PartitionBy,
    };

    const HOUR: i64 = 3_600_000_000;

    fn schema() -> TableSchema {
        TableSchema::new(
            vec![
                ColumnLayout::new("ts", ColumnType::Timestamp),
                ColumnLayout::new("v", ColumnType::Int),
                ColumnLayout::new("s", ColumnType::String),
            ],
            "ts",
            PartitionBy::Hour,
        )
        .expect("schema")
    }

    #[test]
    fn rows_are_sorted_stably_and_split() {
        let mut rows = StagedRows::new(&schema());
        for (ts, v) in [(HOUR + 5, 1), (3, 2), (HOUR + 5, 3), (1, 4)] {
            rows.push_row(vec![Value::Timestamp(ts), Value::Int(v), Value::Null])
                .expect("row");
        }
        let batch = rows.into_batch();
        let names: Vec<_> = batch.partitions().iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, vec!["1970-01-01T00", "1970-01-01T01"]);

        let second = &batch.partitions()[1];
        assert_eq!(second.rows(), RowRange::new(0, 2));
        match &second.columns()[1] {
            StagedColumn::Fixed(data) => {
                let values: Vec<_> = [1i32, 3].iter().flat_map(|v| v.to_le_bytes()).collect();
                assert_eq!(data.as_slice(), &values[..]);
            }
            StagedColumn::Variable { .. } => panic!("int column is fixed"),
        }
        match &second.columns()[2] {
            StagedColumn::Variable { offsets, data } => {
                assert_eq!(read_offset(offsets.as_slice(), 1), 4);
                assert_eq!(read_var_len(data.as_slice(), 0, 4), -1);
            }
            StagedColumn::Fixed(_) => panic!("string column is variable"),
        }
    }

    #[test]
    fn rejects_mistyped_rows() {
        let mut rows = StagedRows::new(&schema());
        assert!(rows
            .push_row(vec![Value::Timestamp(1), Value::Long(1), Value::Null])
            .is_err());
        assert!(rows
            .push_row(vec![Value::Null, Value::Int(1), Value::Null])
            .is_err());
        assert!(rows.push_row(vec![Value::Timestamp(1)]).is_err());
        assert!(rows.is_empty());
    }

    #[test]
    fn rejects_unpartitionable_timestamps() {
        let mut rows = StagedRows::new(&schema());
        assert!(matches!(
            rows.push_row(vec![Value::Timestamp(i64::MAX), Value::Int(1), Value::Null]),
            Err(MergeError::InvalidRange(_))
        ));
        assert!(rows.is_empty());
    }

    #[test]
    fn batch_rejects_duplicate_partitions() {
        let schema = schema();
        let mut rows = StagedRows::new(&schema);
        rows.push_row(vec![
            Value::Timestamp(1),
            Value::Int(1),
            Value::String("a".to_string()),
        ])
        .expect("row");
        let batch = rows.into_batch();
        let partition = batch.partitions()[0].clone();
        let doubled = batch.with_partition(partition);
        assert!(matches!(
            doubled.validate(&schema),
            Err(MergeError::StructuralMismatch(_))
        ));
    }
}
