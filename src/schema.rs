//! Table schema and time partitioning.

use std::{collections::HashSet, fmt};

use chrono::DateTime;
use thiserror::Error;

use crate::column::{ColumnLayout, ColumnType};

/// How rows are grouped into partitions by their designated timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartitionBy {
    /// A single partition named `default`.
    #[default]
    None,
    /// One partition per UTC hour.
    Hour,
    /// One partition per UTC day.
    Day,
    /// One partition per calendar month.
    Month,
    /// One partition per calendar year.
    Year,
}

impl PartitionBy {
    /// Name of the partition holding a row with timestamp `ts` (micros since
    /// the Unix epoch, UTC).
    pub fn partition_name(&self, ts: i64) -> Result<String, SchemaError> {
        let format = match self {
            PartitionBy::None => return Ok("default".to_string()),
            PartitionBy::Hour => "%Y-%m-%dT%H",
            PartitionBy::Day => "%Y-%m-%d",
            PartitionBy::Month => "%Y-%m",
            PartitionBy::Year => "%Y",
        };
        let datetime =
            DateTime::from_timestamp_micros(ts).ok_or(SchemaError::TimestampOutOfRange(ts))?;
        Ok(datetime.format(format).to_string())
    }

    pub(crate) fn tag(&self) -> u8 {
        match self {
            PartitionBy::None => 0,
            PartitionBy::Hour => 1,
            PartitionBy::Day => 2,
            PartitionBy::Month => 3,
            PartitionBy::Year => 4,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => PartitionBy::None,
            1 => PartitionBy::Hour,
            2 => PartitionBy::Day,
            3 => PartitionBy::Month,
            4 => PartitionBy::Year,
            _ => return None,
        })
    }
}

/// Invalid table or column declarations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    /// Two columns share a name.
    #[error("duplicate column {0}")]
    DuplicateColumn(String),
    /// The designated timestamp column does not exist.
    #[error("designated timestamp column {0} not found")]
    MissingTimestamp(String),
    /// The designated timestamp column is not of type `Timestamp`.
    #[error("designated timestamp column {name} has type {column_type}")]
    TimestampType {
        /// Column name.
        name: String,
        /// Declared type.
        column_type: ColumnType,
    },
    /// An index was requested on a type that cannot carry one.
    #[error("column {name} of type {column_type} cannot be indexed")]
    IndexUnsupported {
        /// Column name.
        name: String,
        /// Declared type.
        column_type: ColumnType,
    },
    /// Column names become file names.
    #[error("column name {0:?} is not a valid file stem")]
    InvalidName(String),
    /// A timestamp outside the calendar range partitions can be named for.
    #[error("timestamp {0} is outside the partitionable range")]
    TimestampOutOfRange(i64),
}

/// Ordered columns of a table, its designated timestamp and partitioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    columns: Vec<ColumnLayout>,
    timestamp_index: usize,
    partition_by: PartitionBy,
}

impl TableSchema {
    /// Validate and build a schema.
    pub fn new(
        columns: Vec<ColumnLayout>,
        timestamp: &str,
        partition_by: PartitionBy,
    ) -> Result<Self, SchemaError> {
        let mut seen = HashSet::new();
        for column in &columns {
            check_column(column)?;
            if !seen.insert(column.name()) {
                return Err(SchemaError::DuplicateColumn(column.name().to_string()));
            }
        }
        let timestamp_index = columns
            .iter()
            .position(|column| column.name() == timestamp)
            .ok_or_else(|| SchemaError::MissingTimestamp(timestamp.to_string()))?;
        let designated = &columns[timestamp_index];
        if designated.column_type() != ColumnType::Timestamp || designated.is_indexed() {
            return Err(SchemaError::TimestampType {
                name: designated.name().to_string(),
                column_type: designated.column_type(),
            });
        }
        Ok(Self {
            columns,
            timestamp_index,
            partition_by,
        })
    }

    /// Columns in declaration order.
    pub fn columns(&self) -> &[ColumnLayout] {
        &self.columns
    }

    /// Position of the designated timestamp column.
    pub fn timestamp_index(&self) -> usize {
        self.timestamp_index
    }

    /// The designated timestamp column.
    pub fn timestamp_column(&self) -> &ColumnLayout {
        &self.columns[self.timestamp_index]
    }

    /// Partitioning strategy.
    pub fn partition_by(&self) -> PartitionBy {
        self.partition_by
    }

    /// Position of the column named `name`.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name() == name)
    }

    /// Schema with `column` appended.
    pub fn with_column(&self, column: ColumnLayout) -> Result<Self, SchemaError> {
        check_column(&column)?;
        if self.position(column.name()).is_some() {
            return Err(SchemaError::DuplicateColumn(column.name().to_string()));
        }
        let mut columns = self.columns.clone();
        columns.push(column);
        Ok(Self {
            columns,
            ..self.clone()
        })
    }
}

fn check_column(column: &ColumnLayout) -> Result<(), SchemaError> {
    let name = column.name();
    if name.is_empty()
        || name.starts_with('_')
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(SchemaError::InvalidName(name.to_string()));
    }
    if column.is_indexed() && !column.column_type().supports_index() {
        return Err(SchemaError::IndexUnsupported {
            name: name.to_string(),
            column_type: column.column_type(),
        });
    }
    Ok(())
}

impl fmt::Display for TableSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, column) in self.columns.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{} {}", column.name(), column.column_type())?;
            if column.is_indexed() {
                f.write_str(" indexed")?;
            }
            if i == self.timestamp_index {
                f.write_str(" timestamp")?;
            }
        }
        write!(f, " partition by {:?}", self.partition_by)
    }
}
