//! Binary layout of the `_txn` file.
//!
//! ```text
//! magic "TSMT" | version u32 | txn u64 | partition_by u8 | timestamp u32
//! | column count u32 | (name, type u8, indexed u8)*
//! | partition count u32 | (name, generation u64, rows u64, min opt, max opt)*
//! | crc32 u32
//! ```
//!
//! Integers are little-endian, strings are a `u32` length followed by UTF-8
//! bytes, `opt` is a presence byte followed by an `i64`. The CRC covers every
//! byte before it.

use std::str;

use thiserror::Error;

use crate::{
    column::{ColumnLayout, ColumnType},
    fs::FsError,
    schema::{PartitionBy, SchemaError, TableSchema},
    version::PartitionMeta,
};

const MAGIC: &[u8; 4] = b"TSMT";
const FORMAT_VERSION: u32 = 1;

/// Failures reading or writing table metadata.
#[derive(Debug, Error)]
pub enum MetaError {
    /// The file ends before the structure does, or holds unknown tags.
    #[error("corrupt transaction file: {0}")]
    Corrupt(String),
    /// Stored and computed checksums differ.
    #[error("transaction file checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// Checksum found in the file.
        stored: u32,
        /// Checksum of the content.
        computed: u32,
    },
    /// Written by a newer format.
    #[error("unsupported transaction file version {0}")]
    UnsupportedVersion(u32),
    /// The stored schema does not validate.
    #[error(transparent)]
    Schema(#[from] SchemaError),
    /// Storage failure.
    #[error(transparent)]
    Fs(#[from] FsError),
}

/// Decoded content of a `_txn` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TxnRecord {
    pub(crate) txn: u64,
    pub(crate) schema: TableSchema,
    pub(crate) partitions: Vec<PartitionMeta>,
}

pub(crate) fn encode<'a>(
    txn: u64,
    schema: &TableSchema,
    partitions: impl ExactSizeIterator<Item = &'a PartitionMeta>,
) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&txn.to_le_bytes());
    out.push(schema.partition_by().tag());
    out.extend_from_slice(&(schema.timestamp_index() as u32).to_le_bytes());
    out.extend_from_slice(&(schema.columns().len() as u32).to_le_bytes());
    for column in schema.columns() {
        put_str(&mut out, column.name());
        out.push(column.column_type().tag());
        out.push(u8::from(column.is_indexed()));
    }
    out.extend_from_slice(&(partitions.len() as u32).to_le_bytes());
    for meta in partitions {
        put_str(&mut out, meta.name());
        out.extend_from_slice(&meta.generation().to_le_bytes());
        out.extend_from_slice(&meta.row_count().to_le_bytes());
        put_opt(&mut out, meta.min_timestamp());
        put_opt(&mut out, meta.max_timestamp());
    }
    let crc = crc32fast::hash(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

pub(crate) fn decode(bytes: &[u8]) -> Result<TxnRecord, MetaError> {
    if bytes.len() < MAGIC.len() + 4 {
        return Err(MetaError::Corrupt(format!("{} bytes is too short", bytes.len())));
    }
    let (body, trailer) = bytes.split_at(bytes.len() - 4);
    let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let computed = crc32fast::hash(body);
    if stored != computed {
        return Err(MetaError::ChecksumMismatch { stored, computed });
    }

    let mut reader = Reader { buf: body, pos: 0 };
    if reader.take(MAGIC.len())? != MAGIC {
        return Err(MetaError::Corrupt("bad magic".to_string()));
    }
    let version = reader.u32()?;
    if version != FORMAT_VERSION {
        return Err(MetaError::UnsupportedVersion(version));
    }
    let txn = reader.u64()?;
    let partition_by = PartitionBy::from_tag(reader.u8()?)
        .ok_or_else(|| MetaError::Corrupt("unknown partitioning".to_string()))?;
    let timestamp_index = reader.u32()? as usize;

    let column_count = reader.u32()?;
    let mut columns = Vec::with_capacity(column_count as usize);
    for _ in 0..column_count {
        let name = reader.string()?;
        let tag = reader.u8()?;
        let column_type = ColumnType::from_tag(tag)
            .ok_or_else(|| MetaError::Corrupt(format!("unknown column type tag {tag}")))?;
        let layout = ColumnLayout::new(name, column_type);
        columns.push(if reader.u8()? != 0 { layout.indexed() } else { layout });
    }
    let timestamp = columns
        .get(timestamp_index)
        .map(|column| column.name().to_string())
        .ok_or_else(|| {
            MetaError::Corrupt(format!("timestamp index {timestamp_index} out of range"))
        })?;
    let schema = TableSchema::new(columns, &timestamp, partition_by)?;

    let partition_count = reader.u32()?;
    let mut partitions = Vec::with_capacity(partition_count as usize);
    for _ in 0..partition_count {
        let name = reader.string()?;
        let generation = reader.u64()?;
        let row_count = reader.u64()?;
        let min = reader.opt()?;
        let max = reader.opt()?;
        partitions.push(PartitionMeta::new(&name, generation, row_count, min, max));
    }
    if reader.pos != body.len() {
        return Err(MetaError::Corrupt(format!(
            "{} trailing bytes",
            body.len() - reader.pos
        )));
    }
    Ok(TxnRecord {
        txn,
        schema,
        partitions,
    })
}

fn put_str(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u32).to_le_bytes());
    out.extend_from_slice(value.as_bytes());
}

fn put_opt(out: &mut Vec<u8>, value: Option<i64>) {
    match value {
        Some(value) => {
            out.push(1);
            out.extend_from_slice(&value.to_le_bytes());
        }
        None => {
            out.push(0);
            out.extend_from_slice(&0i64.to_le_bytes());
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], MetaError> {
        let bytes = self
            .buf
            .get(self.pos..self.pos + len)
            .ok_or_else(|| MetaError::Corrupt(format!("truncated at byte {}", self.pos)))?;
        self.pos += len;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], MetaError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, MetaError> {
        Ok(self.array::<1>()?[0])
    }

    fn u32(&mut self) -> Result<u32, MetaError> {
        self.array().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Result<u64, MetaError> {
        self.array().map(u64::from_le_bytes)
    }

    fn opt(&mut self) -> Result<Option<i64>, MetaError> {
        let present = self.u8()?;
        let value = self.array().map(i64::from_le_bytes)?;
        Ok((present != 0).then_some(value))
    }

    fn string(&mut self) -> Result<String, MetaError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|e| MetaError::Corrupt(format!("invalid name: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> TxnRecord {
        let schema = TableSchema::new(
            vec![
                ColumnLayout::new("sym", ColumnType::Symbol).indexed(),
                ColumnLayout::new("ts", ColumnType::Timestamp),
                ColumnLayout::new("note", ColumnType::String),
            ],
            "ts",
            PartitionBy::Day,
        )
        .expect("schema");
        TxnRecord {
            txn: 7,
            schema,
            partitions: vec![
                PartitionMeta::new("2024-03-01", 7, 12, Some(-5), Some(99)),
                PartitionMeta::new("2024-03-02", 3, 0, None, None),
            ],
        }
    }

    #[test]
    fn encode_and_decode() {
        let record = record();
        let bytes = encode(record.txn, &record.schema, record.partitions.iter());
        assert_eq!(decode(&bytes).expect("decode"), record);
    }

    #[test]
    fn checksum_catches_corruption() {
        let record = record();
        let mut bytes = encode(record.txn, &record.schema, record.partitions.iter());
        bytes[10] ^= 0xFF;
        assert!(matches!(decode(&bytes), Err(MetaError::ChecksumMismatch { .. })));
        assert!(matches!(decode(&bytes[..3]), Err(MetaError::Corrupt(_))));
    }
}
