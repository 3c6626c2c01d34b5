//! Column layout descriptors and physical encodings.
//!
//! A column is either a fixed-width element array or a variable-length pair of
//! files: an offset file holding one little-endian `u64` per row and a data file
//! holding `header + payload` elements back-to-back.

pub mod index;

use std::fmt::{Display, Formatter};

/// Length header value that marks a null variable-length element.
pub const VAR_NULL_LEN: i64 = -1;

/// Width in bytes of one entry in a variable column's offset file.
pub const OFFSET_WIDTH: usize = std::mem::size_of::<u64>();

/// Declared column type. The physical shape follows from the type and never
/// changes after the column is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    /// Single byte, `0`/`1`.
    Boolean,
    /// Signed 8-bit integer.
    Byte,
    /// Signed 16-bit integer.
    Short,
    /// UTF-16 code unit.
    Char,
    /// Signed 32-bit integer.
    Int,
    /// Interned string key, stored as a signed 32-bit integer.
    Symbol,
    /// 32-bit IEEE float.
    Float,
    /// Signed 64-bit integer.
    Long,
    /// Milliseconds since the Unix epoch.
    Date,
    /// Microseconds since the Unix epoch.
    Timestamp,
    /// 64-bit IEEE float.
    Double,
    /// 128-bit value stored as two 64-bit words.
    Long128,
    /// 256-bit value stored as four 64-bit words.
    Long256,
    /// UTF-8 string with an `i32` length header.
    String,
    /// Raw bytes with an `i64` length header.
    Binary,
}

/// Physical shape of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Fixed-size elements of the given width in bytes.
    Fixed(usize),
    /// Offset file plus data file.
    Variable,
}

impl ColumnType {
    /// Physical shape of values of this type.
    pub fn kind(&self) -> ColumnKind {
        match self {
            ColumnType::Boolean | ColumnType::Byte => ColumnKind::Fixed(1),
            ColumnType::Short | ColumnType::Char => ColumnKind::Fixed(2),
            ColumnType::Int | ColumnType::Symbol | ColumnType::Float => ColumnKind::Fixed(4),
            ColumnType::Long | ColumnType::Date | ColumnType::Timestamp | ColumnType::Double => {
                ColumnKind::Fixed(8)
            }
            ColumnType::Long128 => ColumnKind::Fixed(16),
            ColumnType::Long256 => ColumnKind::Fixed(32),
            ColumnType::String | ColumnType::Binary => ColumnKind::Variable,
        }
    }

    /// Width of the length header in front of each variable-length element.
    pub fn var_header_width(&self) -> Option<usize> {
        match self {
            ColumnType::String => Some(std::mem::size_of::<i32>()),
            ColumnType::Binary => Some(std::mem::size_of::<i64>()),
            _ => None,
        }
    }

    /// Whether a secondary index can be maintained for this type.
    pub fn supports_index(&self) -> bool {
        matches!(self, ColumnType::Symbol | ColumnType::Int)
    }

    /// Bit pattern used for a null value of a fixed-width type.
    ///
    /// Variable-length types return `None`; their null is encoded in the header.
    pub fn null_value(&self) -> Option<Vec<u8>> {
        let bytes = match self {
            ColumnType::Boolean | ColumnType::Byte => vec![0u8],
            ColumnType::Short | ColumnType::Char => vec![0u8; 2],
            ColumnType::Int | ColumnType::Symbol => i32::MIN.to_le_bytes().to_vec(),
            ColumnType::Float => f32::NAN.to_bits().to_le_bytes().to_vec(),
            ColumnType::Long | ColumnType::Date | ColumnType::Timestamp => {
                i64::MIN.to_le_bytes().to_vec()
            }
            ColumnType::Double => f64::NAN.to_bits().to_le_bytes().to_vec(),
            ColumnType::Long128 => i64::MIN.to_le_bytes().repeat(2),
            ColumnType::Long256 => i64::MIN.to_le_bytes().repeat(4),
            ColumnType::String | ColumnType::Binary => return None,
        };
        Some(bytes)
    }

    /// Encode a variable-length element header.
    pub(crate) fn encode_var_header(&self, len: i64, out: &mut Vec<u8>) {
        match self {
            ColumnType::String => out.extend_from_slice(&(len as i32).to_le_bytes()),
            _ => out.extend_from_slice(&len.to_le_bytes()),
        }
    }

    pub(crate) fn tag(&self) -> u8 {
        match self {
            ColumnType::Boolean => 0,
            ColumnType::Byte => 1,
            ColumnType::Short => 2,
            ColumnType::Char => 3,
            ColumnType::Int => 4,
            ColumnType::Symbol => 5,
            ColumnType::Float => 6,
            ColumnType::Long => 7,
            ColumnType::Date => 8,
            ColumnType::Timestamp => 9,
            ColumnType::Double => 10,
            ColumnType::Long128 => 11,
            ColumnType::Long256 => 12,
            ColumnType::String => 13,
            ColumnType::Binary => 14,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => ColumnType::Boolean,
            1 => ColumnType::Byte,
            2 => ColumnType::Short,
            3 => ColumnType::Char,
            4 => ColumnType::Int,
            5 => ColumnType::Symbol,
            6 => ColumnType::Float,
            7 => ColumnType::Long,
            8 => ColumnType::Date,
            9 => ColumnType::Timestamp,
            10 => ColumnType::Double,
            11 => ColumnType::Long128,
            12 => ColumnType::Long256,
            13 => ColumnType::String,
            14 => ColumnType::Binary,
            _ => return None,
        })
    }
}

impl Display for ColumnType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Name, type and index flag of one table column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnLayout {
    name: String,
    column_type: ColumnType,
    indexed: bool,
}

impl ColumnLayout {
    /// Non-indexed column.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            indexed: false,
        }
    }

    /// Mark the column as carrying a secondary index.
    pub fn indexed(self) -> Self {
        Self {
            indexed: true,
            ..self
        }
    }

    /// Column name, also used as the file stem.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared type.
    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }

    /// Physical shape.
    pub fn kind(&self) -> ColumnKind {
        self.column_type.kind()
    }

    /// Whether a secondary index is kept in lock-step with the data.
    pub fn is_indexed(&self) -> bool {
        self.indexed
    }

    /// Primary file: the element array for fixed columns, the payload file for
    /// variable ones.
    pub fn data_file_name(&self) -> String {
        format!("{}.d", self.name)
    }

    /// Offset file of a variable column.
    pub fn offset_file_name(&self) -> String {
        format!("{}.i", self.name)
    }

    /// Secondary index key log.
    pub fn index_file_name(&self) -> String {
        format!("{}.k", self.name)
    }
}

/// Read the `u64` offset for `row` from an offset file.
#[inline]
pub(crate) fn read_offset(offsets: &[u8], row: usize) -> u64 {
    let at = row * OFFSET_WIDTH;
    let mut buf = [0u8; OFFSET_WIDTH];
    buf.copy_from_slice(&offsets[at..at + OFFSET_WIDTH]);
    u64::from_le_bytes(buf)
}

/// Decode a variable element header at `at`. Returns the signed length.
#[inline]
pub(crate) fn read_var_len(data: &[u8], at: usize, header_width: usize) -> i64 {
    if header_width == 4 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&data[at..at + 4]);
        i32::from_le_bytes(buf) as i64
    } else {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&data[at..at + 8]);
        i64::from_le_bytes(buf)
    }
}

/// Total stored size (header plus payload) of an element with length `len`.
#[inline]
pub(crate) fn var_element_size(len: i64, header_width: usize) -> usize {
    header_width + len.max(0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_widths_follow_type() {
        assert_eq!(ColumnType::Boolean.kind(), ColumnKind::Fixed(1));
        assert_eq!(ColumnType::Char.kind(), ColumnKind::Fixed(2));
        assert_eq!(ColumnType::Symbol.kind(), ColumnKind::Fixed(4));
        assert_eq!(ColumnType::Timestamp.kind(), ColumnKind::Fixed(8));
        assert_eq!(ColumnType::Long128.kind(), ColumnKind::Fixed(16));
        assert_eq!(ColumnType::Long256.kind(), ColumnKind::Fixed(32));
        assert_eq!(ColumnType::Binary.kind(), ColumnKind::Variable);
    }

    #[test]
    fn null_values_match_width() {
        for tag in 0..=14u8 {
            let ty = ColumnType::from_tag(tag).expect("known tag");
            assert_eq!(ty.tag(), tag);
            match (ty.kind(), ty.null_value()) {
                (ColumnKind::Fixed(width), Some(null)) => assert_eq!(null.len(), width),
                (ColumnKind::Variable, None) => {}
                other => panic!("unexpected null encoding for {ty}: {other:?}"),
            }
        }
        assert_eq!(ColumnType::from_tag(15), None);
    }

    #[test]
    fn var_header_round_trips_null_and_empty() {
        let mut buf = Vec::new();
        ColumnType::String.encode_var_header(VAR_NULL_LEN, &mut buf);
        ColumnType::String.encode_var_header(0, &mut buf);
        assert_eq!(read_var_len(&buf, 0, 4), VAR_NULL_LEN);
        assert_eq!(read_var_len(&buf, 4, 4), 0);
        assert_eq!(var_element_size(VAR_NULL_LEN, 4), 4);

        let mut bin = Vec::new();
        ColumnType::Binary.encode_var_header(3, &mut bin);
        assert_eq!(read_var_len(&bin, 0, 8), 3);
        assert_eq!(var_element_size(3, 8), 11);
    }
}
