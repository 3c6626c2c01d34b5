//! Row-ordered key log kept next to indexed `Symbol`/`Int` columns.
//!
//! Each entry is `(key: i32, row: u64)` little-endian, one per row, in row
//! order. Because the log is row-ordered it follows the column through the
//! same open modes: appended in place for the fast path, rewritten for splits.

use crate::merge::{DstCursor, MergeError};

/// Width of one key-log entry.
pub(crate) const KEY_ENTRY_WIDTH: usize = 4 + 8;

/// Append key-log entries for rows `[first_row, first_row + n)` whose keys are
/// the 4-byte elements of `keys`.
pub(crate) fn write_key_log(
    keys: &[u8],
    first_row: u64,
    dst: &mut DstCursor<'_>,
) -> Result<u64, MergeError> {
    let mut row = first_row;
    for key in keys.chunks_exact(4) {
        let mut entry = [0u8; KEY_ENTRY_WIDTH];
        entry[..4].copy_from_slice(key);
        entry[4..].copy_from_slice(&row.to_le_bytes());
        dst.put(&entry)?;
        row += 1;
    }
    Ok(row - first_row)
}

/// Ascending rows recorded for `key`.
pub fn rows_for_key(log: &[u8], key: i32) -> Vec<u64> {
    let needle = key.to_le_bytes();
    log.chunks_exact(KEY_ENTRY_WIDTH)
        .filter(|entry| entry[..4] == needle)
        .map(|entry| {
            let mut row = [0u8; 8];
            row.copy_from_slice(&entry[4..]);
            u64::from_le_bytes(row)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_log_tracks_rows() {
        let keys: Vec<u8> = [3i32, 7, 3, i32::MIN]
            .iter()
            .flat_map(|k| k.to_le_bytes())
            .collect();
        let mut log = vec![0u8; 4 * KEY_ENTRY_WIDTH];
        let mut cursor = DstCursor::new("sym.k", &mut log, 0).expect("cursor");
        assert_eq!(write_key_log(&keys, 10, &mut cursor).expect("log"), 4);

        assert_eq!(rows_for_key(&log, 3), vec![10, 12]);
        assert_eq!(rows_for_key(&log, 7), vec![11]);
        assert_eq!(rows_for_key(&log, i32::MIN), vec![13]);
        assert!(rows_for_key(&log, 42).is_empty());
    }
}
