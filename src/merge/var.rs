//! Copy loops for variable-length columns.
//!
//! The destination offset file is rebuilt from a running byte offset while
//! element payloads (length header plus bytes) are copied back-to-back into the
//! destination data file. Verbatim zones copy the whole data span at once and
//! rebase their offsets; the merge zone goes element by element.

use super::{
    error::MergeError,
    index::{MergeIndex, MergePlan, MergeSource, ZoneKind},
    source_slice, DstCursor,
};
use crate::column::{read_offset, read_var_len, var_element_size, OFFSET_WIDTH};

/// Offset and data files of one variable-length source.
#[derive(Clone, Copy)]
pub(crate) struct VarSource<'a> {
    pub(crate) offsets: &'a [u8],
    pub(crate) data: &'a [u8],
}

impl VarSource<'_> {
    fn offset(&self, what: &str, row: u64) -> Result<u64, MergeError> {
        let at = row as usize * OFFSET_WIDTH;
        source_slice(what, self.offsets, at, OFFSET_WIDTH)?;
        Ok(read_offset(self.offsets, row as usize))
    }

    /// Byte span `[start, end)` of `row` in the data file.
    fn element(
        &self,
        what: &str,
        row: u64,
        header_width: usize,
    ) -> Result<(usize, usize), MergeError> {
        let start = self.offset(what, row)? as usize;
        source_slice(what, self.data, start, header_width)?;
        let len = read_var_len(self.data, start, header_width);
        if len < -1 {
            return Err(MergeError::StructuralMismatch(format!(
                "{what}: invalid element length {len} at row {row}"
            )));
        }
        let end = start + var_element_size(len, header_width);
        source_slice(what, self.data, start, end - start)?;
        Ok((start, end))
    }

    /// Data span covering rows `[lo, hi)`, which are stored contiguously.
    pub(crate) fn span(
        &self,
        what: &str,
        lo: u64,
        hi: u64,
        header_width: usize,
    ) -> Result<(usize, usize), MergeError> {
        if lo >= hi {
            return Ok((0, 0));
        }
        let (start, _) = self.element(what, lo, header_width)?;
        let (_, end) = self.element(what, hi - 1, header_width)?;
        if end < start {
            return Err(MergeError::StructuralMismatch(format!(
                "{what}: offsets decrease across rows [{lo}, {hi})"
            )));
        }
        Ok((start, end))
    }
}

/// Sources and header width of a variable-length column merge.
pub(crate) struct VarSources<'a> {
    pub(crate) header_width: usize,
    pub(crate) old: VarSource<'a>,
    pub(crate) new: VarSource<'a>,
}

impl<'a> VarSources<'a> {
    fn side(&self, source: MergeSource) -> (&'static str, VarSource<'a>) {
        match source {
            MergeSource::Old => ("old var column", self.old),
            MergeSource::New => ("new var column", self.new),
        }
    }

    /// Bytes of payload the merged column needs beyond `data_start`.
    pub(crate) fn merged_data_len(
        &self,
        plan: &MergePlan,
        prefix_in_place: bool,
    ) -> Result<usize, MergeError> {
        let mut total = 0usize;
        for (i, zone) in plan.zones_in_order().into_iter().enumerate() {
            if i == 0 && prefix_in_place {
                continue;
            }
            let hw = self.header_width;
            let (s, e) = self.old.span("old var column", zone.old.lo, zone.old.hi, hw)?;
            total += e - s;
            let (s, e) = self.new.span("new var column", zone.new.lo, zone.new.hi, hw)?;
            total += e - s;
        }
        Ok(total)
    }
}

/// Destination cursors for a variable-length column.
pub(crate) struct VarDestination<'a> {
    pub(crate) offsets: DstCursor<'a>,
    pub(crate) data: DstCursor<'a>,
}

/// Write the merged rows of one variable-length column.
///
/// With `prefix_in_place` the committed prefix already occupies the head of
/// both destination files; both cursors must start right after it.
pub(crate) fn merge_var(
    plan: &MergePlan,
    index: &MergeIndex,
    src: &VarSources<'_>,
    dst: &mut VarDestination<'_>,
    prefix_in_place: bool,
) -> Result<u64, MergeError> {
    let hw = src.header_width;
    let mut rows = 0u64;
    for (i, zone) in plan.zones_in_order().into_iter().enumerate() {
        match zone.kind {
            ZoneKind::None => {}
            _ if i == 0 && prefix_in_place => {
                if zone.kind != ZoneKind::OldOnly {
                    return Err(MergeError::StructuralMismatch(
                        "in-place prefix must come from committed rows".to_string(),
                    ));
                }
                let (_, end) = src.old.span("old var column", zone.old.lo, zone.old.hi, hw)?;
                if dst.data.position() != end
                    || dst.offsets.position() != zone.old.hi as usize * OFFSET_WIDTH
                {
                    return Err(MergeError::StructuralMismatch(format!(
                        "append cursors at ({}, {}) but committed rows end at ({}, {end})",
                        dst.offsets.position(),
                        dst.data.position(),
                        zone.old.hi as usize * OFFSET_WIDTH,
                    )));
                }
            }
            ZoneKind::OldOnly => {
                copy_range(src, MergeSource::Old, zone.old.lo, zone.old.hi, dst)?;
                rows += zone.old.len();
            }
            ZoneKind::NewOnly => {
                copy_range(src, MergeSource::New, zone.new.lo, zone.new.hi, dst)?;
                rows += zone.new.len();
            }
            ZoneKind::Mixed => {
                for entry in index.entries() {
                    let (what, side) = src.side(entry.source);
                    let (start, end) = side.element(what, entry.row, hw)?;
                    dst.offsets.put_u64(dst.data.position() as u64)?;
                    dst.data.put(&side.data[start..end])?;
                }
                rows += index.len() as u64;
            }
        }
    }
    Ok(rows)
}

fn copy_range(
    src: &VarSources<'_>,
    source: MergeSource,
    lo: u64,
    hi: u64,
    dst: &mut VarDestination<'_>,
) -> Result<(), MergeError> {
    let (what, side) = src.side(source);
    let (start, end) = side.span(what, lo, hi, src.header_width)?;
    let base = dst.data.position() as u64;
    for row in lo..hi {
        let offset = side.offset(what, row)?;
        if (offset as usize) < start || offset as usize >= end {
            return Err(MergeError::StructuralMismatch(format!(
                "{what}: offset {offset} of row {row} outside span [{start}, {end})"
            )));
        }
        dst.offsets.put_u64(offset - start as u64 + base)?;
    }
    dst.data.put(&side.data[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        column::ColumnType,
        merge::index::{RowRange, TimestampView},
        test_util::{read_var_column, ts_bytes, var_column},
    };

    struct Merged {
        offsets: Vec<u8>,
        data: Vec<u8>,
        rows: u64,
    }

    fn run(
        column_type: ColumnType,
        old_ts: &[i64],
        old: &[Option<&[u8]>],
        new_ts: &[i64],
        new: &[Option<&[u8]>],
    ) -> Merged {
        let hw = column_type.var_header_width().expect("var type");
        let (ot, nt) = (ts_bytes(old_ts), ts_bytes(new_ts));
        let (plan, index) = MergePlan::build(
            TimestampView::new(&ot),
            old_ts.len() as u64,
            TimestampView::new(&nt),
            RowRange::new(0, new_ts.len() as u64),
        )
        .expect("plan");
        let (old_offsets, old_data) = var_column(column_type, old);
        let (new_offsets, new_data) = var_column(column_type, new);
        let sources = VarSources {
            header_width: hw,
            old: VarSource {
                offsets: &old_offsets,
                data: &old_data,
            },
            new: VarSource {
                offsets: &new_offsets,
                data: &new_data,
            },
        };
        let data_len = sources.merged_data_len(&plan, false).expect("size");
        let mut offsets = vec![0u8; plan.output_rows() as usize * OFFSET_WIDTH];
        let mut data = vec![0u8; data_len];
        let rows = {
            let mut dst = VarDestination {
                offsets: DstCursor::new("s.i", &mut offsets, 0).expect("cursor"),
                data: DstCursor::new("s.d", &mut data, 0).expect("cursor"),
            };
            merge_var(&plan, &index, &sources, &mut dst, false).expect("merge")
        };
        Merged {
            offsets,
            data,
            rows,
        }
    }

    #[test]
    fn strings_nulls_and_empties_round_trip() {
        let old: [Option<&[u8]>; 4] = [Some(b""), None, Some(b"ab"), Some(b"c")];
        let new: [Option<&[u8]>; 2] = [Some(b"xy"), Some(b"")];
        let merged = run(ColumnType::String, &[10, 20, 30, 40], &old, &[15, 30], &new);
        assert_eq!(merged.rows, 6);
        let values = read_var_column(&merged.offsets, &merged.data, 6, 4);
        assert_eq!(
            values,
            vec![
                Some(b"".to_vec()),
                Some(b"xy".to_vec()),
                None,
                Some(b"ab".to_vec()),
                Some(b"".to_vec()),
                Some(b"c".to_vec()),
            ]
        );
    }

    #[test]
    fn binary_prefix_and_suffix_are_rebased() {
        let old: [Option<&[u8]>; 3] = [Some(b"aaaa"), Some(b"b"), Some(b"cc")];
        let new: [Option<&[u8]>; 2] = [Some(b"zzzzzz"), None];
        // Staged rows land before every committed row: prepend.
        let merged = run(ColumnType::Binary, &[5, 6, 7], &old, &[1, 2], &new);
        let values = read_var_column(&merged.offsets, &merged.data, 5, 8);
        assert_eq!(
            values,
            vec![
                Some(b"zzzzzz".to_vec()),
                None,
                Some(b"aaaa".to_vec()),
                Some(b"b".to_vec()),
                Some(b"cc".to_vec()),
            ]
        );
        assert_eq!(read_offset(&merged.offsets, 0), 0);
        assert_eq!(read_offset(&merged.offsets, 2), 8 + 6 + 8);
    }

    #[test]
    fn append_continues_from_committed_data() {
        let old: [Option<&[u8]>; 2] = [Some(b"a"), Some(b"bc")];
        let new: [Option<&[u8]>; 1] = [Some(b"d")];
        let (ot, nt) = (ts_bytes(&[1, 2]), ts_bytes(&[3]));
        let (plan, index) = MergePlan::build(
            TimestampView::new(&ot),
            2,
            TimestampView::new(&nt),
            RowRange::new(0, 1),
        )
        .expect("plan");
        let (old_offsets, old_data) = var_column(ColumnType::String, &old);
        let (new_offsets, new_data) = var_column(ColumnType::String, &new);
        let sources = VarSources {
            header_width: 4,
            old: VarSource {
                offsets: &old_offsets,
                data: &old_data,
            },
            new: VarSource {
                offsets: &new_offsets,
                data: &new_data,
            },
        };
        let extra = sources.merged_data_len(&plan, true).expect("size");
        assert_eq!(extra, 5);

        let mut offsets = old_offsets.clone();
        offsets.resize(3 * OFFSET_WIDTH, 0);
        let mut data = old_data.clone();
        data.resize(old_data.len() + extra, 0);
        let (offsets_start, data_start) = (old_offsets.len(), old_data.len());
        {
            let mut dst = VarDestination {
                offsets: DstCursor::new("s.i", &mut offsets, offsets_start).expect("cursor"),
                data: DstCursor::new("s.d", &mut data, data_start).expect("cursor"),
            };
            merge_var(&plan, &index, &sources, &mut dst, true).expect("merge");
        }
        assert_eq!(&data[..old_data.len()], &old_data[..]);
        assert_eq!(
            read_var_column(&offsets, &data, 3, 4),
            vec![Some(b"a".to_vec()), Some(b"bc".to_vec()), Some(b"d".to_vec())]
        );
    }

    #[test]
    fn corrupt_offsets_are_reported() {
        let (plan, index) = {
            let (ot, nt) = (ts_bytes(&[1]), ts_bytes(&[0]));
            MergePlan::build(
                TimestampView::new(&ot),
                1,
                TimestampView::new(&nt),
                RowRange::new(0, 1),
            )
            .expect("plan")
        };
        let (new_offsets, new_data) = var_column(ColumnType::String, &[Some(b"x")]);
        let bad_offsets = 1_000u64.to_le_bytes();
        let sources = VarSources {
            header_width: 4,
            old: VarSource {
                offsets: &bad_offsets,
                data: &[0u8; 4],
            },
            new: VarSource {
                offsets: &new_offsets,
                data: &new_data,
            },
        };
        assert!(matches!(
            sources.merged_data_len(&plan, false),
            Err(MergeError::StructuralMismatch(_))
        ));
        let mut offsets = vec![0u8; 16];
        let mut data = vec![0u8; 64];
        let mut dst = VarDestination {
            offsets: DstCursor::new("s.i", &mut offsets, 0).expect("cursor"),
            data: DstCursor::new("s.d", &mut data, 0).expect("cursor"),
        };
        assert!(matches!(
            merge_var(&plan, &index, &sources, &mut dst, false),
            Err(MergeError::StructuralMismatch(_))
        ));
    }
}
