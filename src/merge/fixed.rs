//! Copy loops for fixed-width columns.

use super::{
    error::MergeError,
    index::{MergeIndex, MergePlan, MergeSource, ZoneKind},
    source_slice, DstCursor,
};

/// Element sources of a fixed-width column.
pub(crate) struct FixedSources<'a> {
    pub(crate) width: usize,
    pub(crate) old: &'a [u8],
    pub(crate) new: &'a [u8],
}

impl FixedSources<'_> {
    fn rows(&self, source: MergeSource, lo: u64, hi: u64) -> Result<&[u8], MergeError> {
        let (what, src) = match source {
            MergeSource::Old => ("old fixed column", self.old),
            MergeSource::New => ("new fixed column", self.new),
        };
        let at = lo as usize * self.width;
        source_slice(what, src, at, (hi - lo) as usize * self.width)
    }
}

/// Write the merged rows of one fixed-width column into `dst`.
///
/// When `prefix_in_place` is set the prefix rows already sit at the head of
/// the destination (append into the existing file) and the cursor must start
/// right after them.
pub(crate) fn merge_fixed(
    plan: &MergePlan,
    index: &MergeIndex,
    src: &FixedSources<'_>,
    dst: &mut DstCursor<'_>,
    prefix_in_place: bool,
) -> Result<u64, MergeError> {
    let width = src.width;
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
                let expected = zone.old.hi as usize * width;
                if dst.position() != expected {
                    return Err(MergeError::StructuralMismatch(format!(
                        "append cursor at byte {} but committed rows end at {expected}",
                        dst.position()
                    )));
                }
            }
            ZoneKind::OldOnly => {
                dst.put(src.rows(MergeSource::Old, zone.old.lo, zone.old.hi)?)?;
                rows += zone.old.len();
            }
            ZoneKind::NewOnly => {
                dst.put(src.rows(MergeSource::New, zone.new.lo, zone.new.hi)?)?;
                rows += zone.new.len();
            }
            ZoneKind::Mixed => {
                for entry in index.entries() {
                    dst.put(src.rows(entry.source, entry.row, entry.row + 1)?)?;
                }
                rows += index.len() as u64;
            }
        }
    }
    Ok(rows)
}
