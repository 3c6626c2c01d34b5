//! Zone planning and the timestamp merge index.
//!
//! A partition merge splits its output into three zones. The prefix and suffix
//! are each fed by a single source and copied verbatim; only the merge zone in
//! between interleaves committed (`Old`) and staged (`New`) rows. The plan is
//! computed once from the timestamp column and every other column of the
//! partition reuses the same row boundaries.

use super::error::MergeError;

/// Origin of one output row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeSource {
    /// Row already committed to the partition.
    Old,
    /// Newly staged row.
    New,
}

/// One output row of the merge zone: which source, and which row of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeEntry {
    /// Source the row is taken from.
    pub source: MergeSource,
    /// Absolute row number within that source.
    pub row: u64,
}

/// Half-open row range `[lo, hi)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RowRange {
    /// First row.
    pub lo: u64,
    /// One past the last row.
    pub hi: u64,
}

impl RowRange {
    /// Range `[lo, hi)`.
    pub const fn new(lo: u64, hi: u64) -> Self {
        Self { lo, hi }
    }

    /// Number of rows covered.
    pub const fn len(&self) -> u64 {
        self.hi - self.lo
    }

    /// Whether the range covers no rows.
    pub const fn is_empty(&self) -> bool {
        self.hi <= self.lo
    }
}

/// Which sources feed a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneKind {
    /// Zone is empty.
    None,
    /// Verbatim copy of committed rows.
    OldOnly,
    /// Verbatim copy of staged rows.
    NewOnly,
    /// Interleaved per the merge index.
    Mixed,
}

/// One of the prefix, merge or suffix zones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Zone {
    /// Source kind.
    pub kind: ZoneKind,
    /// Committed rows consumed by the zone.
    pub old: RowRange,
    /// Staged rows consumed by the zone.
    pub new: RowRange,
}

impl Zone {
    const NONE: Zone = Zone {
        kind: ZoneKind::None,
        old: RowRange::new(0, 0),
        new: RowRange::new(0, 0),
    };

    fn old_only(old: RowRange) -> Self {
        Self::of(old, RowRange::default())
    }

    fn new_only(new: RowRange) -> Self {
        Self::of(RowRange::default(), new)
    }

    fn of(old: RowRange, new: RowRange) -> Self {
        let kind = match (old.is_empty(), new.is_empty()) {
            (true, true) => ZoneKind::None,
            (false, true) => ZoneKind::OldOnly,
            (true, false) => ZoneKind::NewOnly,
            (false, false) => ZoneKind::Mixed,
        };
        Zone { kind, old, new }
    }

    /// Output rows produced by the zone.
    pub fn rows(&self) -> u64 {
        match self.kind {
            ZoneKind::None => 0,
            ZoneKind::OldOnly => self.old.len(),
            ZoneKind::NewOnly => self.new.len(),
            ZoneKind::Mixed => self.old.len() + self.new.len(),
        }
    }
}

/// Little-endian `i64` timestamps viewed over raw column bytes.
#[derive(Debug, Clone, Copy)]
pub struct TimestampView<'a> {
    bytes: &'a [u8],
}

impl<'a> TimestampView<'a> {
    /// View over a timestamp column. Trailing partial elements are ignored.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// Rows available.
    pub fn len(&self) -> u64 {
        (self.bytes.len() / 8) as u64
    }

    /// Whether the view holds no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Timestamp at `row`.
    #[inline]
    pub fn get(&self, row: u64) -> i64 {
        let at = row as usize * 8;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.bytes[at..at + 8]);
        i64::from_le_bytes(buf)
    }

    /// First row in `range` whose timestamp is `>= ts`.
    fn lower_bound(&self, range: RowRange, ts: i64) -> u64 {
        self.partition_point(range, |v| v < ts)
    }

    /// First row in `range` whose timestamp is `> ts`.
    fn upper_bound(&self, range: RowRange, ts: i64) -> u64 {
        self.partition_point(range, |v| v <= ts)
    }

    fn partition_point(&self, range: RowRange, pred: impl Fn(i64) -> bool) -> u64 {
        let (mut lo, mut hi) = (range.lo, range.hi);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if pred(self.get(mid)) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    fn check_sorted(&self, range: RowRange, side: MergeSource) -> Result<(), MergeError> {
        let mut prev = None;
        for row in range.lo..range.hi {
            let next = self.get(row);
            if let Some(prev) = prev {
                if prev > next {
                    return Err(MergeError::MalformedTimestampOrder {
                        side,
                        row,
                        prev,
                        next,
                    });
                }
            }
            prev = Some(next);
        }
        Ok(())
    }
}

/// Ordered `(source, row)` pairs for the merge zone, shared read-only by every
/// column task of a partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeIndex {
    entries: Vec<MergeEntry>,
}

impl MergeIndex {
    /// Stable two-pointer merge of `old[old_range]` and `new[new_range]`.
    /// Equal timestamps keep the committed row first.
    pub fn build(
        old: TimestampView<'_>,
        old_range: RowRange,
        new: TimestampView<'_>,
        new_range: RowRange,
    ) -> Self {
        let mut entries = Vec::with_capacity((old_range.len() + new_range.len()) as usize);
        let (mut i, mut j) = (old_range.lo, new_range.lo);
        while i < old_range.hi && j < new_range.hi {
            if old.get(i) <= new.get(j) {
                entries.push(MergeEntry {
                    source: MergeSource::Old,
                    row: i,
                });
                i += 1;
            } else {
                entries.push(MergeEntry {
                    source: MergeSource::New,
                    row: j,
                });
                j += 1;
            }
        }
        entries.extend((i..old_range.hi).map(|row| MergeEntry {
            source: MergeSource::Old,
            row,
        }));
        entries.extend((j..new_range.hi).map(|row| MergeEntry {
            source: MergeSource::New,
            row,
        }));
        Self { entries }
    }

    /// Entries in output order.
    pub fn entries(&self) -> &[MergeEntry] {
        &self.entries
    }

    /// Number of output rows described.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Zone boundaries of one partition merge, computed from the timestamp column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    src_data_max: u64,
    ooo: RowRange,
    prefix: Zone,
    merge: Zone,
    suffix: Zone,
    min_timestamp: Option<i64>,
    max_timestamp: Option<i64>,
}

impl MergePlan {
    /// Plan the merge of committed rows `[0, src_data_max)` of `old` with staged
    /// rows `ooo` of `new`, and build the merge index for the merge zone.
    ///
    /// The index is empty unless the merge zone is [`ZoneKind::Mixed`].
    pub fn build(
        old: TimestampView<'_>,
        src_data_max: u64,
        new: TimestampView<'_>,
        ooo: RowRange,
    ) -> Result<(Self, MergeIndex), MergeError> {
        if src_data_max > old.len() {
            return Err(MergeError::InvalidRange(format!(
                "committed row count {src_data_max} exceeds timestamp column of {} rows",
                old.len()
            )));
        }
        if ooo.lo > ooo.hi || ooo.hi > new.len() {
            return Err(MergeError::InvalidRange(format!(
                "staged rows [{}, {}) outside buffer of {} rows",
                ooo.lo,
                ooo.hi,
                new.len()
            )));
        }
        let data = RowRange::new(0, src_data_max);
        old.check_sorted(data, MergeSource::Old)?;
        new.check_sorted(ooo, MergeSource::New)?;

        let (prefix, merge, suffix) = Self::zones(old, data, new, ooo);
        let index = if merge.kind == ZoneKind::Mixed {
            MergeIndex::build(old, merge.old, new, merge.new)
        } else {
            MergeIndex::default()
        };

        let bounds = |view: TimestampView<'_>, range: RowRange| {
            (!range.is_empty()).then(|| (view.get(range.lo), view.get(range.hi - 1)))
        };
        let (min_timestamp, max_timestamp) = match (bounds(old, data), bounds(new, ooo)) {
            (Some((a_min, a_max)), Some((b_min, b_max))) => {
                (Some(a_min.min(b_min)), Some(a_max.max(b_max)))
            }
            (Some((min, max)), None) | (None, Some((min, max))) => (Some(min), Some(max)),
            (None, None) => (None, None),
        };

        let plan = Self {
            src_data_max,
            ooo,
            prefix,
            merge,
            suffix,
            min_timestamp,
            max_timestamp,
        };
        debug_assert_eq!(
            plan.merge.kind == ZoneKind::None,
            !plan.ranges_intersect(old, new),
            "merge zone must be empty iff staged rows do not overlap committed rows"
        );
        debug_assert_eq!(plan.output_rows(), src_data_max + ooo.len());
        Ok((plan, index))
    }

    fn zones(
        old: TimestampView<'_>,
        data: RowRange,
        new: TimestampView<'_>,
        ooo: RowRange,
    ) -> (Zone, Zone, Zone) {
        if data.is_empty() {
            return (Zone::new_only(ooo), Zone::NONE, Zone::NONE);
        }
        if ooo.is_empty() {
            return (Zone::old_only(data), Zone::NONE, Zone::NONE);
        }
        let (old_min, old_max) = (old.get(data.lo), old.get(data.hi - 1));
        let (new_min, new_max) = (new.get(ooo.lo), new.get(ooo.hi - 1));

        if new_min >= old_max {
            return (Zone::old_only(data), Zone::NONE, Zone::new_only(ooo));
        }
        if new_max < old_min {
            return (Zone::new_only(ooo), Zone::NONE, Zone::old_only(data));
        }

        let (prefix, old_lo, new_lo) = if new_min < old_min {
            let split = new.lower_bound(ooo, old_min);
            (Zone::new_only(RowRange::new(ooo.lo, split)), data.lo, split)
        } else {
            let split = old.upper_bound(data, new_min);
            (Zone::old_only(RowRange::new(data.lo, split)), split, ooo.lo)
        };
        let (suffix, old_hi, new_hi) = if old_max > new_max {
            let split = old.upper_bound(data, new_max);
            (Zone::old_only(RowRange::new(split, data.hi)), split, ooo.hi)
        } else {
            let split = new.lower_bound(ooo, old_max);
            (Zone::new_only(RowRange::new(split, ooo.hi)), data.hi, split)
        };
        let merge = Zone::of(RowRange::new(old_lo, old_hi), RowRange::new(new_lo, new_hi));
        (prefix, merge, suffix)
    }

    fn ranges_intersect(&self, old: TimestampView<'_>, new: TimestampView<'_>) -> bool {
        if self.src_data_max == 0 || self.ooo.is_empty() {
            return false;
        }
        let (old_min, old_max) = (old.get(0), old.get(self.src_data_max - 1));
        let (new_min, new_max) = (new.get(self.ooo.lo), new.get(self.ooo.hi - 1));
        new_min < old_max && new_max >= old_min
    }

    /// Rows committed before the merge.
    pub fn src_data_max(&self) -> u64 {
        self.src_data_max
    }

    /// Staged rows taking part in the merge.
    pub fn ooo(&self) -> RowRange {
        self.ooo
    }

    /// Leading verbatim zone.
    pub fn prefix(&self) -> Zone {
        self.prefix
    }

    /// Interleaved zone.
    pub fn merge(&self) -> Zone {
        self.merge
    }

    /// Trailing verbatim zone.
    pub fn suffix(&self) -> Zone {
        self.suffix
    }

    /// Zones in output order.
    pub fn zones_in_order(&self) -> [Zone; 3] {
        [self.prefix, self.merge, self.suffix]
    }

    /// `true` for the append fast path: committed rows stay where they are and
    /// staged rows follow them.
    pub fn is_append(&self) -> bool {
        self.src_data_max > 0
            && self.merge.kind == ZoneKind::None
            && self.prefix.kind == ZoneKind::OldOnly
            && self.suffix.kind != ZoneKind::OldOnly
    }

    /// Whether committed rows have to move.
    pub fn touches_existing_rows(&self) -> bool {
        self.src_data_max > 0 && !self.is_append()
    }

    /// Total rows after the merge.
    pub fn output_rows(&self) -> u64 {
        self.prefix.rows() + self.merge.rows() + self.suffix.rows()
    }

    /// Smallest timestamp after the merge.
    pub fn min_timestamp(&self) -> Option<i64> {
        self.min_timestamp
    }

    /// Largest timestamp after the merge.
    pub fn max_timestamp(&self) -> Option<i64> {
        self.max_timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::ts_bytes;

    fn plan(old: &[i64], new: &[i64]) -> (MergePlan, MergeIndex) {
        let old_bytes = ts_bytes(old);
        let new_bytes = ts_bytes(new);
        MergePlan::build(
            TimestampView::new(&old_bytes),
            old.len() as u64,
            TimestampView::new(&new_bytes),
            RowRange::new(0, new.len() as u64),
        )
        .expect("plan")
    }

    fn merged_timestamps(old: &[i64], new: &[i64]) -> Vec<(MergeSource, i64)> {
        let (plan, index) = plan(old, new);
        let mut out = Vec::new();
        for zone in plan.zones_in_order() {
            match zone.kind {
                ZoneKind::None => {}
                ZoneKind::OldOnly => out.extend(
                    (zone.old.lo..zone.old.hi).map(|r| (MergeSource::Old, old[r as usize])),
                ),
                ZoneKind::NewOnly => out.extend(
                    (zone.new.lo..zone.new.hi).map(|r| (MergeSource::New, new[r as usize])),
                ),
                ZoneKind::Mixed => out.extend(index.entries().iter().map(|e| match e.source {
                    MergeSource::Old => (MergeSource::Old, old[e.row as usize]),
                    MergeSource::New => (MergeSource::New, new[e.row as usize]),
                })),
            }
        }
        out
    }

    #[test]
    fn ties_keep_old_before_new() {
        use MergeSource::{New, Old};

        let merged = merged_timestamps(&[1, 3, 3, 5], &[2, 3, 4]);
        assert_eq!(
            merged,
            vec![
                (Old, 1),
                (New, 2),
                (Old, 3),
                (Old, 3),
                (New, 3),
                (New, 4),
                (Old, 5)
            ]
        );

        let (plan, index) = plan(&[1, 3, 3, 5], &[2, 3, 4]);
        assert_eq!(plan.prefix().kind, ZoneKind::OldOnly);
        assert_eq!(plan.prefix().old, RowRange::new(0, 1));
        assert_eq!(plan.merge().kind, ZoneKind::Mixed);
        assert_eq!(plan.suffix().kind, ZoneKind::OldOnly);
        assert_eq!(plan.suffix().old, RowRange::new(3, 4));
        assert_eq!(index.len(), 5);
        assert_eq!(plan.min_timestamp(), Some(1));
        assert_eq!(plan.max_timestamp(), Some(5));
    }

    #[test]
    fn append_fast_path_has_no_merge_zone() {
        let (plan, index) = plan(&[1, 2, 3], &[3, 4]);
        assert!(plan.is_append());
        assert!(!plan.touches_existing_rows());
        assert_eq!(plan.merge().kind, ZoneKind::None);
        assert_eq!(plan.prefix().old, RowRange::new(0, 3));
        assert_eq!(plan.suffix().kind, ZoneKind::NewOnly);
        assert_eq!(plan.suffix().new, RowRange::new(0, 2));
        assert!(index.is_empty());
    }

    #[test]
    fn prepend_moves_old_rows_without_interleaving() {
        let (plan, index) = plan(&[10, 11], &[1, 2, 9]);
        assert!(plan.touches_existing_rows());
        assert_eq!(plan.prefix().kind, ZoneKind::NewOnly);
        assert_eq!(plan.merge().kind, ZoneKind::None);
        assert_eq!(plan.suffix().kind, ZoneKind::OldOnly);
        assert!(index.is_empty());
    }

    #[test]
    fn equal_boundary_timestamp_forces_merge() {
        // new_max == old_min: the old row must precede the staged one.
        let merged = merged_timestamps(&[5, 6], &[1, 5]);
        let sources: Vec<_> = merged.iter().map(|(s, _)| *s).collect();
        assert_eq!(
            sources,
            vec![
                MergeSource::New,
                MergeSource::Old,
                MergeSource::New,
                MergeSource::Old
            ]
        );
    }

    #[test]
    fn single_sourced_merge_zone_inside_old_range() {
        let (plan, index) = plan(&[1, 5], &[2, 3]);
        assert_eq!(plan.prefix().old, RowRange::new(0, 1));
        assert_eq!(plan.merge().kind, ZoneKind::NewOnly);
        assert_eq!(plan.merge().new, RowRange::new(0, 2));
        assert_eq!(plan.suffix().old, RowRange::new(1, 2));
        assert!(index.is_empty());
        assert_eq!(merged_timestamps(&[1, 5], &[2, 3]).len(), 4);
    }

    #[test]
    fn new_partition_is_all_prefix() {
        let (plan, _) = plan(&[], &[4, 7]);
        assert_eq!(plan.prefix().kind, ZoneKind::NewOnly);
        assert_eq!(plan.output_rows(), 2);
        assert!(!plan.is_append());
        assert!(!plan.touches_existing_rows());
    }

    #[test]
    fn unsorted_input_is_rejected() {
        let old = ts_bytes(&[1, 2]);
        let new = ts_bytes(&[5, 3]);
        let err = MergePlan::build(
            TimestampView::new(&old),
            2,
            TimestampView::new(&new),
            RowRange::new(0, 2),
        )
        .expect_err("unsorted");
        assert!(matches!(
            err,
            MergeError::MalformedTimestampOrder {
                side: MergeSource::New,
                row: 1,
                prev: 5,
                next: 3
            }
        ));
    }

    #[test]
    fn out_of_bounds_range_is_rejected() {
        let old = ts_bytes(&[1]);
        let new = ts_bytes(&[2]);
        let err = MergePlan::build(
            TimestampView::new(&old),
            1,
            TimestampView::new(&new),
            RowRange::new(0, 2),
        )
        .expect_err("range");
        assert!(matches!(err, MergeError::InvalidRange(_)));
    }

    #[test]
    fn randomized_merges_are_sorted_and_conserve_rows() {
        let mut rng = fastrand::Rng::with_seed(7);
        for _ in 0..200 {
            let mut old: Vec<i64> = (0..rng.usize(0..20)).map(|_| rng.i64(0..30)).collect();
            let mut new: Vec<i64> = (0..rng.usize(0..20)).map(|_| rng.i64(0..30)).collect();
            old.sort_unstable();
            new.sort_unstable();

            let merged = merged_timestamps(&old, &new);
            assert_eq!(merged.len(), old.len() + new.len());
            assert!(merged.windows(2).all(|w| w[0].1 <= w[1].1));
            for w in merged.windows(2) {
                if w[0].1 == w[1].1 {
                    assert!(!(w[0].0 == MergeSource::New && w[1].0 == MergeSource::Old));
                }
            }
        }
    }
}
