//! Out-of-order merge core.
//!
//! [`index`] plans the prefix/merge/suffix zones and builds the shared merge
//! index; [`fixed`] and [`var`] are the per-column copy loops; [`task`] wraps
//! them into the unit of work dispatched to the worker pool.

pub(crate) mod error;
pub(crate) mod fixed;
pub mod index;
pub(crate) mod task;
pub(crate) mod var;

pub use error::{FailureClass, MergeError};
pub use index::{
    MergeEntry, MergeIndex, MergePlan, MergeSource, RowRange, TimestampView, Zone, ZoneKind,
};

/// Forward-only writer over a destination region.
///
/// Writes are bounds-checked; running out of space is reported as
/// [`MergeError::ResourceExhaustion`] instead of a panic.
pub(crate) struct DstCursor<'a> {
    target: &'a str,
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> DstCursor<'a> {
    pub(crate) fn new(
        target: &'a str,
        buf: &'a mut [u8],
        start: usize,
    ) -> Result<Self, MergeError> {
        if start > buf.len() {
            return Err(MergeError::ResourceExhaustion {
                target: target.to_string(),
                needed: start,
                available: buf.len(),
            });
        }
        Ok(Self {
            target,
            buf,
            pos: start,
        })
    }

    #[inline]
    pub(crate) fn put(&mut self, bytes: &[u8]) -> Result<(), MergeError> {
        let end = self.pos + bytes.len();
        let Some(dst) = self.buf.get_mut(self.pos..end) else {
            return Err(MergeError::ResourceExhaustion {
                target: self.target.to_string(),
                needed: end,
                available: self.buf.len(),
            });
        };
        dst.copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    #[inline]
    pub(crate) fn put_u64(&mut self, value: u64) -> Result<(), MergeError> {
        self.put(&value.to_le_bytes())
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }
}

/// Borrow `len` bytes at `at` from a source region, or report corruption.
#[inline]
pub(crate) fn source_slice<'a>(
    what: &str,
    src: &'a [u8],
    at: usize,
    len: usize,
) -> Result<&'a [u8], MergeError> {
    src.get(at..at + len).ok_or_else(|| {
        MergeError::StructuralMismatch(format!(
            "{what}: bytes [{at}, {}) outside source of {} bytes",
            at + len,
            src.len()
        ))
    })
}
