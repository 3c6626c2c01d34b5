//! The unit of work handed to the worker pool: merge one column of one
//! partition.
//!
//! A task is built fully resolved by the partition coordinator. It carries
//! its mapped sources, its sized destination and a handle to the partition
//! join, and dispatches once on the column shape before entering the copy
//! loop.

use std::sync::Arc;

use super::{
    fixed::{merge_fixed, FixedSources},
    var::{merge_var, VarDestination, VarSource, VarSources},
    DstCursor, MergeError, MergeIndex, MergePlan,
};
use crate::{
    column::{index::write_key_log, index::KEY_ENTRY_WIDTH, ColumnLayout, OFFSET_WIDTH},
    fs::{ReadRegion, WriteRegion},
    observability::log_debug,
    partition::{coordinator::PartitionJoin, open::OpenColumnMode},
};

/// Identifies a task within a commit. `txn` tags the generation of the
/// partition join the task reports to.
#[derive(Debug, Clone)]
pub(crate) struct TaskId {
    pub(crate) txn: u64,
    pub(crate) partition: Arc<str>,
    pub(crate) slot: usize,
}

/// Mapped inputs of a column merge.
pub(crate) enum ColumnSources {
    Fixed {
        width: usize,
        old: ReadRegion,
        new: ReadRegion,
    },
    Variable {
        header_width: usize,
        old_offsets: ReadRegion,
        old_data: ReadRegion,
        new_offsets: ReadRegion,
        new_data: ReadRegion,
    },
}

/// Sized destination regions of a column merge.
pub(crate) enum ColumnTarget {
    Fixed {
        data: WriteRegion,
    },
    Variable {
        offsets: WriteRegion,
        data: WriteRegion,
    },
}

impl ColumnTarget {
    pub(crate) fn flush(&mut self) -> Result<(), MergeError> {
        match self {
            ColumnTarget::Fixed { data } => data.flush()?,
            ColumnTarget::Variable { offsets, data } => {
                offsets.flush()?;
                data.flush()?;
            }
        }
        Ok(())
    }
}

/// Where writing starts in the destination. Non-zero only when appending to
/// the committed file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TargetStart {
    pub(crate) rows: u64,
    pub(crate) data_bytes: usize,
}

/// What a successful task hands back to the partition join.
pub(crate) struct ColumnOutput {
    pub(crate) target: ColumnTarget,
    pub(crate) key_log: Option<WriteRegion>,
    pub(crate) rows_written: u64,
    pub(crate) bytes_written: u64,
}

impl ColumnOutput {
    pub(crate) fn flush(&mut self) -> Result<(), MergeError> {
        self.target.flush()?;
        if let Some(key_log) = self.key_log.as_mut() {
            key_log.flush()?;
        }
        Ok(())
    }
}

pub(crate) struct ColumnMergeTask {
    pub(crate) id: TaskId,
    pub(crate) layout: ColumnLayout,
    pub(crate) mode: OpenColumnMode,
    pub(crate) plan: Arc<MergePlan>,
    pub(crate) index: Arc<MergeIndex>,
    pub(crate) sources: ColumnSources,
    pub(crate) target: ColumnTarget,
    pub(crate) key_log: Option<WriteRegion>,
    pub(crate) start: TargetStart,
    pub(crate) join: Arc<PartitionJoin>,
}

impl ColumnMergeTask {
    /// Merge the column and report to the partition join. The join decides
    /// whether this was the last task of the partition.
    pub(crate) fn run(self) {
        let ColumnMergeTask {
            id,
            layout,
            mode,
            plan,
            index,
            sources,
            mut target,
            mut key_log,
            start,
            join,
        } = self;

        let result = if join.is_failed() {
            // A sibling already failed; the partition rolls back regardless.
            Err(MergeError::Cancelled)
        } else {
            merge_column(
                &layout,
                mode,
                &plan,
                &index,
                &sources,
                &mut target,
                key_log.as_mut(),
                start,
            )
        };
        drop(sources);

        let result = result.map(|(rows_written, bytes_written)| {
            log_debug!(
                component = "merge",
                event = "column_merged",
                txn = id.txn,
                partition = %id.partition,
                column = layout.name(),
                mode = ?mode,
                rows = rows_written,
                bytes = bytes_written,
            );
            ColumnOutput {
                target,
                key_log,
                rows_written,
                bytes_written,
            }
        });
        join.complete(&id, layout.name(), result);
    }
}

#[allow(clippy::too_many_arguments)]
fn merge_column(
    layout: &ColumnLayout,
    mode: OpenColumnMode,
    plan: &MergePlan,
    index: &MergeIndex,
    sources: &ColumnSources,
    target: &mut ColumnTarget,
    key_log: Option<&mut WriteRegion>,
    start: TargetStart,
) -> Result<(u64, u64), MergeError> {
    let in_place = mode == OpenColumnMode::Append;
    let data_name = layout.data_file_name();
    let (rows, bytes) = match (sources, &mut *target) {
        (ColumnSources::Fixed { width, old, new }, ColumnTarget::Fixed { data }) => {
            let capacity = data.len();
            let mut cursor = DstCursor::new(&data_name, data.as_mut_slice(), start.data_bytes)?;
            let rows = merge_fixed(
                plan,
                index,
                &FixedSources {
                    width: *width,
                    old: old.as_slice(),
                    new: new.as_slice(),
                },
                &mut cursor,
                in_place,
            )?;
            expect_filled(&data_name, cursor.position(), capacity)?;
            (rows, (capacity - start.data_bytes) as u64)
        }
        (
            ColumnSources::Variable {
                header_width,
                old_offsets,
                old_data,
                new_offsets,
                new_data,
            },
            ColumnTarget::Variable { offsets, data },
        ) => {
            let offset_name = layout.offset_file_name();
            let (offsets_len, data_len) = (offsets.len(), data.len());
            let mut dst = VarDestination {
                offsets: DstCursor::new(
                    &offset_name,
                    offsets.as_mut_slice(),
                    start.rows as usize * OFFSET_WIDTH,
                )?,
                data: DstCursor::new(&data_name, data.as_mut_slice(), start.data_bytes)?,
            };
            let rows = merge_var(
                plan,
                index,
                &VarSources {
                    header_width: *header_width,
                    old: VarSource {
                        offsets: old_offsets.as_slice(),
                        data: old_data.as_slice(),
                    },
                    new: VarSource {
                        offsets: new_offsets.as_slice(),
                        data: new_data.as_slice(),
                    },
                },
                &mut dst,
                in_place,
            )?;
            expect_filled(&offset_name, dst.offsets.position(), offsets_len)?;
            expect_filled(&data_name, dst.data.position(), data_len)?;
            let written = (offsets_len - start.rows as usize * OFFSET_WIDTH)
                + (data_len - start.data_bytes);
            (rows, written as u64)
        }
        _ => {
            return Err(MergeError::StructuralMismatch(format!(
                "column {} sources and destination disagree on shape",
                layout.name()
            )))
        }
    };

    let mut bytes = bytes;
    if let (Some(key_log), ColumnTarget::Fixed { data }) = (key_log, &*target) {
        let first_row = start.rows;
        let keys = &data.as_slice()[first_row as usize * 4..];
        let name = layout.index_file_name();
        let capacity = key_log.len();
        let mut cursor = DstCursor::new(
            &name,
            key_log.as_mut_slice(),
            first_row as usize * KEY_ENTRY_WIDTH,
        )?;
        write_key_log(keys, first_row, &mut cursor)?;
        expect_filled(&name, cursor.position(), capacity)?;
        bytes += (capacity - first_row as usize * KEY_ENTRY_WIDTH) as u64;
    }
    Ok((rows, bytes))
}

fn expect_filled(target: &str, written: usize, capacity: usize) -> Result<(), MergeError> {
    if written != capacity {
        return Err(MergeError::StructuralMismatch(format!(
            "{target}: sized for {capacity} bytes but merge produced {written}"
        )));
    }
    Ok(())
}
