//! Open-column strategy.
//!
//! Decides per partition and per column how the destination is prepared, maps
//! the sources and sizes the destination regions. All file-system work of a
//! partition merge happens here, before any copy loop starts. Every change to
//! the file system is recorded in an [`UndoLog`] first so a failed merge can be
//! reverted to the committed state byte for byte.

use std::path::{Path, PathBuf};

use crate::{
    column::{index::KEY_ENTRY_WIDTH, ColumnKind, ColumnLayout, ColumnType, OFFSET_WIDTH},
    fs::{ColumnFs, FsError, ReadRegion, WriteRegion},
    merge::{
        task::{ColumnSources, ColumnTarget, TargetStart},
        var::{VarSource, VarSources},
        MergeError, MergePlan,
    },
    observability::log_warn,
    staging::StagedColumn,
};

/// How a column's destination file is prepared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenColumnMode {
    /// Fresh file in a brand-new partition.
    Create,
    /// Extend the committed file and write only the staged rows.
    Append,
    /// Fresh file in a new partition generation, written through all zones.
    SplitRewrite,
    /// Fresh file for a column added after the partition was created; the
    /// committed rows are synthesized as nulls.
    CreateBackfill,
}

/// Partition-level outcome of planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionMode {
    /// No committed partition exists.
    New,
    /// Staged rows all sort after the committed ones.
    Append,
    /// Staged rows interleave with or precede committed rows.
    Split,
}

impl PartitionMode {
    /// Decide the partition mode from the committed row count and the plan.
    pub fn of(partition_exists: bool, plan: &MergePlan) -> Self {
        if !partition_exists || plan.src_data_max() == 0 {
            PartitionMode::New
        } else if plan.touches_existing_rows() {
            PartitionMode::Split
        } else {
            PartitionMode::Append
        }
    }

    /// Whether the merge writes into a new partition generation directory.
    pub fn writes_new_generation(&self) -> bool {
        !matches!(self, PartitionMode::Append)
    }
}

/// Decision table for one column.
pub(crate) fn open_column_mode(
    partition_exists: bool,
    column_exists: bool,
    touches_existing_rows: bool,
) -> OpenColumnMode {
    match (partition_exists, column_exists, touches_existing_rows) {
        (false, _, _) => OpenColumnMode::Create,
        (true, false, _) => OpenColumnMode::CreateBackfill,
        (true, true, false) => OpenColumnMode::Append,
        (true, true, true) => OpenColumnMode::SplitRewrite,
    }
}

/// File-system change to revert when a merge does not get published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UndoAction {
    RemoveDir(PathBuf),
    RemoveFile(PathBuf),
    Truncate { path: PathBuf, len: u64 },
}

/// Ordered record of file-system changes made while preparing destinations.
#[derive(Debug, Default)]
pub(crate) struct UndoLog {
    actions: Vec<UndoAction>,
}

impl UndoLog {
    pub(crate) fn push(&mut self, action: UndoAction) {
        self.actions.push(action);
    }

    #[cfg(test)]
    pub(crate) fn actions(&self) -> &[UndoAction] {
        &self.actions
    }

    /// Revert every recorded change, newest first. Keeps going after a failure
    /// and returns the first error seen.
    pub(crate) fn rollback(&self, fs: &dyn ColumnFs) -> Result<(), FsError> {
        let mut first = None;
        for action in self.actions.iter().rev() {
            let result = match action {
                UndoAction::RemoveDir(path) => fs.remove_dir_all(path),
                UndoAction::RemoveFile(path) => fs.remove_file(path),
                UndoAction::Truncate { path, len } => fs.truncate(path, *len),
            };
            match result {
                Ok(()) | Err(FsError::NotFound(_)) => {}
                Err(err) => {
                    log_warn!(
                        component = "partition",
                        event = "undo_failed",
                        action = ?action,
                        error = %err,
                    );
                    first.get_or_insert(err);
                }
            }
        }
        first.map_or(Ok(()), Err)
    }
}

/// Directories a partition merge reads from and writes to.
#[derive(Debug, Clone)]
pub(crate) struct PartitionDirs {
    /// Committed generation, if the partition exists.
    pub(crate) old: Option<PathBuf>,
    /// Destination directory (a new generation unless appending).
    pub(crate) dst: PathBuf,
}

/// Everything a column task needs, produced by [`open_column`].
pub(crate) struct OpenedColumn {
    pub(crate) mode: OpenColumnMode,
    pub(crate) sources: ColumnSources,
    pub(crate) target: ColumnTarget,
    pub(crate) key_log: Option<WriteRegion>,
    pub(crate) start: TargetStart,
}

/// Map the sources and prepare the destination of one column.
pub(crate) fn open_column(
    fs: &dyn ColumnFs,
    layout: &ColumnLayout,
    staged: &StagedColumn,
    plan: &MergePlan,
    partition_mode: PartitionMode,
    dirs: &PartitionDirs,
    undo: &mut UndoLog,
) -> Result<OpenedColumn, MergeError> {
    let column_exists = match &dirs.old {
        Some(dir) => fs.exists(&dir.join(layout.data_file_name())),
        None => false,
    };
    let mode = open_column_mode(
        partition_mode != PartitionMode::New,
        column_exists,
        partition_mode == PartitionMode::Split,
    );
    let committed_rows = plan.src_data_max();
    let output_rows = plan.output_rows();
    let in_place = mode == OpenColumnMode::Append;

    let old = match (mode, &dirs.old) {
        (OpenColumnMode::Append | OpenColumnMode::SplitRewrite, Some(dir)) => {
            OldColumn::map(fs, dir, layout)?
        }
        (OpenColumnMode::CreateBackfill, _) => {
            OldColumn::nulls(layout.column_type(), committed_rows)
        }
        _ => OldColumn::empty(layout.kind()),
    };
    let sources = ColumnSources::new(layout.column_type(), old, staged)?;

    // Appends land in the committed generation; rollback restores its length.
    let mut prepare = |path: PathBuf, len: u64| -> Result<WriteRegion, MergeError> {
        if in_place {
            let committed = fs.file_len(&path)?;
            undo.push(UndoAction::Truncate {
                path: path.clone(),
                len: committed,
            });
        } else if !partition_mode.writes_new_generation() {
            undo.push(UndoAction::RemoveFile(path.clone()));
        }
        Ok(fs.map_write(&path, len)?)
    };

    let (target, start) = match &sources {
        ColumnSources::Fixed { width, .. } => {
            let data = prepare(
                dirs.dst.join(layout.data_file_name()),
                output_rows * *width as u64,
            )?;
            let start = TargetStart {
                rows: if in_place { committed_rows } else { 0 },
                data_bytes: if in_place {
                    (committed_rows * *width as u64) as usize
                } else {
                    0
                },
            };
            (ColumnTarget::Fixed { data }, start)
        }
        ColumnSources::Variable {
            header_width,
            old_offsets,
            old_data,
            new_offsets,
            new_data,
        } => {
            let var = VarSources {
                header_width: *header_width,
                old: VarSource {
                    offsets: old_offsets.as_slice(),
                    data: old_data.as_slice(),
                },
                new: VarSource {
                    offsets: new_offsets.as_slice(),
                    data: new_data.as_slice(),
                },
            };
            let committed_data = if in_place {
                var.old
                    .span("old var column", 0, committed_rows, *header_width)?
                    .1
            } else {
                0
            };
            let data_len = committed_data + var.merged_data_len(plan, in_place)?;
            let offsets = prepare(
                dirs.dst.join(layout.offset_file_name()),
                output_rows * OFFSET_WIDTH as u64,
            )?;
            let data = prepare(dirs.dst.join(layout.data_file_name()), data_len as u64)?;
            let start = TargetStart {
                rows: if in_place { committed_rows } else { 0 },
                data_bytes: committed_data,
            };
            (ColumnTarget::Variable { offsets, data }, start)
        }
    };

    let key_log = if layout.is_indexed() {
        let path = dirs.dst.join(layout.index_file_name());
        // A column can be indexed without a key log if the log went missing;
        // rebuilding it from scratch is only possible when rewriting.
        if in_place && !fs.exists(&path) {
            return Err(MergeError::StructuralMismatch(format!(
                "indexed column {} has no key log in {}",
                layout.name(),
                dirs.dst.display()
            )));
        }
        Some(prepare(path, output_rows * KEY_ENTRY_WIDTH as u64)?)
    } else {
        None
    };

    Ok(OpenedColumn {
        mode,
        sources,
        target,
        key_log,
        start,
    })
}

/// Committed bytes of one column, mapped or synthesized.
pub(crate) enum OldColumn {
    Fixed(ReadRegion),
    Variable { offsets: ReadRegion, data: ReadRegion },
}

impl OldColumn {
    fn map(fs: &dyn ColumnFs, dir: &Path, layout: &ColumnLayout) -> Result<Self, FsError> {
        let data = fs.map_read(&dir.join(layout.data_file_name()))?;
        Ok(match layout.kind() {
            ColumnKind::Fixed(_) => OldColumn::Fixed(data),
            ColumnKind::Variable => OldColumn::Variable {
                offsets: fs.map_read(&dir.join(layout.offset_file_name()))?,
                data,
            },
        })
    }

    fn empty(kind: ColumnKind) -> Self {
        match kind {
            ColumnKind::Fixed(_) => OldColumn::Fixed(ReadRegion::empty()),
            ColumnKind::Variable => OldColumn::Variable {
                offsets: ReadRegion::empty(),
                data: ReadRegion::empty(),
            },
        }
    }

    /// `rows` nulls in the column's physical encoding.
    pub(crate) fn nulls(column_type: ColumnType, rows: u64) -> Self {
        let rows = rows as usize;
        match (column_type.null_value(), column_type.var_header_width()) {
            (Some(null), _) => OldColumn::Fixed(ReadRegion::from_vec(null.repeat(rows))),
            (None, Some(header_width)) => {
                let mut header = Vec::with_capacity(header_width);
                column_type.encode_var_header(crate::column::VAR_NULL_LEN, &mut header);
                let offsets = (0..rows)
                    .flat_map(|row| ((row * header_width) as u64).to_le_bytes())
                    .collect();
                OldColumn::Variable {
                    offsets: ReadRegion::from_vec(offsets),
                    data: ReadRegion::from_vec(header.repeat(rows)),
                }
            }
            (None, None) => OldColumn::Fixed(ReadRegion::empty()),
        }
    }
}

impl ColumnSources {
    fn new(
        column_type: ColumnType,
        old: OldColumn,
        staged: &StagedColumn,
    ) -> Result<Self, MergeError> {
        match (column_type.kind(), old, staged) {
            (ColumnKind::Fixed(width), OldColumn::Fixed(old), StagedColumn::Fixed(new)) => {
                Ok(ColumnSources::Fixed {
                    width,
                    old,
                    new: new.clone(),
                })
            }
            (
                ColumnKind::Variable,
                OldColumn::Variable {
                    offsets: old_offsets,
                    data: old_data,
                },
                StagedColumn::Variable { offsets, data },
            ) => Ok(ColumnSources::Variable {
                header_width: column_type.var_header_width().unwrap_or(8),
                old_offsets,
                old_data,
                new_offsets: offsets.clone(),
                new_data: data.clone(),
            }),
            _ => Err(MergeError::StructuralMismatch(format!(
                "staged data shape does not match {column_type} column"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fs::MemFs,
        merge::{RowRange, TimestampView},
        test_util::ts_bytes,
    };

    #[test]
    fn decision_table() {
        assert_eq!(open_column_mode(false, false, false), OpenColumnMode::Create);
        assert_eq!(open_column_mode(true, true, false), OpenColumnMode::Append);
        assert_eq!(open_column_mode(true, true, true), OpenColumnMode::SplitRewrite);
        assert_eq!(open_column_mode(true, false, false), OpenColumnMode::CreateBackfill);
        assert_eq!(open_column_mode(true, false, true), OpenColumnMode::CreateBackfill);
    }

    #[test]
    fn synthesized_nulls_use_type_sentinels() {
        match OldColumn::nulls(ColumnType::Int, 2) {
            OldColumn::Fixed(region) => {
                let nulls = [i32::MIN.to_le_bytes(), i32::MIN.to_le_bytes()].concat();
                assert_eq!(region.as_slice(), &nulls[..]);
            }
            OldColumn::Variable { .. } => panic!("int column must be fixed"),
        }
        match OldColumn::nulls(ColumnType::String, 2) {
            OldColumn::Variable { offsets, data } => {
                assert_eq!(crate::column::read_offset(offsets.as_slice(), 1), 4);
                assert_eq!(crate::column::read_var_len(data.as_slice(), 4, 4), -1);
                assert_eq!(data.len(), 8);
            }
            OldColumn::Fixed(_) => panic!("string column must be variable"),
        }
    }

    #[test]
    fn append_records_truncate_to_committed_length() {
        let fs = MemFs::new();
        let dir = PathBuf::from("t/p.1");
        fs.create_dir_all(&dir).expect("mkdir");
        let layout = ColumnLayout::new("v", ColumnType::Long);
        drop(fs.map_write(&dir.join("v.d"), 16).expect("seed"));

        let (old_ts, new_ts) = (ts_bytes(&[1, 2]), ts_bytes(&[3]));
        let (plan, _) = MergePlan::build(
            TimestampView::new(&old_ts),
            2,
            TimestampView::new(&new_ts),
            RowRange::new(0, 1),
        )
        .expect("plan");
        let mut undo = UndoLog::default();
        let staged = StagedColumn::Fixed(ReadRegion::from_vec(vec![9u8; 8]));
        let dirs = PartitionDirs {
            old: Some(dir.clone()),
            dst: dir.clone(),
        };
        let opened = open_column(
            &fs,
            &layout,
            &staged,
            &plan,
            PartitionMode::Append,
            &dirs,
            &mut undo,
        )
        .expect("open");
        assert_eq!(opened.mode, OpenColumnMode::Append);
        assert_eq!(opened.start.rows, 2);
        assert_eq!(opened.start.data_bytes, 16);
        assert_eq!(
            undo.actions(),
            &[UndoAction::Truncate {
                path: dir.join("v.d"),
                len: 16
            }]
        );
        drop(opened);
        assert_eq!(fs.file_len(&dir.join("v.d")).expect("len"), 24);
        undo.rollback(&fs).expect("rollback");
        assert_eq!(fs.file_len(&dir.join("v.d")).expect("len"), 16);
    }
}
