//! Per-partition merge coordination.
//!
//! Planning (reading the timestamp column, building the plan and index once,
//! opening every column) runs as one job on the worker pool. It then fans out
//! one [`ColumnMergeTask`] per column. Each task reports to the shared
//! [`PartitionJoin`]; the task whose report brings the countdown to zero runs
//! finalize, or rollback if any sibling failed, and answers the caller over a
//! oneshot channel.

use std::{
    mem,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::open::{open_column, OpenedColumn, PartitionDirs, PartitionMode, UndoAction, UndoLog};
use crate::{
    column::ColumnLayout,
    executor::Executor,
    fs::{ColumnFs, ReadRegion},
    merge::{
        task::{ColumnMergeTask, ColumnOutput, TaskId},
        MergeError, MergeIndex, MergePlan, TimestampView,
    },
    metrics::MergeMetrics,
    observability::{log_debug, log_info, log_warn},
    option::CommitMode,
    schema::TableSchema,
    staging::{StagedColumn, StagedPartition},
    version::{edit::VersionEdit, PartitionMeta},
};

/// Why a partition merge did not produce an outcome.
#[derive(Debug)]
pub(crate) struct PartitionFailure {
    pub(crate) partition: String,
    pub(crate) column: Option<String>,
    pub(crate) error: MergeError,
}

pub(crate) type PartitionResult = Result<PartitionOutcome, PartitionFailure>;

/// A finalized, not yet published partition merge.
#[derive(Debug)]
pub(crate) struct PartitionOutcome {
    pub(crate) meta: PartitionMeta,
    pub(crate) mode: PartitionMode,
    pub(crate) undo: UndoLog,
    pub(crate) superseded: Option<PathBuf>,
    pub(crate) rows_written: u64,
}

impl PartitionOutcome {
    pub(crate) fn to_version_edit(&self) -> VersionEdit {
        VersionEdit::PutPartition(self.meta.clone())
    }

    /// Revert the partition to its committed state. Used when a sibling
    /// partition or the metadata publish fails.
    pub(crate) fn rollback(&self, fs: &dyn ColumnFs) {
        if let Err(err) = self.undo.rollback(fs) {
            log_warn!(
                component = "partition",
                event = "rollback_incomplete",
                partition = self.meta.name(),
                error = %err,
            );
        }
    }
}

/// State finalize or rollback needs once every column task has reported.
struct Finisher {
    fs: Arc<dyn ColumnFs>,
    commit_mode: CommitMode,
    cancel: CancellationToken,
    metrics: Arc<MergeMetrics>,
    dirs: PartitionDirs,
    mode: PartitionMode,
    meta: PartitionMeta,
    undo: UndoLog,
    superseded: Option<PathBuf>,
    reply: oneshot::Sender<PartitionResult>,
}

impl Finisher {
    fn finalize(&self, mut outputs: Vec<ColumnOutput>) -> Result<u64, MergeError> {
        if self.cancel.is_cancelled() {
            return Err(MergeError::Cancelled);
        }
        if self.commit_mode == CommitMode::Sync {
            for output in outputs.iter_mut() {
                output.flush()?;
            }
        }
        let rows = outputs.first().map_or(0, |output| output.rows_written);
        let bytes = outputs.iter().map(|output| output.bytes_written).sum();
        // Unmap before the directory sync.
        drop(outputs);
        if self.commit_mode == CommitMode::Sync {
            self.fs.sync_dir(&self.dirs.dst)?;
        }
        self.metrics.record_partition(self.mode, rows, bytes);
        Ok(rows)
    }

    fn rollback(&self, failure: &PartitionFailure) {
        self.metrics.record_rollback();
        log_warn!(
            component = "partition",
            event = "rollback",
            partition = %failure.partition,
            column = failure.column.as_deref().unwrap_or("-"),
            error = %failure.error,
        );
        if let Err(err) = self.undo.rollback(self.fs.as_ref()) {
            log_warn!(
                component = "partition",
                event = "rollback_incomplete",
                partition = %failure.partition,
                error = %err,
            );
        }
    }
}

/// Completion barrier shared by the column tasks of one partition merge.
pub(crate) struct PartitionJoin {
    txn: u64,
    partition: Arc<str>,
    remaining: AtomicUsize,
    failed: AtomicBool,
    outputs: Mutex<Vec<Option<ColumnOutput>>>,
    failure: Mutex<Option<PartitionFailure>>,
    finisher: Mutex<Option<Finisher>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PartitionJoin {
    fn new(txn: u64, partition: Arc<str>, tasks: usize, finisher: Finisher) -> Self {
        Self {
            txn,
            partition,
            remaining: AtomicUsize::new(tasks),
            failed: AtomicBool::new(false),
            outputs: Mutex::new((0..tasks).map(|_| None).collect()),
            failure: Mutex::new(None),
            finisher: Mutex::new(Some(finisher)),
        }
    }

    /// Whether some task of the partition already failed.
    pub(crate) fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Record the first failure; later ones are only logged.
    fn fail(&self, column: Option<&str>, error: MergeError) {
        let mut failure = lock(&self.failure);
        if failure.is_none() {
            *failure = Some(PartitionFailure {
                partition: self.partition.to_string(),
                column: column.map(str::to_string),
                error,
            });
            self.failed.store(true, Ordering::Release);
        } else {
            log_debug!(
                component = "partition",
                event = "secondary_failure",
                partition = %self.partition,
                column = column.unwrap_or("-"),
                error = %error,
            );
        }
    }

    /// Report one column task. The report that completes the countdown
    /// finalizes or rolls back the partition.
    pub(crate) fn complete(
        &self,
        id: &TaskId,
        column: &str,
        result: Result<ColumnOutput, MergeError>,
    ) {
        if id.txn != self.txn || id.partition != self.partition {
            self.fail(
                Some(column),
                MergeError::StructuralMismatch(format!(
                    "task of {}@{} reported to join of {}@{}",
                    id.partition, id.txn, self.partition, self.txn
                )),
            );
        } else {
            match result {
                Ok(output) => match lock(&self.outputs).get_mut(id.slot) {
                    Some(slot) if slot.is_none() => *slot = Some(output),
                    _ => self.fail(
                        Some(column),
                        MergeError::StructuralMismatch(format!(
                            "duplicate or unknown task slot {}",
                            id.slot
                        )),
                    ),
                },
                Err(error) => self.fail(Some(column), error),
            }
        }

        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish();
        }
    }

    fn finish(&self) {
        let Some(finisher) = lock(&self.finisher).take() else {
            return;
        };
        let outputs: Vec<ColumnOutput> = mem::take(&mut *lock(&self.outputs))
            .into_iter()
            .flatten()
            .collect();
        let failure = lock(&self.failure).take();

        let result = match failure {
            Some(failure) => {
                drop(outputs);
                Err(failure)
            }
            None => finisher.finalize(outputs).map_err(|error| PartitionFailure {
                partition: self.partition.to_string(),
                column: None,
                error,
            }),
        };
        let rows_written = match result {
            Ok(rows) => rows,
            Err(failure) => {
                finisher.rollback(&failure);
                let _ = finisher.reply.send(Err(failure));
                return;
            }
        };
        let Finisher {
            fs,
            dirs,
            mode,
            meta,
            undo,
            superseded,
            reply,
            ..
        } = finisher;

        log_info!(
            component = "partition",
            event = "finalized",
            txn = self.txn,
            partition = %self.partition,
            dir = %dirs.dst.display(),
            mode = ?mode,
            rows = meta.row_count(),
        );
        let outcome = PartitionOutcome {
            meta,
            mode,
            undo,
            superseded,
            rows_written,
        };
        if let Err(Ok(outcome)) = reply.send(Ok(outcome)) {
            // Nobody is left to publish the partition.
            outcome.rollback(fs.as_ref());
        }
    }
}

/// Plans and drives the merge of one staged partition.
pub(crate) struct PartitionMergeCoordinator<E> {
    fs: Arc<dyn ColumnFs>,
    executor: Arc<E>,
    table_dir: PathBuf,
    txn: u64,
    schema: Arc<TableSchema>,
    staged: StagedPartition,
    existing: Option<PartitionMeta>,
    commit_mode: CommitMode,
    cancel: CancellationToken,
    metrics: Arc<MergeMetrics>,
}

struct Prepared {
    plan: Arc<MergePlan>,
    index: Arc<MergeIndex>,
    mode: PartitionMode,
    dirs: PartitionDirs,
    meta: PartitionMeta,
    superseded: Option<PathBuf>,
    columns: Vec<(ColumnLayout, OpenedColumn)>,
}

impl<E> PartitionMergeCoordinator<E>
where
    E: Executor,
{
    pub(crate) fn new(
        fs: Arc<dyn ColumnFs>,
        executor: Arc<E>,
        table_dir: PathBuf,
        txn: u64,
        schema: Arc<TableSchema>,
        staged: StagedPartition,
        existing: Option<PartitionMeta>,
    ) -> Self {
        Self {
            fs,
            executor,
            table_dir,
            txn,
            schema,
            staged,
            existing,
            commit_mode: CommitMode::Sync,
            cancel: CancellationToken::new(),
            metrics: Arc::new(MergeMetrics::default()),
        }
    }

    pub(crate) fn with_commit_mode(mut self, commit_mode: CommitMode) -> Self {
        self.commit_mode = commit_mode;
        self
    }

    pub(crate) fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub(crate) fn with_metrics(mut self, metrics: Arc<MergeMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Schedule planning on the worker pool. The receiver yields once, after
    /// the partition finalized or rolled back.
    pub(crate) fn dispatch(self) -> oneshot::Receiver<PartitionResult> {
        let (reply, receiver) = oneshot::channel();
        let executor = self.executor.clone();
        executor.spawn_blocking(move || self.run(reply));
        receiver
    }

    fn run(self, reply: oneshot::Sender<PartitionResult>) {
        let partition: Arc<str> = Arc::from(self.staged.name());
        let mut undo = UndoLog::default();
        let prepared = match self.cancel.is_cancelled() {
            true => Err((None, MergeError::Cancelled)),
            false => self.prepare(&mut undo),
        };
        let prepared = match prepared {
            Ok(prepared) if !self.cancel.is_cancelled() => prepared,
            result => {
                let (column, error) = match result {
                    Ok(prepared) => {
                        drop(prepared);
                        (None, MergeError::Cancelled)
                    }
                    Err(failure) => failure,
                };
                self.metrics.record_rollback();
                log_warn!(
                    component = "partition",
                    event = "plan_failed",
                    txn = self.txn,
                    partition = %partition,
                    column = column.as_deref().unwrap_or("-"),
                    error = %error,
                );
                if let Err(err) = undo.rollback(self.fs.as_ref()) {
                    log_warn!(
                        component = "partition",
                        event = "rollback_incomplete",
                        partition = %partition,
                        error = %err,
                    );
                }
                let _ = reply.send(Err(PartitionFailure {
                    partition: partition.to_string(),
                    column,
                    error,
                }));
                return;
            }
        };

        let Prepared {
            plan,
            index,
            mode,
            dirs,
            meta,
            superseded,
            columns,
        } = prepared;
        log_debug!(
            component = "partition",
            event = "planned",
            txn = self.txn,
            partition = %partition,
            mode = ?mode,
            prefix = ?plan.prefix().kind,
            merge = ?plan.merge().kind,
            suffix = ?plan.suffix().kind,
            merge_rows = index.len(),
        );

        let join = Arc::new(PartitionJoin::new(
            self.txn,
            partition.clone(),
            columns.len(),
            Finisher {
                fs: self.fs.clone(),
                commit_mode: self.commit_mode,
                cancel: self.cancel.clone(),
                metrics: self.metrics.clone(),
                dirs,
                mode,
                meta,
                undo,
                superseded,
                reply,
            },
        ));
        for (slot, (layout, opened)) in columns.into_iter().enumerate() {
            let task = ColumnMergeTask {
                id: TaskId {
                    txn: self.txn,
                    partition: partition.clone(),
                    slot,
                },
                layout,
                mode: opened.mode,
                plan: plan.clone(),
                index: index.clone(),
                sources: opened.sources,
                target: opened.target,
                key_log: opened.key_log,
                start: opened.start,
                join: join.clone(),
            };
            self.executor.spawn_blocking(move || task.run());
        }
    }

    fn prepare(&self, undo: &mut UndoLog) -> Result<Prepared, (Option<String>, MergeError)> {
        let whole = |error: MergeError| (None, error);
        let columns = self.schema.columns();
        if self.staged.columns().len() != columns.len() {
            return Err(whole(MergeError::StructuralMismatch(format!(
                "partition {} staged {} columns, table has {}",
                self.staged.name(),
                self.staged.columns().len(),
                columns.len()
            ))));
        }

        let timestamp = self.schema.timestamp_column();
        let new_ts = match &self.staged.columns()[self.schema.timestamp_index()] {
            StagedColumn::Fixed(region) => region.clone(),
            StagedColumn::Variable { .. } => {
                return Err(whole(MergeError::StructuralMismatch(
                    "designated timestamp staged as variable-length".to_string(),
                )))
            }
        };
        let old_dir = self
            .existing
            .as_ref()
            .map(|meta| self.table_dir.join(meta.dir_name()));
        let committed = self.existing.as_ref().map_or(0, PartitionMeta::row_count);
        let old_ts = match &old_dir {
            Some(dir) if committed > 0 => self
                .fs
                .map_read(&dir.join(timestamp.data_file_name()))
                .map_err(|e| whole(e.into()))?,
            _ => ReadRegion::empty(),
        };

        let (plan, index) = MergePlan::build(
            TimestampView::new(old_ts.as_slice()),
            committed,
            TimestampView::new(new_ts.as_slice()),
            self.staged.rows(),
        )
        .map_err(whole)?;
        drop(old_ts);

        let mode = PartitionMode::of(self.existing.is_some(), &plan);
        let name = self.staged.name();
        let (dirs, generation, superseded) = match (mode, &self.existing) {
            (PartitionMode::Append, Some(meta)) => (
                PartitionDirs {
                    old: old_dir.clone(),
                    dst: self.table_dir.join(meta.dir_name()),
                },
                meta.generation(),
                None,
            ),
            _ => {
                let dst = self.table_dir.join(PartitionMeta::dir_name_of(name, self.txn));
                undo.push(UndoAction::RemoveDir(dst.clone()));
                if self.fs.exists(&dst) {
                    // Leftover of an unpublished attempt at this txn.
                    self.fs.remove_dir_all(&dst).map_err(|e| whole(e.into()))?;
                }
                self.fs.create_dir_all(&dst).map_err(|e| whole(e.into()))?;
                (
                    PartitionDirs {
                        old: old_dir.clone().filter(|_| committed > 0),
                        dst,
                    },
                    self.txn,
                    old_dir,
                )
            }
        };

        let mut opened = Vec::with_capacity(columns.len());
        for (layout, staged) in columns.iter().zip(self.staged.columns()) {
            let column = open_column(self.fs.as_ref(), layout, staged, &plan, mode, &dirs, undo)
                .map_err(|e| (Some(layout.name().to_string()), e))?;
            opened.push((layout.clone(), column));
        }

        let meta = PartitionMeta::new(
            name,
            generation,
            plan.output_rows(),
            plan.min_timestamp(),
            plan.max_timestamp(),
        );
        Ok(Prepared {
            plan: Arc::new(plan),
            index: Arc::new(index),
            mode,
            dirs,
            meta,
            superseded,
            columns: opened,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tokio::sync::oneshot::error::TryRecvError;

    use super::*;
    use crate::{
        column::ColumnType,
        fs::{FsOp, MemFs},
        schema::PartitionBy,
        test_util::{read_var_column, ts_bytes, var_column, DeferredExecutor},
    };

    fn schema() -> Arc<TableSchema> {
        Arc::new(
            TableSchema::new(
                vec![
                    ColumnLayout::new("ts", ColumnType::Timestamp),
                    ColumnLayout::new("price", ColumnType::Double),
                    ColumnLayout::new("qty", ColumnType::Int),
                    ColumnLayout::new("sym", ColumnType::Symbol).indexed(),
                    ColumnLayout::new("note", ColumnType::String),
                ],
                "ts",
                PartitionBy::None,
            )
            .expect("schema"),
        )
    }

    /// Sorted `timestamps` with derived columns. `qty` is `ts + base`, so rows
    /// with equal timestamps can be told apart.
    fn staged(timestamps: &[i64], base: i32) -> StagedPartition {
        let price = timestamps.iter().flat_map(|ts| (*ts as f64).to_le_bytes()).collect();
        let qty = timestamps
            .iter()
            .flat_map(|ts| (*ts as i32 + base).to_le_bytes())
            .collect();
        let sym = timestamps.iter().flat_map(|ts| ((*ts % 3) as i32).to_le_bytes()).collect();
        let notes: Vec<Vec<u8>> =
            timestamps.iter().map(|ts| format!("n{ts}").into_bytes()).collect();
        let note_refs: Vec<Option<&[u8]>> = timestamps
            .iter()
            .zip(&notes)
            .map(|(ts, note)| (ts % 20 != 0).then_some(note.as_slice()))
            .collect();
        let (offsets, data) = var_column(ColumnType::String, &note_refs);
        StagedPartition::new(
            "p",
            timestamps.len() as u64,
            vec![
                StagedColumn::Fixed(ReadRegion::from_vec(ts_bytes(timestamps))),
                StagedColumn::Fixed(ReadRegion::from_vec(price)),
                StagedColumn::Fixed(ReadRegion::from_vec(qty)),
                StagedColumn::Fixed(ReadRegion::from_vec(sym)),
                StagedColumn::Variable {
                    offsets: ReadRegion::from_vec(offsets),
                    data: ReadRegion::from_vec(data),
                },
            ],
        )
    }

    fn coordinator(
        fs: &MemFs,
        executor: &Arc<DeferredExecutor>,
        txn: u64,
        staged: StagedPartition,
        existing: Option<PartitionMeta>,
    ) -> PartitionMergeCoordinator<DeferredExecutor> {
        PartitionMergeCoordinator::new(
            Arc::new(fs.clone()),
            executor.clone(),
            PathBuf::from("t"),
            txn,
            schema(),
            staged,
            existing,
        )
    }

    fn read_i64s(fs: &MemFs, path: &str) -> Vec<i64> {
        fs.file(Path::new(path))
            .expect("file")
            .chunks_exact(8)
            .map(|chunk| i64::from_le_bytes(chunk.try_into().expect("chunk")))
            .collect()
    }

    fn committed(
        fs: &MemFs,
        executor: &Arc<DeferredExecutor>,
        timestamps: &[i64],
    ) -> PartitionMeta {
        let mut rx = coordinator(fs, executor, 1, staged(timestamps, 0), None).dispatch();
        executor.run_all(&mut fastrand::Rng::with_seed(7));
        rx.try_recv().expect("reply").expect("merge").meta
    }

    #[test]
    fn finalizes_once_after_the_last_column_task() {
        for seed in 0..16 {
            let fs = MemFs::new();
            let executor = Arc::new(DeferredExecutor::default());
            let mut rng = fastrand::Rng::with_seed(seed);
            let mut rx =
                coordinator(&fs, &executor, 1, staged(&[10, 10, 20, 30], 0), None).dispatch();

            assert!(executor.run_one(&mut rng));
            assert_eq!(executor.pending(), 5);
            while executor.pending() > 1 {
                assert!(executor.run_one(&mut rng));
                assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
            }
            assert!(executor.run_one(&mut rng));
            let outcome = rx.try_recv().expect("reply").expect("merge");
            assert_eq!(outcome.mode, PartitionMode::New);
            assert_eq!(outcome.meta.row_count(), 4);
            assert_eq!(outcome.meta.dir_name(), "p.1");
            assert_eq!(outcome.meta.min_timestamp(), Some(10));
            assert_eq!(outcome.meta.max_timestamp(), Some(30));
            assert_eq!(read_i64s(&fs, "t/p.1/ts.d"), vec![10, 10, 20, 30]);
            assert_eq!(executor.pending(), 0);
        }
    }

    #[test]
    fn variable_column_interleaves_committed_and_staged_rows() {
        let fs = MemFs::new();
        let executor = Arc::new(DeferredExecutor::default());
        let meta = committed(&fs, &executor, &[10, 30]);

        let mut rx = coordinator(&fs, &executor, 2, staged(&[5, 20], 0), Some(meta)).dispatch();
        executor.run_all(&mut fastrand::Rng::with_seed(1));
        let outcome = rx.try_recv().expect("reply").expect("merge");
        assert_eq!(outcome.mode, PartitionMode::Split);

        let offsets = fs.file(Path::new("t/p.2/note.i")).expect("offsets");
        let data = fs.file(Path::new("t/p.2/note.d")).expect("data");
        assert_eq!(
            read_var_column(&offsets, &data, 4, 4),
            vec![
                Some(b"n5".to_vec()),
                Some(b"n10".to_vec()),
                None,
                Some(b"n30".to_vec()),
            ]
        );
    }

    #[test]
    fn append_keeps_the_generation_and_rolls_back_byte_identical() {
        let fs = MemFs::new();
        let executor = Arc::new(DeferredExecutor::default());
        let meta = committed(&fs, &executor, &[1, 2, 3]);
        let before: Vec<_> = fs.paths().into_iter().map(|p| (fs.file(&p), p)).collect();

        fs.fail_on(FsOp::Flush, "qty.d");
        let mut rx =
            coordinator(&fs, &executor, 2, staged(&[4, 5], 0), Some(meta.clone())).dispatch();
        executor.run_all(&mut fastrand::Rng::with_seed(3));
        let failure = rx.try_recv().expect("reply").expect_err("flush fault");
        assert_eq!(failure.partition, "p");
        assert!(matches!(failure.error, MergeError::Io(_)));

        let after: Vec<_> = fs.paths().into_iter().map(|p| (fs.file(&p), p)).collect();
        assert_eq!(before, after);

        let mut rx = coordinator(&fs, &executor, 2, staged(&[4, 5], 0), Some(meta)).dispatch();
        executor.run_all(&mut fastrand::Rng::with_seed(4));
        let outcome = rx.try_recv().expect("reply").expect("append");
        assert_eq!(outcome.mode, PartitionMode::Append);
        assert_eq!(outcome.meta.dir_name(), "p.1");
        assert_eq!(outcome.rows_written, 2);
        assert!(outcome.superseded.is_none());
        assert_eq!(read_i64s(&fs, "t/p.1/ts.d"), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn split_writes_a_new_generation() {
        let fs = MemFs::new();
        let executor = Arc::new(DeferredExecutor::default());
        let meta = committed(&fs, &executor, &[10, 20, 30]);

        let mut rx = coordinator(&fs, &executor, 2, staged(&[5, 20], 100), Some(meta)).dispatch();
        executor.run_all(&mut fastrand::Rng::with_seed(11));
        let outcome = rx.try_recv().expect("reply").expect("split");
        assert_eq!(outcome.mode, PartitionMode::Split);
        assert_eq!(outcome.meta.dir_name(), "p.2");
        assert_eq!(outcome.superseded, Some(PathBuf::from("t/p.1")));
        assert_eq!(read_i64s(&fs, "t/p.2/ts.d"), vec![5, 10, 20, 20, 30]);
        assert_eq!(read_i64s(&fs, "t/p.1/ts.d"), vec![10, 20, 30]);
        // The committed 20 stays ahead of the staged one.
        let qty: Vec<i32> = fs
            .file(Path::new("t/p.2/qty.d"))
            .expect("qty")
            .chunks_exact(4)
            .map(|chunk| i32::from_le_bytes(chunk.try_into().expect("chunk")))
            .collect();
        assert_eq!(qty, vec![105, 10, 20, 120, 30]);
    }

    #[test]
    fn open_failure_removes_the_new_generation() {
        let fs = MemFs::new();
        let executor = Arc::new(DeferredExecutor::default());
        fs.fail_on(FsOp::MapWrite, "note.i");
        let mut rx = coordinator(&fs, &executor, 1, staged(&[1, 2], 0), None).dispatch();
        executor.run_all(&mut fastrand::Rng::with_seed(5));

        let failure = rx.try_recv().expect("reply").expect_err("map fault");
        assert_eq!(failure.column.as_deref(), Some("note"));
        assert!(fs.paths().is_empty());
        assert!(!fs.exists(Path::new("t/p.1")));
    }

    #[test]
    fn cancellation_after_planning_rolls_back() {
        let fs = MemFs::new();
        let executor = Arc::new(DeferredExecutor::default());
        let cancel = CancellationToken::new();
        let mut rx = coordinator(&fs, &executor, 1, staged(&[1, 2], 0), None)
            .with_cancel(cancel.clone())
            .dispatch();
        let mut rng = fastrand::Rng::with_seed(9);
        assert!(executor.run_one(&mut rng));
        cancel.cancel();
        executor.run_all(&mut rng);

        let failure = rx.try_recv().expect("reply").expect_err("cancelled");
        assert!(matches!(failure.error, MergeError::Cancelled));
        assert!(!fs.exists(Path::new("t/p.1")));
    }

    #[test]
    fn mismatched_report_fails_the_partition() {
        let fs = MemFs::new();
        let (reply, mut rx) = oneshot::channel();
        let finisher = Finisher {
            fs: Arc::new(fs.clone()),
            commit_mode: CommitMode::NoSync,
            cancel: CancellationToken::new(),
            metrics: Arc::new(MergeMetrics::default()),
            dirs: PartitionDirs {
                old: None,
                dst: PathBuf::from("t/p.1"),
            },
            mode: PartitionMode::New,
            meta: PartitionMeta::new("p", 1, 0, None, None),
            undo: UndoLog::default(),
            superseded: None,
            reply,
        };
        let join = PartitionJoin::new(1, Arc::from("p"), 1, finisher);
        let stray = TaskId {
            txn: 2,
            partition: Arc::from("p"),
            slot: 0,
        };
        join.complete(&stray, "ts", Err(MergeError::Cancelled));
        assert!(join.is_failed());
        let failure = rx.try_recv().expect("reply").expect_err("mismatch");
        assert!(matches!(failure.error, MergeError::StructuralMismatch(_)));
    }
}
