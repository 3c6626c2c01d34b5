//! Commit entry point.
//!
//! [`Engine`] serializes commits, fans each commit out to one partition
//! coordinator per staged partition and publishes the new table version by
//! atomically replacing the `_txn` file once every partition has finalized.
//! Any failure before that point rolls every prepared partition back.

use std::{path::PathBuf, sync::Arc};

use async_lock::{Mutex, RwLock};
use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{
    alert::{AlertSink, LogAlertSink, MergeAlert},
    column::ColumnLayout,
    executor::Executor,
    fs::{ColumnFs, FsError},
    merge::{FailureClass, MergeError},
    metrics::{MergeMetrics, MergeMetricsSnapshot},
    observability::{log_info, log_warn},
    option::EngineOption,
    partition::{
        coordinator::{PartitionMergeCoordinator, PartitionOutcome},
        open::PartitionMode,
    },
    schema::{SchemaError, TableSchema},
    staging::CommitBatch,
    version::{
        cleaner::{Cleaner, CleanerError},
        codec::MetaError,
        edit::VersionEdit,
        PartitionMeta, TableSnapshot, TableState,
    },
};

/// Errors returned by [`Engine`] operations.
#[derive(Debug, Error)]
pub enum CommitError {
    /// A partition merge failed or the commit was cancelled.
    #[error("merge failed: {source}")]
    Merge {
        /// Partition whose merge failed, if the failure is partition-local.
        partition: Option<String>,
        /// Column whose task failed, if known.
        column: Option<String>,
        /// Underlying failure.
        #[source]
        source: MergeError,
    },
    /// Reading or decoding the transaction file failed.
    #[error("metadata error: {0}")]
    Meta(#[from] MetaError),
    /// Invalid schema change.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),
    /// Storage failure outside a partition merge.
    #[error("storage error: {0}")]
    Fs(#[from] FsError),
    /// The directory cleaner failed.
    #[error("cleaner error: {0}")]
    Cleaner(#[from] CleanerError),
    /// `create` found an existing table.
    #[error("table already exists at {0}")]
    AlreadyExists(PathBuf),
    /// A worker job went away without reporting a result.
    #[error("worker dropped its result")]
    WorkerLost,
    /// The transaction file was replaced and the engine now serves `txn`,
    /// but the rename may not survive a crash. Superseded directories are
    /// kept.
    #[error("txn {txn} published without a durable rename: {source}")]
    PublishedUnsynced {
        /// Transaction the engine adopted.
        txn: u64,
        /// Directory sync failure.
        #[source]
        source: FsError,
    },
}

impl From<MergeError> for CommitError {
    fn from(source: MergeError) -> Self {
        CommitError::Merge {
            partition: None,
            column: None,
            source,
        }
    }
}

impl CommitError {
    /// Failure class for metrics and alerting.
    pub fn class(&self) -> FailureClass {
        match self {
            CommitError::Merge { source, .. } => source.class(),
            CommitError::Schema(_) | CommitError::AlreadyExists(_) => {
                FailureClass::PreconditionViolation
            }
            CommitError::Meta(MetaError::Schema(_)) => FailureClass::StructuralMismatch,
            CommitError::Meta(_)
            | CommitError::Fs(_)
            | CommitError::Cleaner(_)
            | CommitError::WorkerLost
            | CommitError::PublishedUnsynced { .. } => FailureClass::IoFailure,
        }
    }

    /// Whether the commit was cancelled by the caller.
    pub fn is_cancelled(&self) -> bool {
        self.class() == FailureClass::Cancelled
    }
}

/// One partition published by a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPartition {
    /// Committed state after the commit.
    pub meta: PartitionMeta,
    /// How the partition was written.
    pub mode: PartitionMode,
    /// Rows written by the merge. An append writes only the staged rows.
    pub rows_written: u64,
}

/// Result of a successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Published transaction id. Unchanged when nothing was staged.
    pub txn: u64,
    /// Published partitions, in staging order.
    pub partitions: Vec<PublishedPartition>,
}

/// Out-of-order commit engine for one table.
pub struct Engine<E> {
    option: Arc<EngineOption>,
    fs: Arc<dyn ColumnFs>,
    executor: Arc<E>,
    state: RwLock<TableSnapshot>,
    writer: Mutex<()>,
    alerts: Arc<dyn AlertSink>,
    metrics: Arc<MergeMetrics>,
    cleaner_done: oneshot::Receiver<Result<(), CleanerError>>,
}

/// Run `job` on the worker pool and wait for its result.
async fn run_blocking<E, T, F>(executor: &E, job: F) -> Result<T, CommitError>
where
    E: Executor,
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (reply, receiver) = oneshot::channel();
    executor.spawn_blocking(move || {
        let _ = reply.send(job());
    });
    receiver.await.map_err(|_| CommitError::WorkerLost)
}

impl<E> Engine<E>
where
    E: Executor,
{
    /// Create a new, empty table at the option's path.
    pub async fn create(
        option: EngineOption,
        schema: TableSchema,
        fs: Arc<dyn ColumnFs>,
        executor: Arc<E>,
    ) -> Result<Self, CommitError> {
        let option = Arc::new(option);
        let txn_path = option.txn_path();
        if fs.exists(&txn_path) {
            return Err(CommitError::AlreadyExists(option.path.clone()));
        }
        {
            let (fs, path) = (fs.clone(), option.path.clone());
            run_blocking(executor.as_ref(), move || fs.create_dir_all(&path)).await??;
        }

        let (clean_sender, cleaner_done) = Self::spawn_cleaner(&option, &fs, &executor);
        let state = TableState::new(schema, Some(clean_sender));
        let bytes = state.encode();
        {
            let fs = fs.clone();
            run_blocking(executor.as_ref(), move || fs.write_atomic(&txn_path, &bytes)).await??;
        }
        log_info!(
            component = "engine",
            event = "table_created",
            path = %option.path.display(),
            schema = %state.schema(),
        );
        Ok(Self::assemble(option, fs, executor, state, cleaner_done))
    }

    /// Open the table at the option's path.
    pub async fn open(
        option: EngineOption,
        fs: Arc<dyn ColumnFs>,
        executor: Arc<E>,
    ) -> Result<Self, CommitError> {
        let option = Arc::new(option);
        let bytes = {
            let (fs, path) = (fs.clone(), option.txn_path());
            run_blocking(executor.as_ref(), move || fs.read(&path))
                .await?
                .map_err(MetaError::from)?
        };
        let (clean_sender, cleaner_done) = Self::spawn_cleaner(&option, &fs, &executor);
        let state = TableState::decode(&bytes, Some(clean_sender))?;
        log_info!(
            component = "engine",
            event = "table_opened",
            path = %option.path.display(),
            txn = state.txn(),
            partitions = state.partitions().count(),
        );
        Ok(Self::assemble(option, fs, executor, state, cleaner_done))
    }

    fn spawn_cleaner(
        option: &EngineOption,
        fs: &Arc<dyn ColumnFs>,
        executor: &Arc<E>,
    ) -> (
        flume::Sender<crate::version::cleaner::CleanTag>,
        oneshot::Receiver<Result<(), CleanerError>>,
    ) {
        let (mut cleaner, clean_sender) = Cleaner::new(option, fs.clone());
        let (done, cleaner_done) = oneshot::channel();
        executor.spawn_blocking(move || {
            let _ = done.send(cleaner.listen());
        });
        (clean_sender, cleaner_done)
    }

    fn assemble(
        option: Arc<EngineOption>,
        fs: Arc<dyn ColumnFs>,
        executor: Arc<E>,
        state: TableState,
        cleaner_done: oneshot::Receiver<Result<(), CleanerError>>,
    ) -> Self {
        Self {
            option,
            fs,
            executor,
            state: RwLock::new(Arc::new(state)),
            writer: Mutex::new(()),
            alerts: Arc::new(LogAlertSink),
            metrics: Arc::new(MergeMetrics::default()),
            cleaner_done,
        }
    }

    /// Report fatal commit failures to `alerts` instead of the log.
    pub fn with_alert_sink(self, alerts: Arc<dyn AlertSink>) -> Self {
        Engine { alerts, ..self }
    }

    /// Latest published table version.
    pub async fn snapshot(&self) -> TableSnapshot {
        self.state.read().await.clone()
    }

    /// Current merge counters.
    pub fn metrics(&self) -> MergeMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Directory holding the committed generation of `meta`.
    pub fn partition_dir(&self, meta: &PartitionMeta) -> PathBuf {
        self.option.path.join(meta.dir_name())
    }

    /// Merge and publish `batch`.
    pub async fn commit(&self, batch: CommitBatch) -> Result<CommitReceipt, CommitError> {
        self.commit_with_cancel(batch, CancellationToken::new()).await
    }

    /// Merge and publish `batch` unless `cancel` fires before every partition
    /// has finalized. Once publishing starts the commit runs to completion.
    pub async fn commit_with_cancel(
        &self,
        batch: CommitBatch,
        cancel: CancellationToken,
    ) -> Result<CommitReceipt, CommitError> {
        let _writer = self.writer.lock().await;
        let current = self.snapshot().await;
        let txn = current.txn() + 1;

        match self.commit_locked(&current, txn, batch, &cancel).await {
            Ok(receipt) => {
                if !receipt.partitions.is_empty() {
                    self.metrics.record_commit();
                }
                Ok(receipt)
            }
            Err(err) => {
                self.metrics.record_failed_commit(err.class());
                log_warn!(
                    component = "engine",
                    event = "commit_rejected",
                    txn = txn,
                    class = ?err.class(),
                    error = %err,
                );
                if !err.is_cancelled() {
                    let (partition, column) = match &err {
                        CommitError::Merge {
                            partition, column, ..
                        } => (partition.clone(), column.clone()),
                        _ => (None, None),
                    };
                    self.alerts.report(&MergeAlert {
                        txn,
                        partition,
                        column,
                        class: err.class(),
                        message: err.to_string(),
                    });
                }
                Err(err)
            }
        }
    }

    async fn commit_locked(
        &self,
        current: &TableSnapshot,
        txn: u64,
        batch: CommitBatch,
        cancel: &CancellationToken,
    ) -> Result<CommitReceipt, CommitError> {
        if cancel.is_cancelled() {
            return Err(MergeError::Cancelled.into());
        }
        let schema = current.schema_ref();
        batch.validate(&schema)?;
        let staged: Vec<_> = batch
            .into_partitions()
            .into_iter()
            .filter(|partition| !partition.rows().is_empty())
            .collect();
        if staged.is_empty() {
            return Ok(CommitReceipt {
                txn: current.txn(),
                partitions: Vec::new(),
            });
        }

        let parallelism = self.option.partition_parallelism.max(1);
        let mut outcomes: Vec<PartitionOutcome> = Vec::with_capacity(staged.len());
        let mut failure = None;
        let mut pending = staged.into_iter().peekable();
        while failure.is_none() && pending.peek().is_some() {
            let receivers = pending.by_ref().take(parallelism).map(|partition| {
                let existing = current.partition(partition.name()).cloned();
                PartitionMergeCoordinator::new(
                    self.fs.clone(),
                    self.executor.clone(),
                    self.option.path.clone(),
                    txn,
                    schema.clone(),
                    partition,
                    existing,
                )
                .with_commit_mode(self.option.commit_mode)
                .with_cancel(cancel.clone())
                .with_metrics(self.metrics.clone())
                .dispatch()
            });
            for result in join_all(receivers).await {
                match result {
                    Ok(Ok(outcome)) => outcomes.push(outcome),
                    Ok(Err(partition)) => {
                        failure.get_or_insert(CommitError::Merge {
                            partition: Some(partition.partition),
                            column: partition.column,
                            source: partition.error,
                        });
                    }
                    Err(_) => {
                        failure.get_or_insert(CommitError::WorkerLost);
                    }
                }
            }
        }
        if let Some(err) = failure {
            self.rollback(outcomes).await;
            return Err(err);
        }

        let mut edits: Vec<VersionEdit> =
            outcomes.iter().map(PartitionOutcome::to_version_edit).collect();
        edits.push(VersionEdit::LatestTxn { txn });
        let next = match current.apply(edits) {
            Ok(next) => next,
            Err(err) => {
                self.rollback(outcomes).await;
                return Err(err.into());
            }
        };
        match self.publish(&next).await {
            Ok(()) => {}
            Err(CommitError::Fs(FsError::Unsynced { source, .. })) => {
                // `_txn` already names the new generations: keep them and
                // keep the superseded ones too.
                *self.state.write().await = Arc::new(next);
                log_warn!(
                    component = "engine",
                    event = "commit_unsynced",
                    txn = txn,
                    error = %source,
                );
                return Err(CommitError::PublishedUnsynced {
                    txn,
                    source: *source,
                });
            }
            Err(err) => {
                drop(next);
                self.rollback(outcomes).await;
                return Err(err);
            }
        }

        current.retire(outcomes.iter().filter_map(|o| o.superseded.clone()).collect());
        let receipt = CommitReceipt {
            txn,
            partitions: outcomes
                .into_iter()
                .map(|outcome| PublishedPartition {
                    meta: outcome.meta,
                    mode: outcome.mode,
                    rows_written: outcome.rows_written,
                })
                .collect(),
        };
        *self.state.write().await = Arc::new(next);
        log_info!(
            component = "engine",
            event = "commit_published",
            txn = txn,
            partitions = receipt.partitions.len(),
            appended = receipt
                .partitions
                .iter()
                .filter(|p| p.mode == PartitionMode::Append)
                .count(),
        );
        Ok(receipt)
    }

    async fn publish(&self, next: &TableState) -> Result<(), CommitError> {
        let bytes = next.encode();
        let (fs, path) = (self.fs.clone(), self.option.txn_path());
        run_blocking(self.executor.as_ref(), move || fs.write_atomic(&path, &bytes)).await??;
        Ok(())
    }

    async fn rollback(&self, outcomes: Vec<PartitionOutcome>) {
        if outcomes.is_empty() {
            return;
        }
        let fs = self.fs.clone();
        let metrics = self.metrics.clone();
        let result = run_blocking(self.executor.as_ref(), move || {
            for outcome in &outcomes {
                metrics.record_rollback();
                outcome.rollback(fs.as_ref());
            }
        })
        .await;
        if result.is_err() {
            log_warn!(
                component = "engine",
                event = "rollback_lost",
            );
        }
    }

    /// Add a column. Rows committed before the column existed read as null;
    /// partitions are backfilled when they are next merged.
    pub async fn add_column(&self, column: ColumnLayout) -> Result<TableSnapshot, CommitError> {
        let _writer = self.writer.lock().await;
        let current = self.snapshot().await;
        let txn = current.txn() + 1;
        let name = column.name().to_string();
        let next = current.apply(vec![
            VersionEdit::AddColumn(column),
            VersionEdit::LatestTxn { txn },
        ])?;
        let published = self.publish(&next).await;
        let next = Arc::new(next);
        match published {
            Ok(()) => {}
            Err(CommitError::Fs(FsError::Unsynced { source, .. })) => {
                *self.state.write().await = next;
                return Err(CommitError::PublishedUnsynced {
                    txn,
                    source: *source,
                });
            }
            Err(err) => return Err(err),
        }
        *self.state.write().await = next.clone();
        log_info!(
            component = "engine",
            event = "column_added",
            txn = txn,
            column = %name,
        );
        Ok(next)
    }

    /// Stop the engine and wait for the cleaner to drain. Snapshots handed out
    /// earlier must be dropped for this to return.
    pub async fn close(self) -> Result<(), CommitError> {
        let Engine {
            state,
            cleaner_done,
            ..
        } = self;
        drop(state);
        match cleaner_done.await {
            Ok(result) => result.map_err(CommitError::from),
            Err(_) => Err(CleanerError::Lost.into()),
        }
    }
}
