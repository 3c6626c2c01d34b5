//! Worker pool seam.
//!
//! Column merges are CPU- and page-fault-bound copy loops over mapped files,
//! so they run as blocking jobs. The engine only needs "run this closure
//! somewhere"; completion is reported back through the partition join.

#[cfg(feature = "tokio")]
pub mod tokio;

/// Runs blocking jobs on a pool of worker threads.
pub trait Executor: Send + Sync + 'static {
    /// Schedule `job`. The executor may run jobs in any order and in parallel.
    fn spawn_blocking<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static;
}
