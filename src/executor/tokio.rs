//! [`Executor`](super::Executor) backed by a tokio runtime.

use tokio::runtime::Handle;

use super::Executor;

/// Executor backed by the blocking pool of a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    handle: Handle,
}

impl TokioExecutor {
    /// Executor spawning onto the runtime behind `handle`.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

impl Default for TokioExecutor {
    /// Uses the runtime the caller is running on.
    ///
    /// # Panics
    /// Panics when called outside of a tokio runtime.
    fn default() -> Self {
        Self {
            handle: Handle::current(),
        }
    }
}

impl Executor for TokioExecutor {
    fn spawn_blocking<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // Detached: results travel through the partition join, not the handle.
        drop(self.handle.spawn_blocking(job));
    }
}
