use std::path::PathBuf;

/// Durability of a published commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitMode {
    /// Flush every merged column and sync partition directories before the
    /// transaction file is replaced.
    #[default]
    Sync,
    /// Leave flushing to the operating system.
    NoSync,
}

/// Configuration of an [`Engine`](crate::Engine).
#[derive(Debug, Clone)]
pub struct EngineOption {
    pub(crate) path: PathBuf,
    pub(crate) commit_mode: CommitMode,
    pub(crate) clean_channel_buffer: usize,
    pub(crate) partition_parallelism: usize,
}

impl<P> From<P> for EngineOption
where
    P: Into<PathBuf>,
{
    fn from(path: P) -> Self {
        EngineOption {
            path: path.into(),
            commit_mode: CommitMode::Sync,
            clean_channel_buffer: 10,
            partition_parallelism: 16,
        }
    }
}

impl EngineOption {
    /// Table directory.
    pub fn path(self, path: impl Into<PathBuf>) -> Self {
        EngineOption {
            path: path.into(),
            ..self
        }
    }

    /// Durability of published commits.
    pub fn commit_mode(self, commit_mode: CommitMode) -> Self {
        EngineOption {
            commit_mode,
            ..self
        }
    }

    /// Bound of the channel feeding the directory cleaner.
    pub fn clean_channel_buffer(self, clean_channel_buffer: usize) -> Self {
        EngineOption {
            clean_channel_buffer,
            ..self
        }
    }

    /// How many partitions of one commit are merged at the same time. Zero is
    /// treated as one.
    pub fn partition_parallelism(self, partition_parallelism: usize) -> Self {
        EngineOption {
            partition_parallelism,
            ..self
        }
    }
}

impl EngineOption {
    pub(crate) fn txn_path(&self) -> PathBuf {
        self.path.join(crate::version::TXN_FILE)
    }
}
