//! Storage capability used by the merge engine.
//!
//! The engine never touches files directly. Planning opens, creates and extends
//! column files through [`ColumnFs`]; column tasks only see the resulting
//! mapped regions, and finalize/rollback call back into the file system to
//! sync, truncate or delete.

mod local;
mod mem;

use std::{
    fmt::{Debug, Formatter},
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

pub use local::LocalFs;
pub use mem::{FsOp, MemFs};
use thiserror::Error;

/// Errors surfaced by a [`ColumnFs`] implementation.
#[derive(Debug, Error)]
pub enum FsError {
    /// Underlying operating-system error.
    #[error("fs io error on {path}: {source}")]
    Io {
        /// File or directory the operation targeted.
        path: PathBuf,
        /// Original error.
        #[source]
        source: io::Error,
    },
    /// The path does not exist.
    #[error("fs path not found: {0}")]
    NotFound(PathBuf),
    /// Failure injected by a test file system.
    #[error("fs injected failure: {op:?} on {path}")]
    Injected {
        /// Operation that was failed.
        op: FsOp,
        /// Path the operation targeted.
        path: PathBuf,
    },
    /// [`ColumnFs::write_atomic`] replaced the file but could not make the
    /// rename durable. Readers already see the new content.
    #[error("fs write to {path} landed but was not synced: {source}")]
    Unsynced {
        /// File that was replaced.
        path: PathBuf,
        /// Failure from syncing the parent directory.
        #[source]
        source: Box<FsError>,
    },
}

impl FsError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        FsError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Read-only view over a mapped file. Cloning shares the mapping; the
/// mapping is released when the last clone drops.
#[derive(Clone)]
pub struct ReadRegion {
    inner: Arc<dyn AsRef<[u8]> + Send + Sync>,
}

impl ReadRegion {
    pub(crate) fn new(inner: Arc<dyn AsRef<[u8]> + Send + Sync>) -> Self {
        Self { inner }
    }

    /// Region over bytes already owned in memory.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(bytes),
        }
    }

    /// Zero-length region.
    pub fn empty() -> Self {
        Self::from_vec(Vec::new())
    }

    /// Mapped bytes.
    pub fn as_slice(&self) -> &[u8] {
        (*self.inner).as_ref()
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Whether the region is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Debug for ReadRegion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadRegion").field("len", &self.len()).finish()
    }
}

/// Writable mapping of a file backing.
pub trait RegionMut: Send {
    /// Whole mapped file.
    fn as_slice(&self) -> &[u8];

    /// Whole mapped file, mutable.
    fn as_mut_slice(&mut self) -> &mut [u8];

    /// Make the written bytes durable.
    fn flush(&mut self) -> Result<(), FsError>;
}

/// Exclusive writable region released (unmapped) on drop.
pub struct WriteRegion {
    path: PathBuf,
    inner: Box<dyn RegionMut>,
}

impl WriteRegion {
    pub(crate) fn new(path: PathBuf, inner: Box<dyn RegionMut>) -> Self {
        Self { path, inner }
    }

    /// File this region maps.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mapped bytes.
    pub fn as_slice(&self) -> &[u8] {
        self.inner.as_slice()
    }

    /// Mapped bytes, mutable.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.inner.as_mut_slice()
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Whether the region is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush written bytes to durable storage.
    pub fn flush(&mut self) -> Result<(), FsError> {
        self.inner.flush()
    }
}

impl Debug for WriteRegion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteRegion")
            .field("path", &self.path)
            .field("len", &self.len())
            .finish()
    }
}

/// File-system capability the engine calls into.
///
/// Every method is synchronous: planning and finalize run on worker threads and
/// the copy loops never perform I/O.
pub trait ColumnFs: Send + Sync + 'static {
    /// Create a directory and its parents.
    fn create_dir_all(&self, path: &Path) -> Result<(), FsError>;

    /// Whether a file or directory exists.
    fn exists(&self, path: &Path) -> bool;

    /// Length of a file in bytes.
    fn file_len(&self, path: &Path) -> Result<u64, FsError>;

    /// Map an existing file read-only.
    fn map_read(&self, path: &Path) -> Result<ReadRegion, FsError>;

    /// Create the file if needed, resize it to `len` and map it writable.
    fn map_write(&self, path: &Path, len: u64) -> Result<WriteRegion, FsError>;

    /// Shrink or grow a file to `len` bytes.
    fn truncate(&self, path: &Path, len: u64) -> Result<(), FsError>;

    /// Delete a file.
    fn remove_file(&self, path: &Path) -> Result<(), FsError>;

    /// Delete a directory tree.
    fn remove_dir_all(&self, path: &Path) -> Result<(), FsError>;

    /// Replace `path` with `bytes` so readers observe either the old or the new
    /// content, never a mix.
    ///
    /// Returns [`FsError::Unsynced`] when the new content is in place but its
    /// durability is unknown; any other error leaves the old content.
    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), FsError>;

    /// Read a whole file.
    fn read(&self, path: &Path) -> Result<Vec<u8>, FsError>;

    /// Make directory entries (created or renamed files) durable.
    fn sync_dir(&self, path: &Path) -> Result<(), FsError>;
}
