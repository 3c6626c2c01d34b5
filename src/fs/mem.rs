use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use super::{ColumnFs, FsError, ReadRegion, RegionMut, WriteRegion};

/// Operation kinds that can be failed on purpose with [`MemFs::fail_on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsOp {
    /// [`ColumnFs::map_read`].
    MapRead,
    /// [`ColumnFs::map_write`].
    MapWrite,
    /// [`WriteRegion::flush`].
    Flush,
    /// [`ColumnFs::truncate`].
    Truncate,
    /// [`ColumnFs::remove_file`] and [`ColumnFs::remove_dir_all`].
    Remove,
    /// [`ColumnFs::write_atomic`].
    WriteAtomic,
    /// [`ColumnFs::sync_dir`], and the directory sync that follows the rename
    /// in [`ColumnFs::write_atomic`]. The latter fails with
    /// [`FsError::Unsynced`] after the new content is stored.
    SyncDir,
}

#[derive(Debug)]
struct Fault {
    op: FsOp,
    fragment: String,
}

#[derive(Debug, Default)]
struct MemFsState {
    files: BTreeMap<PathBuf, Vec<u8>>,
    dirs: BTreeSet<PathBuf>,
    faults: Vec<Fault>,
}

/// In-memory [`ColumnFs`] with one-shot fault injection.
///
/// Writable regions work on a private copy that is written back on flush and
/// on drop, which is enough to model mapped-file semantics for a single writer.
#[derive(Debug, Clone, Default)]
pub struct MemFs {
    state: Arc<Mutex<MemFsState>>,
}

impl MemFs {
    /// Empty file system.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `op` whose path contains `fragment`.
    pub fn fail_on(&self, op: FsOp, fragment: impl Into<String>) {
        self.lock().faults.push(Fault {
            op,
            fragment: fragment.into(),
        });
    }

    /// Snapshot of one file's bytes.
    pub fn file(&self, path: &Path) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    /// Every file path currently stored, sorted.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.lock().files.keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, MemFsState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(state: &mut MemFsState, op: FsOp, path: &Path) -> Result<(), FsError> {
        let display = path.to_string_lossy();
        if let Some(pos) = state
            .faults
            .iter()
            .position(|f| f.op == op && display.contains(f.fragment.as_str()))
        {
            state.faults.remove(pos);
            return Err(FsError::Injected {
                op,
                path: path.to_path_buf(),
            });
        }
        Ok(())
    }
}

struct MemRegion {
    fs: MemFs,
    path: PathBuf,
    buf: Vec<u8>,
}

impl MemRegion {
    fn write_back(&self) {
        let mut state = self.fs.lock();
        if let Some(file) = state.files.get_mut(&self.path) {
            file.clone_from(&self.buf);
        }
    }
}

impl RegionMut for MemRegion {
    fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    fn flush(&mut self) -> Result<(), FsError> {
        MemFs::check(&mut self.fs.lock(), FsOp::Flush, &self.path)?;
        self.write_back();
        Ok(())
    }
}

impl Drop for MemRegion {
    fn drop(&mut self) {
        self.write_back();
    }
}

impl ColumnFs for MemFs {
    fn create_dir_all(&self, path: &Path) -> Result<(), FsError> {
        let mut state = self.lock();
        let mut current = Some(path);
        while let Some(dir) = current {
            if dir.as_os_str().is_empty() {
                break;
            }
            state.dirs.insert(dir.to_path_buf());
            current = dir.parent();
        }
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        let state = self.lock();
        state.files.contains_key(path) || state.dirs.contains(path)
    }

    fn file_len(&self, path: &Path) -> Result<u64, FsError> {
        self.lock()
            .files
            .get(path)
            .map(|f| f.len() as u64)
            .ok_or_else(|| FsError::NotFound(path.to_path_buf()))
    }

    fn map_read(&self, path: &Path) -> Result<ReadRegion, FsError> {
        let mut state = self.lock();
        Self::check(&mut state, FsOp::MapRead, path)?;
        let bytes = state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| FsError::NotFound(path.to_path_buf()))?;
        Ok(ReadRegion::from_vec(bytes))
    }

    fn map_write(&self, path: &Path, len: u64) -> Result<WriteRegion, FsError> {
        let buf = {
            let mut state = self.lock();
            Self::check(&mut state, FsOp::MapWrite, path)?;
            let file = state.files.entry(path.to_path_buf()).or_default();
            file.resize(len as usize, 0);
            file.clone()
        };
        Ok(WriteRegion::new(
            path.to_path_buf(),
            Box::new(MemRegion {
                fs: self.clone(),
                path: path.to_path_buf(),
                buf,
            }),
        ))
    }

    fn truncate(&self, path: &Path, len: u64) -> Result<(), FsError> {
        let mut state = self.lock();
        Self::check(&mut state, FsOp::Truncate, path)?;
        let file = state
            .files
            .get_mut(path)
            .ok_or_else(|| FsError::NotFound(path.to_path_buf()))?;
        file.resize(len as usize, 0);
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<(), FsError> {
        let mut state = self.lock();
        Self::check(&mut state, FsOp::Remove, path)?;
        state
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| FsError::NotFound(path.to_path_buf()))
    }

    fn remove_dir_all(&self, path: &Path) -> Result<(), FsError> {
        let mut state = self.lock();
        Self::check(&mut state, FsOp::Remove, path)?;
        if !state.dirs.contains(path) {
            return Err(FsError::NotFound(path.to_path_buf()));
        }
        state.files.retain(|p, _| !p.starts_with(path));
        state.dirs.retain(|p| !p.starts_with(path));
        Ok(())
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), FsError> {
        let mut state = self.lock();
        Self::check(&mut state, FsOp::WriteAtomic, path)?;
        state.files.insert(path.to_path_buf(), bytes.to_vec());
        let parent = path.parent().unwrap_or(Path::new(""));
        Self::check(&mut state, FsOp::SyncDir, parent).map_err(|source| FsError::Unsynced {
            path: path.to_path_buf(),
            source: Box::new(source),
        })
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>, FsError> {
        self.lock()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| FsError::NotFound(path.to_path_buf()))
    }

    fn sync_dir(&self, path: &Path) -> Result<(), FsError> {
        Self::check(&mut self.lock(), FsOp::SyncDir, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_write_back_on_drop() {
        let fs = MemFs::new();
        let path = Path::new("t/p/a.d");
        let mut region = fs.map_write(path, 3).expect("map");
        region.as_mut_slice().copy_from_slice(&[7, 8, 9]);
        drop(region);
        assert_eq!(fs.file(path), Some(vec![7, 8, 9]));
    }

    #[test]
    fn injected_fault_fires_once() {
        let fs = MemFs::new();
        let path = Path::new("t/p/a.d");
        fs.fail_on(FsOp::MapWrite, "a.d");
        assert!(matches!(
            fs.map_write(path, 1),
            Err(FsError::Injected {
                op: FsOp::MapWrite,
                ..
            })
        ));
        assert!(fs.map_write(path, 1).is_ok());
    }

    #[test]
    fn write_atomic_reports_an_unsynced_rename() {
        let fs = MemFs::new();
        let path = Path::new("db/_txn");
        fs.write_atomic(path, b"old").expect("write");
        fs.fail_on(FsOp::WriteAtomic, "_txn");
        assert!(matches!(
            fs.write_atomic(path, b"new"),
            Err(FsError::Injected { .. })
        ));
        assert_eq!(fs.file(path), Some(b"old".to_vec()));

        fs.fail_on(FsOp::SyncDir, "db");
        assert!(matches!(
            fs.write_atomic(path, b"new"),
            Err(FsError::Unsynced { .. })
        ));
        assert_eq!(fs.file(path), Some(b"new".to_vec()));
    }

    #[test]
    fn remove_dir_drops_nested_files() {
        let fs = MemFs::new();
        fs.create_dir_all(Path::new("t/p.3")).expect("mkdir");
        drop(fs.map_write(Path::new("t/p.3/a.d"), 2).expect("map"));
        drop(fs.map_write(Path::new("t/p/a.d"), 2).expect("map"));
        fs.remove_dir_all(Path::new("t/p.3")).expect("rm");
        assert_eq!(fs.paths(), vec![PathBuf::from("t/p/a.d")]);
        assert!(fs.exists(Path::new("t")));
    }
}
