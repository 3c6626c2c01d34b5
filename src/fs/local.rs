use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use memmap2::{Mmap, MmapMut};

use super::{ColumnFs, FsError, ReadRegion, RegionMut, WriteRegion};

/// [`ColumnFs`] over the local file system with memory-mapped regions.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

struct MappedMut {
    path: PathBuf,
    map: Option<MmapMut>,
}

impl RegionMut for MappedMut {
    fn as_slice(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        self.map.as_deref_mut().unwrap_or(&mut [])
    }

    fn flush(&mut self) -> Result<(), FsError> {
        match &self.map {
            Some(map) => map.flush().map_err(|e| FsError::io(&self.path, e)),
            None => Ok(()),
        }
    }
}

fn not_found_or_io(path: &Path, err: io::Error) -> FsError {
    if err.kind() == io::ErrorKind::NotFound {
        FsError::NotFound(path.to_path_buf())
    } else {
        FsError::io(path, err)
    }
}

impl ColumnFs for LocalFs {
    fn create_dir_all(&self, path: &Path) -> Result<(), FsError> {
        fs::create_dir_all(path).map_err(|e| FsError::io(path, e))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn file_len(&self, path: &Path) -> Result<u64, FsError> {
        fs::metadata(path)
            .map(|m| m.len())
            .map_err(|e| not_found_or_io(path, e))
    }

    fn map_read(&self, path: &Path) -> Result<ReadRegion, FsError> {
        let file = File::open(path).map_err(|e| not_found_or_io(path, e))?;
        let len = file.metadata().map_err(|e| FsError::io(path, e))?.len();
        if len == 0 {
            return Ok(ReadRegion::empty());
        }
        // SAFETY: committed column files are never modified in place while a
        // read mapping is alive; appends only write past the published length.
        let map = unsafe { Mmap::map(&file) }.map_err(|e| FsError::io(path, e))?;
        Ok(ReadRegion::new(Arc::new(map)))
    }

    fn map_write(&self, path: &Path, len: u64) -> Result<WriteRegion, FsError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| FsError::io(path, e))?;
        file.set_len(len).map_err(|e| FsError::io(path, e))?;
        let map = if len == 0 {
            None
        } else {
            // SAFETY: the region is handed to exactly one column task and no
            // other mapping of this destination is written concurrently.
            Some(unsafe { MmapMut::map_mut(&file) }.map_err(|e| FsError::io(path, e))?)
        };
        Ok(WriteRegion::new(
            path.to_path_buf(),
            Box::new(MappedMut {
                path: path.to_path_buf(),
                map,
            }),
        ))
    }

    fn truncate(&self, path: &Path, len: u64) -> Result<(), FsError> {
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| not_found_or_io(path, e))?;
        file.set_len(len).map_err(|e| FsError::io(path, e))?;
        file.sync_all().map_err(|e| FsError::io(path, e))
    }

    fn remove_file(&self, path: &Path) -> Result<(), FsError> {
        fs::remove_file(path).map_err(|e| not_found_or_io(path, e))
    }

    fn remove_dir_all(&self, path: &Path) -> Result<(), FsError> {
        fs::remove_dir_all(path).map_err(|e| not_found_or_io(path, e))
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), FsError> {
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp).map_err(|e| FsError::io(&tmp, e))?;
            file.write_all(bytes).map_err(|e| FsError::io(&tmp, e))?;
            file.sync_all().map_err(|e| FsError::io(&tmp, e))?;
        }
        fs::rename(&tmp, path).map_err(|e| FsError::io(path, e))?;
        match path.parent() {
            Some(parent) => self.sync_dir(parent).map_err(|source| FsError::Unsynced {
                path: path.to_path_buf(),
                source: Box::new(source),
            }),
            None => Ok(()),
        }
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>, FsError> {
        fs::read(path).map_err(|e| not_found_or_io(path, e))
    }

    #[cfg(unix)]
    fn sync_dir(&self, path: &Path) -> Result<(), FsError> {
        File::open(path)
            .and_then(|dir| dir.sync_all())
            .map_err(|e| FsError::io(path, e))
    }

    #[cfg(not(unix))]
    fn sync_dir(&self, _path: &Path) -> Result<(), FsError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn map_write_extends_and_preserves_prefix() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("c.d");
        let fs = LocalFs;

        let mut region = fs.map_write(&path, 4).expect("map");
        region.as_mut_slice().copy_from_slice(&[1, 2, 3, 4]);
        region.flush().expect("flush");
        drop(region);

        let mut region = fs.map_write(&path, 6).expect("remap");
        assert_eq!(&region.as_slice()[..4], &[1, 2, 3, 4]);
        region.as_mut_slice()[4..].copy_from_slice(&[5, 6]);
        drop(region);

        assert_eq!(fs.read(&path).expect("read"), vec![1, 2, 3, 4, 5, 6]);
        fs.truncate(&path, 4).expect("truncate");
        assert_eq!(fs.map_read(&path).expect("map read").as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn empty_files_map_to_empty_regions() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("empty.d");
        let fs = LocalFs;
        let region = fs.map_write(&path, 0).expect("map");
        assert!(region.is_empty());
        drop(region);
        assert!(fs.map_read(&path).expect("map read").is_empty());
    }

    #[test]
    fn write_atomic_replaces_content() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("_txn");
        let fs = LocalFs;
        fs.write_atomic(&path, b"first").expect("write");
        fs.write_atomic(&path, b"second").expect("rewrite");
        assert_eq!(fs.read(&path).expect("read"), b"second");
        assert!(!dir.path().join("_txn.tmp").exists());
    }
}
