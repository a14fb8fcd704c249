use crate::error::StorageError;
use crate::storage::{StorageBackend, StorageResult};
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Filesystem implementation of the StorageBackend trait
///
/// Every path is relative to `base_path`; parent directories are created on
/// write.
pub struct FileSystemStorage {
    base_path: PathBuf,
}

impl FileSystemStorage {
    pub fn open<P: AsRef<Path>>(base_path: P) -> StorageResult<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)
            .map_err(|e| StorageError::io(base_path.display().to_string(), e))?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn full_path(&self, relative_path: &str) -> PathBuf {
        self.base_path.join(relative_path)
    }
}

impl StorageBackend for FileSystemStorage {
    fn write(&self, path: &str, data: &[u8]) -> StorageResult<()> {
        self.ensure_directory(path)?;
        let full = self.full_path(path);
        std::fs::write(&full, data).map_err(|e| StorageError::io(path, e))?;
        trace!("wrote {} bytes to {:?}", data.len(), full);
        Ok(())
    }

    fn read(&self, path: &str) -> StorageResult<Option<Bytes>> {
        match std::fs::read(self.full_path(path)) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    fn delete(&self, path: &str) -> StorageResult<bool> {
        match std::fs::remove_file(self.full_path(path)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    fn exists(&self, path: &str) -> StorageResult<bool> {
        Ok(self.full_path(path).exists())
    }

    fn size(&self, path: &str) -> StorageResult<u64> {
        match std::fs::metadata(self.full_path(path)) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    fn ensure_directory(&self, path: &str) -> StorageResult<()> {
        if let Some(parent) = self.full_path(path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io(path, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_read_nested_path() {
        let temp = TempDir::new().unwrap();
        let storage = FileSystemStorage::open(temp.path()).unwrap();

        storage.write("db/ab/cd/abcd", b"hello").unwrap();

        assert!(storage.exists("db/ab/cd/abcd").unwrap());
        assert_eq!(
            storage.read("db/ab/cd/abcd").unwrap(),
            Some(Bytes::from_static(b"hello"))
        );
        assert_eq!(storage.size("db/ab/cd/abcd").unwrap(), 5);
    }

    #[test]
    fn test_missing_path() {
        let temp = TempDir::new().unwrap();
        let storage = FileSystemStorage::open(temp.path()).unwrap();

        assert_eq!(storage.read("nope").unwrap(), None);
        assert!(!storage.exists("nope").unwrap());
        assert_eq!(storage.size("nope").unwrap(), 0);
        assert!(!storage.delete("nope").unwrap());
    }

    #[test]
    fn test_delete_and_overwrite() {
        let temp = TempDir::new().unwrap();
        let storage = FileSystemStorage::open(temp.path()).unwrap();

        storage.write("a/b", b"one").unwrap();
        storage.write("a/b", b"two!").unwrap();
        assert_eq!(storage.size("a/b").unwrap(), 4);

        assert!(storage.delete("a/b").unwrap());
        assert!(!storage.exists("a/b").unwrap());
    }
}
