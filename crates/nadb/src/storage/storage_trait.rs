use crate::error::StorageError;
use bytes::Bytes;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Byte storage addressed by relative path
///
/// This is the whole surface the replication layer needs from a backend.
/// Implementations know nothing about keys, tags or operations; callers map
/// logical keys to paths with [`key_path`](crate::storage::key_path).
pub trait StorageBackend: Send + Sync {
    /// Store `data` at `path`, replacing any previous value
    fn write(&self, path: &str, data: &[u8]) -> StorageResult<()>;

    /// Read the value at `path`, or `None` if nothing is stored there
    fn read(&self, path: &str) -> StorageResult<Option<Bytes>>;

    /// Remove the value at `path`
    /// Returns true if something was removed; a missing path is not an error
    fn delete(&self, path: &str) -> StorageResult<bool>;

    fn exists(&self, path: &str) -> StorageResult<bool>;

    /// Size in bytes of the value at `path` (0 if missing)
    fn size(&self, path: &str) -> StorageResult<u64>;

    /// Make sure whatever container `path` lives in exists
    fn ensure_directory(&self, path: &str) -> StorageResult<()>;
}
