use crate::config::StorageConfig;
use crate::db::{Database, DbPool};
use crate::storage::{StorageBackend, StorageResult};
use bytes::Bytes;
use rusqlite::{OptionalExtension, params};
use std::path::Path;

/// SQLite implementation of the StorageBackend trait
///
/// Each relative path is one row in the `blobs` table. There are no real
/// directories, so `ensure_directory` is a no-op.
pub struct SqliteStorage {
    db: Database,
}

impl SqliteStorage {
    pub fn open<P: AsRef<Path>>(path: P, config: &StorageConfig) -> StorageResult<Self> {
        Ok(SqliteStorage {
            db: Database::open(path, config)?,
        })
    }

    pub fn pool(&self) -> &DbPool {
        self.db.pool()
    }
}

impl StorageBackend for SqliteStorage {
    fn write(&self, path: &str, data: &[u8]) -> StorageResult<()> {
        let conn = self.pool().get()?;
        conn.execute(
            "INSERT INTO blobs (path, data) VALUES (?1, ?2)
             ON CONFLICT(path) DO UPDATE SET data = excluded.data",
            params![path, data],
        )?;
        Ok(())
    }

    fn read(&self, path: &str) -> StorageResult<Option<Bytes>> {
        let conn = self.pool().get()?;
        let data: Option<Vec<u8>> = conn
            .query_row(
                "SELECT data FROM blobs WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(data.map(Bytes::from))
    }

    fn delete(&self, path: &str) -> StorageResult<bool> {
        let conn = self.pool().get()?;
        let removed = conn.execute("DELETE FROM blobs WHERE path = ?1", params![path])?;
        Ok(removed > 0)
    }

    fn exists(&self, path: &str) -> StorageResult<bool> {
        let conn = self.pool().get()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM blobs WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn size(&self, path: &str) -> StorageResult<u64> {
        let conn = self.pool().get()?;
        let len: Option<i64> = conn
            .query_row(
                "SELECT length(data) FROM blobs WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(len.unwrap_or(0).max(0) as u64)
    }

    fn ensure_directory(&self, _path: &str) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use tempfile::TempDir;

    fn open_storage(temp: &TempDir) -> SqliteStorage {
        let config = StorageConfig {
            backend: BackendKind::Sqlite,
            path: temp.path().join("node.db"),
            sqlite_cache_size: 1000,
            sqlite_busy_timeout: 5000,
        };
        SqliteStorage::open(&config.path, &config).unwrap()
    }

    #[test]
    fn test_write_read_roundtrip() {
        let temp = TempDir::new().unwrap();
        let storage = open_storage(&temp);

        storage.write("db/aa/bb/aabb", &[0, 1, 2, 255]).unwrap();

        assert!(storage.exists("db/aa/bb/aabb").unwrap());
        assert_eq!(
            storage.read("db/aa/bb/aabb").unwrap(),
            Some(Bytes::from(vec![0u8, 1, 2, 255]))
        );
        assert_eq!(storage.size("db/aa/bb/aabb").unwrap(), 4);
    }

    #[test]
    fn test_overwrite_and_delete() {
        let temp = TempDir::new().unwrap();
        let storage = open_storage(&temp);

        storage.write("p", b"first").unwrap();
        storage.write("p", b"second").unwrap();
        assert_eq!(storage.read("p").unwrap(), Some(Bytes::from_static(b"second")));

        assert!(storage.delete("p").unwrap());
        assert!(!storage.delete("p").unwrap());
        assert_eq!(storage.read("p").unwrap(), None);
        assert_eq!(storage.size("p").unwrap(), 0);
        assert!(!storage.exists("p").unwrap());
    }

    #[test]
    fn test_reopen_keeps_data() {
        let temp = TempDir::new().unwrap();
        {
            let storage = open_storage(&temp);
            storage.write("persist", b"yes").unwrap();
        }
        let storage = open_storage(&temp);
        assert_eq!(storage.read("persist").unwrap(), Some(Bytes::from_static(b"yes")));
    }
}
