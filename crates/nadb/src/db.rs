use crate::config::StorageConfig;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Pooled SQLite database holding path-addressed blobs
pub struct Database {
    pool: DbPool,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P, config: &StorageConfig) -> Result<Self, crate::error::StorageError> {
        let cache_size = config.sqlite_cache_size;
        let busy_timeout = config.sqlite_busy_timeout;
        let path_ref = path.as_ref();

        // Initialize schema with a single connection first
        {
            let conn = Connection::open(path_ref)?;
            Self::configure(&conn, cache_size, busy_timeout)?;
            Self::initialize_schema(&conn)?;
        }

        let manager = SqliteConnectionManager::file(path_ref)
            .with_init(move |conn| Self::configure(conn, cache_size, busy_timeout));

        let pool = Pool::builder()
            .max_size(8)
            .min_idle(Some(1))
            .build(manager)?;

        Ok(Database { pool })
    }

    fn configure(conn: &Connection, cache_size: i32, busy_timeout: i32) -> rusqlite::Result<()> {
        conn.pragma_update(None, "cache_size", cache_size)?;
        conn.pragma_update(None, "busy_timeout", busy_timeout)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(())
    }

    fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            -- Values keyed by their relative storage path
            CREATE TABLE IF NOT EXISTS blobs (
                path TEXT PRIMARY KEY,
                data BLOB NOT NULL
            ) WITHOUT ROWID;
            "#,
        )?;

        Ok(())
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}
