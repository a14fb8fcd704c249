pub mod fs;
pub mod network_sync;
pub mod sqlite;
pub mod storage_trait;

pub use fs::FileSystemStorage;
pub use network_sync::{NetworkSyncStats, NetworkSyncStorage, WriteContext, apply_operation};
pub use sqlite::SqliteStorage;
pub use storage_trait::{StorageBackend, StorageResult};

use blake2::digest::consts::U16;
use blake2::{Blake2b, Digest};

type KeyHasher = Blake2b<U16>;

/// Relative storage path of a logical key
///
/// `{db}/{h[0..2]}/{h[2..4]}/{h}` where `h` is the hex BLAKE2b-128 digest of
/// `"{db}:{namespace}:{key}"`. Primary writers and the secondary apply path
/// must agree on this or replicas diverge.
pub fn key_path(db: &str, namespace: &str, key: &str) -> String {
    let digest = KeyHasher::digest(format!("{}:{}:{}", db, namespace, key).as_bytes());
    let hash = hex::encode(digest);
    format!("{}/{}/{}/{}", db, &hash[0..2], &hash[2..4], hash)
}
