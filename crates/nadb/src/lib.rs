pub mod buffers;
pub mod config;
pub mod db;
pub mod error;
pub mod protocol;
pub mod replication;
pub mod storage;
pub mod types;

// Public exports
pub use buffers::{OperationLog, SendQueue};
pub use config::{Mode, NodeConfig, ReplicationConfig};
pub use error::{ProtocolError, ReplicationError, Result, StorageError};
pub use protocol::{FrameCodec, FrameDecode};
pub use replication::{
    InboundPrimaryLink, OutboundReplicaLink, ReplicationClient, ReplicationManager,
    ReplicationServer,
};
pub use storage::{
    FileSystemStorage, NetworkSyncStorage, SqliteStorage, StorageBackend, key_path,
};
pub use types::{DeletePayload, OpKind, OpType, Operation, SetPayload};
