use crate::types::OpType;
use std::time::Duration;
use thiserror::Error;

/// Failures while framing or parsing a replicated operation.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("frame body is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("invalid base64 value: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: OpType, reason: String },

    #[error("incomplete frame: expected {expected} bytes, got {actual}")]
    Incomplete { expected: usize, actual: usize },

    #[error("trailing bytes after frame: {0}")]
    TrailingBytes(usize),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

impl ProtocolError {
    pub fn is_checksum_mismatch(&self) -> bool {
        matches!(self, ProtocolError::ChecksumMismatch { .. })
    }
}

/// Failures raised by a base storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("{0}")]
    ReadOnly(String),

    #[error("{message}{}", addr.as_ref().map(|a| format!(" (addr={a})")).unwrap_or_default())]
    Connection {
        message: String,
        addr: Option<String>,
    },

    #[error("replica {replica_id} timed out after {lag:?}")]
    ReplicaTimeout { replica_id: String, lag: Duration },

    #[error("{operation} is not available in {mode} mode")]
    WrongMode {
        operation: &'static str,
        mode: crate::config::Mode,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("{0} operations are not supported by the apply path")]
    UnsupportedOperation(OpType),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReplicationError {
    pub fn read_only(message: impl Into<String>) -> Self {
        ReplicationError::ReadOnly(message.into())
    }

    pub fn connection(message: impl Into<String>, addr: Option<String>) -> Self {
        ReplicationError::Connection {
            message: message.into(),
            addr,
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, ReplicationError::ReadOnly(_))
    }
}

pub type Result<T> = std::result::Result<T, ReplicationError>;
