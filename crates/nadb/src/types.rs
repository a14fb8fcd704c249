use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wire-level operation kind.
///
/// Serialized as the upper-case names used in the frame's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpType {
    Set,
    Delete,
    SetTtl,
    Flush,
    Metadata,
    Heartbeat,
    SyncRequest,
    SyncResponse,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Set => "SET",
            OpType::Delete => "DELETE",
            OpType::SetTtl => "SET_TTL",
            OpType::Flush => "FLUSH",
            OpType::Metadata => "METADATA",
            OpType::Heartbeat => "HEARTBEAT",
            OpType::SyncRequest => "SYNC_REQUEST",
            OpType::SyncResponse => "SYNC_RESPONSE",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a SET: the logical key plus everything a secondary needs to
/// reproduce the write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetPayload {
    pub key: String,
    pub value: Bytes,
    pub db: String,
    pub namespace: String,
    pub tags: Vec<String>,
    pub ttl_seconds: Option<u64>,
}

impl SetPayload {
    pub fn new(
        key: impl Into<String>,
        value: impl Into<Bytes>,
        db: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            db: db.into(),
            namespace: namespace.into(),
            tags: Vec::new(),
            ttl_seconds: None,
        }
    }

    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ttl(mut self, ttl_seconds: Option<u64>) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePayload {
    pub key: String,
    pub db: String,
    pub namespace: String,
}

impl DeletePayload {
    pub fn new(key: impl Into<String>, db: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            db: db.into(),
            namespace: namespace.into(),
        }
    }
}

/// Kind-specific content of an operation.
///
/// SET_TTL, FLUSH, METADATA and SYNC_RESPONSE are reserved on the wire: they
/// round-trip through the codec with their JSON object intact but the apply
/// path refuses them.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    Set(SetPayload),
    Delete(DeletePayload),
    Heartbeat,
    SyncRequest { from_sequence: u64 },
    SetTtl(Map<String, Value>),
    Flush(Map<String, Value>),
    Metadata(Map<String, Value>),
    SyncResponse(Map<String, Value>),
}

impl OpKind {
    pub fn op_type(&self) -> OpType {
        match self {
            OpKind::Set(_) => OpType::Set,
            OpKind::Delete(_) => OpType::Delete,
            OpKind::Heartbeat => OpType::Heartbeat,
            OpKind::SyncRequest { .. } => OpType::SyncRequest,
            OpKind::SetTtl(_) => OpType::SetTtl,
            OpKind::Flush(_) => OpType::Flush,
            OpKind::Metadata(_) => OpType::Metadata,
            OpKind::SyncResponse(_) => OpType::SyncResponse,
        }
    }
}

/// One replicated mutation.
///
/// The checksum is computed when the operation is built, so an `Operation`
/// value always carries a digest matching its content.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    sequence: u64,
    timestamp: f64,
    kind: OpKind,
    checksum: String,
}

impl Operation {
    /// Build an operation stamped with the current wall-clock time.
    pub fn new(sequence: u64, kind: OpKind) -> Self {
        Self::at(sequence, now_timestamp(), kind)
    }

    /// Build an operation with an explicit timestamp (seconds since epoch).
    pub fn at(sequence: u64, timestamp: f64, kind: OpKind) -> Self {
        let checksum = crate::protocol::checksum_for(sequence, timestamp, &kind);
        Self {
            sequence,
            timestamp,
            kind,
            checksum,
        }
    }

    pub fn set(sequence: u64, payload: SetPayload) -> Self {
        Self::new(sequence, OpKind::Set(payload))
    }

    pub fn delete(sequence: u64, payload: DeletePayload) -> Self {
        Self::new(sequence, OpKind::Delete(payload))
    }

    pub fn heartbeat(sequence: u64) -> Self {
        Self::new(sequence, OpKind::Heartbeat)
    }

    pub fn sync_request(sequence: u64, from_sequence: u64) -> Self {
        Self::new(sequence, OpKind::SyncRequest { from_sequence })
    }

    /// Reassemble a decoded operation. The caller has already verified the
    /// checksum against the frame body.
    pub(crate) fn from_verified_parts(
        sequence: u64,
        timestamp: f64,
        kind: OpKind,
        checksum: String,
    ) -> Self {
        Self {
            sequence,
            timestamp,
            kind,
            checksum,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn kind(&self) -> &OpKind {
        &self.kind
    }

    pub fn op_type(&self) -> OpType {
        self.kind.op_type()
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self.kind, OpKind::Heartbeat)
    }
}

/// Seconds since the epoch, truncated to millisecond precision so the value
/// survives a JSON round trip without drift.
pub fn now_timestamp() -> f64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    millis as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_type_names() {
        assert_eq!(OpType::Set.as_str(), "SET");
        assert_eq!(OpType::SetTtl.to_string(), "SET_TTL");
        assert_eq!(OpType::SyncResponse.as_str(), "SYNC_RESPONSE");
        assert_eq!(
            serde_json::to_string(&OpType::SyncRequest).unwrap(),
            "\"SYNC_REQUEST\""
        );
        let parsed: OpType = serde_json::from_str("\"HEARTBEAT\"").unwrap();
        assert_eq!(parsed, OpType::Heartbeat);
    }

    #[test]
    fn test_factories_attach_checksum() {
        let op = Operation::set(
            1,
            SetPayload::new("k1", &b"v1"[..], "db", "ns").with_tags(["t"]),
        );
        assert_eq!(op.sequence(), 1);
        assert_eq!(op.op_type(), OpType::Set);
        assert_eq!(op.checksum().len(), 64);
        assert!(op.checksum().chars().all(|c| c.is_ascii_hexdigit()));

        let hb = Operation::heartbeat(2);
        assert!(hb.is_heartbeat());
        assert_eq!(hb.checksum().len(), 64);
    }

    #[test]
    fn test_checksum_depends_on_content() {
        let a = Operation::at(1, 1.5, OpKind::Delete(DeletePayload::new("a", "db", "ns")));
        let b = Operation::at(1, 1.5, OpKind::Delete(DeletePayload::new("b", "db", "ns")));
        let c = Operation::at(2, 1.5, OpKind::Delete(DeletePayload::new("a", "db", "ns")));
        let a2 = Operation::at(1, 1.5, OpKind::Delete(DeletePayload::new("a", "db", "ns")));

        assert_ne!(a.checksum(), b.checksum());
        assert_ne!(a.checksum(), c.checksum());
        assert_eq!(a.checksum(), a2.checksum());
    }

    #[test]
    fn test_now_timestamp_is_millisecond_precision() {
        let ts = now_timestamp();
        assert!(ts > 1_600_000_000.0);
        let scaled = ts * 1000.0;
        assert!((scaled - scaled.round()).abs() < 1e-3);
    }
}
