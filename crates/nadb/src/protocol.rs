//! Length-prefixed, checksummed frames for replicated operations.
//!
//! Frame layout:
//!
//! ```text
//! [u32 big-endian body length N][N bytes of UTF-8 JSON]
//! {"type": "...", "sequence": u64, "timestamp": f64, "data": {...}, "checksum": "<sha256 hex>"}
//! ```
//!
//! Binary `value` fields travel base64-encoded with a `"_value_encoded": true`
//! sentinel beside them. The checksum is SHA-256 over the sorted-key compact
//! JSON of `{type, sequence, timestamp, data}` in that wire form.

use crate::error::ProtocolError;
use crate::types::{DeletePayload, OpKind, OpType, Operation, SetPayload};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Hard cap on a frame body. Larger frames are refused before any buffer is
/// sized for them.
pub const MAX_FRAME_BYTES: usize = 100 * 1024 * 1024;

const VALUE_ENCODED_FLAG: &str = "_value_encoded";

/// Outcome of trying to slice one frame off the front of a byte buffer.
#[derive(Debug)]
pub enum FrameDecode {
    /// Not enough bytes yet; nothing was consumed.
    Incomplete { needed: usize },
    /// A verified operation and the number of bytes it occupied.
    Complete { operation: Operation, consumed: usize },
    /// The frame is bad. `consumed` is the frame's extent when it can be
    /// skipped, or `None` when the stream position can no longer be trusted.
    Invalid {
        error: ProtocolError,
        consumed: Option<usize>,
    },
}

#[derive(Debug, Deserialize)]
struct WireFrame {
    #[serde(rename = "type")]
    op_type: OpType,
    sequence: u64,
    timestamp: f64,
    data: Map<String, Value>,
    checksum: String,
}

/// Frame encoder/decoder with a configurable size ceiling.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_BYTES)
    }
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Serialize an operation into a complete frame.
    pub fn encode(&self, operation: &Operation) -> Result<Bytes, ProtocolError> {
        // Base64 inflates by 4/3; refuse oversized values before encoding them.
        if let OpKind::Set(payload) = operation.kind() {
            let encoded_len = payload.value.len().div_ceil(3) * 4;
            if encoded_len > self.max_frame_bytes {
                return Err(ProtocolError::FrameTooLarge {
                    size: encoded_len,
                    max: self.max_frame_bytes,
                });
            }
        }

        let mut body = Map::new();
        body.insert("type".into(), Value::from(operation.op_type().as_str()));
        body.insert("sequence".into(), Value::from(operation.sequence()));
        body.insert("timestamp".into(), Value::from(operation.timestamp()));
        body.insert("data".into(), Value::Object(wire_data(operation.kind())));
        body.insert("checksum".into(), Value::from(operation.checksum()));

        let json = serde_json::to_vec(&Value::Object(body))?;
        if json.len() > self.max_frame_bytes || json.len() > u32::MAX as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: json.len(),
                max: self.max_frame_bytes,
            });
        }

        let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_BYTES + json.len());
        frame.put_u32(json.len() as u32);
        frame.put_slice(&json);
        Ok(frame.freeze())
    }

    /// Try to decode the frame at the front of `buf`.
    pub fn decode(&self, buf: &[u8]) -> FrameDecode {
        if buf.len() < LENGTH_PREFIX_BYTES {
            return FrameDecode::Incomplete {
                needed: LENGTH_PREFIX_BYTES - buf.len(),
            };
        }

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len > self.max_frame_bytes {
            return FrameDecode::Invalid {
                error: ProtocolError::FrameTooLarge {
                    size: len,
                    max: self.max_frame_bytes,
                },
                consumed: None,
            };
        }

        let total = LENGTH_PREFIX_BYTES + len;
        if buf.len() < total {
            return FrameDecode::Incomplete {
                needed: total - buf.len(),
            };
        }

        match decode_body(&buf[LENGTH_PREFIX_BYTES..total]) {
            Ok(operation) => FrameDecode::Complete {
                operation,
                consumed: total,
            },
            Err(error) => FrameDecode::Invalid {
                error,
                consumed: Some(total),
            },
        }
    }

    /// Decode a buffer that must hold exactly one frame.
    pub fn decode_exact(&self, buf: &[u8]) -> Result<Operation, ProtocolError> {
        match self.decode(buf) {
            FrameDecode::Complete {
                operation,
                consumed,
            } => {
                if consumed != buf.len() {
                    return Err(ProtocolError::TrailingBytes(buf.len() - consumed));
                }
                Ok(operation)
            }
            FrameDecode::Incomplete { needed } => Err(ProtocolError::Incomplete {
                expected: buf.len() + needed,
                actual: buf.len(),
            }),
            FrameDecode::Invalid { error, .. } => Err(error),
        }
    }
}

/// Encode with the default 100 MiB ceiling.
pub fn encode(operation: &Operation) -> Result<Bytes, ProtocolError> {
    FrameCodec::default().encode(operation)
}

/// Decode with the default 100 MiB ceiling.
pub fn decode(buf: &[u8]) -> FrameDecode {
    FrameCodec::default().decode(buf)
}

pub fn decode_exact(buf: &[u8]) -> Result<Operation, ProtocolError> {
    FrameCodec::default().decode_exact(buf)
}

/// Checksum of an operation's content in its wire form.
pub fn checksum_for(sequence: u64, timestamp: f64, kind: &OpKind) -> String {
    checksum_wire(kind.op_type(), sequence, timestamp, &wire_data(kind))
}

fn checksum_wire(op_type: OpType, sequence: u64, timestamp: f64, data: &Map<String, Value>) -> String {
    // serde_json's Map is ordered by key, so this serialization is canonical.
    let mut canonical = Map::new();
    canonical.insert("type".into(), Value::from(op_type.as_str()));
    canonical.insert("sequence".into(), Value::from(sequence));
    canonical.insert("timestamp".into(), Value::from(timestamp));
    canonical.insert("data".into(), Value::Object(data.clone()));

    let bytes = Value::Object(canonical).to_string();
    hex::encode(Sha256::digest(bytes.as_bytes()))
}

fn decode_body(body: &[u8]) -> Result<Operation, ProtocolError> {
    let text = std::str::from_utf8(body)?;
    let frame: WireFrame = serde_json::from_str(text)?;

    let expected = checksum_wire(frame.op_type, frame.sequence, frame.timestamp, &frame.data);
    if expected != frame.checksum {
        return Err(ProtocolError::ChecksumMismatch {
            expected,
            actual: frame.checksum,
        });
    }

    let kind = kind_from_wire(frame.op_type, frame.data)?;
    Ok(Operation::from_verified_parts(
        frame.sequence,
        frame.timestamp,
        kind,
        frame.checksum,
    ))
}

fn wire_data(kind: &OpKind) -> Map<String, Value> {
    let mut data = Map::new();
    match kind {
        OpKind::Set(payload) => {
            data.insert("key".into(), Value::from(payload.key.as_str()));
            data.insert("value".into(), Value::from(BASE64.encode(&payload.value)));
            data.insert(VALUE_ENCODED_FLAG.into(), Value::Bool(true));
            data.insert("db".into(), Value::from(payload.db.as_str()));
            data.insert("namespace".into(), Value::from(payload.namespace.as_str()));
            if !payload.tags.is_empty() {
                data.insert(
                    "tags".into(),
                    Value::Array(payload.tags.iter().map(|t| Value::from(t.as_str())).collect()),
                );
            }
            if let Some(ttl) = payload.ttl_seconds {
                data.insert("ttl".into(), Value::from(ttl));
            }
        }
        OpKind::Delete(payload) => {
            data.insert("key".into(), Value::from(payload.key.as_str()));
            data.insert("db".into(), Value::from(payload.db.as_str()));
            data.insert("namespace".into(), Value::from(payload.namespace.as_str()));
        }
        OpKind::Heartbeat => {}
        OpKind::SyncRequest { from_sequence } => {
            data.insert("from_sequence".into(), Value::from(*from_sequence));
        }
        OpKind::SetTtl(raw) | OpKind::Flush(raw) | OpKind::Metadata(raw) | OpKind::SyncResponse(raw) => {
            data = raw.clone();
        }
    }
    data
}

fn kind_from_wire(op_type: OpType, mut data: Map<String, Value>) -> Result<OpKind, ProtocolError> {
    let kind = match op_type {
        OpType::Set => {
            let encoded = data
                .get(VALUE_ENCODED_FLAG)
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let value = match data.remove("value") {
                Some(Value::String(s)) if encoded => Bytes::from(BASE64.decode(s.as_bytes())?),
                Some(Value::String(s)) => Bytes::from(s.into_bytes()),
                _ => return Err(invalid(op_type, "missing string field 'value'")),
            };
            let tags = match data.remove("tags") {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Array(items)) => items
                    .into_iter()
                    .map(|t| match t {
                        Value::String(s) => Ok(s),
                        _ => Err(invalid(op_type, "tags must be strings")),
                    })
                    .collect::<Result<Vec<_>, _>>()?,
                Some(_) => return Err(invalid(op_type, "tags must be an array")),
            };
            let ttl_seconds = match data.get("ttl") {
                None | Some(Value::Null) => None,
                Some(v) => Some(
                    v.as_u64()
                        .ok_or_else(|| invalid(op_type, "ttl must be a non-negative integer"))?,
                ),
            };
            OpKind::Set(SetPayload {
                key: take_string(op_type, &mut data, "key")?,
                value,
                db: take_string(op_type, &mut data, "db")?,
                namespace: take_string(op_type, &mut data, "namespace")?,
                tags,
                ttl_seconds,
            })
        }
        OpType::Delete => OpKind::Delete(DeletePayload {
            key: take_string(op_type, &mut data, "key")?,
            db: take_string(op_type, &mut data, "db")?,
            namespace: take_string(op_type, &mut data, "namespace")?,
        }),
        OpType::Heartbeat => OpKind::Heartbeat,
        OpType::SyncRequest => {
            let from_sequence = data
                .get("from_sequence")
                .and_then(Value::as_u64)
                .ok_or_else(|| invalid(op_type, "missing integer field 'from_sequence'"))?;
            OpKind::SyncRequest { from_sequence }
        }
        OpType::SetTtl => OpKind::SetTtl(data),
        OpType::Flush => OpKind::Flush(data),
        OpType::Metadata => OpKind::Metadata(data),
        OpType::SyncResponse => OpKind::SyncResponse(data),
    };
    Ok(kind)
}

fn take_string(
    op_type: OpType,
    data: &mut Map<String, Value>,
    field: &str,
) -> Result<String, ProtocolError> {
    match data.remove(field) {
        Some(Value::String(s)) => Ok(s),
        _ => Err(invalid(op_type, &format!("missing string field '{}'", field))),
    }
}

fn invalid(kind: OpType, reason: &str) -> ProtocolError {
    ProtocolError::InvalidPayload {
        kind,
        reason: reason.to_string(),
    }
}
