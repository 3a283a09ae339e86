//! Binary wire protocol between clients and a room.
//!
//! Every frame is one bincode-encoded (standard config) message:
//! ```text
//! client ──► room   ClientMessage::{Connect, Push, Ping}
//! room   ──► client ServerMessage::{Connected, RejectConnect, Data, Pong, Error}
//! ```
//!
//! Encoding and decoding are pure. A frame that does not decode to a known
//! variant, or that carries trailing bytes, is a [`ProtocolError`].

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::diff::Patch;
use crate::record::{Record, RecordContent, RecordId, SchemaDescriptor, SchemaMismatch, ValidationError};

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Encode(String),
    #[error("deserialization error: {0}")]
    Decode(String),
    #[error("unexpected {message} while session is {state}")]
    UnexpectedMessage {
        message: &'static str,
        state: &'static str,
    },
    #[error("message for session '{got}' arrived on session '{expected}'")]
    SessionKeyMismatch { expected: String, got: String },
    #[error("unknown session '{0}'")]
    UnknownSession(String),
    #[error("presence id '{presence_id}' {reason}")]
    InvalidPresenceId {
        presence_id: String,
        reason: &'static str,
    },
    #[error("connection closed")]
    ConnectionClosed,
}

fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| ProtocolError::Encode(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Decode(e.to_string()))?;
    if read != bytes.len() {
        return Err(ProtocolError::Decode(format!(
            "{} trailing bytes",
            bytes.len() - read
        )));
    }
    Ok(msg)
}

// ─── Client → room ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MutationOp {
    Upsert {
        type_name: String,
        content: RecordContent,
    },
    Delete,
}

/// One record change proposed by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub record_id: RecordId,
    pub op: MutationOp,
}

impl Mutation {
    pub fn upsert(
        record_id: impl Into<RecordId>,
        type_name: impl Into<String>,
        content: impl Into<RecordContent>,
    ) -> Self {
        Self {
            record_id: record_id.into(),
            op: MutationOp::Upsert {
                type_name: type_name.into(),
                content: content.into(),
            },
        }
    }

    pub fn delete(record_id: impl Into<RecordId>) -> Self {
        Self {
            record_id: record_id.into(),
            op: MutationOp::Delete,
        }
    }
}

/// Handshake sent once per socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub session_key: String,
    pub presence_id: String,
    pub schema: SchemaDescriptor,
    /// Clock of the client's last synced state, if it has one.
    pub last_known_clock: Option<u64>,
}

/// A batch of local changes, optionally carrying the sender's presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Push {
    pub session_key: String,
    /// Client-chosen id echoed back in the matching [`PushResult`].
    pub push_id: u64,
    pub mutations: Vec<Mutation>,
    pub presence: Option<RecordContent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    Connect(ConnectRequest),
    Push(Push),
    Ping,
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Connect(_) => "connect",
            ClientMessage::Push(_) => "push",
            ClientMessage::Ping => "ping",
        }
    }
}

// ─── Room → client ───────────────────────────────────────────────

/// A mutation the room dropped, with the room's value for that id so the
/// client can restore it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedMutation {
    pub record_id: RecordId,
    pub reason: ValidationError,
    pub current: Option<Record>,
}

/// Acknowledgement of a push, delivered in order with patches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushResult {
    pub push_id: u64,
    /// Room clock once the push was applied.
    pub clock: u64,
    pub rejected: Vec<RejectedMutation>,
}

/// Messages that travel through a session's debounced data queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataMessage {
    Patch(Patch),
    PushResult(PushResult),
}

/// Initial state for a freshly connected session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Hydration {
    /// Every document record plus the other sessions' presence.
    Snapshot { records: Vec<Record> },
    /// Only what changed since the client's last known clock.
    Incremental(Patch),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectAccepted {
    pub clock: u64,
    pub schema_version: u32,
    /// The session resumed within its removal grace period.
    pub resumed: bool,
    pub hydration: Hydration,
}

/// Why a handshake was refused. No session is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RejectReason {
    #[error("schema mismatch: {0}")]
    SchemaMismatch(SchemaMismatch),
    #[error("room is full")]
    RoomFull,
    #[error("forbidden")]
    Forbidden,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    Connected(ConnectAccepted),
    RejectConnect { reason: RejectReason },
    Data(Vec<DataMessage>),
    Pong,
    /// Sent before the room drops a session for a protocol violation.
    Error { message: String },
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::RecordsDiff;
    use serde_json::json;

    fn connect() -> ClientMessage {
        ClientMessage::Connect(ConnectRequest {
            session_key: "s1".into(),
            presence_id: "presence:s1".into(),
            schema: SchemaDescriptor {
                version: 2,
                record_types: vec!["shape".into()],
            },
            last_known_clock: Some(12),
        })
    }

    #[test]
    fn test_connect_roundtrip() {
        let msg = connect();
        let decoded = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.kind(), "connect");
    }

    #[test]
    fn test_push_with_presence_roundtrip() {
        let msg = ClientMessage::Push(Push {
            session_key: "s1".into(),
            push_id: 4,
            mutations: vec![
                Mutation::upsert("shape:1", "shape", json!({ "x": 1, "label": "hi" })),
                Mutation::delete("shape:2"),
            ],
            presence: Some(json!({ "cursor": { "x": 3.5, "y": -1 } }).into()),
        });
        let decoded = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_data_batch_roundtrip() {
        let mut changes = RecordsDiff::new();
        changes.put(Record::new("shape:1", "shape", json!({ "x": 2 }), 6));
        changes.remove("shape:2".into());
        let msg = ServerMessage::Data(vec![
            DataMessage::Patch(Patch::new(5, 6, changes)),
            DataMessage::PushResult(PushResult {
                push_id: 9,
                clock: 7,
                rejected: vec![RejectedMutation {
                    record_id: "shape:3".into(),
                    reason: ValidationError::MissingField("x".into()),
                    current: None,
                }],
            }),
        ]);
        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_reject_roundtrip() {
        let msg = ServerMessage::RejectConnect {
            reason: RejectReason::SchemaMismatch(SchemaMismatch::ServerTooOld),
        };
        assert_eq!(ServerMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_unknown_variant_rejected() {
        // Variant index 42 does not exist.
        let bytes = vec![42u8];
        assert!(matches!(
            ClientMessage::decode(&bytes),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(ClientMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(ClientMessage::decode(&[]).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = ClientMessage::Ping.encode().unwrap();
        bytes.push(0);
        assert!(matches!(
            ClientMessage::decode(&bytes),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn test_ping_is_small() {
        let bytes = ClientMessage::Ping.encode().unwrap();
        assert!(bytes.len() <= 2, "ping encoded to {} bytes", bytes.len());
    }

    #[test]
    fn test_error_display() {
        let err = ProtocolError::UnexpectedMessage {
            message: "push",
            state: "awaiting-connect-message",
        };
        assert_eq!(
            err.to_string(),
            "unexpected push while session is awaiting-connect-message"
        );
        assert_eq!(RejectReason::RoomFull.to_string(), "room is full");
    }
}
