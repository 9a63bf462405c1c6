//! Binary wire protocol between editors and the sync server.
//!
//! Frames are bincode-encoded tagged enums. Every inbound frame is decoded
//! and validated here, before anything reaches a document session:
//!
//! ```text
//! client ──► ClientMessage ──► validate() ──► ConnectionHandler
//!                                                   │
//! client ◄── ServerMessage ◄── encode() ◄───────────┘
//! ```
//!
//! Delta payloads are opaque to this layer; they are checked by the replica
//! (document content) or the awareness state (presence) they target.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthError;

/// Opaque, stable document identifier.
pub type DocumentId = String;

/// Unique id of one transport connection within a process.
pub type ConnectionId = Uuid;

/// Longest accepted document identifier, in bytes.
pub const MAX_DOCUMENT_ID_LEN: usize = 256;

/// Frames sent by editors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Present a bearer token when the upgrade request carried none.
    Authenticate { token: String },
    /// Attach to a document and receive its full state.
    Join { document_id: DocumentId },
    /// CRDT update delta for a joined document.
    Update { document_id: DocumentId, delta: Vec<u8> },
    /// Awareness delta for a joined document.
    Awareness { document_id: DocumentId, delta: Vec<u8> },
    /// Detach from a document.
    Leave { document_id: DocumentId },
    /// Application-level heartbeat.
    Ping,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Token accepted.
    Authenticated { user_id: String },
    /// Full document state, sent once per join.
    Synced { document_id: DocumentId, delta: Vec<u8> },
    /// Incremental update produced by another editor.
    Update { document_id: DocumentId, delta: Vec<u8> },
    /// Awareness delta (full snapshot on join, incremental afterwards).
    Awareness { document_id: DocumentId, delta: Vec<u8> },
    PeerJoined { document_id: DocumentId, user_id: String },
    PeerLeft { document_id: DocumentId, user_id: String },
    Error { code: ErrorCode, message: String },
    Pong,
}

/// Closed set of error codes surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorCode {
    Unauthenticated = 1,
    AuthFailed = 2,
    MalformedFrame = 3,
    NotJoined = 4,
    InvalidDelta = 5,
    Forbidden = 6,
    Internal = 7,
}

impl ClientMessage {
    /// Decode and validate a client frame.
    pub fn decode(bytes: &[u8], max_frame_bytes: usize) -> Result<Self, ProtocolError> {
        if bytes.len() > max_frame_bytes {
            return Err(ProtocolError::Malformed(format!(
                "frame of {} bytes exceeds limit of {max_frame_bytes}",
                bytes.len()
            )));
        }
        let (msg, read): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if read != bytes.len() {
            return Err(ProtocolError::Malformed(format!(
                "{} trailing bytes after frame",
                bytes.len() - read
            )));
        }
        msg.validate()?;
        Ok(msg)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Structural checks that do not depend on connection state.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            ClientMessage::Authenticate { token } if token.is_empty() => {
                Err(ProtocolError::Malformed("empty token".into()))
            }
            ClientMessage::Join { document_id } | ClientMessage::Leave { document_id } => {
                validate_document_id(document_id)
            }
            ClientMessage::Update { document_id, delta }
            | ClientMessage::Awareness { document_id, delta } => {
                validate_document_id(document_id)?;
                if delta.is_empty() {
                    return Err(ProtocolError::Malformed("empty delta".into()));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Document the frame targets, if any.
    pub fn document_id(&self) -> Option<&str> {
        match self {
            ClientMessage::Join { document_id }
            | ClientMessage::Update { document_id, .. }
            | ClientMessage::Awareness { document_id, .. }
            | ClientMessage::Leave { document_id } => Some(document_id),
            ClientMessage::Authenticate { .. } | ClientMessage::Ping => None,
        }
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Ok(msg)
    }

    /// Error frame for a rejected client operation.
    pub fn error(err: &ProtocolError) -> Self {
        ServerMessage::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// Document ids are opaque but must be printable and bounded, since they
/// become persistence keys and channel names.
pub fn validate_document_id(document_id: &str) -> Result<(), ProtocolError> {
    if document_id.is_empty() {
        return Err(ProtocolError::Malformed("empty document id".into()));
    }
    if document_id.len() > MAX_DOCUMENT_ID_LEN {
        return Err(ProtocolError::Malformed(format!(
            "document id longer than {MAX_DOCUMENT_ID_LEN} bytes"
        )));
    }
    if document_id.chars().any(char::is_control) {
        return Err(ProtocolError::Malformed(
            "document id contains control characters".into(),
        ));
    }
    Ok(())
}

/// Protocol-level errors. Only these (and authentication failures) are
/// ever reported back to a client.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("not authenticated")]
    Unauthenticated,
    #[error("authentication failed: {0}")]
    AuthFailed(#[from] AuthError),
    #[error("document {0} is not joined")]
    NotJoined(DocumentId),
    #[error("invalid delta: {0}")]
    InvalidDelta(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProtocolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::Malformed(_) => ErrorCode::MalformedFrame,
            ProtocolError::Unauthenticated => ErrorCode::Unauthenticated,
            ProtocolError::AuthFailed(_) => ErrorCode::AuthFailed,
            ProtocolError::NotJoined(_) => ErrorCode::NotJoined,
            ProtocolError::InvalidDelta(_) => ErrorCode::InvalidDelta,
            ProtocolError::Forbidden(_) => ErrorCode::Forbidden,
            ProtocolError::Serialization(_)
            | ProtocolError::ConnectionClosed
            | ProtocolError::Internal(_) => ErrorCode::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 1024 * 1024;

    #[test]
    fn test_update_frame_roundtrip() {
        let msg = ClientMessage::Update {
            document_id: "doc-1".into(),
            delta: vec![1, 2, 3],
        };
        let decoded = ClientMessage::decode(&msg.encode().unwrap(), LIMIT).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.document_id(), Some("doc-1"));
    }

    #[test]
    fn test_decode_garbage_is_malformed() {
        let err = ClientMessage::decode(&[0xFF, 0xFE, 0xFD], LIMIT).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MalformedFrame);
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = ClientMessage::Ping.encode().unwrap();
        bytes.push(0);
        assert!(matches!(
            ClientMessage::decode(&bytes, LIMIT),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let msg = ClientMessage::Update {
            document_id: "doc-1".into(),
            delta: vec![7; 64],
        };
        let bytes = msg.encode().unwrap();
        assert!(ClientMessage::decode(&bytes, 16).is_err());
    }

    #[test]
    fn test_empty_delta_rejected() {
        let msg = ClientMessage::Awareness {
            document_id: "doc-1".into(),
            delta: Vec::new(),
        };
        assert!(ClientMessage::decode(&msg.encode().unwrap(), LIMIT).is_err());
    }

    #[test]
    fn test_document_id_validation() {
        assert!(validate_document_id("project/42/main.tex").is_ok());
        assert!(validate_document_id("").is_err());
        assert!(validate_document_id("bad\0id").is_err());
        assert!(validate_document_id(&"x".repeat(MAX_DOCUMENT_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_error_frame_carries_code() {
        let frame = ServerMessage::error(&ProtocolError::NotJoined("doc-9".into()));
        let decoded = ServerMessage::decode(&frame.encode().unwrap()).unwrap();
        match decoded {
            ServerMessage::Error { code, message } => {
                assert_eq!(code, ErrorCode::NotJoined);
                assert!(message.contains("doc-9"));
            }
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    #[test]
    fn test_error_code_values() {
        assert_eq!(ErrorCode::Unauthenticated as u8, 1);
        assert_eq!(ErrorCode::Internal as u8, 7);
    }
}
