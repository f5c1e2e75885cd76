//! Binary client/server protocol, one WebSocket connection per user and
//! document.
//!
//! ```text
//! client                                server
//!   │ Join { doc_id, user }               │
//!   │ ──────────────────────────────────► │
//!   │           Joined(color, snapshot)   │
//!   │ ◄────────────────────────────────── │
//!   │ Submit { edit, base_revision }      │
//!   │ ──────────────────────────────────► │ ──► Remote(op) to every other user
//!   │                     Ack(committed)  │
//!   │ ◄────────────────────────────────── │
//! ```
//!
//! Messages are bincode encoded (serde mode) and carried in binary frames.
//!
//! Performance target: encode/decode < 500ns for a typical edit.

use serde::{Deserialize, Serialize};
use tandem_core::{CommittedOperation, Edit, Revision, Snapshot, UserId};
use thiserror::Error;
use uuid::Uuid;

use crate::error::SessionError;
use crate::presence::{Cursor, PresenceDelta};
use crate::session::JoinAck;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
    /// A message that is not valid in the connection's current state.
    #[error("unexpected message: {0}")]
    Unexpected(&'static str),
}

/// Client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Must be the first message on a connection.
    Join { doc_id: Uuid, user: UserId },
    Leave,
    Submit {
        edit: Edit,
        base_revision: Revision,
    },
    Cursor { cursor: Cursor, revision: Revision },
    /// Replay everything committed after `since`.
    Resync { since: Revision },
    Snapshot,
    Ping,
}

/// Server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    Joined(JoinAck),
    /// The sender's own submission, as committed.
    Ack(CommittedOperation),
    /// Someone else's committed operation, in commit order.
    Remote(CommittedOperation),
    Presence(PresenceDelta),
    CatchUp(Vec<CommittedOperation>),
    Snapshot(Snapshot),
    Error { kind: ErrorKind, message: String },
    Pong,
}

/// What a client should do about an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Fix the request; local state is still valid.
    InvalidRequest,
    /// Discard local state and fetch a snapshot.
    Resync,
    /// The server rejected a well-formed edit because of an internal fault.
    Integrity,
    /// Retry later.
    Unavailable,
}

impl ServerMessage {
    pub fn error(err: &SessionError) -> Self {
        let kind = if err.requires_resync() {
            ErrorKind::Resync
        } else if err.is_integrity_fault() {
            ErrorKind::Integrity
        } else {
            match err {
                SessionError::DocumentClosed(_) | SessionError::Open { .. } => {
                    ErrorKind::Unavailable
                }
                _ => ErrorKind::InvalidRequest,
            }
        };
        ServerMessage::Error {
            kind,
            message: err.to_string(),
        }
    }

    pub fn protocol_error(err: &ProtocolError) -> Self {
        ServerMessage::Error {
            kind: ErrorKind::InvalidRequest,
            message: err.to_string(),
        }
    }
}

macro_rules! bincode_codec {
    ($ty:ty) => {
        impl $ty {
            pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
                bincode::serde::encode_to_vec(self, bincode::config::standard())
                    .map_err(|e| ProtocolError::Encode(e.to_string()))
            }

            pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
                let (msg, _) =
                    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                        .map_err(|e| ProtocolError::Decode(e.to_string()))?;
                Ok(msg)
            }
        }
    };
}

bincode_codec!(ClientMessage);
bincode_codec!(ServerMessage);
