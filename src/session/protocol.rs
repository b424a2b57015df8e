//! Websocket wire format: JSON text frames tagged by `type`, with document
//! state and ops carried as base64 postcard blobs.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::ids::{ClientId, RoomKey};
use crate::model::{Cursor, Op, Presence, RejectedOp};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// Join `room`, leaving any room this connection is in.
    #[serde(rename = "sync.request")]
    SyncRequest { room: RoomKey },
    #[serde(rename = "op.submit")]
    OpSubmit { room: RoomKey, op: String },
    #[serde(rename = "presence.update")]
    PresenceUpdate {
        room: RoomKey,
        presence: PresenceInput,
    },
    #[serde(rename = "ping")]
    Ping,
}

/// The client-supplied part of a presence entry. Identity and liveness are
/// filled in by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceInput {
    pub display_name: String,
    pub color: String,
    #[serde(default)]
    pub cursor: Option<Cursor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub client_id: ClientId,
    pub presence: Presence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// Full state plus the replica id the client must stamp its ops with.
    #[serde(rename = "sync.full")]
    SyncFull {
        room: RoomKey,
        client_id: ClientId,
        state: String,
        presence: Vec<PresenceEntry>,
    },
    #[serde(rename = "op.applied")]
    OpApplied { room: RoomKey, op: String },
    /// Always followed by a `sync.full` carrying a fresh client id.
    #[serde(rename = "op.rejected")]
    OpRejected {
        room: RoomKey,
        reason: String,
        rejection: RejectedOp,
    },
    #[serde(rename = "presence.changed")]
    PresenceChanged {
        room: RoomKey,
        client_id: ClientId,
        presence: Presence,
    },
    #[serde(rename = "presence.left")]
    PresenceLeft { room: RoomKey, client_id: ClientId },
    #[serde(rename = "room.closed")]
    RoomClosed { room: RoomKey, reason: String },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, AppError> {
        serde_json::from_str(text).map_err(|e| AppError::Protocol(format!("unparseable frame: {e}")))
    }

    pub fn to_json(&self) -> Result<String, AppError> {
        serde_json::to_string(self).map_err(|e| AppError::Internal(e.to_string()))
    }
}

impl ServerFrame {
    pub fn parse(text: &str) -> Result<Self, AppError> {
        serde_json::from_str(text).map_err(|e| AppError::Protocol(format!("unparseable frame: {e}")))
    }

    pub fn to_json(&self) -> Result<String, AppError> {
        serde_json::to_string(self).map_err(|e| AppError::Internal(e.to_string()))
    }

    pub fn error(err: &AppError) -> Self {
        Self::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

pub fn encode_blob(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn decode_blob(encoded: &str) -> Result<Vec<u8>, AppError> {
    BASE64
        .decode(encoded)
        .map_err(|e| AppError::Protocol(format!("invalid base64 blob: {e}")))
}

/// Base64 postcard op, as carried by `op.submit` and `op.applied`.
pub fn encode_op(op: &Op) -> Result<String, AppError> {
    Ok(encode_blob(&op.encode()?))
}

pub fn decode_op(encoded: &str) -> Result<Op, AppError> {
    let bytes = decode_blob(encoded)?;
    Op::decode(&bytes).map_err(|e| AppError::Protocol(format!("undecodable op: {e}")))
}
