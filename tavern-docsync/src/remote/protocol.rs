//! Binary request/response protocol for the WebSocket document service.
//!
//! Wire format (bincode-encoded, one frame per binary WebSocket message):
//! ```text
//! ┌────────────┬───────────────────────────────────────────┐
//! │ request_id │ body                                      │
//! │ 16 bytes   │ enum tag + fields (key, payload, ...)     │
//! └────────────┴───────────────────────────────────────────┘
//! ```
//!
//! Every request gets exactly one response carrying the same
//! `request_id`, so several calls can share one connection.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{CompactAck, PushAck, RemoteSnapshot, SnapshotAck, UpsertMode};
use crate::doc_id::DocumentId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestBody {
    FetchSnapshot {
        key: DocumentId,
    },
    UpsertSnapshot {
        key: DocumentId,
        payload: Vec<u8>,
        mode: UpsertMode,
    },
    PushUpdate {
        key: DocumentId,
        payload: Vec<u8>,
        client_id: Option<String>,
    },
    Compact {
        key: DocumentId,
        before_or_eq: u64,
    },
    RemoveDocument {
        key: DocumentId,
    },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseBody {
    Snapshot(Option<RemoteSnapshot>),
    SnapshotAck(SnapshotAck),
    PushAck(PushAck),
    CompactAck(CompactAck),
    Removed,
    Pong,
    /// Non-success response
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocRequest {
    pub request_id: Uuid,
    pub body: RequestBody,
}

impl DocRequest {
    pub fn new(body: RequestBody) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            body,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocResponse {
    pub request_id: Uuid,
    pub body: ResponseBody,
}

impl DocResponse {
    pub fn reply(request: &DocRequest, body: ResponseBody) -> Self {
        Self {
            request_id: request.request_id,
            body,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// Response body does not match the request kind
    UnexpectedResponse(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::UnexpectedResponse(e) => write!(f, "Unexpected response: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
