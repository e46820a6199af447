//! Remote document service boundary.
//!
//! ```text
//! RemoteSyncClient ──► dyn RemoteDocService
//!                          ├── MemoryDocService   (in-process, tests / embedded server)
//!                          └── WsDocService ──WebSocket──► DocServer ──► MemoryDocService
//! ```
//!
//! Keys are `DocumentId`s as the server sees them (`entityType`,
//! `entityId`, `docType`); the space root maps to its space's id through
//! `DocumentDescriptor::remote_key`. Server times are opaque monotonic
//! millisecond values issued by the service.

pub mod memory;
pub mod protocol;
pub mod server;
pub mod ws;

pub use memory::MemoryDocService;
pub use protocol::{DocRequest, DocResponse, ProtocolError, RequestBody, ResponseBody};
pub use server::{DocServer, ServerConfig, ServerStats};
pub use ws::{ConnectionState, WsDocService};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::doc_id::DocumentId;

/// Latest server-side state of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSnapshot {
    /// Full state as a v1 update
    pub payload: Vec<u8>,
    pub server_time: u64,
}

/// Server confirmation that a snapshot is durably stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotAck {
    /// Every update the server received at or before this time is in the snapshot
    pub server_time: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAck {
    pub server_time: u64,
    /// The client id was already seen; nothing was stored
    pub duplicate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactAck {
    pub removed: u64,
}

/// How the server treats an uploaded snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertMode {
    /// Merge into the server's state (bootstrap, regular sync, force sync)
    Merge,
    /// Replace the server's state and drop its retained updates (rollback)
    Replace,
}

/// Remote failures. All of them are recoverable from the engine's view.
#[derive(Debug, Clone)]
pub enum RemoteError {
    /// Could not reach the service or the connection dropped
    Network(String),
    /// No answer within `RemoteConfig::request_timeout`
    Timeout,
    /// Service answered with a non-success response
    Rejected(String),
    /// Malformed frame
    Protocol(ProtocolError),
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteError::Network(e) => write!(f, "Network error: {e}"),
            RemoteError::Timeout => write!(f, "Request timed out"),
            RemoteError::Rejected(reason) => write!(f, "Rejected by server: {reason}"),
            RemoteError::Protocol(e) => write!(f, "Protocol error: {e}"),
        }
    }
}

impl std::error::Error for RemoteError {}

impl From<ProtocolError> for RemoteError {
    fn from(e: ProtocolError) -> Self {
        RemoteError::Protocol(e)
    }
}

/// The four document operations of the remote service, plus removal.
#[async_trait]
pub trait RemoteDocService: Send + Sync {
    /// Latest snapshot with every retained update merged in; `None` if the
    /// server has never seen the document.
    async fn fetch_snapshot(&self, key: &DocumentId) -> Result<Option<RemoteSnapshot>, RemoteError>;

    /// Full-state upload.
    async fn upsert_snapshot(
        &self,
        key: &DocumentId,
        payload: &[u8],
        mode: UpsertMode,
    ) -> Result<SnapshotAck, RemoteError>;

    /// Incremental update. Retrying with the same `client_id` is a no-op.
    async fn push_update(
        &self,
        key: &DocumentId,
        payload: &[u8],
        client_id: Option<&str>,
    ) -> Result<PushAck, RemoteError>;

    /// Discard retained updates at or before `before_or_eq`.
    async fn compact(&self, key: &DocumentId, before_or_eq: u64) -> Result<CompactAck, RemoteError>;

    /// Forget the document entirely.
    async fn remove_document(&self, key: &DocumentId) -> Result<(), RemoteError>;
}
