//! # tavern-docsync — Local-first document sync for space, room and clue descriptions
//!
//! Documents are Yrs CRDTs edited offline, durably queued in RocksDB,
//! pushed to a document service, compacted once the server confirms a
//! snapshot, and rolled back from local history on demand.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐ edit  ┌────────────────┐ append ┌──────────────┐
//! │ SyncSession  │──────►│ DocumentHandle │───────►│ UpdateLog    │──┐
//! └──────┬───────┘       │ (Yrs Doc)      │        └──────────────┘  │
//!        │               └────────────────┘        ┌──────────────┐  ├─► LocalStore
//!        │ push / upsert / compact                 │ SnapshotStore│──┘   (RocksDB)
//!        ▼                                         └──────────────┘
//! ┌──────────────────┐   WebSocket   ┌───────────┐
//! │ RemoteSyncClient │ ◄───────────► │ DocServer │
//! │ (state, watermark)│  bincode     └───────────┘
//! └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`doc_id`] — Canonical document ids (`room:42:description`, `space_root`)
//! - [`storage`] — RocksDB store: update log, base state, snapshots, metadata
//! - [`document`] — Live Yrs document handle
//! - [`registry`] — Workspaces and their documents, loaded once per process
//! - [`remote`] — Remote service trait, wire protocol, server and client
//! - [`sync`] — Per-document sync state and watermark-guarded compaction
//! - [`session`] — Edit → append → push → snapshot → compact
//! - [`rollback`] — Local snapshots and forced restore
//! - [`cleanup`] — Ordered document deletion

pub mod cleanup;
pub mod config;
pub mod doc_id;
pub mod document;
pub mod engine;
pub mod error;
pub mod registry;
pub mod remote;
pub mod rollback;
pub mod session;
pub mod storage;
pub mod sync;

// Re-exports for convenience
pub use cleanup::{DeletionCoordinator, DeletionReport};
pub use config::{EngineConfig, RemoteConfig};
pub use doc_id::{DocKind, DocumentDescriptor, DocumentId, EntityKind, WorkspaceId, SPACE_ROOT_ID};
pub use document::{DocumentError, DocumentHandle};
pub use engine::DocSyncEngine;
pub use error::SyncError;
pub use registry::{DocumentRegistry, MetaChange, Workspace};
pub use remote::{
    CompactAck, DocServer, MemoryDocService, PushAck, RemoteDocService, RemoteError, RemoteSnapshot,
    ServerConfig, SnapshotAck, UpsertMode, WsDocService,
};
pub use rollback::SnapshotController;
pub use session::{PullOutcome, SyncOutcome, SyncReport, SyncSession};
pub use storage::{
    DocumentMeta, LocalStore, SnapshotId, SnapshotStore, SnapshotSummary, StoreConfig, StoreError,
    UpdateLog, UpdateRecord,
};
pub use sync::{RemoteSyncClient, SyncState, Watermark};
