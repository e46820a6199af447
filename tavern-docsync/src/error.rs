//! Error taxonomy of the sync engine.
//!
//! Durability and precondition failures propagate to the caller. Network
//! failures never show up here: the sync layer absorbs them into retry
//! state (see `SyncOutcome::Deferred`).

use crate::document::DocumentError;
use crate::remote::RemoteError;
use crate::storage::StoreError;

/// Engine-level errors.
#[derive(Debug, Clone)]
pub enum SyncError {
    /// A local edit could not be written to the update log; it is not saved.
    Durability(StoreError),
    /// Any other local store failure
    Store(StoreError),
    /// The convergent runtime rejected a payload
    Document(DocumentError),
    /// Compaction asked for a watermark the server has not confirmed
    CompactionPrecondition {
        doc_id: String,
        requested: u64,
        confirmed: Option<u64>,
    },
    /// Snapshot or document does not exist
    NotFound(String),
    /// Operation needs a remote key the document does not have
    NoRemoteKey(String),
    /// Remote call failed; `SyncSession` turns this into a deferred outcome
    Remote(RemoteError),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Durability(e) => write!(f, "Edit not saved: {e}"),
            SyncError::Store(e) => write!(f, "Local store error: {e}"),
            SyncError::Document(e) => write!(f, "Document error: {e}"),
            SyncError::CompactionPrecondition {
                doc_id,
                requested,
                confirmed,
            } => match confirmed {
                Some(confirmed) => write!(
                    f,
                    "Refusing compaction of {doc_id} at {requested}: confirmed snapshot watermark is {confirmed}"
                ),
                None => write!(
                    f,
                    "Refusing compaction of {doc_id} at {requested}: no confirmed snapshot"
                ),
            },
            SyncError::NotFound(what) => write!(f, "Not found: {what}"),
            SyncError::NoRemoteKey(doc) => write!(f, "Document {doc} has no remote counterpart"),
            SyncError::Remote(e) => write!(f, "Remote error: {e}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Store(e)
    }
}

impl From<RemoteError> for SyncError {
    fn from(e: RemoteError) -> Self {
        SyncError::Remote(e)
    }
}

impl From<DocumentError> for SyncError {
    fn from(e: DocumentError) -> Self {
        SyncError::Document(e)
    }
}
