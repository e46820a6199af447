//! Document deletion.
//!
//! Order is fixed:
//! 1. remote removal, one best-effort attempt (failures are logged only)
//! 2. local pending log and base state, which must succeed
//! 3. metadata, live handle, sync state and local snapshot history
//!
//! The document lock of `RemoteSyncClient` is held across all three steps,
//! so a sync or pull of the same document either finishes before the
//! deletion starts or starts after it and finds nothing to upload.

use std::sync::Arc;

use crate::doc_id::{DocumentDescriptor, WorkspaceId};
use crate::error::SyncError;
use crate::registry::DocumentRegistry;
use crate::storage::SnapshotStore;
use crate::sync::RemoteSyncClient;

/// What a deletion removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionReport {
    pub remote_removed: bool,
    pub updates_cleared: u64,
    pub snapshots_removed: usize,
    pub meta_removed: bool,
}

pub struct DeletionCoordinator {
    registry: Arc<DocumentRegistry>,
    snapshots: Arc<SnapshotStore>,
    remote: Arc<RemoteSyncClient>,
}

impl DeletionCoordinator {
    pub fn new(
        registry: Arc<DocumentRegistry>,
        snapshots: Arc<SnapshotStore>,
        remote: Arc<RemoteSyncClient>,
    ) -> Self {
        Self {
            registry,
            snapshots,
            remote,
        }
    }

    pub async fn delete_document(
        &self,
        workspace: &WorkspaceId,
        doc: DocumentDescriptor,
    ) -> Result<DeletionReport, SyncError> {
        let guard = self.remote.lock_document(workspace, &doc).await;
        let report = self.delete_locked(workspace, doc).await;
        drop(guard);
        self.remote.release_document_lock(workspace, &doc);
        report
    }

    async fn delete_locked(
        &self,
        workspace: &WorkspaceId,
        doc: DocumentDescriptor,
    ) -> Result<DeletionReport, SyncError> {
        let remote_removed = match self.remote.remove_document(workspace, &doc).await {
            Ok(()) => true,
            Err(SyncError::NoRemoteKey(_)) => false,
            Err(e) => {
                log::warn!("Remote removal of {workspace}/{doc} failed, continuing locally: {e}");
                false
            }
        };

        let updates_cleared = self.registry.log().purge_document(workspace, &doc).await?;

        let meta_removed = self.registry.remove_document(workspace, &doc).await?;
        self.remote.forget(workspace, &doc);
        let snapshots_removed = self.snapshots.delete_snapshots(workspace, &doc).await?;

        log::info!(
            "Deleted {workspace}/{doc}: {updates_cleared} pending updates, {snapshots_removed} snapshots (remote: {remote_removed})"
        );
        Ok(DeletionReport {
            remote_removed,
            updates_cleared,
            snapshots_removed,
            meta_removed,
        })
    }
}
