//! Local version history and rollback.
//!
//! Restoring is a forced reset, not a merge: the live document is replaced
//! by the snapshot, its pending updates are dropped, its base becomes the
//! snapshot, and the next sync replaces the server state
//! (`UpsertMode::Replace`) instead of merging into it.

use std::sync::Arc;

use crate::doc_id::{DocumentDescriptor, WorkspaceId};
use crate::error::SyncError;
use crate::registry::DocumentRegistry;
use crate::storage::{SnapshotId, SnapshotStore, SnapshotSummary};
use crate::sync::RemoteSyncClient;

pub struct SnapshotController {
    registry: Arc<DocumentRegistry>,
    snapshots: Arc<SnapshotStore>,
    remote: Arc<RemoteSyncClient>,
    /// Snapshots kept per document after each new one (None = all)
    keep: Option<usize>,
}

impl SnapshotController {
    pub fn new(
        registry: Arc<DocumentRegistry>,
        snapshots: Arc<SnapshotStore>,
        remote: Arc<RemoteSyncClient>,
        keep: Option<usize>,
    ) -> Self {
        Self {
            registry,
            snapshots,
            remote,
            keep,
        }
    }

    /// Store the current live state as a new snapshot.
    pub async fn create_local_snapshot(
        &self,
        workspace: &WorkspaceId,
        doc: DocumentDescriptor,
        label: Option<&str>,
    ) -> Result<SnapshotId, SyncError> {
        let handle = self.registry.get_or_create_document(workspace, doc).await?;
        let state = handle.encode_state();
        let id = self.snapshots.add_snapshot(workspace, &doc, &state, label).await?;

        if let Some(keep) = self.keep {
            let pruned = self.snapshots.prune_snapshots(workspace, &doc, keep).await?;
            if pruned > 0 {
                log::debug!("Pruned {pruned} old snapshots of {workspace}/{doc}");
            }
        }
        Ok(id)
    }

    pub async fn list_snapshots(
        &self,
        workspace: &WorkspaceId,
        doc: DocumentDescriptor,
        limit: Option<usize>,
    ) -> Result<Vec<SnapshotSummary>, SyncError> {
        Ok(self.snapshots.list_snapshots(workspace, &doc, limit).await?)
    }

    /// Overwrite the live document with a stored snapshot.
    ///
    /// `NotFound` if the snapshot does not exist or belongs to another
    /// document.
    pub async fn restore_from_snapshot(
        &self,
        workspace: &WorkspaceId,
        doc: DocumentDescriptor,
        id: SnapshotId,
    ) -> Result<(), SyncError> {
        let summary = self
            .snapshots
            .get_snapshot(id)
            .await?
            .filter(|s| s.workspace_id == workspace.as_str() && s.doc_id == doc.encode())
            .ok_or_else(|| SyncError::NotFound(format!("{id} for {workspace}/{doc}")))?;
        let payload = self
            .snapshots
            .get_snapshot_payload(id)
            .await?
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;

        let _guard = self.remote.lock_document(workspace, &doc).await;
        let handle = self.registry.get_or_create_document(workspace, doc).await?;
        handle.reset_from(&payload)?;
        let dropped = self.registry.log().reset_to(workspace, &doc, &payload).await?;
        self.remote.mark_reset(workspace, &doc);

        log::info!(
            "Restored {workspace}/{doc} to {id} (label {:?}), dropped {dropped} pending updates",
            summary.label
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteConfig;
    use crate::doc_id::DocumentId;
    use crate::remote::MemoryDocService;
    use crate::storage::{LocalStore, StoreConfig, UpdateLog};
    use crate::sync::SyncState;
    use tempfile::{tempdir, TempDir};

    fn controller(keep: Option<usize>) -> (TempDir, SnapshotController) {
        let dir = tempdir().unwrap();
        let store = Arc::new(LocalStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
        let registry = Arc::new(DocumentRegistry::new(Arc::new(UpdateLog::new(store.clone()))));
        let remote = Arc::new(RemoteSyncClient::new(
            Arc::new(MemoryDocService::new()),
            RemoteConfig::for_testing(),
        ));
        let snapshots = Arc::new(SnapshotStore::new(store).unwrap());
        (dir, SnapshotController::new(registry, snapshots, remote, keep))
    }

    fn clue(id: u64) -> DocumentDescriptor {
        DocumentDescriptor::Entity(DocumentId::clue_description(id))
    }

    #[tokio::test]
    async fn test_restore_discards_later_edits() {
        let (_dir, ctl) = controller(None);
        let ws = WorkspaceId::space(1);
        let handle = ctl.registry.get_or_create_document(&ws, clue(1)).await.unwrap();

        let delta = handle.push_text("v1");
        ctl.registry.log().append(&ws, &clue(1), &delta).await.unwrap();
        let id = ctl.create_local_snapshot(&ws, clue(1), Some("v1")).await.unwrap();

        let delta = handle.push_text(" draft");
        ctl.registry.log().append(&ws, &clue(1), &delta).await.unwrap();

        ctl.restore_from_snapshot(&ws, clue(1), id).await.unwrap();
        assert_eq!(handle.text(), "v1");
        assert_eq!(ctl.registry.log().pending_count(&ws, &clue(1)).await.unwrap(), 0);
        assert!(ctl.remote.pending_reset(&ws, &clue(1)));
        assert_eq!(ctl.remote.state(&ws, &clue(1)), SyncState::Dirty);
    }

    #[tokio::test]
    async fn test_restore_unknown_or_foreign_snapshot() {
        let (_dir, ctl) = controller(None);
        let ws = WorkspaceId::space(1);

        let err = ctl
            .restore_from_snapshot(&ws, clue(1), SnapshotId(999))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));

        let id = ctl.create_local_snapshot(&ws, clue(2), None).await.unwrap();
        let err = ctl.restore_from_snapshot(&ws, clue(1), id).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
        let err = ctl
            .restore_from_snapshot(&WorkspaceId::space(2), clue(2), id)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_keep_limit_prunes() {
        let (_dir, ctl) = controller(Some(2));
        let ws = WorkspaceId::space(1);

        for _ in 0..4 {
            ctl.create_local_snapshot(&ws, clue(1), None).await.unwrap();
        }
        assert_eq!(ctl.list_snapshots(&ws, clue(1), None).await.unwrap().len(), 2);
    }
}
