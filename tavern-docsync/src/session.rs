//! Edit → durable append → push → snapshot → compaction.
//!
//! ```text
//! apply_local_edit ──► DocumentHandle::edit ──► UpdateLog::append ──► mark Dirty
//!                                                   (must succeed)
//!
//! sync_document:
//!   list pending ──► push each (client id per seq) ──► upsert full state
//!        │                                                │ SnapshotAck → Watermark
//!        │                                                ▼
//!        │                       request_compaction(watermark) (remote housekeeping)
//!        │                                                │
//!        └────────── compact_into_base(state, ≤ last pushed seq) (local)
//! ```
//!
//! A failed remote call never touches the local log: the document stays
//! `PushFailed` and the outcome is `SyncOutcome::Deferred`.

use std::sync::Arc;
use yrs::{Text, TransactionMut, WriteTxn};

use crate::doc_id::{DocumentDescriptor, WorkspaceId};
use crate::document::CONTENT_ROOT;
use crate::error::SyncError;
use crate::registry::DocumentRegistry;
use crate::remote::UpsertMode;
use crate::storage::UpdateLog;
use crate::sync::{RemoteSyncClient, SyncState};

/// Result of a sync attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Server confirmed the full state; local log compacted.
    Synced {
        pushed: usize,
        duplicates: usize,
        compacted_local: u64,
        compacted_remote: u64,
    },
    /// Nothing pending
    UpToDate,
    /// Document has no remote counterpart
    LocalOnly,
    /// Remote failure; local data untouched, retried later
    Deferred { reason: String },
}

/// Result of a pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    /// Server has never seen the document
    Absent,
    Merged { server_time: u64 },
    LocalOnly,
    Deferred { reason: String },
}

/// Summary of `sync_all_pending`.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub synced: usize,
    pub deferred: usize,
    pub failed: Vec<(WorkspaceId, DocumentDescriptor, SyncError)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Incremental,
    FullUpsert,
}

/// Orchestrates local edits and their sync.
pub struct SyncSession {
    registry: Arc<DocumentRegistry>,
    remote: Arc<RemoteSyncClient>,
}

impl SyncSession {
    pub fn new(registry: Arc<DocumentRegistry>, remote: Arc<RemoteSyncClient>) -> Self {
        Self { registry, remote }
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    pub fn remote(&self) -> &Arc<RemoteSyncClient> {
        &self.remote
    }

    fn log(&self) -> &Arc<UpdateLog> {
        self.registry.log()
    }

    // ─── Local edits ──────────────────────────────────────────────────

    /// Apply an edit and durably record its delta.
    ///
    /// Returns the closure's result and the log sequence of the delta. A
    /// `SyncError::Durability` means the edit is not saved: the live
    /// document is rolled back to what the log holds.
    pub async fn apply_local_edit<F, R>(
        &self,
        workspace: &WorkspaceId,
        doc: DocumentDescriptor,
        f: F,
    ) -> Result<(R, u64), SyncError>
    where
        F: FnOnce(&mut TransactionMut) -> R,
    {
        let handle = self.registry.get_or_create_document(workspace, doc).await?;
        let (result, delta) = handle.edit(f);
        let seq = match self.log().append(workspace, &doc, &delta).await {
            Ok(seq) => seq,
            Err(e) => {
                if let Err(reload) = self.registry.reload_document(workspace, &doc).await {
                    log::error!("Could not drop unsaved edit of {workspace}/{doc}: {reload}");
                }
                return Err(SyncError::Durability(e));
            }
        };
        self.remote.mark_dirty(workspace, &doc);
        Ok((result, seq))
    }

    /// Insert text into the `content` root (index clamped to the end).
    pub async fn insert_text(
        &self,
        workspace: &WorkspaceId,
        doc: DocumentDescriptor,
        index: u32,
        chunk: &str,
    ) -> Result<u64, SyncError> {
        let ((), seq) = self
            .apply_local_edit(workspace, doc, |txn| {
                let text = txn.get_or_insert_text(CONTENT_ROOT);
                let index = index.min(text.len(&*txn));
                text.insert(txn, index, chunk);
            })
            .await?;
        Ok(seq)
    }

    /// Append text at the end of the `content` root.
    pub async fn append_text(
        &self,
        workspace: &WorkspaceId,
        doc: DocumentDescriptor,
        chunk: &str,
    ) -> Result<u64, SyncError> {
        self.insert_text(workspace, doc, u32::MAX, chunk).await
    }

    // ─── Sync ─────────────────────────────────────────────────────────

    /// Push pending updates, confirm a snapshot, compact.
    pub async fn sync_document(
        &self,
        workspace: &WorkspaceId,
        doc: DocumentDescriptor,
    ) -> Result<SyncOutcome, SyncError> {
        self.sync_with(workspace, doc, Strategy::Incremental).await
    }

    /// Full-state upsert without incremental pushes.
    pub async fn force_sync(
        &self,
        workspace: &WorkspaceId,
        doc: DocumentDescriptor,
    ) -> Result<SyncOutcome, SyncError> {
        self.sync_with(workspace, doc, Strategy::FullUpsert).await
    }

    async fn sync_with(
        &self,
        workspace: &WorkspaceId,
        doc: DocumentDescriptor,
        strategy: Strategy,
    ) -> Result<SyncOutcome, SyncError> {
        if doc.remote_key(workspace).is_none() {
            return Ok(SyncOutcome::LocalOnly);
        }
        let _guard = self.remote.lock_document(workspace, &doc).await;

        let handle = self.registry.get_or_create_document(workspace, doc).await?;
        let pending = self.log().list_all(workspace, &doc).await?;
        let reset = self.remote.pending_reset(workspace, &doc);
        let strategy = if reset { Strategy::FullUpsert } else { strategy };

        if strategy == Strategy::Incremental
            && pending.is_empty()
            && self.remote.state(workspace, &doc) == SyncState::Clean
        {
            return Ok(SyncOutcome::UpToDate);
        }

        self.remote.begin_push(workspace, &doc);

        let mut pushed = 0;
        let mut duplicates = 0;
        if strategy == Strategy::Incremental {
            for record in &pending {
                match self
                    .remote
                    .push_update(workspace, &doc, &record.payload, record.seq)
                    .await
                {
                    Ok(ack) if ack.duplicate => duplicates += 1,
                    Ok(_) => pushed += 1,
                    Err(e) => return self.defer(workspace, &doc, e),
                }
            }
        }

        let state = handle.encode_state();
        let mode = if reset { UpsertMode::Replace } else { UpsertMode::Merge };
        let watermark = match self.remote.upsert_snapshot(workspace, &doc, &state, mode).await {
            Ok(watermark) => watermark,
            Err(e) => return self.defer(workspace, &doc, e),
        };

        // The server holds `state` now, so everything up to the last listed
        // record may leave the local log. Later appends stay pending.
        let compacted_local = match pending.last() {
            Some(last) => {
                self.log()
                    .compact_into_base(workspace, &doc, &state, last.seq)
                    .await?
            }
            None => {
                self.log().store_base(workspace, &doc, &state).await?;
                0
            }
        };

        let compacted_remote = match self.remote.request_compaction(workspace, &doc, watermark).await {
            Ok(ack) => ack.removed,
            Err(e) => {
                log::warn!("Remote compaction of {workspace}/{doc} skipped: {e}");
                0
            }
        };

        let state_after = self.remote.finish_push(workspace, &doc);
        log::info!(
            "Synced {workspace}/{doc}: pushed {pushed} ({duplicates} duplicate), compacted {compacted_local} local / {compacted_remote} remote, now {state_after:?}"
        );
        Ok(SyncOutcome::Synced {
            pushed,
            duplicates,
            compacted_local,
            compacted_remote,
        })
    }

    fn defer(
        &self,
        workspace: &WorkspaceId,
        doc: &DocumentDescriptor,
        error: SyncError,
    ) -> Result<SyncOutcome, SyncError> {
        match error {
            SyncError::Remote(_) => {
                self.remote.fail_push(workspace, doc, &error);
                Ok(SyncOutcome::Deferred {
                    reason: error.to_string(),
                })
            }
            other => {
                self.remote.fail_push(workspace, doc, &other);
                Err(other)
            }
        }
    }

    /// Fetch the server state and merge it into the live document.
    pub async fn pull_document(
        &self,
        workspace: &WorkspaceId,
        doc: DocumentDescriptor,
    ) -> Result<PullOutcome, SyncError> {
        if doc.remote_key(workspace).is_none() {
            return Ok(PullOutcome::LocalOnly);
        }
        let _guard = self.remote.lock_document(workspace, &doc).await;

        let snapshot = match self.remote.fetch_snapshot(workspace, &doc).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return Ok(PullOutcome::Absent),
            Err(SyncError::Remote(e)) => {
                log::warn!("Pull of {workspace}/{doc} deferred: {e}");
                return Ok(PullOutcome::Deferred {
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        let handle = self.registry.get_or_create_document(workspace, doc).await?;
        handle.apply_update(&snapshot.payload)?;
        // merged state ⊇ old base + pending, so it can replace the base
        self.log()
            .store_base(workspace, &doc, &handle.encode_state())
            .await?;

        log::debug!("Pulled {workspace}/{doc} at server time {}", snapshot.server_time);
        Ok(PullOutcome::Merged {
            server_time: snapshot.server_time,
        })
    }

    /// Retry every document with pending updates or unfinished sync state.
    pub async fn sync_all_pending(&self) -> Result<SyncReport, SyncError> {
        let mut targets = self.log().documents_with_pending()?;
        for key in self.remote.needing_sync() {
            if !targets.contains(&key) {
                targets.push(key);
            }
        }

        let mut report = SyncReport::default();
        for (workspace, doc) in targets {
            match self.sync_document(&workspace, doc).await {
                Ok(SyncOutcome::Deferred { .. }) => report.deferred += 1,
                Ok(SyncOutcome::Synced { .. }) => report.synced += 1,
                Ok(_) => {}
                Err(e) => {
                    log::error!("Sync of {workspace}/{doc} failed: {e}");
                    report.failed.push((workspace, doc, e));
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteConfig;
    use crate::doc_id::DocumentId;
    use crate::document::DocumentHandle;
    use crate::remote::{MemoryDocService, RemoteDocService};
    use crate::storage::{LocalStore, StoreConfig};
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        service: Arc<MemoryDocService>,
        session: SyncSession,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        let registry = Arc::new(DocumentRegistry::new(Arc::new(UpdateLog::new(Arc::new(store)))));
        let service = Arc::new(MemoryDocService::new());
        let remote = Arc::new(RemoteSyncClient::new(service.clone(), RemoteConfig::for_testing()));
        Fixture {
            _dir: dir,
            service,
            session: SyncSession::new(registry, remote),
        }
    }

    fn room() -> DocumentDescriptor {
        DocumentDescriptor::Entity(DocumentId::room_description(1))
    }

    #[tokio::test]
    async fn test_edit_is_logged_and_dirty() {
        let f = fixture();
        let ws = WorkspaceId::space(1);

        f.session.append_text(&ws, room(), "hello").await.unwrap();
        assert_eq!(f.session.log().pending_count(&ws, &room()).await.unwrap(), 1);
        assert_eq!(f.session.remote().state(&ws, &room()), SyncState::Dirty);
        assert_eq!(f.service.request_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_append_is_not_kept_or_uploaded() {
        let f = fixture();
        let ws = WorkspaceId::space(1);
        f.session.append_text(&ws, room(), "kept").await.unwrap();

        f.session.registry().store().set_fail_writes(true);
        let err = f.session.append_text(&ws, room(), " lost").await.unwrap_err();
        assert!(matches!(err, SyncError::Durability(_)));
        f.session.registry().store().set_fail_writes(false);

        let handle = f.session.registry().get_or_create_document(&ws, room()).await.unwrap();
        assert_eq!(handle.text(), "kept");
        assert_eq!(f.session.log().pending_count(&ws, &room()).await.unwrap(), 1);

        f.session.sync_document(&ws, room()).await.unwrap();
        let snapshot = f
            .service
            .fetch_snapshot(&DocumentId::room_description(1))
            .await
            .unwrap()
            .unwrap();
        let remote = DocumentHandle::from_state(ws.clone(), room(), Some(&snapshot.payload), []).unwrap();
        assert_eq!(remote.text(), "kept");
    }

    #[tokio::test]
    async fn test_sync_pushes_and_compacts() {
        let f = fixture();
        let ws = WorkspaceId::space(1);

        f.session.append_text(&ws, room(), "hello").await.unwrap();
        f.session.append_text(&ws, room(), " world").await.unwrap();

        let outcome = f.session.sync_document(&ws, room()).await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Synced {
                pushed: 2,
                duplicates: 0,
                compacted_local: 2,
                compacted_remote: 2,
            }
        );
        assert_eq!(f.session.log().pending_count(&ws, &room()).await.unwrap(), 0);
        assert_eq!(f.session.remote().state(&ws, &room()), SyncState::Clean);
        assert_eq!(f.service.retained_updates(&DocumentId::room_description(1)), 0);

        assert_eq!(f.session.sync_document(&ws, room()).await.unwrap(), SyncOutcome::UpToDate);
    }

    #[tokio::test]
    async fn test_offline_sync_is_deferred() {
        let f = fixture();
        let ws = WorkspaceId::space(1);
        f.service.set_offline(true);

        f.session.append_text(&ws, room(), "offline").await.unwrap();
        let outcome = f.session.sync_document(&ws, room()).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Deferred { .. }));
        assert_eq!(f.session.remote().state(&ws, &room()), SyncState::PushFailed);
        assert_eq!(f.session.log().pending_count(&ws, &room()).await.unwrap(), 1);

        f.service.set_offline(false);
        let report = f.session.sync_all_pending().await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(f.session.log().pending_count(&ws, &room()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_local_only_document() {
        let f = fixture();
        let ws = WorkspaceId::new("scratch");

        f.session
            .append_text(&ws, DocumentDescriptor::SpaceRoot, "notes")
            .await
            .unwrap();
        assert_eq!(
            f.session.sync_document(&ws, DocumentDescriptor::SpaceRoot).await.unwrap(),
            SyncOutcome::LocalOnly
        );
        assert_eq!(f.service.request_count(), 0);
    }

    #[tokio::test]
    async fn test_pull_absent_then_merged() {
        let f = fixture();
        let ws = WorkspaceId::space(1);

        assert_eq!(f.session.pull_document(&ws, room()).await.unwrap(), PullOutcome::Absent);

        let other = DocumentHandle::new(ws.clone(), room());
        let delta = other.push_text("from elsewhere");
        f.service
            .push_update(&DocumentId::room_description(1), &delta, None)
            .await
            .unwrap();

        assert!(matches!(
            f.session.pull_document(&ws, room()).await.unwrap(),
            PullOutcome::Merged { .. }
        ));
        let handle = f.session.registry().get_or_create_document(&ws, room()).await.unwrap();
        assert_eq!(handle.text(), "from elsewhere");
    }

    #[tokio::test]
    async fn test_force_sync_skips_pushes() {
        let f = fixture();
        let ws = WorkspaceId::space(1);

        f.session.append_text(&ws, room(), "state").await.unwrap();
        let outcome = f.session.force_sync(&ws, room()).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Synced { pushed: 0, compacted_local: 1, .. }));
        assert_eq!(f.service.retained_updates(&DocumentId::room_description(1)), 0);
        assert!(f
            .service
            .snapshot_time(&DocumentId::room_description(1))
            .is_some());
    }
}
