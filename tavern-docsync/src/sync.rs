//! Remote sync client: per-document sync state over a `RemoteDocService`.
//!
//! ```text
//!            mark_dirty            begin_push
//!   Clean ───────────────► Dirty ─────────────► Pushing ──ok──► Clean
//!     ▲                      ▲                     │
//!     │                      └──── mark_dirty ─────┤ (edit during push)
//!     │                                            └─err──► PushFailed ──mark_dirty──► Dirty
//! ```
//!
//! Every remote call is bounded by `RemoteConfig::request_timeout`; an
//! expired call is a failure. Compaction is only ever requested for a
//! `Watermark`, and a watermark only comes out of a `SnapshotAck` the
//! server returned for the same document, so snapshot confirmation always
//! precedes compaction.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::config::RemoteConfig;
use crate::doc_id::{DocumentDescriptor, DocumentId, WorkspaceId};
use crate::error::SyncError;
use crate::remote::{
    CompactAck, PushAck, RemoteDocService, RemoteError, RemoteSnapshot, SnapshotAck, UpsertMode,
};

/// Sync state of one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    #[default]
    Clean,
    Dirty,
    Pushing,
    PushFailed,
}

/// Server time known to be covered by a confirmed snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Watermark(u64);

impl Watermark {
    pub fn server_time(&self) -> u64 {
        self.0
    }
}

impl From<SnapshotAck> for Watermark {
    fn from(ack: SnapshotAck) -> Self {
        Watermark(ack.server_time)
    }
}

#[derive(Debug, Default)]
struct DocSyncEntry {
    state: SyncState,
    confirmed: Option<Watermark>,
    /// Set by rollback: next sync must replace the server state
    pending_reset: bool,
    last_error: Option<String>,
}

type DocKey = (WorkspaceId, DocumentDescriptor);

/// Client side of the remote protocol.
pub struct RemoteSyncClient {
    service: Arc<dyn RemoteDocService>,
    config: RemoteConfig,
    docs: Mutex<HashMap<DocKey, DocSyncEntry>>,
    /// Sync, pull, restore and deletion of one document never overlap
    doc_locks: Mutex<HashMap<DocKey, Arc<AsyncMutex<()>>>>,
}

impl RemoteSyncClient {
    pub fn new(service: Arc<dyn RemoteDocService>, config: RemoteConfig) -> Self {
        Self {
            service,
            config,
            docs: Mutex::new(HashMap::new()),
            doc_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<DocKey, DocSyncEntry>> {
        self.docs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_entry<R>(
        &self,
        workspace: &WorkspaceId,
        doc: &DocumentDescriptor,
        f: impl FnOnce(&mut DocSyncEntry) -> R,
    ) -> R {
        let mut entries = self.entries();
        f(entries.entry((workspace.clone(), *doc)).or_default())
    }

    // ─── Document locks ───────────────────────────────────────────────

    /// Exclusive access to one document's sync pipeline.
    ///
    /// Held by `SyncSession` for a whole sync or pull, by rollback for a
    /// restore and by deletion across all of its steps.
    pub async fn lock_document(
        &self,
        workspace: &WorkspaceId,
        doc: &DocumentDescriptor,
    ) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.doc_locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry((workspace.clone(), *doc))
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Forget the lock of a document nobody holds or waits on.
    ///
    /// Call after dropping the guard. Returns whether the entry was removed.
    pub fn release_document_lock(&self, workspace: &WorkspaceId, doc: &DocumentDescriptor) -> bool {
        let mut locks = self.doc_locks.lock().unwrap_or_else(|e| e.into_inner());
        let key = (workspace.clone(), *doc);
        match locks.get(&key) {
            Some(lock) if Arc::strong_count(lock) == 1 => {
                locks.remove(&key);
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_locks(&self) -> usize {
        self.doc_locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    // ─── State machine ────────────────────────────────────────────────

    pub fn state(&self, workspace: &WorkspaceId, doc: &DocumentDescriptor) -> SyncState {
        self.entries()
            .get(&(workspace.clone(), *doc))
            .map_or(SyncState::Clean, |entry| entry.state)
    }

    /// A local edit was durably appended.
    pub fn mark_dirty(&self, workspace: &WorkspaceId, doc: &DocumentDescriptor) {
        self.with_entry(workspace, doc, |entry| entry.state = SyncState::Dirty);
    }

    pub fn begin_push(&self, workspace: &WorkspaceId, doc: &DocumentDescriptor) {
        self.with_entry(workspace, doc, |entry| entry.state = SyncState::Pushing);
    }

    /// Push finished. Returns the resulting state: `Dirty` if an edit
    /// arrived while pushing.
    pub fn finish_push(&self, workspace: &WorkspaceId, doc: &DocumentDescriptor) -> SyncState {
        self.with_entry(workspace, doc, |entry| {
            if entry.state == SyncState::Pushing {
                entry.state = SyncState::Clean;
            }
            entry.last_error = None;
            entry.state
        })
    }

    pub fn fail_push(&self, workspace: &WorkspaceId, doc: &DocumentDescriptor, error: &SyncError) {
        log::warn!("Sync of {workspace}/{doc} deferred: {error}");
        self.with_entry(workspace, doc, |entry| {
            if entry.state == SyncState::Pushing {
                entry.state = SyncState::PushFailed;
            }
            entry.last_error = Some(error.to_string());
        });
    }

    pub fn last_error(&self, workspace: &WorkspaceId, doc: &DocumentDescriptor) -> Option<String> {
        self.entries()
            .get(&(workspace.clone(), *doc))
            .and_then(|entry| entry.last_error.clone())
    }

    /// Documents that still need a sync attempt.
    pub fn needing_sync(&self) -> Vec<DocKey> {
        self.entries()
            .iter()
            .filter(|(_, entry)| entry.state != SyncState::Clean || entry.pending_reset)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// After a rollback: the server state must be replaced, not merged.
    pub fn mark_reset(&self, workspace: &WorkspaceId, doc: &DocumentDescriptor) {
        self.with_entry(workspace, doc, |entry| {
            entry.pending_reset = true;
            entry.state = SyncState::Dirty;
        });
    }

    pub fn pending_reset(&self, workspace: &WorkspaceId, doc: &DocumentDescriptor) -> bool {
        self.entries()
            .get(&(workspace.clone(), *doc))
            .is_some_and(|entry| entry.pending_reset)
    }

    /// Latest watermark the server confirmed for this document.
    pub fn confirmed_watermark(
        &self,
        workspace: &WorkspaceId,
        doc: &DocumentDescriptor,
    ) -> Option<Watermark> {
        self.entries()
            .get(&(workspace.clone(), *doc))
            .and_then(|entry| entry.confirmed)
    }

    /// Drop all sync state of a document.
    pub fn forget(&self, workspace: &WorkspaceId, doc: &DocumentDescriptor) -> bool {
        self.entries().remove(&(workspace.clone(), *doc)).is_some()
    }

    /// Stable id for one pushed record: `<client>:<doc>:<seq>`.
    pub fn push_client_id(&self, key: &DocumentId, seq: u64) -> String {
        format!("{}:{}:{}", self.config.client_id, key, seq)
    }

    // ─── Remote calls ─────────────────────────────────────────────────

    fn remote_key(&self, workspace: &WorkspaceId, doc: &DocumentDescriptor) -> Result<DocumentId, SyncError> {
        doc.remote_key(workspace)
            .ok_or_else(|| SyncError::NoRemoteKey(format!("{workspace}/{doc}")))
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T, RemoteError>>) -> Result<T, SyncError> {
        match tokio::time::timeout(self.config.request_timeout, call).await {
            Ok(result) => result.map_err(SyncError::Remote),
            Err(_) => Err(SyncError::Remote(RemoteError::Timeout)),
        }
    }

    pub async fn fetch_snapshot(
        &self,
        workspace: &WorkspaceId,
        doc: &DocumentDescriptor,
    ) -> Result<Option<RemoteSnapshot>, SyncError> {
        let key = self.remote_key(workspace, doc)?;
        self.bounded(self.service.fetch_snapshot(&key)).await
    }

    /// At-least-once push of one update.
    pub async fn push_update(
        &self,
        workspace: &WorkspaceId,
        doc: &DocumentDescriptor,
        payload: &[u8],
        seq: u64,
    ) -> Result<PushAck, SyncError> {
        let key = self.remote_key(workspace, doc)?;
        let client_id = self.push_client_id(&key, seq);
        let ack = self
            .bounded(self.service.push_update(&key, payload, Some(&client_id)))
            .await?;
        if ack.duplicate {
            log::debug!("Push {client_id} was already delivered");
        }
        Ok(ack)
    }

    /// Upload full state. On success the ack becomes the document's
    /// confirmed watermark.
    pub async fn upsert_snapshot(
        &self,
        workspace: &WorkspaceId,
        doc: &DocumentDescriptor,
        payload: &[u8],
        mode: UpsertMode,
    ) -> Result<Watermark, SyncError> {
        let key = self.remote_key(workspace, doc)?;
        let ack = self
            .bounded(self.service.upsert_snapshot(&key, payload, mode))
            .await?;
        let watermark = Watermark::from(ack);
        self.with_entry(workspace, doc, |entry| {
            entry.confirmed = entry.confirmed.max(Some(watermark));
            if mode == UpsertMode::Replace {
                entry.pending_reset = false;
            }
        });
        log::debug!("Server confirmed snapshot of {workspace}/{doc} at {}", watermark.0);
        Ok(watermark)
    }

    /// Ask the server to drop updates covered by `watermark`.
    ///
    /// Refuses any watermark newer than the one the server confirmed for
    /// this document.
    pub async fn request_compaction(
        &self,
        workspace: &WorkspaceId,
        doc: &DocumentDescriptor,
        watermark: Watermark,
    ) -> Result<CompactAck, SyncError> {
        match self.confirmed_watermark(workspace, doc) {
            Some(confirmed) if watermark <= confirmed => {}
            confirmed => {
                return Err(SyncError::CompactionPrecondition {
                    doc_id: format!("{workspace}/{doc}"),
                    requested: watermark.0,
                    confirmed: confirmed.map(|w| w.0),
                });
            }
        }

        let key = self.remote_key(workspace, doc)?;
        let ack = self.bounded(self.service.compact(&key, watermark.0)).await?;
        log::debug!("Server compacted {} updates of {workspace}/{doc}", ack.removed);
        Ok(ack)
    }

    /// One attempt to delete the remote copy.
    pub async fn remove_document(
        &self,
        workspace: &WorkspaceId,
        doc: &DocumentDescriptor,
    ) -> Result<(), SyncError> {
        let key = self.remote_key(workspace, doc)?;
        self.bounded(self.service.remove_document(&key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryDocService;
    use std::time::Duration;
    use yrs::{Doc, Text, Transact, WriteTxn};

    fn update(content: &str) -> Vec<u8> {
        let doc = Doc::new();
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("content");
        text.insert(&mut txn, 0, content);
        txn.encode_update_v1()
    }

    fn client() -> (Arc<MemoryDocService>, RemoteSyncClient) {
        let service = Arc::new(MemoryDocService::new());
        let client = RemoteSyncClient::new(service.clone(), RemoteConfig::for_testing());
        (service, client)
    }

    fn room() -> DocumentDescriptor {
        DocumentDescriptor::Entity(DocumentId::room_description(1))
    }

    #[test]
    fn test_state_transitions() {
        let (_service, client) = client();
        let ws = WorkspaceId::space(1);

        assert_eq!(client.state(&ws, &room()), SyncState::Clean);
        client.mark_dirty(&ws, &room());
        assert_eq!(client.state(&ws, &room()), SyncState::Dirty);
        client.begin_push(&ws, &room());
        assert_eq!(client.state(&ws, &room()), SyncState::Pushing);
        assert_eq!(client.finish_push(&ws, &room()), SyncState::Clean);

        client.begin_push(&ws, &room());
        client.fail_push(&ws, &room(), &SyncError::Remote(RemoteError::Timeout));
        assert_eq!(client.state(&ws, &room()), SyncState::PushFailed);
        assert!(client.last_error(&ws, &room()).unwrap().contains("timed out"));
        assert_eq!(client.needing_sync(), vec![(ws.clone(), room())]);

        client.mark_dirty(&ws, &room());
        assert_eq!(client.state(&ws, &room()), SyncState::Dirty);
    }

    #[test]
    fn test_edit_during_push_stays_dirty() {
        let (_service, client) = client();
        let ws = WorkspaceId::space(1);

        client.begin_push(&ws, &room());
        client.mark_dirty(&ws, &room());
        assert_eq!(client.finish_push(&ws, &room()), SyncState::Dirty);
    }

    #[tokio::test]
    async fn test_compaction_requires_confirmed_snapshot() {
        let (service, client) = client();
        let ws = WorkspaceId::space(1);

        let ack = service
            .upsert_snapshot(&DocumentId::room_description(1), &update("x"), UpsertMode::Merge)
            .await
            .unwrap();
        // the ack went to someone else; this client never confirmed anything
        let err = client
            .request_compaction(&ws, &room(), Watermark::from(ack))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::CompactionPrecondition { confirmed: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_compaction_refuses_newer_watermark() {
        let (_service, client) = client();
        let ws = WorkspaceId::space(1);

        let confirmed = client
            .upsert_snapshot(&ws, &room(), &update("x"), UpsertMode::Merge)
            .await
            .unwrap();
        let newer = Watermark::from(SnapshotAck {
            server_time: confirmed.server_time() + 1_000,
        });

        let err = client.request_compaction(&ws, &room(), newer).await.unwrap_err();
        assert!(matches!(err, SyncError::CompactionPrecondition { .. }));

        client.request_compaction(&ws, &room(), confirmed).await.unwrap();
    }

    #[tokio::test]
    async fn test_push_is_idempotent_per_seq() {
        let (service, client) = client();
        let ws = WorkspaceId::space(1);
        let payload = update("hello");

        let first = client.push_update(&ws, &room(), &payload, 7).await.unwrap();
        let retry = client.push_update(&ws, &room(), &payload, 7).await.unwrap();
        assert!(!first.duplicate);
        assert!(retry.duplicate);
        assert_eq!(service.retained_updates(&DocumentId::room_description(1)), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_failure() {
        let (service, client) = client();
        service.set_latency(Duration::from_secs(2));
        let ws = WorkspaceId::space(1);

        let err = client.fetch_snapshot(&ws, &room()).await.unwrap_err();
        assert!(matches!(err, SyncError::Remote(RemoteError::Timeout)));
    }

    #[tokio::test]
    async fn test_space_root_without_space_id() {
        let (_service, client) = client();
        let ws = WorkspaceId::new("scratch");
        let err = client
            .fetch_snapshot(&ws, &DocumentDescriptor::SpaceRoot)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NoRemoteKey(_)));
    }

    #[test]
    fn test_push_client_id_format() {
        let (_service, client) = client();
        assert_eq!(
            client.push_client_id(&DocumentId::room_description(3), 12),
            "test-client:room:3:description:12"
        );
    }

    #[tokio::test]
    async fn test_reset_flag_cleared_by_replace() {
        let (_service, client) = client();
        let ws = WorkspaceId::space(1);

        client.mark_reset(&ws, &room());
        assert!(client.pending_reset(&ws, &room()));
        client
            .upsert_snapshot(&ws, &room(), &update("x"), UpsertMode::Merge)
            .await
            .unwrap();
        assert!(client.pending_reset(&ws, &room()));
        client
            .upsert_snapshot(&ws, &room(), &update("x"), UpsertMode::Replace)
            .await
            .unwrap();
        assert!(!client.pending_reset(&ws, &room()));
    }

    #[tokio::test]
    async fn test_document_lock_is_exclusive_and_released() {
        let (_service, client) = client();
        let ws = WorkspaceId::space(1);

        let guard = client.lock_document(&ws, &room()).await;
        let blocked = tokio::time::timeout(Duration::from_millis(20), client.lock_document(&ws, &room())).await;
        assert!(blocked.is_err());

        // other documents are not affected
        let other = DocumentDescriptor::Entity(DocumentId::room_description(2));
        drop(client.lock_document(&ws, &other).await);

        assert!(!client.release_document_lock(&ws, &room()));
        drop(guard);
        assert!(client.release_document_lock(&ws, &room()));
        assert!(client.release_document_lock(&ws, &other));
        assert_eq!(client.tracked_locks(), 0);
    }
}
