//! In-process document service.
//!
//! Backs the WebSocket `DocServer` and doubles as the test double for the
//! sync client. It keeps, per document, one snapshot plus the updates
//! received since, and tracks its own snapshot watermark:
//!
//! - `upsert_snapshot` (merge) folds the current snapshot, every retained
//!   update and the uploaded state into a new snapshot stamped with a fresh
//!   server time. The snapshot covers every update received before it.
//! - `compact` past the snapshot time is ignored.
//! - `push_update` remembers client ids and acknowledges retries as
//!   duplicates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use super::{
    CompactAck, PushAck, RemoteDocService, RemoteError, RemoteSnapshot, SnapshotAck, UpsertMode,
};
use crate::doc_id::DocumentId;
use crate::storage::now_millis;

#[derive(Debug, Clone)]
struct RetainedUpdate {
    server_time: u64,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct RemoteDoc {
    snapshot: Option<Vec<u8>>,
    snapshot_time: Option<u64>,
    updates: Vec<RetainedUpdate>,
    /// client id → server time of the first delivery
    seen_clients: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct ServiceState {
    last_time: u64,
    docs: HashMap<DocumentId, RemoteDoc>,
}

impl ServiceState {
    /// Strictly increasing server clock.
    fn tick(&mut self) -> u64 {
        self.last_time = now_millis().max(self.last_time + 1);
        self.last_time
    }
}

/// Document service holding everything in memory.
#[derive(Debug, Default)]
pub struct MemoryDocService {
    state: Mutex<ServiceState>,
    offline: AtomicBool,
    latency_ms: AtomicU64,
    requests: AtomicU64,
}

impl MemoryDocService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an unreachable service: every call fails with a network error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every call (for timeout tests).
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Total calls received, including failed ones.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    /// Updates retained since the last compaction.
    pub fn retained_updates(&self, key: &DocumentId) -> usize {
        self.lock().docs.get(key).map_or(0, |doc| doc.updates.len())
    }

    /// Server time of the current snapshot.
    pub fn snapshot_time(&self, key: &DocumentId) -> Option<u64> {
        self.lock().docs.get(key).and_then(|doc| doc.snapshot_time)
    }

    pub fn contains(&self, key: &DocumentId) -> bool {
        self.lock().docs.contains_key(key)
    }

    fn lock(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn enter(&self) -> Result<(), RemoteError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("service offline".into()));
        }
        Ok(())
    }
}

fn decode_update(payload: &[u8]) -> Result<Update, RemoteError> {
    Update::decode_v1(payload).map_err(|e| RemoteError::Rejected(format!("invalid update: {e}")))
}

fn merge_state<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Result<Vec<u8>, RemoteError> {
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        for part in parts {
            txn.apply_update(decode_update(part)?)
                .map_err(|e| RemoteError::Rejected(format!("cannot apply update: {e}")))?;
        }
    }
    let txn = doc.transact();
    Ok(txn.encode_state_as_update_v1(&StateVector::default()))
}

#[async_trait]
impl RemoteDocService for MemoryDocService {
    async fn fetch_snapshot(&self, key: &DocumentId) -> Result<Option<RemoteSnapshot>, RemoteError> {
        self.enter().await?;
        let state = self.lock();
        let Some(doc) = state.docs.get(key) else {
            return Ok(None);
        };
        if doc.snapshot.is_none() && doc.updates.is_empty() {
            return Ok(None);
        }

        let parts = doc
            .snapshot
            .iter()
            .map(Vec::as_slice)
            .chain(doc.updates.iter().map(|u| u.payload.as_slice()));
        let payload = merge_state(parts)?;
        let server_time = doc
            .updates
            .iter()
            .map(|u| u.server_time)
            .chain(doc.snapshot_time)
            .max()
            .unwrap_or_default();
        Ok(Some(RemoteSnapshot {
            payload,
            server_time,
        }))
    }

    async fn upsert_snapshot(
        &self,
        key: &DocumentId,
        payload: &[u8],
        mode: UpsertMode,
    ) -> Result<SnapshotAck, RemoteError> {
        self.enter().await?;
        let mut state = self.lock();
        let server_time = state.tick();
        let doc = state.docs.entry(*key).or_default();

        let snapshot = match mode {
            UpsertMode::Merge => {
                let parts = doc
                    .snapshot
                    .iter()
                    .map(Vec::as_slice)
                    .chain(doc.updates.iter().map(|u| u.payload.as_slice()))
                    .chain(std::iter::once(payload));
                merge_state(parts)?
            }
            UpsertMode::Replace => {
                decode_update(payload)?;
                doc.updates.clear();
                payload.to_vec()
            }
        };
        doc.snapshot = Some(snapshot);
        doc.snapshot_time = Some(server_time);

        log::debug!("Snapshot for {key} stored at {server_time} ({mode:?})");
        Ok(SnapshotAck { server_time })
    }

    async fn push_update(
        &self,
        key: &DocumentId,
        payload: &[u8],
        client_id: Option<&str>,
    ) -> Result<PushAck, RemoteError> {
        self.enter().await?;
        decode_update(payload)?;

        let mut state = self.lock();
        if let Some(seen) = client_id.and_then(|id| state.docs.get(key)?.seen_clients.get(id).copied()) {
            return Ok(PushAck {
                server_time: seen,
                duplicate: true,
            });
        }

        let server_time = state.tick();
        let doc = state.docs.entry(*key).or_default();
        doc.updates.push(RetainedUpdate {
            server_time,
            payload: payload.to_vec(),
        });
        if let Some(id) = client_id {
            doc.seen_clients.insert(id.to_string(), server_time);
        }
        Ok(PushAck {
            server_time,
            duplicate: false,
        })
    }

    async fn compact(&self, key: &DocumentId, before_or_eq: u64) -> Result<CompactAck, RemoteError> {
        self.enter().await?;
        let mut state = self.lock();
        let Some(doc) = state.docs.get_mut(key) else {
            return Ok(CompactAck { removed: 0 });
        };

        match doc.snapshot_time {
            Some(snapshot_time) if before_or_eq <= snapshot_time => {
                let before = doc.updates.len();
                doc.updates.retain(|u| u.server_time > before_or_eq);
                let removed = (before - doc.updates.len()) as u64;
                log::debug!("Compacted {removed} updates of {key} at or before {before_or_eq}");
                Ok(CompactAck { removed })
            }
            snapshot_time => {
                log::warn!(
                    "Ignoring compaction of {key} at {before_or_eq}: snapshot watermark is {snapshot_time:?}"
                );
                Ok(CompactAck { removed: 0 })
            }
        }
    }

    async fn remove_document(&self, key: &DocumentId) -> Result<(), RemoteError> {
        self.enter().await?;
        if self.lock().docs.remove(key).is_some() {
            log::info!("Removed remote document {key}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{GetString, Text, WriteTxn};

    fn text_update(client: u64, content: &str) -> Vec<u8> {
        let doc = Doc::with_client_id(client);
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("content");
        text.insert(&mut txn, 0, content);
        txn.encode_update_v1()
    }

    fn text_of(payload: &[u8]) -> String {
        let doc = Doc::new();
        let mut txn = doc.transact_mut();
        txn.apply_update(Update::decode_v1(payload).unwrap()).unwrap();
        let text = txn.get_or_insert_text("content");
        text.get_string(&txn)
    }

    fn key() -> DocumentId {
        DocumentId::room_description(1)
    }

    #[tokio::test]
    async fn test_unknown_document_is_absent() {
        let service = MemoryDocService::new();
        assert_eq!(service.fetch_snapshot(&key()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fetch_merges_updates() {
        let service = MemoryDocService::new();
        service.push_update(&key(), &text_update(1, "a"), None).await.unwrap();
        service.push_update(&key(), &text_update(2, "b"), None).await.unwrap();

        let snapshot = service.fetch_snapshot(&key()).await.unwrap().unwrap();
        let text = text_of(&snapshot.payload);
        assert_eq!(text.len(), 2);
        assert!(text.contains('a') && text.contains('b'));
    }

    #[tokio::test]
    async fn test_duplicate_client_id() {
        let service = MemoryDocService::new();
        let update = text_update(1, "once");

        let first = service.push_update(&key(), &update, Some("c:1")).await.unwrap();
        let retry = service.push_update(&key(), &update, Some("c:1")).await.unwrap();
        assert!(!first.duplicate);
        assert!(retry.duplicate);
        assert_eq!(retry.server_time, first.server_time);
        assert_eq!(service.retained_updates(&key()), 1);
    }

    #[tokio::test]
    async fn test_invalid_update_rejected() {
        let service = MemoryDocService::new();
        let err = service.push_update(&key(), &[0xFF, 0xFF], None).await.unwrap_err();
        assert!(matches!(err, RemoteError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_compaction_limited_to_snapshot_watermark() {
        let service = MemoryDocService::new();
        service.push_update(&key(), &text_update(1, "a"), None).await.unwrap();
        let ack = service
            .upsert_snapshot(&key(), &text_update(1, "a"), UpsertMode::Merge)
            .await
            .unwrap();
        let late = service.push_update(&key(), &text_update(2, "b"), None).await.unwrap();
        assert!(late.server_time > ack.server_time);

        // beyond the watermark: ignored
        let refused = service.compact(&key(), late.server_time).await.unwrap();
        assert_eq!(refused.removed, 0);
        assert_eq!(service.retained_updates(&key()), 2);

        let done = service.compact(&key(), ack.server_time).await.unwrap();
        assert_eq!(done.removed, 1);
        assert_eq!(service.retained_updates(&key()), 1);

        let text = text_of(&service.fetch_snapshot(&key()).await.unwrap().unwrap().payload);
        assert!(text.contains('a') && text.contains('b'));
    }

    #[tokio::test]
    async fn test_merge_upsert_keeps_foreign_updates() {
        let service = MemoryDocService::new();
        service.push_update(&key(), &text_update(2, "other"), None).await.unwrap();
        let ack = service
            .upsert_snapshot(&key(), &text_update(1, "mine"), UpsertMode::Merge)
            .await
            .unwrap();
        service.compact(&key(), ack.server_time).await.unwrap();
        assert_eq!(service.retained_updates(&key()), 0);

        let text = text_of(&service.fetch_snapshot(&key()).await.unwrap().unwrap().payload);
        assert!(text.contains("other") && text.contains("mine"));
    }

    #[tokio::test]
    async fn test_replace_upsert_drops_retained() {
        let service = MemoryDocService::new();
        service.push_update(&key(), &text_update(2, "gone"), None).await.unwrap();
        service
            .upsert_snapshot(&key(), &text_update(1, "restored"), UpsertMode::Replace)
            .await
            .unwrap();

        assert_eq!(service.retained_updates(&key()), 0);
        let text = text_of(&service.fetch_snapshot(&key()).await.unwrap().unwrap().payload);
        assert_eq!(text, "restored");
    }

    #[tokio::test]
    async fn test_offline_and_remove() {
        let service = MemoryDocService::new();
        service.push_update(&key(), &text_update(1, "x"), None).await.unwrap();

        service.set_offline(true);
        assert!(matches!(
            service.fetch_snapshot(&key()).await,
            Err(RemoteError::Network(_))
        ));
        service.set_offline(false);

        service.remove_document(&key()).await.unwrap();
        assert!(!service.contains(&key()));
        service.remove_document(&key()).await.unwrap();
        assert_eq!(service.request_count(), 4);
    }
}
