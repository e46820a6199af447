//! Append-only log of pending CRDT update deltas.
//!
//! ```text
//! key:   <workspace>\0<doc id>\0<seq: u64 BE>
//! value: bincode(StoredUpdate { doc_id, created_at, payload: LZ4 })
//! ```
//!
//! Records stay in the log until the server has confirmed a snapshot that
//! covers them (`compact_into_base`) or the document is deleted
//! (`purge_document`). Appends and clears of the same document are
//! serialized; different documents never contend.

use rocksdb::{Direction, IteratorMode, WriteBatch};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{
    compress, decode_record, decode_u64, decompress, doc_prefix, encode_record, now_millis,
    LocalStore, StoreError, CF_UPDATES,
};
use crate::doc_id::{self, DocumentDescriptor, WorkspaceId};

/// One pending update as returned by `list_all`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRecord {
    /// Auto-increment record id (insertion order)
    pub seq: u64,
    pub doc_id: String,
    pub payload: Vec<u8>,
    /// Append time (ms since epoch)
    pub created_at: u64,
}

#[derive(Serialize, Deserialize)]
struct StoredUpdate {
    doc_id: String,
    created_at: u64,
    payload: Vec<u8>,
}

/// Durable per-document update log.
pub struct UpdateLog {
    store: Arc<LocalStore>,
    /// Per-document write locks, keyed by document prefix
    locks: Mutex<HashMap<Vec<u8>, Arc<Mutex<()>>>>,
}

impl UpdateLog {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    async fn lock_doc(&self, prefix: &[u8]) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(prefix.to_vec())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Forget the lock of a document nobody holds or waits on.
    async fn release_lock(&self, prefix: &[u8]) {
        let mut locks = self.locks.lock().await;
        if locks.get(prefix).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(prefix);
        }
    }

    /// Durably append one update. Returns its sequence number.
    ///
    /// An error here means the edit was NOT recorded.
    pub async fn append(
        &self,
        workspace: &WorkspaceId,
        doc: &DocumentDescriptor,
        payload: &[u8],
    ) -> Result<u64, StoreError> {
        let prefix = doc_prefix(workspace, doc);
        let _guard = self.lock_doc(&prefix).await;

        let value = encode_record(&StoredUpdate {
            doc_id: doc.encode(),
            created_at: now_millis(),
            payload: compress(payload),
        })?;

        let cf = self.store.cf(CF_UPDATES)?;
        let result = self.store.commit_with_record_id(|seq, batch| {
            batch.put_cf(&cf, update_key(&prefix, seq), &value);
            Ok(())
        });

        match result {
            Ok(seq) => {
                log::debug!("Appended update #{seq} ({} bytes) for {workspace}/{doc}", payload.len());
                Ok(seq)
            }
            Err(e) => {
                log::error!("Failed to persist update for {workspace}/{doc}: {e}");
                Err(e)
            }
        }
    }

    /// All pending updates of a document, in insertion order.
    pub async fn list_all(
        &self,
        workspace: &WorkspaceId,
        doc: &DocumentDescriptor,
    ) -> Result<Vec<UpdateRecord>, StoreError> {
        let prefix = doc_prefix(workspace, doc);
        let cf = self.store.cf(CF_UPDATES)?;

        let mut records = Vec::new();
        for item in self
            .store
            .db()
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let stored: StoredUpdate = decode_record(&value)?;
            records.push(UpdateRecord {
                seq: decode_u64(&key[prefix.len()..]),
                doc_id: stored.doc_id,
                payload: decompress(&stored.payload)?,
                created_at: stored.created_at,
            });
        }
        Ok(records)
    }

    /// Number of pending updates of a document.
    pub async fn pending_count(
        &self,
        workspace: &WorkspaceId,
        doc: &DocumentDescriptor,
    ) -> Result<usize, StoreError> {
        let prefix = doc_prefix(workspace, doc);
        let cf = self.store.cf(CF_UPDATES)?;

        let mut count = 0;
        for item in self
            .store
            .db()
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Remove every pending update of a document in one atomic batch.
    pub async fn clear_all(
        &self,
        workspace: &WorkspaceId,
        doc: &DocumentDescriptor,
    ) -> Result<u64, StoreError> {
        let prefix = doc_prefix(workspace, doc);
        let _guard = self.lock_doc(&prefix).await;

        let mut batch = WriteBatch::default();
        let count = self.stage_clear(&mut batch, &prefix, u64::MAX)?;
        if count > 0 {
            self.store.write(batch)?;
        }
        Ok(count)
    }

    /// Replace the base state with `state` and drop updates with
    /// `seq <= up_to_seq`, atomically.
    ///
    /// Called only after the server confirmed a snapshot covering those
    /// updates. Updates appended later are kept.
    pub async fn compact_into_base(
        &self,
        workspace: &WorkspaceId,
        doc: &DocumentDescriptor,
        state: &[u8],
        up_to_seq: u64,
    ) -> Result<u64, StoreError> {
        let prefix = doc_prefix(workspace, doc);
        let _guard = self.lock_doc(&prefix).await;

        let mut batch = WriteBatch::default();
        let count = self.stage_clear(&mut batch, &prefix, up_to_seq)?;
        self.store.stage_base(&mut batch, workspace, doc, state)?;
        self.store.write(batch)?;

        log::debug!("Compacted {count} updates of {workspace}/{doc} into base state");
        Ok(count)
    }

    /// Overwrite the base state and keep pending updates.
    ///
    /// `state` must already contain everything the old base had.
    pub async fn store_base(
        &self,
        workspace: &WorkspaceId,
        doc: &DocumentDescriptor,
        state: &[u8],
    ) -> Result<(), StoreError> {
        let prefix = doc_prefix(workspace, doc);
        let _guard = self.lock_doc(&prefix).await;

        let mut batch = WriteBatch::default();
        self.store.stage_base(&mut batch, workspace, doc, state)?;
        self.store.write(batch)
    }

    /// Drop all pending updates and overwrite the base state (rollback).
    pub async fn reset_to(
        &self,
        workspace: &WorkspaceId,
        doc: &DocumentDescriptor,
        state: &[u8],
    ) -> Result<u64, StoreError> {
        let prefix = doc_prefix(workspace, doc);
        let _guard = self.lock_doc(&prefix).await;

        let mut batch = WriteBatch::default();
        let count = self.stage_clear(&mut batch, &prefix, u64::MAX)?;
        self.store.stage_base(&mut batch, workspace, doc, state)?;
        self.store.write(batch)?;
        Ok(count)
    }

    /// Drop all pending updates and the base state (deletion).
    pub async fn purge_document(
        &self,
        workspace: &WorkspaceId,
        doc: &DocumentDescriptor,
    ) -> Result<u64, StoreError> {
        let prefix = doc_prefix(workspace, doc);
        let count = {
            let _guard = self.lock_doc(&prefix).await;
            let mut batch = WriteBatch::default();
            let count = self.stage_clear(&mut batch, &prefix, u64::MAX)?;
            self.store.stage_base_delete(&mut batch, workspace, doc)?;
            self.store.write(batch)?;
            count
        };
        self.release_lock(&prefix).await;
        Ok(count)
    }

    /// Every document that still has pending updates, across workspaces.
    ///
    /// Used to resume syncing after a restart.
    pub fn documents_with_pending(&self) -> Result<Vec<(WorkspaceId, DocumentDescriptor)>, StoreError> {
        let cf = self.store.cf(CF_UPDATES)?;
        let mut docs: Vec<(WorkspaceId, DocumentDescriptor)> = Vec::new();

        for item in self.store.db().iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let Some((workspace, doc)) = parse_update_key(&key) else {
                log::warn!("Skipping malformed update key ({} bytes)", key.len());
                continue;
            };
            if docs.last() != Some(&(workspace.clone(), doc)) {
                docs.push((workspace, doc));
            }
        }
        Ok(docs)
    }

    fn stage_clear(
        &self,
        batch: &mut WriteBatch,
        prefix: &[u8],
        up_to_seq: u64,
    ) -> Result<u64, StoreError> {
        let cf = self.store.cf(CF_UPDATES)?;
        let mut count = 0u64;

        for item in self
            .store
            .db()
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            if decode_u64(&key[prefix.len()..]) > up_to_seq {
                break;
            }
            batch.delete_cf(&cf, &key);
            count += 1;
        }
        Ok(count)
    }
}

fn update_key(prefix: &[u8], seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 8);
    key.extend_from_slice(prefix);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn parse_update_key(key: &[u8]) -> Option<(WorkspaceId, DocumentDescriptor)> {
    if key.len() < 8 {
        return None;
    }
    let head = key[..key.len() - 8].strip_suffix(&[0])?;
    let split = head.iter().position(|b| *b == 0)?;
    let workspace = std::str::from_utf8(&head[..split]).ok()?;
    let doc = std::str::from_utf8(&head[split + 1..]).ok()?;
    Some((WorkspaceId::new(workspace), doc_id::decode(doc)?))
}
