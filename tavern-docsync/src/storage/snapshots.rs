//! Version history: full-state snapshots per (workspace, document).
//!
//! ```text
//! CF "snapshots"       id (u64 BE)                        → record (payload LZ4)
//! CF "snapshot_index"  <ws>\0<doc>\0<created_at BE><id BE> → summary
//! ```
//!
//! A snapshot is a self-contained checkpoint; it never depends on the
//! update log. Listing walks the index backwards, so newer snapshots come
//! first and snapshots taken in the same millisecond are ordered by id.

use rocksdb::{Direction, IteratorMode, WriteBatch};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{
    compress, decode_record, decompress, doc_prefix, encode_record, now_millis, LocalStore,
    StoreError, CF_SNAPSHOTS, CF_SNAPSHOT_INDEX,
};
use crate::doc_id::{DocumentDescriptor, WorkspaceId};

/// Identifier of a stored snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotId(pub u64);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "snapshot#{}", self.0)
    }
}

/// Snapshot listing entry (no payload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub id: SnapshotId,
    pub workspace_id: String,
    pub doc_id: String,
    pub label: Option<String>,
    /// ms since epoch
    pub created_at: u64,
    /// Uncompressed payload size
    pub size: u64,
}

#[derive(Serialize, Deserialize)]
struct StoredSnapshot {
    summary: SnapshotSummary,
    payload: Vec<u8>,
}

/// Snapshot store over the shared `LocalStore`.
pub struct SnapshotStore {
    store: Arc<LocalStore>,
    /// Highest `created_at` handed out, seeded from disk on open.
    /// `created_at` never decreases, across restarts too.
    last_created_at: AtomicU64,
}

impl SnapshotStore {
    pub fn new(store: Arc<LocalStore>) -> Result<Self, StoreError> {
        let last_created_at = latest_created_at(&store)?;
        Ok(Self {
            store,
            last_created_at: AtomicU64::new(last_created_at),
        })
    }

    /// Append a full-state checkpoint. No dedup, no size limit.
    pub async fn add_snapshot(
        &self,
        workspace: &WorkspaceId,
        doc: &DocumentDescriptor,
        payload: &[u8],
        label: Option<&str>,
    ) -> Result<SnapshotId, StoreError> {
        let cf_snapshots = self.store.cf(CF_SNAPSHOTS)?;
        let cf_index = self.store.cf(CF_SNAPSHOT_INDEX)?;
        let prefix = doc_prefix(workspace, doc);
        let compressed = compress(payload);

        // Stamped under the id lock so id order and time order agree.
        let id = self.store.commit_with_record_id(|id, batch| {
            let now = now_millis();
            let created_at = self.last_created_at.fetch_max(now, Ordering::SeqCst).max(now);
            let summary = SnapshotSummary {
                id: SnapshotId(id),
                workspace_id: workspace.as_str().to_string(),
                doc_id: doc.encode(),
                label: label.map(str::to_string),
                created_at,
                size: payload.len() as u64,
            };
            batch.put_cf(&cf_index, index_key(&prefix, created_at, id), encode_record(&summary)?);
            batch.put_cf(
                &cf_snapshots,
                id.to_be_bytes(),
                encode_record(&StoredSnapshot {
                    summary,
                    payload: compressed,
                })?,
            );
            Ok(())
        })?;

        log::info!(
            "Stored snapshot #{id} for {workspace}/{doc} ({} bytes, label {:?})",
            payload.len(),
            label
        );
        Ok(SnapshotId(id))
    }

    /// Snapshots of a document, most recent first.
    pub async fn list_snapshots(
        &self,
        workspace: &WorkspaceId,
        doc: &DocumentDescriptor,
        limit: Option<usize>,
    ) -> Result<Vec<SnapshotSummary>, StoreError> {
        let cf = self.store.cf(CF_SNAPSHOT_INDEX)?;
        let prefix = doc_prefix(workspace, doc);
        let upper = index_key(&prefix, u64::MAX, u64::MAX);
        let limit = limit.unwrap_or(usize::MAX);

        let mut summaries = Vec::new();
        for item in self
            .store
            .db()
            .iterator_cf(&cf, IteratorMode::From(&upper, Direction::Reverse))
        {
            if summaries.len() >= limit {
                break;
            }
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            summaries.push(decode_record(&value)?);
        }
        Ok(summaries)
    }

    /// Summary of one snapshot, or `None` if it does not exist.
    pub async fn get_snapshot(&self, id: SnapshotId) -> Result<Option<SnapshotSummary>, StoreError> {
        Ok(self.load(id)?.map(|stored| stored.summary))
    }

    /// Raw payload of one snapshot, or `None` if it does not exist.
    pub async fn get_snapshot_payload(&self, id: SnapshotId) -> Result<Option<Vec<u8>>, StoreError> {
        match self.load(id)? {
            Some(stored) => Ok(Some(decompress(&stored.payload)?)),
            None => Ok(None),
        }
    }

    /// Keep the newest `keep` snapshots of a document and drop the rest.
    pub async fn prune_snapshots(
        &self,
        workspace: &WorkspaceId,
        doc: &DocumentDescriptor,
        keep: usize,
    ) -> Result<usize, StoreError> {
        let all = self.list_snapshots(workspace, doc, None).await?;
        let doomed = all.into_iter().skip(keep).collect::<Vec<_>>();
        self.delete(workspace, doc, &doomed)?;
        Ok(doomed.len())
    }

    /// Drop the whole history of a document.
    pub async fn delete_snapshots(
        &self,
        workspace: &WorkspaceId,
        doc: &DocumentDescriptor,
    ) -> Result<usize, StoreError> {
        self.prune_snapshots(workspace, doc, 0).await
    }

    fn load(&self, id: SnapshotId) -> Result<Option<StoredSnapshot>, StoreError> {
        let cf = self.store.cf(CF_SNAPSHOTS)?;
        match self.store.db().get_cf(&cf, id.0.to_be_bytes())? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    fn delete(
        &self,
        workspace: &WorkspaceId,
        doc: &DocumentDescriptor,
        doomed: &[SnapshotSummary],
    ) -> Result<(), StoreError> {
        if doomed.is_empty() {
            return Ok(());
        }
        let cf_snapshots = self.store.cf(CF_SNAPSHOTS)?;
        let cf_index = self.store.cf(CF_SNAPSHOT_INDEX)?;
        let prefix = doc_prefix(workspace, doc);

        let mut batch = WriteBatch::default();
        for summary in doomed {
            batch.delete_cf(&cf_index, index_key(&prefix, summary.created_at, summary.id.0));
            batch.delete_cf(&cf_snapshots, summary.id.0.to_be_bytes());
        }
        self.store.write(batch)
    }
}

/// `created_at` of the newest snapshot (highest id), 0 if there is none.
fn latest_created_at(store: &LocalStore) -> Result<u64, StoreError> {
    let cf = store.cf(CF_SNAPSHOTS)?;
    match store.db().iterator_cf(&cf, IteratorMode::End).next() {
        Some(item) => {
            let (_, value) = item?;
            let stored: StoredSnapshot = decode_record(&value)?;
            Ok(stored.summary.created_at)
        }
        None => Ok(0),
    }
}

fn index_key(prefix: &[u8], created_at: u64, id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 16);
    key.extend_from_slice(prefix);
    key.extend_from_slice(&created_at.to_be_bytes());
    key.extend_from_slice(&id.to_be_bytes());
    key
}
