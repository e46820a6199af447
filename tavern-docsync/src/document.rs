//! Live convergent document backed by a Yrs `Doc`.
//!
//! A `DocumentHandle` is the one mutable object for a logical document in
//! this process. Local edits run inside a single Yrs write transaction and
//! hand back that transaction's update delta; remote deltas and snapshots
//! are merged with `apply_update`, which is commutative and idempotent.
//!
//! The only non-merging operation is `reset_from`, used by rollback.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, TransactionMut, Update, WriteTxn};

use crate::doc_id::{DocumentDescriptor, WorkspaceId};

/// Root text shared type holding plain document content.
pub const CONTENT_ROOT: &str = "content";

/// Errors from the convergent runtime.
#[derive(Debug, Clone)]
pub enum DocumentError {
    /// Payload is not a valid v1 update
    InvalidUpdate(String),
    /// Update decoded but could not be integrated
    ApplyFailed(String),
}

impl std::fmt::Display for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentError::InvalidUpdate(e) => write!(f, "Invalid update: {e}"),
            DocumentError::ApplyFailed(e) => write!(f, "Failed to apply update: {e}"),
        }
    }
}

impl std::error::Error for DocumentError {}

/// Handle to one live document.
pub struct DocumentHandle {
    workspace: WorkspaceId,
    descriptor: DocumentDescriptor,
    doc: RwLock<Doc>,
}

impl DocumentHandle {
    /// Empty document.
    pub fn new(workspace: WorkspaceId, descriptor: DocumentDescriptor) -> Self {
        Self {
            workspace,
            descriptor,
            doc: RwLock::new(Doc::new()),
        }
    }

    /// Rebuild a document from its base state plus pending updates.
    ///
    /// Order does not matter; undecodable updates are skipped with a warning
    /// so one corrupt record cannot hide the rest of the document.
    pub fn from_state<'a>(
        workspace: WorkspaceId,
        descriptor: DocumentDescriptor,
        base: Option<&[u8]>,
        updates: impl IntoIterator<Item = &'a [u8]>,
    ) -> Result<Self, DocumentError> {
        let handle = Self::new(workspace, descriptor);
        if let Some(base) = base {
            handle.apply_update(base)?;
        }
        for update in updates {
            if let Err(e) = handle.apply_update(update) {
                log::warn!(
                    "Skipping unreadable update for {}/{}: {e}",
                    handle.workspace,
                    handle.descriptor
                );
            }
        }
        Ok(handle)
    }

    pub fn workspace(&self) -> &WorkspaceId {
        &self.workspace
    }

    pub fn descriptor(&self) -> &DocumentDescriptor {
        &self.descriptor
    }

    fn read(&self) -> RwLockReadGuard<'_, Doc> {
        self.doc.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Mutations are exclusive; reads may run concurrently.
    fn write(&self) -> RwLockWriteGuard<'_, Doc> {
        self.doc.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Run a local edit in one write transaction.
    ///
    /// Returns the closure's result and the update delta produced by the
    /// transaction (empty delta if nothing changed).
    pub fn edit<F, R>(&self, f: F) -> (R, Vec<u8>)
    where
        F: FnOnce(&mut TransactionMut) -> R,
    {
        let doc = self.write();
        let mut txn = doc.transact_mut();
        let result = f(&mut txn);
        let update = txn.encode_update_v1();
        (result, update)
    }

    /// Merge a delta or a full snapshot.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), DocumentError> {
        let update =
            Update::decode_v1(update).map_err(|e| DocumentError::InvalidUpdate(e.to_string()))?;
        let doc = self.write();
        let mut txn = doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| DocumentError::ApplyFailed(e.to_string()))
    }

    /// Full state as a v1 update.
    pub fn encode_state(&self) -> Vec<u8> {
        let doc = self.read();
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encoded state vector.
    pub fn state_vector(&self) -> Vec<u8> {
        let doc = self.read();
        let txn = doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Replace the whole document with the given snapshot.
    ///
    /// This discards local history instead of merging. The handle keeps its
    /// identity, so every holder sees the restored state.
    pub fn reset_from(&self, snapshot: &[u8]) -> Result<(), DocumentError> {
        let update =
            Update::decode_v1(snapshot).map_err(|e| DocumentError::InvalidUpdate(e.to_string()))?;
        let fresh = Doc::new();
        {
            let mut txn = fresh.transact_mut();
            txn.apply_update(update)
                .map_err(|e| DocumentError::ApplyFailed(e.to_string()))?;
        }
        *self.write() = fresh;
        Ok(())
    }

    // ─── Plain text content ───────────────────────────────────────────

    /// Current content of the `content` text root.
    pub fn text(&self) -> String {
        let doc = self.read();
        let txn = doc.transact();
        txn.get_text(CONTENT_ROOT)
            .map(|text| text.get_string(&txn))
            .unwrap_or_default()
    }

    /// Insert text at a character offset (clamped to the end).
    pub fn insert_text(&self, index: u32, chunk: &str) -> Vec<u8> {
        let ((), update) = self.edit(|txn| {
            let text = txn.get_or_insert_text(CONTENT_ROOT);
            let index = index.min(text.len(&*txn));
            text.insert(txn, index, chunk);
        });
        update
    }

    /// Append text at the end.
    pub fn push_text(&self, chunk: &str) -> Vec<u8> {
        self.insert_text(u32::MAX, chunk)
    }

    /// Replace the whole content.
    pub fn replace_text(&self, content: &str) -> Vec<u8> {
        let ((), update) = self.edit(|txn| {
            let text = txn.get_or_insert_text(CONTENT_ROOT);
            let len = text.len(&*txn);
            if len > 0 {
                text.remove_range(txn, 0, len);
            }
            text.insert(txn, 0, content);
        });
        update
    }
}

impl std::fmt::Debug for DocumentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentHandle")
            .field("workspace", &self.workspace)
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc_id::DocumentId;

    fn handle() -> DocumentHandle {
        DocumentHandle::new(
            WorkspaceId::space(1),
            DocumentDescriptor::Entity(DocumentId::room_description(1)),
        )
    }

    #[test]
    fn test_edit_produces_delta() {
        let doc = handle();
        let delta = doc.push_text("hello");
        assert!(!delta.is_empty());
        assert_eq!(doc.text(), "hello");

        let replica = handle();
        replica.apply_update(&delta).unwrap();
        assert_eq!(replica.text(), "hello");
    }

    #[test]
    fn test_merge_is_commutative() {
        let alice = handle();
        let bob = handle();
        let a = alice.push_text("A");
        let b = bob.push_text("B");

        let ab = handle();
        ab.apply_update(&a).unwrap();
        ab.apply_update(&b).unwrap();

        let ba = handle();
        ba.apply_update(&b).unwrap();
        ba.apply_update(&a).unwrap();

        assert_eq!(ab.text(), ba.text());
        assert_eq!(ab.text().len(), 2);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let source = handle();
        let delta = source.push_text("once");

        let target = handle();
        target.apply_update(&delta).unwrap();
        target.apply_update(&delta).unwrap();
        assert_eq!(target.text(), "once");
    }

    #[test]
    fn test_from_state_skips_garbage() {
        let source = handle();
        let d1 = source.push_text("hello");
        let d2 = source.push_text(" world");
        let garbage = vec![0xFF, 0x00, 0x13];

        let rebuilt = DocumentHandle::from_state(
            WorkspaceId::space(1),
            DocumentDescriptor::SpaceRoot,
            None,
            [d2.as_slice(), garbage.as_slice(), d1.as_slice()],
        )
        .unwrap();
        assert_eq!(rebuilt.text(), "hello world");
    }

    #[test]
    fn test_invalid_update_rejected() {
        let doc = handle();
        assert!(matches!(
            doc.apply_update(&[0xFF, 0xFF, 0xFF]),
            Err(DocumentError::InvalidUpdate(_))
        ));
    }

    #[test]
    fn test_reset_discards_later_edits() {
        let doc = handle();
        doc.push_text("v1");
        let snapshot = doc.encode_state();
        doc.push_text(" and more");

        doc.reset_from(&snapshot).unwrap();
        assert_eq!(doc.text(), "v1");

        // still editable after reset
        doc.push_text("!");
        assert_eq!(doc.text(), "v1!");
    }

    #[test]
    fn test_replace_text() {
        let doc = handle();
        doc.push_text("old title");
        doc.replace_text("new");
        assert_eq!(doc.text(), "new");
    }
}
