//! Workspace/document registry.
//!
//! ```text
//! DocumentRegistry
//!   └── WorkspaceId ─► OnceCell<Arc<Workspace>>   (loaded once per process)
//!                         ├── meta:      doc id → DocumentMeta
//!                         └── documents: descriptor → Arc<DocumentHandle>
//! ```
//!
//! The registry is an explicit context object: create one per process and
//! pass it to whoever needs a document. It hands out the same `Arc` for the
//! same id, so concurrent edits always land on one Yrs document.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, OnceCell};

use crate::doc_id::{self, DocumentDescriptor, WorkspaceId};
use crate::document::DocumentHandle;
use crate::error::SyncError;
use crate::storage::{DocumentMeta, LocalStore, UpdateLog};

/// Result of `ensure_meta`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaChange {
    Created,
    Renamed { from: String },
    Unchanged,
}

/// One collaborative container (a space) and its live documents.
pub struct Workspace {
    id: WorkspaceId,
    log: Arc<UpdateLog>,
    /// Directory entries keyed by canonical doc id
    meta: RwLock<BTreeMap<String, DocumentMeta>>,
    /// Live documents; held across the cold-load await so one id never
    /// yields two handles
    documents: Mutex<HashMap<DocumentDescriptor, Arc<DocumentHandle>>>,
}

impl Workspace {
    /// Load metadata and the persisted state of every known document.
    async fn load(id: WorkspaceId, log: Arc<UpdateLog>) -> Result<Self, SyncError> {
        let metas = log.store().list_meta(&id)?;
        let mut documents = HashMap::new();
        let mut meta = BTreeMap::new();

        for entry in metas {
            match doc_id::decode(&entry.id) {
                Some(descriptor) => {
                    let handle = load_document(&log, &id, descriptor).await?;
                    documents.insert(descriptor, Arc::new(handle));
                }
                None => log::warn!("Workspace {id} lists undecodable document id {:?}", entry.id),
            }
            meta.insert(entry.id.clone(), entry);
        }

        log::info!("Loaded workspace {id} with {} documents", documents.len());
        Ok(Self {
            id,
            log,
            meta: RwLock::new(meta),
            documents: Mutex::new(documents),
        })
    }

    pub fn id(&self) -> &WorkspaceId {
        &self.id
    }

    /// Live handle for a document, loading it from disk on first access.
    pub async fn document(&self, descriptor: DocumentDescriptor) -> Result<Arc<DocumentHandle>, SyncError> {
        let mut documents = self.documents.lock().await;
        if let Some(handle) = documents.get(&descriptor) {
            return Ok(handle.clone());
        }
        let handle = Arc::new(load_document(&self.log, &self.id, descriptor).await?);
        documents.insert(descriptor, handle.clone());
        Ok(handle)
    }

    /// Rebuild a loaded document from base state plus pending log, in
    /// place, so every holder of the handle sees only persisted changes.
    ///
    /// If the persisted state cannot be read the handle is evicted and the
    /// next access loads it again.
    pub async fn reload_document(&self, descriptor: &DocumentDescriptor) -> Result<(), SyncError> {
        let mut documents = self.documents.lock().await;
        let Some(handle) = documents.get(descriptor).cloned() else {
            return Ok(());
        };
        let reloaded = match load_document(&self.log, &self.id, *descriptor).await {
            Ok(fresh) => handle.reset_from(&fresh.encode_state()).map_err(SyncError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = &reloaded {
            log::warn!("Evicting {}/{descriptor} after failed reload: {e}", self.id);
            documents.remove(descriptor);
        }
        reloaded
    }

    /// Live handle if the document is already loaded.
    pub async fn loaded_document(&self, descriptor: &DocumentDescriptor) -> Option<Arc<DocumentHandle>> {
        self.documents.lock().await.get(descriptor).cloned()
    }

    /// Directory entry of a document.
    pub fn meta(&self, descriptor: &DocumentDescriptor) -> Option<DocumentMeta> {
        self.read_meta().get(&descriptor.encode()).cloned()
    }

    /// All directory entries, ordered by document id.
    pub fn list_meta(&self) -> Vec<DocumentMeta> {
        self.read_meta().values().cloned().collect()
    }

    /// Create or retitle a directory entry. Writes nothing when unchanged.
    pub fn ensure_meta(
        &self,
        descriptor: &DocumentDescriptor,
        title: Option<&str>,
    ) -> Result<MetaChange, SyncError> {
        let key = descriptor.encode();
        let mut meta = self.meta.write().unwrap_or_else(|e| e.into_inner());

        match meta.get(&key) {
            Some(existing) => {
                let Some(title) = title else {
                    return Ok(MetaChange::Unchanged);
                };
                if existing.title == title {
                    return Ok(MetaChange::Unchanged);
                }
                let mut updated = existing.clone();
                let from = std::mem::replace(&mut updated.title, title.to_string());
                self.log.store().save_meta(&self.id, &updated)?;
                meta.insert(key, updated);
                log::debug!("Renamed {}/{descriptor}: {from:?} -> {title:?}", self.id);
                Ok(MetaChange::Renamed { from })
            }
            None => {
                let created = DocumentMeta::new(key.clone(), title.unwrap_or_default());
                self.log.store().save_meta(&self.id, &created)?;
                meta.insert(key, created);
                log::debug!("Registered {}/{descriptor}", self.id);
                Ok(MetaChange::Created)
            }
        }
    }

    /// Drop a document from the directory and from the live set.
    ///
    /// Returns whether anything was removed.
    pub async fn remove_document(&self, descriptor: &DocumentDescriptor) -> Result<bool, SyncError> {
        let key = descriptor.encode();
        self.log.store().delete_meta(&self.id, descriptor)?;
        let had_meta = self
            .meta
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key)
            .is_some();
        let had_handle = self.documents.lock().await.remove(descriptor).is_some();
        Ok(had_meta || had_handle)
    }

    fn read_meta(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, DocumentMeta>> {
        self.meta.read().unwrap_or_else(|e| e.into_inner())
    }
}

async fn load_document(
    log: &UpdateLog,
    workspace: &WorkspaceId,
    descriptor: DocumentDescriptor,
) -> Result<DocumentHandle, SyncError> {
    let base = log.store().load_base(workspace, &descriptor)?;
    let pending = log.list_all(workspace, &descriptor).await?;
    let handle = DocumentHandle::from_state(
        workspace.clone(),
        descriptor,
        base.as_deref(),
        pending.iter().map(|record| record.payload.as_slice()),
    )?;
    log::debug!(
        "Loaded {workspace}/{descriptor} (base: {}, pending: {})",
        base.is_some(),
        pending.len()
    );
    Ok(handle)
}

/// Process-wide registry of workspaces.
pub struct DocumentRegistry {
    log: Arc<UpdateLog>,
    workspaces: Mutex<HashMap<WorkspaceId, Arc<OnceCell<Arc<Workspace>>>>>,
}

impl DocumentRegistry {
    pub fn new(log: Arc<UpdateLog>) -> Self {
        Self {
            log,
            workspaces: Mutex::new(HashMap::new()),
        }
    }

    pub fn log(&self) -> &Arc<UpdateLog> {
        &self.log
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        self.log.store()
    }

    /// Same `Arc<Workspace>` for the same id, loaded exactly once even when
    /// called concurrently.
    pub async fn get_or_create_workspace(&self, id: &WorkspaceId) -> Result<Arc<Workspace>, SyncError> {
        let cell = {
            let mut workspaces = self.workspaces.lock().await;
            workspaces
                .entry(id.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        let workspace = cell
            .get_or_try_init(|| async {
                Workspace::load(id.clone(), self.log.clone()).await.map(Arc::new)
            })
            .await?;
        Ok(workspace.clone())
    }

    pub async fn get_or_create_document(
        &self,
        workspace: &WorkspaceId,
        descriptor: DocumentDescriptor,
    ) -> Result<Arc<DocumentHandle>, SyncError> {
        self.get_or_create_workspace(workspace)
            .await?
            .document(descriptor)
            .await
    }

    pub async fn ensure_meta(
        &self,
        workspace: &WorkspaceId,
        descriptor: &DocumentDescriptor,
        title: Option<&str>,
    ) -> Result<MetaChange, SyncError> {
        self.get_or_create_workspace(workspace)
            .await?
            .ensure_meta(descriptor, title)
    }

    pub async fn list_meta(&self, workspace: &WorkspaceId) -> Result<Vec<DocumentMeta>, SyncError> {
        Ok(self.get_or_create_workspace(workspace).await?.list_meta())
    }

    /// Apply business titles (room names, space name). Returns how many
    /// entries were created or renamed.
    pub async fn sync_titles<I, S>(&self, workspace: &WorkspaceId, titles: I) -> Result<usize, SyncError>
    where
        I: IntoIterator<Item = (DocumentDescriptor, S)>,
        S: AsRef<str>,
    {
        let ws = self.get_or_create_workspace(workspace).await?;
        let mut changed = 0;
        for (descriptor, title) in titles {
            if ws.ensure_meta(&descriptor, Some(title.as_ref()))? != MetaChange::Unchanged {
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Remove a document's metadata and live handle.
    pub async fn remove_document(
        &self,
        workspace: &WorkspaceId,
        descriptor: &DocumentDescriptor,
    ) -> Result<bool, SyncError> {
        self.get_or_create_workspace(workspace)
            .await?
            .remove_document(descriptor)
            .await
    }

    /// See [`Workspace::reload_document`].
    pub async fn reload_document(
        &self,
        workspace: &WorkspaceId,
        descriptor: &DocumentDescriptor,
    ) -> Result<(), SyncError> {
        self.get_or_create_workspace(workspace)
            .await?
            .reload_document(descriptor)
            .await
    }

    /// Workspace if it has already been loaded.
    pub async fn loaded_workspace(&self, id: &WorkspaceId) -> Option<Arc<Workspace>> {
        let workspaces = self.workspaces.lock().await;
        workspaces.get(id).and_then(|cell| cell.get().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc_id::DocumentId;
    use crate::storage::StoreConfig;
    use tempfile::{tempdir, TempDir};

    fn open_registry(dir: &TempDir) -> DocumentRegistry {
        let store = LocalStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        DocumentRegistry::new(Arc::new(UpdateLog::new(Arc::new(store))))
    }

    fn room(id: u64) -> DocumentDescriptor {
        DocumentDescriptor::Entity(DocumentId::room_description(id))
    }

    #[tokio::test]
    async fn test_same_workspace_instance() {
        let dir = tempdir().unwrap();
        let registry = open_registry(&dir);
        let ws = WorkspaceId::space(1);

        let a = registry.get_or_create_workspace(&ws).await.unwrap();
        let b = registry.get_or_create_workspace(&ws).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let other = registry.get_or_create_workspace(&WorkspaceId::space(2)).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[tokio::test]
    async fn test_concurrent_workspace_creation_yields_one_instance() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(open_registry(&dir));
        let ws = WorkspaceId::space(1);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let ws = ws.clone();
            handles.push(tokio::spawn(async move {
                registry.get_or_create_workspace(&ws).await.unwrap()
            }));
        }
        let mut workspaces = Vec::new();
        for h in handles {
            workspaces.push(h.await.unwrap());
        }
        for w in &workspaces[1..] {
            assert!(Arc::ptr_eq(&workspaces[0], w));
        }
    }

    #[tokio::test]
    async fn test_same_document_handle() {
        let dir = tempdir().unwrap();
        let registry = open_registry(&dir);
        let ws = WorkspaceId::space(1);

        let a = registry.get_or_create_document(&ws, room(3)).await.unwrap();
        let b = registry.get_or_create_document(&ws, room(3)).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        a.push_text("shared");
        assert_eq!(b.text(), "shared");
    }

    #[tokio::test]
    async fn test_reload_drops_unlogged_changes() {
        let dir = tempdir().unwrap();
        let registry = open_registry(&dir);
        let ws = WorkspaceId::space(1);

        let handle = registry.get_or_create_document(&ws, room(3)).await.unwrap();
        let logged = handle.push_text("logged");
        registry.log().append(&ws, &room(3), &logged).await.unwrap();
        handle.push_text(" never logged");

        registry.reload_document(&ws, &room(3)).await.unwrap();
        assert_eq!(handle.text(), "logged");
        let again = registry.get_or_create_document(&ws, room(3)).await.unwrap();
        assert!(Arc::ptr_eq(&handle, &again));
    }

    #[tokio::test]
    async fn test_ensure_meta_transitions() {
        let dir = tempdir().unwrap();
        let registry = open_registry(&dir);
        let ws = WorkspaceId::space(1);

        assert_eq!(
            registry.ensure_meta(&ws, &room(1), Some("Tavern")).await.unwrap(),
            MetaChange::Created
        );
        assert_eq!(
            registry.ensure_meta(&ws, &room(1), Some("Tavern")).await.unwrap(),
            MetaChange::Unchanged
        );
        assert_eq!(
            registry.ensure_meta(&ws, &room(1), None).await.unwrap(),
            MetaChange::Unchanged
        );
        assert_eq!(
            registry.ensure_meta(&ws, &room(1), Some("Cellar")).await.unwrap(),
            MetaChange::Renamed { from: "Tavern".into() }
        );

        let listed = registry.list_meta(&ws).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].title, "Cellar");
        assert_eq!(listed[0].id, "room:1:description");
    }

    #[tokio::test]
    async fn test_sync_titles_counts_changes() {
        let dir = tempdir().unwrap();
        let registry = open_registry(&dir);
        let ws = WorkspaceId::space(1);

        let titles = vec![
            (DocumentDescriptor::SpaceRoot, "Campaign"),
            (room(1), "Tavern"),
            (room(2), "Road"),
        ];
        assert_eq!(registry.sync_titles(&ws, titles.clone()).await.unwrap(), 3);
        assert_eq!(registry.sync_titles(&ws, titles).await.unwrap(), 0);
        assert_eq!(
            registry.sync_titles(&ws, vec![(room(2), "Forest Road")]).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_workspace_reload_restores_meta_and_state() {
        let dir = tempdir().unwrap();
        let ws = WorkspaceId::space(7);

        {
            let registry = open_registry(&dir);
            registry.ensure_meta(&ws, &room(1), Some("Tavern")).await.unwrap();
            let doc = registry.get_or_create_document(&ws, room(1)).await.unwrap();
            let delta = doc.push_text("persisted");
            registry.log().append(&ws, &room(1), &delta).await.unwrap();
        }

        let registry = open_registry(&dir);
        let workspace = registry.get_or_create_workspace(&ws).await.unwrap();
        assert_eq!(workspace.meta(&room(1)).unwrap().title, "Tavern");

        let doc = workspace.loaded_document(&room(1)).await.expect("loaded eagerly");
        assert_eq!(doc.text(), "persisted");
    }

    #[tokio::test]
    async fn test_remove_document() {
        let dir = tempdir().unwrap();
        let registry = open_registry(&dir);
        let ws = WorkspaceId::space(1);

        registry.ensure_meta(&ws, &room(1), Some("Tavern")).await.unwrap();
        let before = registry.get_or_create_document(&ws, room(1)).await.unwrap();

        assert!(registry.remove_document(&ws, &room(1)).await.unwrap());
        assert!(registry.list_meta(&ws).await.unwrap().is_empty());

        let after = registry.get_or_create_document(&ws, room(1)).await.unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(!registry.remove_document(&ws, &room(99)).await.unwrap());
    }
}
