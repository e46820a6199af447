//! One-call wiring of the whole engine.

use std::sync::Arc;

use crate::cleanup::DeletionCoordinator;
use crate::config::EngineConfig;
use crate::registry::DocumentRegistry;
use crate::remote::{RemoteDocService, WsDocService};
use crate::rollback::SnapshotController;
use crate::session::SyncSession;
use crate::storage::{LocalStore, SnapshotStore, StoreError, UpdateLog};
use crate::sync::RemoteSyncClient;

/// Every component over one shared `LocalStore`.
pub struct DocSyncEngine {
    pub store: Arc<LocalStore>,
    pub registry: Arc<DocumentRegistry>,
    pub snapshots: Arc<SnapshotStore>,
    pub remote: Arc<RemoteSyncClient>,
    pub session: SyncSession,
    pub history: SnapshotController,
    pub deletion: DeletionCoordinator,
}

impl DocSyncEngine {
    /// Open the local store and talk to `service`.
    pub fn open(config: EngineConfig, service: Arc<dyn RemoteDocService>) -> Result<Self, StoreError> {
        let store = Arc::new(LocalStore::open(config.store)?);
        let registry = Arc::new(DocumentRegistry::new(Arc::new(UpdateLog::new(store.clone()))));
        let snapshots = Arc::new(SnapshotStore::new(store.clone())?);
        let remote = Arc::new(RemoteSyncClient::new(service, config.remote));

        log::info!("Document sync engine opened at {}", store.path().display());
        Ok(Self {
            session: SyncSession::new(registry.clone(), remote.clone()),
            history: SnapshotController::new(
                registry.clone(),
                snapshots.clone(),
                remote.clone(),
                config.snapshot_keep,
            ),
            deletion: DeletionCoordinator::new(registry.clone(), snapshots.clone(), remote.clone()),
            store,
            registry,
            snapshots,
            remote,
        })
    }

    /// Open with a WebSocket client for `config.remote.url`.
    pub fn open_ws(config: EngineConfig) -> Result<Self, StoreError> {
        let service = Arc::new(WsDocService::from_config(&config.remote));
        Self::open(config, service)
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.store.flush()
    }
}
