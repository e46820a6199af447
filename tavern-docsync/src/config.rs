//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::storage::StoreConfig;

/// Remote document service settings.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// WebSocket endpoint of the document server
    pub url: String,
    /// Upper bound for every remote call; expiry counts as a failure
    pub request_timeout: Duration,
    /// Stable identity of this client, used to build push client ids
    pub client_id: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9190".to_string(),
            request_timeout: Duration::from_secs(10),
            client_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl RemoteConfig {
    /// Short timeout and a fixed client id.
    pub fn for_testing() -> Self {
        Self {
            url: "ws://127.0.0.1:0".to_string(),
            request_timeout: Duration::from_millis(500),
            client_id: "test-client".to_string(),
        }
    }
}

/// Everything needed to open a `DocSyncEngine`.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub remote: RemoteConfig,
    /// Local snapshots kept per document (None = unbounded)
    pub snapshot_keep: Option<usize>,
}

impl EngineConfig {
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            store: StoreConfig::for_testing(path),
            remote: RemoteConfig::for_testing(),
            snapshot_keep: None,
        }
    }
}
