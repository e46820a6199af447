//! Local durable store for workspace documents.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  append/clear   ┌──────────────────────────────────────┐
//! │ UpdateLog    │ ──────────────► │ LocalStore (RocksDB)                 │
//! └──────────────┘                 │                                      │
//! ┌──────────────┐  add/list/get   │ CF "updates"   : pending deltas      │
//! │ SnapshotStore│ ──────────────► │ CF "documents" : compacted base state│
//! └──────────────┘                 │ CF "snapshots" : version history     │
//! ┌──────────────┐  meta/base      │ CF "snapshot_index" : (ws,doc,time)  │
//! │ Registry     │ ──────────────► │ CF "metadata"  : DocumentMeta        │
//! └──────────────┘                 │ CF "sequence"  : record id counter   │
//!                                  └──────────────────────────────────────┘
//! ```
//!
//! Every key that belongs to a document starts with
//! `<workspace>\0<doc id>\0`, so per-document scans are prefix scans.

pub mod snapshots;
pub mod update_log;

pub use snapshots::{SnapshotId, SnapshotStore, SnapshotSummary};
pub use update_log::{UpdateLog, UpdateRecord};

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use crate::doc_id::{DocumentDescriptor, WorkspaceId};

pub(crate) const CF_UPDATES: &str = "updates";
pub(crate) const CF_DOCUMENTS: &str = "documents";
pub(crate) const CF_SNAPSHOTS: &str = "snapshots";
pub(crate) const CF_SNAPSHOT_INDEX: &str = "snapshot_index";
pub(crate) const CF_METADATA: &str = "metadata";
const CF_SEQUENCE: &str = "sequence";

const COLUMN_FAMILIES: &[&str] = &[
    CF_UPDATES,
    CF_DOCUMENTS,
    CF_SNAPSHOTS,
    CF_SNAPSHOT_INDEX,
    CF_METADATA,
    CF_SEQUENCE,
];

const SEQUENCE_KEY: &[u8] = b"next";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write batch (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tavern-docsync-db"),
            block_cache_size: 32 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 2 * 1024 * 1024,
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error (quota, I/O, corruption)
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Directory entry of a document inside its workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMeta {
    /// Canonical document id
    pub id: String,
    pub title: String,
    pub tags: Vec<String>,
    /// Creation time (ms since epoch)
    pub create_date: u64,
}

impl DocumentMeta {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            tags: Vec::new(),
            create_date: now_millis(),
        }
    }
}

/// RocksDB-backed local store shared by the update log, the snapshot
/// store and the registry.
pub struct LocalStore {
    /// RocksDB instance (single-threaded mode)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Next auto-increment record id (update seq and snapshot id)
    sequence: AtomicU64,
    /// Serializes id allocation with the write that persists it
    id_lock: Mutex<()>,
    #[cfg(test)]
    fail_writes: std::sync::atomic::AtomicBool,
}

impl LocalStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let sequence = Self::recover_sequence(&db)?;
        log::info!(
            "Opened local store at {} (next record id {sequence})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            sequence: AtomicU64::new(sequence),
            id_lock: Mutex::new(()),
            #[cfg(test)]
            fail_writes: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Payloads are already LZ4 compressed by us
            CF_UPDATES | CF_DOCUMENTS | CF_SNAPSHOTS => {
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {
                opts.set_compression_type(DBCompressionType::Lz4);
            }
        }

        opts
    }

    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, StoreError> {
        let cf = db
            .cf_handle(CF_SEQUENCE)
            .ok_or_else(|| StoreError::DatabaseError("Column family 'sequence' not found".into()))?;
        Ok(db.get_cf(&cf, SEQUENCE_KEY)?.map_or(0, |bytes| decode_u64(&bytes)))
    }

    // ─── Record ids ───────────────────────────────────────────────────

    /// Commit a batch that carries a freshly allocated record id.
    ///
    /// Allocation and commit happen under one lock so the persisted
    /// counter never moves backwards; a failed write does not consume
    /// the id.
    pub(crate) fn commit_with_record_id<F>(&self, build: F) -> Result<u64, StoreError>
    where
        F: FnOnce(u64, &mut WriteBatch) -> Result<(), StoreError>,
    {
        let _guard = self.id_lock.lock().unwrap_or_else(|e| e.into_inner());
        let id = self.sequence.load(Ordering::SeqCst);

        let mut batch = WriteBatch::default();
        build(id, &mut batch)?;
        let cf = self.cf(CF_SEQUENCE)?;
        batch.put_cf(&cf, SEQUENCE_KEY, (id + 1).to_be_bytes());
        self.write(batch)?;

        self.sequence.store(id + 1, Ordering::SeqCst);
        Ok(id)
    }

    /// Next record id that will be assigned.
    pub fn next_record_id(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    // ─── Base state ───────────────────────────────────────────────────

    /// Load the compacted base state of a document.
    pub fn load_base(
        &self,
        workspace: &WorkspaceId,
        doc: &DocumentDescriptor,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, doc_prefix(workspace, doc))? {
            Some(compressed) => Ok(Some(decompress(&compressed)?)),
            None => Ok(None),
        }
    }

    /// Stage a base-state overwrite.
    pub(crate) fn stage_base(
        &self,
        batch: &mut WriteBatch,
        workspace: &WorkspaceId,
        doc: &DocumentDescriptor,
        state: &[u8],
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        batch.put_cf(&cf, doc_prefix(workspace, doc), compress(state));
        Ok(())
    }

    pub(crate) fn stage_base_delete(
        &self,
        batch: &mut WriteBatch,
        workspace: &WorkspaceId,
        doc: &DocumentDescriptor,
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        batch.delete_cf(&cf, doc_prefix(workspace, doc));
        Ok(())
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn save_meta(&self, workspace: &WorkspaceId, meta: &DocumentMeta) -> Result<(), StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, meta_key(workspace, &meta.id), encode_record(meta)?);
        self.write(batch)
    }

    pub fn delete_meta(&self, workspace: &WorkspaceId, doc: &DocumentDescriptor) -> Result<(), StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf, meta_key(workspace, &doc.encode()));
        self.write(batch)
    }

    /// All metadata entries of a workspace, ordered by document id.
    pub fn list_meta(&self, workspace: &WorkspaceId) -> Result<Vec<DocumentMeta>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let prefix = workspace_prefix(workspace);
        let mut metas = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            metas.push(decode_record(&value)?);
        }
        Ok(metas)
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    pub(crate) fn db(&self) -> &DBWithThreadMode<SingleThreaded> {
        &self.db
    }

    /// Commit a batch with the configured durability.
    pub(crate) fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    #[cfg(not(test))]
    fn check_writable(&self) -> Result<(), StoreError> {
        Ok(())
    }

    #[cfg(test)]
    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::DatabaseError("write rejected (disk full)".into()));
        }
        Ok(())
    }

    /// Make every following write fail until switched off.
    #[cfg(test)]
    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    /// Force a memtable flush.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

/// `<workspace>\0`
pub(crate) fn workspace_prefix(workspace: &WorkspaceId) -> Vec<u8> {
    let mut key = Vec::with_capacity(workspace.as_str().len() + 1);
    key.extend_from_slice(workspace.as_str().as_bytes());
    key.push(0);
    key
}

/// `<workspace>\0<doc>\0`
pub(crate) fn doc_prefix(workspace: &WorkspaceId, doc: &DocumentDescriptor) -> Vec<u8> {
    let mut key = workspace_prefix(workspace);
    key.extend_from_slice(doc.encode().as_bytes());
    key.push(0);
    key
}

fn meta_key(workspace: &WorkspaceId, doc_id: &str) -> Vec<u8> {
    let mut key = workspace_prefix(workspace);
    key.extend_from_slice(doc_id.as_bytes());
    key.push(0);
    key
}

pub(crate) fn decode_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[..n].copy_from_slice(&bytes[..n]);
    u64::from_be_bytes(buf)
}

pub(crate) fn compress(data: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(data)
}

pub(crate) fn decompress(data: &[u8]) -> Result<Vec<u8>, StoreError> {
    lz4_flex::decompress_size_prepended(data)
        .map_err(|e| StoreError::CompressionError(e.to_string()))
}

pub(crate) fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

pub(crate) fn decode_record<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
