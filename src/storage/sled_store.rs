//! Sled-based storage for document snapshots and the operation log.
//!
//! Trees:
//! - `documents`: bincode `DocumentState` per document id
//! - `changes`: bincode `LoggedChange` keyed by `u32 BE id length | id bytes | u64 BE version`,
//!   so one document's keys can never be a prefix of another's
//! - `heads`: big-endian u64 head version per document, updated with
//!   compare-and-swap so concurrent appenders cannot claim the same version
//!
//! Changes newer than the saved snapshot are never compacted away: until the
//! snapshot catches up they are the only record of those edits.

use async_trait::async_trait;
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::{DocumentStore, StorageConfig};
use crate::sync::oplog::{LogError, LoggedChange, OperationLog, WindowConfig};
use crate::sync::DocumentState;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Corruption detected in document: {0}")]
    Corruption(String),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for LogError {
    fn from(err: StorageError) -> Self {
        LogError::Unavailable(err.to_string())
    }
}

const TREE_DOCUMENTS: &str = "documents";
const TREE_CHANGES: &str = "changes";
const TREE_HEADS: &str = "heads";

/// Sled-backed document store and operation log
#[derive(Clone)]
pub struct SledStore {
    db: Arc<Db>,
    documents: Tree,
    changes: Tree,
    heads: Tree,
    window: WindowConfig,
}

impl SledStore {
    /// Open or create a store at the configured path
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let path = Path::new(&config.path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        let documents = db.open_tree(TREE_DOCUMENTS)?;
        let changes = db.open_tree(TREE_CHANGES)?;
        let heads = db.open_tree(TREE_HEADS)?;

        Ok(Self {
            db: Arc::new(db),
            documents,
            changes,
            heads,
            window: WindowConfig::default(),
        })
    }

    /// Replay window used when this store serves as the operation log
    pub fn with_window(mut self, window: WindowConfig) -> Self {
        self.window = window;
        self
    }

    fn change_prefix(document_id: &str) -> Vec<u8> {
        let id = document_id.as_bytes();
        let mut key = Vec::with_capacity(4 + id.len() + 8);
        key.extend_from_slice(&(id.len() as u32).to_be_bytes());
        key.extend_from_slice(id);
        key
    }

    fn change_key(document_id: &str, version: u64) -> Vec<u8> {
        let mut key = Self::change_prefix(document_id);
        key.extend_from_slice(&version.to_be_bytes());
        key
    }

    fn load_state(&self, document_id: &str) -> StorageResult<Option<DocumentState>> {
        match self.documents.get(document_id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save_state(&self, document_id: &str, state: &DocumentState) -> StorageResult<()> {
        let bytes = bincode::serialize(state)?;
        self.documents.insert(document_id.as_bytes(), bytes)?;
        Ok(())
    }

    fn read_head(&self, document_id: &str) -> StorageResult<Option<(sled::IVec, u64)>> {
        match self.heads.get(document_id.as_bytes())? {
            Some(raw) => {
                let bytes: [u8; 8] = raw.as_ref().try_into().map_err(|_| {
                    StorageError::Corruption(format!("bad head record for {}", document_id))
                })?;
                Ok(Some((raw, u64::from_be_bytes(bytes))))
            }
            None => Ok(None),
        }
    }

    /// Load retained changes for a document with version > `since`
    pub fn load_changes_since(
        &self,
        document_id: &str,
        since: u64,
    ) -> StorageResult<Vec<LoggedChange>> {
        let start = Self::change_key(document_id, since.saturating_add(1));
        let end = Self::change_key(document_id, u64::MAX);

        let mut changes = Vec::new();
        for item in self.changes.range(start..=end) {
            let (_, value) = item?;
            changes.push(bincode::deserialize(&value)?);
        }
        Ok(changes)
    }

    /// Drop changes beyond the window's count and age limits, keeping every
    /// change newer than the saved snapshot
    pub fn compact_changes(&self, document_id: &str) -> StorageResult<usize> {
        let floor = self.load_state(document_id)?.map_or(0, |state| state.version);
        let now = chrono::Utc::now().timestamp_millis();

        let mut retained = 0;
        let mut removable = Vec::new();
        for item in self.changes.scan_prefix(Self::change_prefix(document_id)) {
            let (key, value) = item?;
            let change: LoggedChange = bincode::deserialize(&value)?;
            retained += 1;
            if change.version <= floor {
                removable.push((key, self.window.is_expired(&change, now)));
            }
        }

        let mut removed = 0;
        for (key, expired) in removable {
            if retained <= self.window.max_entries && !expired {
                continue;
            }
            if self.changes.remove(key)?.is_some() {
                retained -= 1;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Get storage statistics
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            document_count: self.documents.len(),
            change_count: self.changes.len(),
            total_size_bytes: self.db.size_on_disk().unwrap_or(0),
        }
    }
}

/// Statistics about the storage
#[derive(Debug, Clone)]
pub struct StorageStats {
    pub document_count: usize,
    pub change_count: usize,
    pub total_size_bytes: u64,
}

#[async_trait]
impl DocumentStore for SledStore {
    async fn load(&self, document_id: &str) -> StorageResult<Option<DocumentState>> {
        self.load_state(document_id)
    }

    async fn save(&self, document_id: &str, content: &str, version: u64) -> StorageResult<()> {
        // never overwrite a newer snapshot written by another process
        if let Some(existing) = self.load_state(document_id)? {
            if existing.version > version {
                return Ok(());
            }
        }
        self.save_state(document_id, &DocumentState::at_version(content, version))?;
        self.compact_changes(document_id)?;
        Ok(())
    }
}

#[async_trait]
impl OperationLog for SledStore {
    async fn window(&self, document_id: &str, since: u64) -> Result<Vec<LoggedChange>, LogError> {
        // age limits are applied by compaction, which keeps unsaved changes
        self.load_changes_since(document_id, since).map_err(LogError::from)
    }

    async fn append(&self, document_id: &str, change: LoggedChange) -> Result<(), LogError> {
        let current = self.read_head(document_id)?;
        if let Some((_, head)) = &current {
            if change.version != head + 1 {
                return Err(LogError::VersionConflict {
                    expected: change.version.saturating_sub(1),
                    actual: *head,
                });
            }
        }

        let expected = current.as_ref().map(|(raw, _)| raw.clone());
        let swapped = self
            .heads
            .compare_and_swap(
                document_id.as_bytes(),
                expected,
                Some(change.version.to_be_bytes().to_vec()),
            )
            .map_err(StorageError::from)?;
        if let Err(lost) = swapped {
            let actual = lost
                .current
                .and_then(|raw| <[u8; 8]>::try_from(raw.as_ref()).ok())
                .map(u64::from_be_bytes)
                .unwrap_or(0);
            return Err(LogError::VersionConflict {
                expected: change.version.saturating_sub(1),
                actual,
            });
        }

        let key = Self::change_key(document_id, change.version);
        let bytes = bincode::serialize(&change).map_err(StorageError::from)?;
        self.changes
            .insert(key, bytes)
            .map_err(StorageError::from)?;
        self.compact_changes(document_id)?;
        Ok(())
    }
}

impl Drop for SledStore {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
