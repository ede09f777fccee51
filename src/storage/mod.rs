//! Storage module for persisted document state and the durable operation log.
//!
//! The document store is an external collaborator: the engine only needs
//! `load` and `save`. The sled backend stores bincode-encoded snapshots and can
//! also serve as the shared recent-operations log.

mod sled_store;

pub use sled_store::{SledStore, StorageError, StorageResult};

use async_trait::async_trait;

use crate::sync::DocumentState;

/// Persistent home of converged document snapshots
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Load the latest saved state, or `None` for a document never saved
    async fn load(&self, document_id: &str) -> StorageResult<Option<DocumentState>>;

    /// Save `content` as the state at `version`
    async fn save(&self, document_id: &str, content: &str, version: u64) -> StorageResult<()>;
}

/// Configuration for the storage layer
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes (default: 256MB)
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = flush on every write)
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/codoc.sled".to_string(),
            cache_size: 256 * 1024 * 1024,
            flush_interval_ms: 500,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }
}
