//! Bounded log of recently accepted changes per document.
//!
//! The log is the serialization point for a document: every accepted change is
//! appended with compare-and-set on the previous version, so two processes
//! accepting edits for the same document cannot both claim the same version.
//! Entries are evicted by count and by age; anything older is assumed to be
//! reflected in the stored document state.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

use super::operation::Operation;
use super::{now_millis, DocumentId, OperationId, UserId};

/// One accepted change: the rebased components of a single submitted operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedChange {
    /// Document version this change produced
    pub version: u64,
    /// Id of the submitted operation
    pub operation_id: OperationId,
    pub author_id: UserId,
    /// Components as applied, in order
    pub operations: Vec<Operation>,
    /// Server acceptance time, milliseconds since the epoch
    pub accepted_at: i64,
}

impl LoggedChange {
    pub fn new(version: u64, source: &Operation, operations: Vec<Operation>) -> Self {
        Self {
            version,
            operation_id: source.id.clone(),
            author_id: source.author_id.clone(),
            operations,
            accepted_at: now_millis(),
        }
    }
}

/// Errors from the operation log
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogError {
    #[error("operation log unavailable: {0}")]
    Unavailable(String),

    #[error("version conflict: expected head {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },
}

/// Replay window limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    /// Maximum retained changes per document
    pub max_entries: usize,
    /// Maximum age of a retained change
    pub ttl: Duration,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_entries: 500,
            ttl: Duration::from_secs(300),
        }
    }
}

impl WindowConfig {
    pub(crate) fn is_expired(&self, change: &LoggedChange, now_ms: i64) -> bool {
        now_ms.saturating_sub(change.accepted_at) > self.ttl.as_millis() as i64
    }
}

/// Shared log of recently accepted changes.
///
/// Implementations backed by shared infrastructure let several server
/// processes serialize edits to the same document.
#[async_trait]
pub trait OperationLog: Send + Sync {
    /// Retained changes with a version greater than `since`, oldest first
    async fn window(&self, document_id: &str, since: u64) -> Result<Vec<LoggedChange>, LogError>;

    /// Append `change`, which must directly follow the current head.
    ///
    /// A document with no recorded head accepts any version.
    async fn append(&self, document_id: &str, change: LoggedChange) -> Result<(), LogError>;
}

#[derive(Debug, Default)]
struct DocumentLog {
    head: Option<u64>,
    entries: VecDeque<LoggedChange>,
}

impl DocumentLog {
    fn evict(&mut self, config: &WindowConfig) {
        let now = now_millis();
        while self.entries.len() > config.max_entries {
            self.entries.pop_front();
        }
        while self.entries.front().is_some_and(|c| config.is_expired(c, now)) {
            self.entries.pop_front();
        }
    }
}

/// In-process ring buffer log
pub struct MemoryOperationLog {
    config: WindowConfig,
    documents: DashMap<DocumentId, Mutex<DocumentLog>>,
}

impl MemoryOperationLog {
    pub fn new(config: WindowConfig) -> Self {
        Self {
            config,
            documents: DashMap::new(),
        }
    }

    /// Number of retained changes for a document
    #[cfg(test)]
    pub fn retained(&self, document_id: &str) -> usize {
        self.documents
            .get(document_id)
            .map(|log| log.lock().entries.len())
            .unwrap_or(0)
    }
}

impl Default for MemoryOperationLog {
    fn default() -> Self {
        Self::new(WindowConfig::default())
    }
}

#[async_trait]
impl OperationLog for MemoryOperationLog {
    async fn window(&self, document_id: &str, since: u64) -> Result<Vec<LoggedChange>, LogError> {
        let Some(log) = self.documents.get(document_id) else {
            return Ok(Vec::new());
        };
        let mut log = log.lock();
        log.evict(&self.config);
        Ok(log.entries.iter().filter(|c| c.version > since).cloned().collect())
    }

    async fn append(&self, document_id: &str, change: LoggedChange) -> Result<(), LogError> {
        let log = self.documents.entry(document_id.to_string()).or_default();
        let mut log = log.lock();

        if let Some(head) = log.head {
            if change.version != head + 1 {
                return Err(LogError::VersionConflict {
                    expected: change.version.saturating_sub(1),
                    actual: head,
                });
            }
        }

        log.head = Some(change.version);
        log.entries.push_back(change);
        log.evict(&self.config);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(version: u64) -> LoggedChange {
        let op = Operation::insert("doc", 0, "x", "alice");
        LoggedChange::new(version, &op, vec![op.clone()])
    }

    #[tokio::test]
    async fn test_window_filters_by_version() {
        let log = MemoryOperationLog::default();
        for v in 1..=5 {
            log.append("doc", change(v)).await.unwrap();
        }

        let window = log.window("doc", 3).await.unwrap();
        let versions: Vec<u64> = window.iter().map(|c| c.version).collect();
        assert_eq!(versions, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_append_rejects_gap_and_replay() {
        let log = MemoryOperationLog::default();
        log.append("doc", change(7)).await.unwrap();

        assert_eq!(
            log.append("doc", change(7)).await,
            Err(LogError::VersionConflict { expected: 6, actual: 7 })
        );
        assert!(log.append("doc", change(9)).await.is_err());
        assert!(log.append("doc", change(8)).await.is_ok());
    }

    #[tokio::test]
    async fn test_ring_is_bounded() {
        let log = MemoryOperationLog::new(WindowConfig {
            max_entries: 3,
            ttl: Duration::from_secs(60),
        });
        for v in 1..=10 {
            log.append("doc", change(v)).await.unwrap();
        }

        assert_eq!(log.retained("doc"), 3);
        let window = log.window("doc", 0).await.unwrap();
        assert_eq!(window.first().map(|c| c.version), Some(8));
    }

    #[tokio::test]
    async fn test_expired_entries_are_dropped() {
        let log = MemoryOperationLog::new(WindowConfig {
            max_entries: 100,
            ttl: Duration::from_secs(1),
        });
        let mut old = change(1);
        old.accepted_at -= 5_000;
        log.append("doc", old).await.unwrap();
        log.append("doc", change(2)).await.unwrap();

        let window = log.window("doc", 0).await.unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].version, 2);
    }

    #[tokio::test]
    async fn test_documents_are_independent() {
        let log = MemoryOperationLog::default();
        log.append("a", change(1)).await.unwrap();
        log.append("b", change(40)).await.unwrap();

        assert_eq!(log.window("a", 0).await.unwrap().len(), 1);
        assert!(log.window("c", 0).await.unwrap().is_empty());
    }
}
