//! Authoritative per-document state.
//!
//! The coordinator owns one `DocumentState` per loaded document. Accepting an
//! operation is one critical section per document: catch up from the shared
//! log, rebase against the concurrent window, append with compare-and-set,
//! apply, mark dirty. Persistence happens later in the save loop and never
//! blocks acceptance.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use super::conflict::{detect_conflicts, resolve_conflict, ConflictPolicy, EditConflict, Resolution};
use super::oplog::{LogError, LoggedChange, OperationLog};
use super::operation::Operation;
use super::transform::{apply_all, rebase};
use super::{now_millis, DocumentId, OperationId, SyncError, SyncResult, UserId};
use crate::storage::DocumentStore;

/// Snapshot of a document's content and version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentState {
    pub content: String,
    /// Incremented exactly once per accepted operation
    pub version: u64,
    /// Milliseconds since the epoch
    pub last_modified: i64,
}

impl DocumentState {
    pub fn empty() -> Self {
        Self::at_version("", 0)
    }

    pub fn at_version(content: impl Into<String>, version: u64) -> Self {
        Self {
            content: content.into(),
            version,
            last_modified: now_millis(),
        }
    }

    fn apply_change(&mut self, change: &LoggedChange) {
        self.content = apply_all(&self.content, &change.operations);
        self.version = change.version;
        self.last_modified = now_millis();
    }
}

/// Coordinator settings
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Upper bound on positions and lengths accepted from clients
    pub max_document_chars: u64,
    /// What to do with detected conflicts
    pub conflict_policy: ConflictPolicy,
    /// Attempts to win the log append before giving up
    pub append_attempts: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_document_chars: 10 * 1024 * 1024,
            conflict_policy: ConflictPolicy::Transform,
            append_attempts: 3,
        }
    }
}

/// Result of accepting one submitted operation
#[derive(Debug, Clone)]
pub struct AcceptedChange {
    pub document_id: DocumentId,
    pub operation_id: OperationId,
    pub author_id: UserId,
    /// Rebased components, as applied
    pub operations: Vec<Operation>,
    /// Version after applying
    pub version: u64,
    /// The operation lost conflict resolution and was applied as a no-op
    pub superseded: bool,
    /// Conflicts the operation was involved in
    pub conflicts: Vec<EditConflict>,
}

struct DocumentSlot {
    state: DocumentState,
    dirty: bool,
    /// The slot has left the map; holders must look the document up again
    evicted: bool,
}

/// Owner of the canonical buffers
pub struct DocumentCoordinator {
    config: CoordinatorConfig,
    store: Arc<dyn DocumentStore>,
    log: Arc<dyn OperationLog>,
    documents: DashMap<DocumentId, Arc<Mutex<DocumentSlot>>>,
    accepted: AtomicU64,
    conflicts: AtomicU64,
}

impl DocumentCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn DocumentStore>,
        log: Arc<dyn OperationLog>,
    ) -> Self {
        Self {
            config,
            store,
            log,
            documents: DashMap::new(),
            accepted: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
        }
    }

    async fn slot(&self, document_id: &str) -> SyncResult<Arc<Mutex<DocumentSlot>>> {
        if let Some(slot) = self.documents.get(document_id) {
            return Ok(slot.clone());
        }

        let state = match self.store.load(document_id).await {
            Ok(Some(state)) => {
                info!("Loaded document {} at version {}", document_id, state.version);
                state
            }
            Ok(None) => {
                info!("Creating new document: {}", document_id);
                DocumentState::empty()
            }
            Err(e) => {
                error!("Failed to load document {}: {}", document_id, e);
                return Err(SyncError::RetryableUnavailable(format!("document store: {}", e)));
            }
        };

        let slot = self
            .documents
            .entry(document_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(DocumentSlot {
                    state,
                    dirty: false,
                    evicted: false,
                }))
            })
            .clone();
        Ok(slot)
    }

    /// Lock the live slot of a document, reloading if it was evicted while waiting
    async fn lock_slot(&self, document_id: &str) -> SyncResult<OwnedMutexGuard<DocumentSlot>> {
        loop {
            let slot = self.slot(document_id).await?.lock_owned().await;
            if !slot.evicted {
                return Ok(slot);
            }
            debug!("Document {} was evicted while waiting, reloading", document_id);
        }
    }

    /// Current state of a document, caught up with the shared log
    pub async fn open(&self, document_id: &str) -> SyncResult<DocumentState> {
        let mut slot = self.lock_slot(document_id).await?;
        let since = slot.state.version;
        let window = self.log.window(document_id, since).await?;
        self.catch_up(document_id, &mut slot, &window).await?;
        Ok(slot.state.clone())
    }

    /// Snapshot without touching the log; `None` if the document is not loaded
    #[cfg(test)]
    pub async fn snapshot(&self, document_id: &str) -> Option<DocumentState> {
        let slot = self.documents.get(document_id)?.clone();
        let state = slot.lock().await.state.clone();
        Some(state)
    }

    /// Rebase, apply and record one operation
    pub async fn accept_operation(&self, op: Operation) -> SyncResult<AcceptedChange> {
        op.validate(self.config.max_document_chars)?;

        let document_id = op.document_id.clone();
        let mut slot = self.lock_slot(&document_id).await?;

        let mut attempt = 0;
        let (change, conflicts, superseded) = loop {
            attempt += 1;

            let since = op.base_version.min(slot.state.version);
            let window = self.log.window(&document_id, since).await?;
            self.catch_up(&document_id, &mut slot, &window).await?;

            let current = slot.state.version;
            if op.base_version > current {
                return Err(SyncError::MalformedOperation(format!(
                    "base version {} is ahead of document version {}",
                    op.base_version, current
                )));
            }

            let concurrent: Vec<&LoggedChange> = window
                .iter()
                .filter(|c| c.version > op.base_version)
                .collect();
            let missing = (current - op.base_version) as usize;
            let gap = concurrent
                .first()
                .is_some_and(|c| c.version != op.base_version + 1);
            if concurrent.len() < missing || gap {
                return Err(SyncError::ResyncRequired {
                    base_version: op.base_version,
                    current_version: current,
                });
            }

            let applied: Vec<Operation> = concurrent
                .iter()
                .flat_map(|c| c.operations.iter().cloned())
                .collect();
            let mut rebased = rebase(std::slice::from_ref(&op), &applied);

            let conflicts = self.conflicts_with(&op, &concurrent);
            let superseded = !conflicts.is_empty() && self.loses_resolution(&op, &conflicts);
            if superseded {
                debug!("Operation {} superseded by conflict resolution", op.id);
                rebased = vec![op.as_retain()];
            }

            let change = LoggedChange::new(current + 1, &op, rebased);
            match self.log.append(&document_id, change.clone()).await {
                Ok(()) => break (change, conflicts, superseded),
                Err(LogError::VersionConflict { expected, actual })
                    if attempt < self.config.append_attempts =>
                {
                    debug!(
                        "Lost append race on {} (expected head {}, found {}), retrying",
                        document_id, expected, actual
                    );
                }
                Err(e) => {
                    warn!("Operation log append failed for {}: {}", document_id, e);
                    return Err(SyncError::RetryableUnavailable(e.to_string()));
                }
            }
        };

        slot.state.apply_change(&change);
        slot.dirty = true;
        self.accepted.fetch_add(1, Ordering::Relaxed);

        debug!(
            "Accepted {} on {} -> version {} ({} component(s))",
            change.operation_id,
            document_id,
            change.version,
            change.operations.len()
        );

        Ok(AcceptedChange {
            document_id,
            operation_id: change.operation_id,
            author_id: change.author_id,
            operations: change.operations,
            version: change.version,
            superseded,
            conflicts,
        })
    }

    /// Apply logged changes this process has not seen yet
    /// Apply logged changes newer than the slot. When the log has already
    /// dropped the changes right after the slot, fall back to the saved
    /// snapshot if it reaches the start of the window.
    async fn catch_up(
        &self,
        document_id: &str,
        slot: &mut DocumentSlot,
        window: &[LoggedChange],
    ) -> SyncResult<()> {
        for change in window {
            if change.version <= slot.state.version {
                continue;
            }
            if change.version != slot.state.version + 1 {
                self.reload_saved(document_id, slot, change.version - 1).await?;
                if change.version <= slot.state.version {
                    continue;
                }
            }
            slot.state.apply_change(change);
            slot.dirty = true;
        }
        Ok(())
    }

    /// Replace the slot with the saved snapshot if it is at least `needed`
    async fn reload_saved(
        &self,
        document_id: &str,
        slot: &mut DocumentSlot,
        needed: u64,
    ) -> SyncResult<()> {
        let saved = self
            .store
            .load(document_id)
            .await
            .map_err(|e| SyncError::RetryableUnavailable(format!("document store: {}", e)))?;
        match saved {
            Some(saved) if saved.version >= needed && saved.version > slot.state.version => {
                info!(
                    "Document {} reloaded from version {} to saved version {}",
                    document_id, slot.state.version, saved.version
                );
                slot.state = saved;
                slot.dirty = false;
                Ok(())
            }
            _ => {
                warn!(
                    "Document {} is at version {} but the log resumes at {}",
                    document_id,
                    slot.state.version,
                    needed + 1
                );
                Err(SyncError::RetryableUnavailable(format!(
                    "document {} is behind the operation log",
                    document_id
                )))
            }
        }
    }

    fn conflicts_with(&self, op: &Operation, concurrent: &[&LoggedChange]) -> Vec<EditConflict> {
        let mut candidates: Vec<Operation> = concurrent
            .iter()
            .filter(|c| c.author_id != op.author_id)
            .flat_map(|c| c.operations.iter().cloned())
            .collect();
        if candidates.is_empty() {
            return Vec::new();
        }
        candidates.push(op.clone());

        let conflicts: Vec<EditConflict> = detect_conflicts(&candidates)
            .into_iter()
            .filter(|c| c.involves(op))
            .collect();
        if !conflicts.is_empty() {
            self.conflicts.fetch_add(conflicts.len() as u64, Ordering::Relaxed);
            debug!(
                "Operation {} on {} overlaps {} concurrent edit(s)",
                op.id,
                op.document_id,
                conflicts.len()
            );
        }
        conflicts
    }

    fn loses_resolution(&self, op: &Operation, conflicts: &[EditConflict]) -> bool {
        let Some(resolution) = self.config.conflict_policy.resolution() else {
            return false;
        };
        conflicts.iter().any(|conflict| {
            let kept = resolve_conflict(conflict, &resolution);
            let kept_as_is = kept.iter().any(|k| k.id == op.id);
            // merged inserts absorb every contributing insert
            let absorbed = resolution == Resolution::Merge
                && op.is_insert()
                && kept.iter().all(Operation::is_insert);
            !(kept_as_is || absorbed)
        })
    }

    /// Persist every dirty document. Failed saves stay dirty for the next pass.
    pub async fn save_dirty(&self) -> usize {
        let slots: Vec<(DocumentId, Arc<Mutex<DocumentSlot>>)> = self
            .documents
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut saved = 0;
        for (document_id, slot) in slots {
            let snapshot = {
                let mut slot = slot.lock().await;
                if slot.evicted || !slot.dirty {
                    continue;
                }
                slot.dirty = false;
                slot.state.clone()
            };

            match self.store.save(&document_id, &snapshot.content, snapshot.version).await {
                Ok(()) => {
                    debug!("Saved document {} at version {}", document_id, snapshot.version);
                    saved += 1;
                }
                Err(e) => {
                    error!("Failed to save document {}: {}", document_id, e);
                    slot.lock().await.dirty = true;
                }
            }
        }
        saved
    }

    /// Save and drop a document from memory
    pub async fn evict(&self, document_id: &str) -> SyncResult<()> {
        let Some(slot) = self.documents.get(document_id).map(|s| s.clone()) else {
            return Ok(());
        };
        let mut guard = slot.lock().await;
        if guard.evicted {
            return Ok(());
        }
        if guard.dirty {
            self.store
                .save(document_id, &guard.state.content, guard.state.version)
                .await
                .map_err(|e| SyncError::RetryableUnavailable(e.to_string()))?;
            guard.dirty = false;
        }
        // waiters still holding this slot see the flag and reload
        guard.evicted = true;
        self.documents.remove_if(document_id, |_, current| Arc::ptr_eq(current, &slot));
        info!("Evicted document {} from memory", document_id);
        Ok(())
    }

    pub fn loaded_documents(&self) -> Vec<DocumentId> {
        self.documents.iter().map(|e| e.key().clone()).collect()
    }

    pub fn accepted_count(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn conflict_count(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }
}
