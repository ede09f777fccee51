//! Presence and cursor management for real-time collaboration.
//!
//! This module handles ephemeral state that is never persisted:
//! - Who is in each document (keyed by connection, projected to users)
//! - Presence status decay (active / idle / away)
//! - Last-value-wins cursor positions
//!
//! A user with two tabs open is two connections but one collaborator; the
//! first connection announces the user and the last one to leave retires it.
//! Connection ids are unique across processes, so one `PresenceManager` can be
//! shared by every node serving the same rooms.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::operation::CursorPosition;
use super::{now_millis, ConnectionId, DocumentId, UserId};

/// How long before a user is considered idle (no activity)
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// How long before a user is considered away
const AWAY_TIMEOUT: Duration = Duration::from_secs(300);

const PALETTE: [&str; 14] = [
    "#3b82f6", // blue
    "#ef4444", // red
    "#22c55e", // green
    "#f59e0b", // amber
    "#8b5cf6", // violet
    "#ec4899", // pink
    "#06b6d4", // cyan
    "#f97316", // orange
    "#14b8a6", // teal
    "#a855f7", // purple
    "#84cc16", // lime
    "#6366f1", // indigo
    "#d946ef", // fuchsia
    "#0ea5e9", // sky
];

/// Stable color for a user, identical on every process and reconnect
pub fn user_color(user_id: &str) -> String {
    let digest = Sha256::digest(user_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let idx = (u64::from_be_bytes(prefix) % PALETTE.len() as u64) as usize;
    PALETTE[idx].to_string()
}

/// Presence status for a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// Actively editing
    #[default]
    Active,
    /// No recent activity
    Idle,
    /// Extended inactivity
    Away,
}

impl PresenceStatus {
    fn for_inactivity(elapsed_ms: i64) -> Self {
        if elapsed_ms > AWAY_TIMEOUT.as_millis() as i64 {
            PresenceStatus::Away
        } else if elapsed_ms > IDLE_TIMEOUT.as_millis() as i64 {
            PresenceStatus::Idle
        } else {
            PresenceStatus::Active
        }
    }
}

/// A collaborator as shown to other members of a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaborationUser {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub avatar: Option<String>,
    /// Hex color derived from the user id
    pub color: String,
    pub joined_at: i64,
    pub last_activity: i64,
    #[serde(default)]
    pub status: PresenceStatus,
}

impl CollaborationUser {
    pub fn new(id: impl Into<String>, name: impl Into<String>, email: impl Into<String>) -> Self {
        let id = id.into();
        let now = now_millis();
        Self {
            color: user_color(&id),
            id,
            name: name.into(),
            email: email.into(),
            avatar: None,
            joined_at: now,
            last_activity: now,
            status: PresenceStatus::Active,
        }
    }

    pub fn with_avatar(mut self, avatar: Option<String>) -> Self {
        self.avatar = avatar;
        self
    }

    /// Update the last activity timestamp and set status to active
    pub fn touch(&mut self) {
        self.last_activity = now_millis();
        self.status = PresenceStatus::Active;
    }

    /// Update status based on inactivity; returns true if it changed
    pub fn update_status(&mut self, now_ms: i64) -> bool {
        let status = PresenceStatus::for_inactivity(now_ms.saturating_sub(self.last_activity));
        let changed = status != self.status;
        self.status = status;
        changed
    }
}

#[derive(Debug, Clone)]
struct Member {
    user: CollaborationUser,
    cursor: Option<CursorPosition>,
}

/// Presence for one document
#[derive(Debug, Default)]
pub struct DocumentPresence {
    members: DashMap<ConnectionId, Member>,
    /// Serializes first/last connection detection
    membership: Mutex<()>,
}

impl DocumentPresence {

    fn user_connections(&self, user_id: &str) -> usize {
        self.members.iter().filter(|m| m.user.id == user_id).count()
    }

    /// Add a connection; returns true if this is the user's first connection
    pub fn add(&self, connection_id: &str, user: CollaborationUser) -> bool {
        let _membership = self.membership.lock();
        let first = self.user_connections(&user.id) == 0;
        self.members
            .insert(connection_id.to_string(), Member { user, cursor: None });
        first
    }

    /// Remove a connection; returns the user and whether it was their last connection
    pub fn remove(&self, connection_id: &str) -> Option<(CollaborationUser, bool)> {
        let _membership = self.membership.lock();
        let (_, member) = self.members.remove(connection_id)?;
        let last = self.user_connections(&member.user.id) == 0;
        Some((member.user, last))
    }

    /// Store a cursor unless a newer one is already known; returns whether it was applied
    pub fn update_cursor(
        &self,
        connection_id: &str,
        cursor: CursorPosition,
    ) -> Result<bool, PresenceError> {
        let mut member = self
            .members
            .get_mut(connection_id)
            .ok_or_else(|| PresenceError::ConnectionNotFound(connection_id.to_string()))?;

        if member.cursor.as_ref().is_some_and(|current| !cursor.supersedes(current)) {
            return Ok(false);
        }
        member.cursor = Some(cursor);
        member.user.touch();
        Ok(true)
    }

    #[cfg(test)]
    pub fn cursor(&self, connection_id: &str) -> Option<CursorPosition> {
        self.members.get(connection_id).and_then(|m| m.cursor.clone())
    }

    /// Mark a connection's user as active
    pub fn touch(&self, connection_id: &str) {
        if let Some(mut member) = self.members.get_mut(connection_id) {
            member.user.touch();
        }
    }

    /// Unique users, earliest join first
    pub fn active_users(&self) -> Vec<CollaborationUser> {
        let mut by_user: HashMap<UserId, CollaborationUser> = HashMap::new();
        for member in self.members.iter() {
            let user = &member.user;
            match by_user.get_mut(&user.id) {
                Some(existing) => {
                    if user.joined_at < existing.joined_at {
                        existing.joined_at = user.joined_at;
                    }
                    if user.last_activity > existing.last_activity {
                        existing.last_activity = user.last_activity;
                        existing.status = user.status;
                    }
                }
                None => {
                    by_user.insert(user.id.clone(), user.clone());
                }
            }
        }
        let mut users: Vec<CollaborationUser> = by_user.into_values().collect();
        users.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.id.cmp(&b.id)));
        users
    }

    /// Connection count (not unique users)
    pub fn connection_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Update all statuses based on activity; returns how many changed
    pub fn update_all_statuses(&self) -> usize {
        let now = now_millis();
        self.members
            .iter_mut()
            .filter_map(|mut member| member.user.update_status(now).then_some(()))
            .count()
    }
}

/// Errors related to presence operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PresenceError {
    #[error("Connection not present in document: {0}")]
    ConnectionNotFound(ConnectionId),
}

/// Presence across all documents, shared by every node that holds a handle
#[derive(Default)]
pub struct PresenceManager {
    documents: DashMap<DocumentId, Arc<DocumentPresence>>,
}

impl PresenceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, document_id: &str) -> Option<Arc<DocumentPresence>> {
        self.documents.get(document_id).map(|p| p.clone())
    }

    /// Add a connection to a document; returns the document's presence and
    /// whether this is the user's first connection there
    pub fn join(
        &self,
        document_id: &str,
        connection_id: &str,
        user: CollaborationUser,
    ) -> (Arc<DocumentPresence>, bool) {
        // adding under the entry lock keeps `remove_if_empty` from dropping it
        let presence = self
            .documents
            .entry(document_id.to_string())
            .or_default();
        let first = presence.add(connection_id, user);
        (presence.clone(), first)
    }

    /// Remove a connection from a document; returns the user and whether it
    /// was their last connection there
    pub fn leave(
        &self,
        document_id: &str,
        connection_id: &str,
    ) -> Option<(CollaborationUser, bool)> {
        let presence = self.get(document_id)?;
        let left = presence.remove(connection_id);
        self.remove_if_empty(document_id);
        left
    }

    /// Drop a document's presence if nobody is left in it
    pub fn remove_if_empty(&self, document_id: &str) -> bool {
        self.documents.remove_if(document_id, |_, p| p.is_empty()).is_some()
    }

    /// Total connections across all documents
    pub fn total_connections(&self) -> usize {
        self.documents.iter().map(|p| p.connection_count()).sum()
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    /// Update statuses for all documents
    pub fn update_all_statuses(&self) -> usize {
        self.documents.iter().map(|p| p.update_all_statuses()).sum()
    }

    /// Remove presence entries for documents without members
    pub fn cleanup(&self) {
        self.documents.retain(|_, p| !p.is_empty());
    }
}
