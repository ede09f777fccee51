//! Session registry: which connection belongs to which user and document.
//!
//! Each connection walks `Connecting -> Joined(document) -> Left | Disconnected`.
//! The registry is the only owner of `Session` values; everything else reads
//! copies.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::{now_millis, ConnectionId, DocumentId, SyncError, SyncResult, UserId};

/// Lifecycle of one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport is up, no document joined yet
    Connecting,
    Joined(DocumentId),
    /// Explicitly left; the connection may join again
    Left,
    Disconnected,
}

/// A joined (user, document, connection) triple
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user_id: UserId,
    pub document_id: DocumentId,
    pub connection_id: ConnectionId,
    pub joined_at: i64,
    pub last_activity: i64,
}

struct ConnectionEntry {
    state: ConnectionState,
    session: Option<Session>,
    last_seen: Instant,
}

impl ConnectionEntry {
    fn touch(&mut self) {
        self.last_seen = Instant::now();
        if let Some(session) = self.session.as_mut() {
            session.last_activity = now_millis();
        }
    }

    fn is_stale(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Registry of live connections and their sessions
#[derive(Default)]
pub struct SessionRegistry {
    connections: DashMap<ConnectionId, ConnectionEntry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new transport connection
    pub fn register(&self, connection_id: &str) {
        self.connections.insert(
            connection_id.to_string(),
            ConnectionEntry {
                state: ConnectionState::Connecting,
                session: None,
                last_seen: Instant::now(),
            },
        );
        debug!("Connection registered: {}", connection_id);
    }

    /// Create the session for a verified user joining `document_id`
    pub fn join(
        &self,
        connection_id: &str,
        user_id: &str,
        document_id: &str,
    ) -> SyncResult<Session> {
        let mut entry = self
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| SyncError::ConnectionNotFound(connection_id.to_string()))?;

        match &entry.state {
            ConnectionState::Joined(current) => {
                return Err(SyncError::AlreadyJoined(current.clone()))
            }
            ConnectionState::Disconnected => {
                return Err(SyncError::ConnectionNotFound(connection_id.to_string()))
            }
            ConnectionState::Connecting | ConnectionState::Left => {}
        }

        let now = now_millis();
        let session = Session {
            user_id: user_id.to_string(),
            document_id: document_id.to_string(),
            connection_id: connection_id.to_string(),
            joined_at: now,
            last_activity: now,
        };
        entry.state = ConnectionState::Joined(document_id.to_string());
        entry.session = Some(session.clone());
        entry.last_seen = Instant::now();

        info!("User {} joined {} on connection {}", user_id, document_id, connection_id);
        Ok(session)
    }

    /// The session of a connection, which must be joined to `document_id`
    pub fn require_joined(&self, connection_id: &str, document_id: &str) -> SyncResult<Session> {
        let entry = self
            .connections
            .get(connection_id)
            .ok_or_else(|| SyncError::ConnectionNotFound(connection_id.to_string()))?;

        match (&entry.state, &entry.session) {
            (ConnectionState::Joined(joined), Some(session)) if joined == document_id => {
                Ok(session.clone())
            }
            (ConnectionState::Joined(joined), _) => Err(SyncError::AccessDenied(format!(
                "connection is joined to {}, not {}",
                joined, document_id
            ))),
            _ => Err(SyncError::NotJoined(document_id.to_string())),
        }
    }

    /// The session of a connection, whatever document it is joined to
    pub fn session(&self, connection_id: &str) -> Option<Session> {
        self.connections.get(connection_id).and_then(|e| e.session.clone())
    }

    pub fn state(&self, connection_id: &str) -> Option<ConnectionState> {
        self.connections.get(connection_id).map(|e| e.state.clone())
    }

    /// End the session but keep the connection
    pub fn leave(&self, connection_id: &str) -> Option<Session> {
        let mut entry = self.connections.get_mut(connection_id)?;
        let session = entry.session.take()?;
        entry.state = ConnectionState::Left;
        info!("User {} left {}", session.user_id, session.document_id);
        Some(session)
    }

    /// Forget the connection, returning its session if it was joined
    pub fn disconnect(&self, connection_id: &str) -> Option<Session> {
        let (_, mut entry) = self.connections.remove(connection_id)?;
        entry.state = ConnectionState::Disconnected;
        debug!("Connection disconnected: {}", connection_id);
        entry.session.take()
    }

    /// Record activity on a connection
    pub fn touch(&self, connection_id: &str) {
        if let Some(mut entry) = self.connections.get_mut(connection_id) {
            entry.touch();
        }
    }

    /// Connections with no activity for longer than `timeout`
    pub fn stale_connections(&self, timeout: Duration) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|entry| entry.is_stale(timeout))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Sessions joined to a document on this process
    #[cfg(test)]
    pub fn sessions_in(&self, document_id: &str) -> Vec<Session> {
        self.connections
            .iter()
            .filter_map(|entry| entry.session.clone())
            .filter(|session| session.document_id == document_id)
            .collect()
    }

    /// Number of joined sessions
    pub fn session_count(&self) -> usize {
        self.connections.iter().filter(|e| e.session.is_some()).count()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[test]
    fn test_join_creates_session() {
        let registry = SessionRegistry::new();
        registry.register("conn-1");
        assert_eq!(registry.state("conn-1"), Some(ConnectionState::Connecting));

        let session = assert_ok!(registry.join("conn-1", "alice", "doc"));
        assert_eq!(session.user_id, "alice");
        assert_eq!(registry.session_count(), 1);
        assert_eq!(registry.state("conn-1"), Some(ConnectionState::Joined("doc".to_string())));
    }

    #[test]
    fn test_join_unknown_connection() {
        let registry = SessionRegistry::new();
        assert!(matches!(
            registry.join("ghost", "alice", "doc"),
            Err(SyncError::ConnectionNotFound(_))
        ));
    }

    #[test]
    fn test_second_join_is_rejected() {
        let registry = SessionRegistry::new();
        registry.register("conn-1");
        registry.join("conn-1", "alice", "doc-a").unwrap();

        assert_eq!(
            registry.join("conn-1", "alice", "doc-b"),
            Err(SyncError::AlreadyJoined("doc-a".to_string()))
        );
    }

    #[test]
    fn test_require_joined() {
        let registry = SessionRegistry::new();
        registry.register("conn-1");

        assert!(matches!(registry.require_joined("conn-1", "doc"), Err(SyncError::NotJoined(_))));

        registry.join("conn-1", "alice", "doc").unwrap();
        assert!(registry.require_joined("conn-1", "doc").is_ok());
        assert!(matches!(
            registry.require_joined("conn-1", "other"),
            Err(SyncError::AccessDenied(_))
        ));
    }

    #[test]
    fn test_leave_then_rejoin() {
        let registry = SessionRegistry::new();
        registry.register("conn-1");
        registry.join("conn-1", "alice", "doc-a").unwrap();

        let left = registry.leave("conn-1").unwrap();
        assert_eq!(left.document_id, "doc-a");
        assert_eq!(registry.state("conn-1"), Some(ConnectionState::Left));
        assert!(registry.leave("conn-1").is_none());

        assert!(registry.join("conn-1", "alice", "doc-b").is_ok());
    }

    #[test]
    fn test_disconnect_removes_connection() {
        let registry = SessionRegistry::new();
        registry.register("conn-1");
        registry.join("conn-1", "alice", "doc").unwrap();

        let session = registry.disconnect("conn-1").unwrap();
        assert_eq!(session.connection_id, "conn-1");
        assert_eq!(registry.connection_count(), 0);
        assert!(registry.disconnect("conn-1").is_none());
    }

    #[test]
    fn test_stale_connections() {
        let registry = SessionRegistry::new();
        registry.register("conn-1");
        registry.register("conn-2");

        assert!(registry.stale_connections(Duration::from_secs(60)).is_empty());

        std::thread::sleep(Duration::from_millis(20));
        registry.touch("conn-2");
        let stale = registry.stale_connections(Duration::from_millis(10));
        assert_eq!(stale, vec!["conn-1".to_string()]);
    }

    #[test]
    fn test_sessions_in_document() {
        let registry = SessionRegistry::new();
        let joins = [("c1", "alice", "doc"), ("c2", "bob", "doc"), ("c3", "carol", "other")];
        for (conn, user, doc) in joins {
            registry.register(conn);
            registry.join(conn, user, doc).unwrap();
        }
        assert_eq!(registry.sessions_in("doc").len(), 2);
    }
}
