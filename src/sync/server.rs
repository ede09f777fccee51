//! CollabServer: the connection-facing side of the editing engine.
//!
//! This module wires the collaborators together:
//! - SessionRegistry for the per-connection state machine
//! - PresenceManager for who is in each document
//! - RoomBroadcaster for fan-out over the pub/sub bus
//! - DocumentCoordinator for the authoritative content and version
//!
//! Every public method handles one client request and returns the reply for
//! that client; everything other members need to see goes through the bus.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::broadcast::RoomBroadcaster;
use super::bus::PubSubBus;
use super::coordinator::DocumentCoordinator;
use super::operation::{CursorPosition, Operation};
use super::presence::{CollaborationUser, PresenceManager};
use super::protocol::{ClientMessage, ServerMessage};
use super::session::{ConnectionState, Session, SessionRegistry};
use super::{now_millis, ConnectionId, NodeId, SyncError, SyncResult};
use crate::auth::{AccessPolicy, AuthError, IdentityVerifier};

/// Configuration for the CollabServer
#[derive(Debug, Clone)]
pub struct CollabServerConfig {
    /// Identifier of this process on the bus
    pub node_id: NodeId,
    /// Document auto-save interval
    pub save_interval: Duration,
    /// Cleanup interval for stale connections and idle documents
    pub cleanup_interval: Duration,
    /// Connections silent for longer than this are dropped
    pub session_timeout: Duration,
}

impl Default for CollabServerConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            save_interval: Duration::from_secs(2),
            cleanup_interval: Duration::from_secs(60),
            session_timeout: Duration::from_secs(300),
        }
    }
}

/// The collaboration server
pub struct CollabServer {
    config: CollabServerConfig,
    sessions: SessionRegistry,
    presence: Arc<PresenceManager>,
    broadcaster: RoomBroadcaster,
    coordinator: Arc<DocumentCoordinator>,
    identity: Arc<dyn IdentityVerifier>,
    access: Arc<dyn AccessPolicy>,
    /// Server start time
    started_at: Instant,
    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
}

fn access_error(err: AuthError) -> SyncError {
    match err {
        AuthError::Unavailable(reason) => SyncError::RetryableUnavailable(reason),
        other => SyncError::AccessDenied(other.to_string()),
    }
}

impl CollabServer {
    pub fn new(
        config: CollabServerConfig,
        coordinator: Arc<DocumentCoordinator>,
        identity: Arc<dyn IdentityVerifier>,
        access: Arc<dyn AccessPolicy>,
        bus: Arc<dyn PubSubBus>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            broadcaster: RoomBroadcaster::new(config.node_id.clone(), bus),
            config,
            sessions: SessionRegistry::new(),
            presence: Arc::new(PresenceManager::new()),
            coordinator,
            identity,
            access,
            started_at: Instant::now(),
            shutdown_tx,
        }
    }

    /// Share presence with other nodes serving the same rooms
    pub fn with_presence(mut self, presence: Arc<PresenceManager>) -> Self {
        self.presence = presence;
        self
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    #[cfg(test)]
    pub fn coordinator(&self) -> &Arc<DocumentCoordinator> {
        &self.coordinator
    }

    #[cfg(test)]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Register a new transport connection and its outbound channel
    pub fn connect(&self, tx: mpsc::UnboundedSender<ServerMessage>) -> ConnectionId {
        let connection_id = uuid::Uuid::new_v4().to_string();
        self.sessions.register(&connection_id);
        self.broadcaster.register_connection(&connection_id, tx);
        connection_id
    }

    /// Record inbound activity on a connection
    pub fn touch(&self, connection_id: &str) {
        self.sessions.touch(connection_id);
        if let Some(session) = self.sessions.session(connection_id) {
            if let Some(presence) = self.presence.get(&session.document_id) {
                presence.touch(connection_id);
            }
        }
    }

    /// Dispatch one decoded client message, returning the direct reply if any.
    /// Failures become `error` messages for the sender.
    pub async fn handle_message(
        &self,
        connection_id: &str,
        msg: ClientMessage,
    ) -> Option<ServerMessage> {
        self.touch(connection_id);

        let result = match msg {
            ClientMessage::JoinDocument {
                document_id,
                credential,
            } => self.join(connection_id, &document_id, &credential).await.map(Some),
            ClientMessage::DocumentChange { operation } => {
                self.submit_change(connection_id, operation).await.map(Some)
            }
            ClientMessage::CursorPosition { cursor } => {
                self.update_cursor(connection_id, cursor).await.map(|_| None)
            }
            ClientMessage::LeaveDocument { document_id } => {
                self.leave(connection_id, &document_id).await.map(|_| None)
            }
            ClientMessage::Ping { timestamp } => Ok(Some(ServerMessage::Pong {
                timestamp,
                server_time: now_millis(),
            })),
        };

        match result {
            Ok(reply) => reply,
            Err(e) => {
                debug!("Request on {} failed: {}", connection_id, e);
                Some(ServerMessage::from(&e))
            }
        }
    }

    /// Join a document: verify, authorize, subscribe, announce
    pub async fn join(
        &self,
        connection_id: &str,
        document_id: &str,
        credential: &str,
    ) -> SyncResult<ServerMessage> {
        match self.sessions.state(connection_id) {
            None => return Err(SyncError::ConnectionNotFound(connection_id.to_string())),
            Some(ConnectionState::Joined(current)) => return Err(SyncError::AlreadyJoined(current)),
            Some(_) => {}
        }

        let identity = self.identity.verify(credential).await.map_err(|e| {
            debug!("Credential rejected on {}: {}", connection_id, e);
            access_error(e)
        })?;

        if !self
            .access
            .check_access(&identity.user_id, document_id)
            .await
            .map_err(access_error)?
        {
            return Err(SyncError::AccessDenied(format!(
                "{} has no access to {}",
                identity.user_id, document_id
            )));
        }

        // load before creating any session state
        self.coordinator.open(document_id).await?;

        let session = self.sessions.join(connection_id, &identity.user_id, document_id)?;
        if let Err(e) = self.broadcaster.join_room(document_id, connection_id).await {
            self.sessions.leave(connection_id);
            return Err(SyncError::RetryableUnavailable(e.to_string()));
        }

        // read state after subscribing so no accepted change falls between the two
        let document_state = match self.coordinator.open(document_id).await {
            Ok(state) => state,
            Err(e) => {
                self.sessions.leave(connection_id);
                self.broadcaster.leave_room(document_id, connection_id);
                return Err(e);
            }
        };

        let user = CollaborationUser::new(&identity.user_id, &identity.name, &identity.email)
            .with_avatar(identity.avatar.clone());
        let (presence, first_connection) =
            self.presence.join(document_id, connection_id, user.clone());

        if first_connection {
            let msg = ServerMessage::UserJoined {
                document_id: document_id.to_string(),
                user: user.clone(),
            };
            if let Err(e) = self.broadcaster.publish(document_id, Some(connection_id), msg).await {
                warn!("Failed to announce {} in {}: {}", session.user_id, document_id, e);
            }
        }

        info!(
            "User {} joined document {} at version {}",
            session.user_id, document_id, document_state.version
        );

        Ok(ServerMessage::DocumentJoined {
            document_id: document_id.to_string(),
            document_state,
            active_users: presence.active_users(),
            self_user: user,
        })
    }

    /// Accept an edit, broadcast it to the room, and acknowledge the author
    pub async fn submit_change(
        &self,
        connection_id: &str,
        operation: Operation,
    ) -> SyncResult<ServerMessage> {
        let session = self.sessions.require_joined(connection_id, &operation.document_id)?;
        let document_id = session.document_id.clone();
        let operation = operation.with_author(session.user_id.clone());

        let accepted = match self.coordinator.accept_operation(operation).await {
            Ok(accepted) => accepted,
            Err(SyncError::ResyncRequired {
                base_version,
                current_version,
            }) => {
                info!(
                    "Connection {} is at version {} of {} (current {}), sending full state",
                    connection_id, base_version, document_id, current_version
                );
                let document_state = self.coordinator.open(&document_id).await?;
                return Ok(ServerMessage::Resync {
                    document_id,
                    document_state,
                });
            }
            Err(e) => return Err(e),
        };

        let broadcast = ServerMessage::DocumentChange {
            document_id: document_id.clone(),
            operations: accepted.operations.clone(),
            version: accepted.version,
            author_id: accepted.author_id.clone(),
        };
        let published = self
            .broadcaster
            .publish(&document_id, Some(connection_id), broadcast)
            .await;
        if let Err(e) = published {
            // the change is committed; members catch up through the log or a resync
            error!("Failed to broadcast version {} of {}: {}", accepted.version, document_id, e);
        }

        Ok(ServerMessage::ChangeAccepted {
            operation_id: accepted.operation_id,
            version: accepted.version,
            operations: accepted.operations,
            superseded: accepted.superseded,
        })
    }

    /// Store and relay a cursor move. Cursors skip the coordinator.
    pub async fn update_cursor(
        &self,
        connection_id: &str,
        cursor: CursorPosition,
    ) -> SyncResult<()> {
        let session = self.sessions.require_joined(connection_id, &cursor.document_id)?;
        let cursor = CursorPosition {
            user_id: session.user_id,
            ..cursor
        };

        let presence = self
            .presence
            .get(&session.document_id)
            .ok_or_else(|| SyncError::NotJoined(session.document_id.clone()))?;
        let applied = presence
            .update_cursor(connection_id, cursor.clone())
            .map_err(|e| SyncError::Internal(e.to_string()))?;
        if !applied {
            return Ok(());
        }

        let msg = ServerMessage::CursorPosition { cursor };
        let published = self
            .broadcaster
            .publish(&session.document_id, Some(connection_id), msg)
            .await;
        if let Err(e) = published {
            debug!("Dropped cursor update for {}: {}", session.document_id, e);
        }
        Ok(())
    }

    /// Explicitly leave a document, keeping the connection open
    pub async fn leave(&self, connection_id: &str, document_id: &str) -> SyncResult<()> {
        self.sessions.require_joined(connection_id, document_id)?;
        if let Some(session) = self.sessions.leave(connection_id) {
            self.depart(connection_id, &session).await;
        }
        Ok(())
    }

    /// Tear down everything a connection owns
    pub async fn disconnect(&self, connection_id: &str) {
        if let Some(session) = self.sessions.disconnect(connection_id) {
            self.depart(connection_id, &session).await;
        }
        self.broadcaster.unregister_connection(connection_id);
    }

    async fn depart(&self, connection_id: &str, session: &Session) {
        let document_id = &session.document_id;
        self.broadcaster.leave_room(document_id, connection_id);

        if let Some((user, true)) = self.presence.leave(document_id, connection_id) {
            let msg = ServerMessage::UserLeft {
                document_id: document_id.clone(),
                user_id: user.id,
            };
            if let Err(e) = self.broadcaster.publish(document_id, Some(connection_id), msg).await {
                warn!("Failed to announce departure from {}: {}", document_id, e);
            }
        }
    }

    /// Save dirty documents to storage
    pub async fn save_dirty_documents(&self) -> usize {
        self.coordinator.save_dirty().await
    }

    /// Drop stale connections, decay presence, evict idle documents
    pub async fn cleanup(&self) {
        for connection_id in self.sessions.stale_connections(self.config.session_timeout) {
            warn!("Removing stale connection: {}", connection_id);
            self.disconnect(&connection_id).await;
        }

        let changed = self.presence.update_all_statuses();
        if changed > 0 {
            debug!("{} presence statuses changed", changed);
        }
        self.presence.cleanup();

        for document_id in self.coordinator.loaded_documents() {
            if self.broadcaster.has_local_members(&document_id) {
                continue;
            }
            if let Err(e) = self.coordinator.evict(&document_id).await {
                error!("Failed to evict document {}: {}", document_id, e);
            }
        }

        let pruned = self.broadcaster.prune_bus();
        if pruned > 0 {
            debug!("Released {} idle bus channels", pruned);
        }
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            active_documents: self.coordinator.loaded_documents().len(),
            active_rooms: self.broadcaster.room_count(),
            active_connections: self.sessions.connection_count(),
            active_sessions: self.sessions.session_count(),
            present_connections: self.presence.total_connections(),
            present_documents: self.presence.document_count(),
            accepted_operations: self.coordinator.accepted_count(),
            detected_conflicts: self.coordinator.conflict_count(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Start background tasks (save loop, cleanup loop)
    pub fn start_background_tasks(self: Arc<Self>) -> BackgroundTaskHandles {
        let server = self.clone();
        let save_interval = server.config.save_interval;

        // Save task
        let save_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(save_interval);
            let mut shutdown = server.shutdown_receiver();

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let saved = server.save_dirty_documents().await;
                        if saved > 0 {
                            debug!("Auto-saved {} documents", saved);
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Save task shutting down");
                        let saved = server.save_dirty_documents().await;
                        info!("Final save wrote {} documents", saved);
                        break;
                    }
                }
            }
        });

        let server = self;
        let cleanup_interval = server.config.cleanup_interval;

        // Cleanup task
        let cleanup_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);
            let mut shutdown = server.shutdown_receiver();

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        server.cleanup().await;
                    }
                    _ = shutdown.recv() => {
                        info!("Cleanup task shutting down");
                        break;
                    }
                }
            }
        });

        BackgroundTaskHandles {
            save_task: save_handle,
            cleanup_task: cleanup_handle,
        }
    }
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub active_documents: usize,
    pub active_rooms: usize,
    pub active_connections: usize,
    pub active_sessions: usize,
    /// Connections in any document's presence, across every sharing node
    pub present_connections: usize,
    pub present_documents: usize,
    pub accepted_operations: u64,
    pub detected_conflicts: u64,
    pub uptime_seconds: u64,
}

/// Handles for background tasks
pub struct BackgroundTaskHandles {
    pub save_task: tokio::task::JoinHandle<()>,
    pub cleanup_task: tokio::task::JoinHandle<()>,
}

impl BackgroundTaskHandles {
    /// Wait for all tasks to complete
    pub async fn wait(self) {
        let _ = tokio::join!(self.save_task, self.cleanup_task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Identity, StaticAccessPolicy};
    use crate::storage::{SledStore, StorageConfig};
    use crate::sync::bus::LocalBus;
    use crate::sync::coordinator::CoordinatorConfig;
    use crate::sync::oplog::{MemoryOperationLog, OperationLog, WindowConfig};
    use crate::sync::protocol::ErrorCode;
    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::time::timeout;

    /// Accepts `token-<user>` credentials
    struct TokenVerifier;

    #[async_trait]
    impl IdentityVerifier for TokenVerifier {
        async fn verify(&self, credential: &str) -> Result<Identity, AuthError> {
            let user = credential
                .strip_prefix("token-")
                .ok_or_else(|| AuthError::InvalidCredential("unknown token".to_string()))?;
            Ok(Identity {
                user_id: user.to_string(),
                name: user.to_uppercase(),
                email: format!("{}@example.com", user),
                avatar: None,
            })
        }
    }

    struct Harness {
        server: CollabServer,
        _dir: TempDir,
    }

    fn node(
        bus: Arc<dyn PubSubBus>,
        log: Arc<dyn OperationLog>,
        access: Arc<dyn AccessPolicy>,
        presence: Arc<PresenceManager>,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(StorageConfig::new(
            dir.path().join("test.sled").to_string_lossy().to_string(),
        ))
        .unwrap();
        let coordinator = Arc::new(DocumentCoordinator::new(
            CoordinatorConfig::default(),
            Arc::new(store),
            log,
        ));
        let server = CollabServer::new(
            CollabServerConfig::default(),
            coordinator,
            Arc::new(TokenVerifier),
            access,
            bus,
        )
        .with_presence(presence);
        Harness { server, _dir: dir }
    }

    fn single_node() -> Harness {
        node(
            Arc::new(LocalBus::default()),
            Arc::new(MemoryOperationLog::default()),
            Arc::new(StaticAccessPolicy::allow_all()),
            Arc::default(),
        )
    }

    fn open_connection(
        server: &CollabServer,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (server.connect(tx), rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Option<ServerMessage> {
        timeout(Duration::from_millis(500), rx.recv()).await.ok().flatten()
    }

    async fn quiet(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> bool {
        timeout(Duration::from_millis(100), rx.recv()).await.is_err()
    }

    #[tokio::test]
    async fn test_invalid_credential_creates_no_session() {
        let h = single_node();
        let (conn, _rx) = open_connection(&h.server);

        let result = h.server.join(&conn, "doc", "garbage").await;
        assert!(matches!(result, Err(SyncError::AccessDenied(_))));
        assert_eq!(h.server.sessions().session_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_grant_is_denied() {
        let policy = Arc::new(StaticAccessPolicy::deny_all());
        policy.grant("alice", "doc");
        let h = node(
            Arc::new(LocalBus::default()),
            Arc::new(MemoryOperationLog::default()),
            policy,
            Arc::default(),
        );

        let (alice, _a) = open_connection(&h.server);
        let (bob, _b) = open_connection(&h.server);
        assert!(h.server.join(&alice, "doc", "token-alice").await.is_ok());
        assert!(matches!(
            h.server.join(&bob, "doc", "token-bob").await,
            Err(SyncError::AccessDenied(_))
        ));
        assert_eq!(h.server.sessions().session_count(), 1);
    }

    #[tokio::test]
    async fn test_join_announces_and_lists_users() {
        let h = single_node();
        let (alice, mut alice_rx) = open_connection(&h.server);
        let (bob, _bob_rx) = open_connection(&h.server);

        h.server.join(&alice, "doc", "token-alice").await.unwrap();
        let reply = h.server.join(&bob, "doc", "token-bob").await.unwrap();

        match reply {
            ServerMessage::DocumentJoined {
                active_users,
                self_user,
                document_state,
                ..
            } => {
                assert_eq!(self_user.id, "bob");
                assert_eq!(active_users.len(), 2);
                assert_eq!(document_state.version, 0);
            }
            other => panic!("Expected DocumentJoined, got {:?}", other),
        }

        match next(&mut alice_rx).await {
            Some(ServerMessage::UserJoined { user, .. }) => assert_eq!(user.id, "bob"),
            other => panic!("Expected UserJoined, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_double_join_is_rejected() {
        let h = single_node();
        let (conn, _rx) = open_connection(&h.server);
        h.server.join(&conn, "doc", "token-alice").await.unwrap();

        assert_eq!(
            h.server.join(&conn, "other", "token-alice").await.unwrap_err(),
            SyncError::AlreadyJoined("doc".to_string())
        );
    }

    #[tokio::test]
    async fn test_change_is_broadcast_and_acknowledged() {
        let h = single_node();
        let (alice, mut alice_rx) = open_connection(&h.server);
        let (bob, mut bob_rx) = open_connection(&h.server);
        h.server.join(&alice, "doc", "token-alice").await.unwrap();
        h.server.join(&bob, "doc", "token-bob").await.unwrap();
        next(&mut alice_rx).await; // bob's user-joined

        let op = Operation::insert("doc", 0, "hello", "spoofed");
        let ack = h.server.submit_change(&alice, op.clone()).await.unwrap();
        match ack {
            ServerMessage::ChangeAccepted {
                operation_id,
                version,
                superseded,
                ..
            } => {
                assert_eq!(operation_id, op.id);
                assert_eq!(version, 1);
                assert!(!superseded);
            }
            other => panic!("Expected ChangeAccepted, got {:?}", other),
        }

        match next(&mut bob_rx).await {
            Some(ServerMessage::DocumentChange {
                operations,
                version,
                author_id,
                ..
            }) => {
                assert_eq!(version, 1);
                assert_eq!(author_id, "alice");
                assert_eq!(operations[0].content.as_deref(), Some("hello"));
            }
            other => panic!("Expected DocumentChange, got {:?}", other),
        }
        assert!(quiet(&mut alice_rx).await);
    }

    #[tokio::test]
    async fn test_change_requires_join() {
        let h = single_node();
        let (alice, _rx) = open_connection(&h.server);
        h.server.join(&alice, "doc", "token-alice").await.unwrap();
        let (stranger, _srx) = open_connection(&h.server);

        let op = Operation::insert("doc", 0, "x", "stranger");
        assert!(matches!(
            h.server.submit_change(&stranger, op).await,
            Err(SyncError::NotJoined(_))
        ));

        let elsewhere = Operation::insert("other", 0, "x", "alice");
        assert!(matches!(
            h.server.submit_change(&alice, elsewhere).await,
            Err(SyncError::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_client_gets_resync() {
        let log = Arc::new(MemoryOperationLog::new(WindowConfig {
            max_entries: 1,
            ttl: Duration::from_secs(60),
        }));
        let h = node(
            Arc::new(LocalBus::default()),
            log,
            Arc::new(StaticAccessPolicy::allow_all()),
            Arc::default(),
        );
        let (alice, _rx) = open_connection(&h.server);
        h.server.join(&alice, "doc", "token-alice").await.unwrap();
        for v in 0..3u64 {
            let op = Operation::insert("doc", 0, "a", "alice").with_base_version(v);
            h.server.submit_change(&alice, op).await.unwrap();
        }

        let stale = Operation::insert("doc", 0, "b", "alice").with_base_version(0);
        match h.server.submit_change(&alice, stale).await.unwrap() {
            ServerMessage::Resync { document_state, .. } => {
                assert_eq!(document_state.content, "aaa");
                assert_eq!(document_state.version, 3);
            }
            other => panic!("Expected Resync, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cursor_is_relayed_with_verified_user() {
        let h = single_node();
        let (alice, _alice_rx) = open_connection(&h.server);
        let (bob, mut bob_rx) = open_connection(&h.server);
        h.server.join(&alice, "doc", "token-alice").await.unwrap();
        h.server.join(&bob, "doc", "token-bob").await.unwrap();

        let cursor = CursorPosition::new("someone-else", "doc", 3, 7);
        h.server.update_cursor(&alice, cursor).await.unwrap();

        match next(&mut bob_rx).await {
            Some(ServerMessage::CursorPosition { cursor }) => {
                assert_eq!(cursor.user_id, "alice");
                assert_eq!((cursor.line, cursor.character), (3, 7));
            }
            other => panic!("Expected CursorPosition, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_user_left_only_after_last_connection() {
        let h = single_node();
        let (tab1, _t1) = open_connection(&h.server);
        let (tab2, _t2) = open_connection(&h.server);
        let (bob, mut bob_rx) = open_connection(&h.server);

        h.server.join(&bob, "doc", "token-bob").await.unwrap();
        h.server.join(&tab1, "doc", "token-alice").await.unwrap();
        h.server.join(&tab2, "doc", "token-alice").await.unwrap();

        assert!(matches!(next(&mut bob_rx).await, Some(ServerMessage::UserJoined { .. })));
        assert!(quiet(&mut bob_rx).await);

        h.server.disconnect(&tab1).await;
        assert!(quiet(&mut bob_rx).await);

        h.server.leave(&tab2, "doc").await.unwrap();
        match next(&mut bob_rx).await {
            Some(ServerMessage::UserLeft { user_id, .. }) => assert_eq!(user_id, "alice"),
            other => panic!("Expected UserLeft, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handle_message_maps_errors() {
        let h = single_node();
        let (conn, _rx) = open_connection(&h.server);

        let reply = h
            .server
            .handle_message(
                &conn,
                ClientMessage::DocumentChange {
                    operation: Operation::insert("doc", 0, "x", "alice"),
                },
            )
            .await;
        match reply {
            Some(ServerMessage::Error { code, .. }) => assert_eq!(code, ErrorCode::NotJoined),
            other => panic!("Expected Error, got {:?}", other),
        }

        let pong = h.server.handle_message(&conn, ClientMessage::Ping { timestamp: 42 }).await;
        assert!(matches!(pong, Some(ServerMessage::Pong { timestamp: 42, .. })));

        let cursor = ClientMessage::CursorPosition {
            cursor: CursorPosition::new("alice", "doc", 0, 0),
        };
        assert!(matches!(
            h.server.handle_message(&conn, cursor).await,
            Some(ServerMessage::Error { .. })
        ));
    }

    #[tokio::test]
    async fn test_two_nodes_share_a_room() {
        let bus: Arc<dyn PubSubBus> = Arc::new(LocalBus::default());
        let log: Arc<dyn OperationLog> = Arc::new(MemoryOperationLog::default());
        let access: Arc<dyn AccessPolicy> = Arc::new(StaticAccessPolicy::allow_all());
        let presence: Arc<PresenceManager> = Arc::default();
        let a = node(bus.clone(), log.clone(), access.clone(), presence.clone());
        let b = node(bus, log, access, presence);

        let (alice, _alice_rx) = open_connection(&a.server);
        let (bob, mut bob_rx) = open_connection(&b.server);
        a.server.join(&alice, "doc", "token-alice").await.unwrap();
        b.server.join(&bob, "doc", "token-bob").await.unwrap();

        a.server
            .submit_change(&alice, Operation::insert("doc", 0, "hello", "alice"))
            .await
            .unwrap();
        match next(&mut bob_rx).await {
            Some(ServerMessage::DocumentChange { version, .. }) => assert_eq!(version, 1),
            other => panic!("Expected DocumentChange, got {:?}", other),
        }

        // bob edits against version 1 on the other node
        let ack = b
            .server
            .submit_change(&bob, Operation::insert("doc", 5, "!", "bob").with_base_version(1))
            .await
            .unwrap();
        assert!(matches!(ack, ServerMessage::ChangeAccepted { version: 2, .. }));

        let state = a.server.coordinator().open("doc").await.unwrap();
        assert_eq!(state.content, "hello!");
    }

    #[tokio::test]
    async fn test_cleanup_drops_stale_connections_and_idle_documents() {
        let mut h = single_node();
        h.server.config.session_timeout = Duration::ZERO;
        let (alice, _rx) = open_connection(&h.server);
        h.server.join(&alice, "doc", "token-alice").await.unwrap();
        h.server
            .submit_change(&alice, Operation::insert("doc", 0, "keep", "alice"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        h.server.cleanup().await;

        let stats = h.server.stats();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.active_rooms, 0);
        assert_eq!(stats.active_documents, 0);

        // evicted documents were saved first
        let state = h.server.coordinator().open("doc").await.unwrap();
        assert_eq!(state.content, "keep");
    }

    #[tokio::test]
    async fn test_presence_spans_nodes() {
        let bus: Arc<dyn PubSubBus> = Arc::new(LocalBus::default());
        let log: Arc<dyn OperationLog> = Arc::new(MemoryOperationLog::default());
        let access: Arc<dyn AccessPolicy> = Arc::new(StaticAccessPolicy::allow_all());
        let presence: Arc<PresenceManager> = Arc::default();
        let a = node(bus.clone(), log.clone(), access.clone(), presence.clone());
        let b = node(bus, log, access, presence);

        let (alice_a, _alice_a_rx) = open_connection(&a.server);
        let (bob, mut bob_rx) = open_connection(&b.server);
        a.server.join(&alice_a, "doc", "token-alice").await.unwrap();

        match b.server.join(&bob, "doc", "token-bob").await.unwrap() {
            ServerMessage::DocumentJoined { active_users, .. } => {
                let ids: Vec<&str> = active_users.iter().map(|u| u.id.as_str()).collect();
                assert_eq!(ids, vec!["alice", "bob"]);
            }
            other => panic!("Expected DocumentJoined, got {:?}", other),
        }

        // a second tab on the other node is the same collaborator
        let (alice_b, _alice_b_rx) = open_connection(&b.server);
        b.server.join(&alice_b, "doc", "token-alice").await.unwrap();
        assert!(quiet(&mut bob_rx).await);

        a.server.disconnect(&alice_a).await;
        assert!(quiet(&mut bob_rx).await);

        b.server.disconnect(&alice_b).await;
        match next(&mut bob_rx).await {
            Some(ServerMessage::UserLeft { user_id, .. }) => assert_eq!(user_id, "alice"),
            other => panic!("Expected UserLeft, got {:?}", other),
        }
        assert!(quiet(&mut bob_rx).await);
        assert_eq!(a.server.stats().present_connections, 1);
    }

    #[tokio::test]
    async fn test_cleanup_releases_idle_bus_channels() {
        let bus = Arc::new(LocalBus::default());
        let h = node(
            bus.clone(),
            Arc::new(MemoryOperationLog::default()),
            Arc::new(StaticAccessPolicy::allow_all()),
            Arc::default(),
        );
        let (conn, _rx) = open_connection(&h.server);
        for doc in ["one", "two", "three"] {
            h.server.join(&conn, doc, "token-alice").await.unwrap();
            h.server.leave(&conn, doc).await.unwrap();
        }
        let (bob, _bob_rx) = open_connection(&h.server);
        h.server.join(&bob, "busy", "token-bob").await.unwrap();
        assert_eq!(bus.channel_count(), 4);

        // aborted forwarders drop their receivers once the runtime gets to them
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.server.cleanup().await;
        assert_eq!(bus.channel_count(), 1);
    }
}
