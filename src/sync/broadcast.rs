//! Room broadcaster: process-local connection index plus bus fan-out.
//!
//! Each process keeps an index of its own connection handles and, per room,
//! its local members. Every member holds its own bus subscription, taken when
//! it joined, and a forwarder task that delivers envelopes to that connection
//! only. A member therefore never sees messages published before its join.
//! Leaving aborts the member's forwarder, which releases its subscription.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::bus::{BusEnvelope, BusError, PubSubBus};
use super::protocol::ServerMessage;
use super::{ConnectionId, DocumentId, NodeId, SyncError, SyncResult};

/// Outbound channel of one connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub connection_id: ConnectionId,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ConnectionHandle {
    pub fn new(connection_id: impl Into<String>, tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            connection_id: connection_id.into(),
            tx,
        }
    }

    /// Send a message to this connection
    pub fn send(&self, msg: ServerMessage) -> SyncResult<()> {
        self.tx
            .send(msg)
            .map_err(|_| SyncError::ConnectionNotFound(self.connection_id.clone()))
    }
}

#[derive(Default)]
struct LocalRoom {
    /// Forwarder of each member's subscription
    members: HashMap<ConnectionId, JoinHandle<()>>,
}

type ConnectionIndex = Arc<DashMap<ConnectionId, ConnectionHandle>>;

/// Fans room messages out to connected clients
pub struct RoomBroadcaster {
    node_id: NodeId,
    bus: Arc<dyn PubSubBus>,
    connections: ConnectionIndex,
    rooms: DashMap<DocumentId, LocalRoom>,
}

impl RoomBroadcaster {
    pub fn new(node_id: impl Into<String>, bus: Arc<dyn PubSubBus>) -> Self {
        Self {
            node_id: node_id.into(),
            bus,
            connections: Arc::new(DashMap::new()),
            rooms: DashMap::new(),
        }
    }

    /// Make a connection reachable by id
    pub fn register_connection(
        &self,
        connection_id: &str,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) {
        self.connections
            .insert(connection_id.to_string(), ConnectionHandle::new(connection_id, tx));
    }

    pub fn unregister_connection(&self, connection_id: &str) {
        self.connections.remove(connection_id);
    }

    /// Send directly to one local connection
    #[cfg(test)]
    pub fn send_to(&self, connection_id: &str, msg: ServerMessage) -> SyncResult<()> {
        let handle = self
            .connections
            .get(connection_id)
            .map(|h| h.clone())
            .ok_or_else(|| SyncError::ConnectionNotFound(connection_id.to_string()))?;
        handle.send(msg)
    }

    /// Add a local connection to a room with a subscription of its own
    pub async fn join_room(&self, document_id: &str, connection_id: &str) -> Result<(), BusError> {
        let rx = self.bus.subscribe(document_id).await?;
        let forwarder = self.spawn_forwarder(document_id, connection_id, BroadcastStream::new(rx));

        let previous = self
            .rooms
            .entry(document_id.to_string())
            .or_insert_with(|| {
                debug!("Node {} now hosts room {}", self.node_id, document_id);
                LocalRoom::default()
            })
            .members
            .insert(connection_id.to_string(), forwarder);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    /// Remove a local connection from a room; returns true if the room emptied
    pub fn leave_room(&self, document_id: &str, connection_id: &str) -> bool {
        if let Some(mut room) = self.rooms.get_mut(document_id) {
            if let Some(forwarder) = room.members.remove(connection_id) {
                forwarder.abort();
            }
        }

        if self
            .rooms
            .remove_if(document_id, |_, room| room.members.is_empty())
            .is_some()
        {
            info!("Room {} has no local members, torn down", document_id);
            return true;
        }
        false
    }

    /// Release bus channels nobody is subscribed to any more
    pub fn prune_bus(&self) -> usize {
        self.bus.prune()
    }

    /// Publish a message to every member of a room on every process
    pub async fn publish(
        &self,
        document_id: &str,
        exclude: Option<&str>,
        message: ServerMessage,
    ) -> Result<usize, BusError> {
        let exclude = exclude.map(str::to_string);
        let envelope = BusEnvelope::new(&self.node_id, document_id, exclude, message);
        self.bus.publish(document_id, envelope).await
    }

    /// Local members of a room
    #[cfg(test)]
    pub fn local_members(&self, document_id: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(document_id)
            .map(|room| room.members.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_local_members(&self, document_id: &str) -> bool {
        self.rooms.contains_key(document_id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn spawn_forwarder(
        &self,
        document_id: &str,
        connection_id: &str,
        mut stream: BroadcastStream<BusEnvelope>,
    ) -> JoinHandle<()> {
        let connections = self.connections.clone();
        let document_id = document_id.to_string();
        let connection_id = connection_id.to_string();

        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                let envelope = match item {
                    Ok(envelope) => envelope,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(
                            "Connection {} lagged in room {}, dropped {} messages",
                            connection_id, document_id, skipped
                        );
                        continue;
                    }
                };
                if envelope.exclude_connection.as_deref() == Some(connection_id.as_str()) {
                    continue;
                }
                let Some(handle) = connections.get(&connection_id).map(|h| h.clone()) else {
                    break;
                };
                if handle.send(envelope.message).is_err() {
                    debug!("Connection {} closed, stopping its forwarder", connection_id);
                    break;
                }
            }
            debug!("Forwarder for {} in room {} finished", connection_id, document_id);
        })
    }
}

impl Drop for RoomBroadcaster {
    fn drop(&mut self) {
        for room in self.rooms.iter() {
            for forwarder in room.members.values() {
                forwarder.abort();
            }
        }
    }
}
