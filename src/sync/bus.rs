//! Pub/sub bus for fanning room messages across server processes.
//!
//! Every process hosting members of a room subscribes to that room's channel.
//! Envelopes carry the connection to exclude so the author of a change is
//! skipped no matter which process delivers the message.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use super::protocol::ServerMessage;
use super::{ConnectionId, DocumentId, NodeId};

/// A room message on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEnvelope {
    /// Process that published the message
    pub origin_node: NodeId,
    pub document_id: DocumentId,
    /// Connection that must not receive the message
    pub exclude_connection: Option<ConnectionId>,
    pub message: ServerMessage,
}

impl BusEnvelope {
    pub fn new(
        origin_node: impl Into<String>,
        document_id: impl Into<String>,
        exclude_connection: Option<ConnectionId>,
        message: ServerMessage,
    ) -> Self {
        Self {
            origin_node: origin_node.into(),
            document_id: document_id.into(),
            exclude_connection,
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("pub/sub bus unavailable: {0}")]
    Unavailable(String),
}

/// Named-channel fan-out shared by every server process
#[async_trait]
pub trait PubSubBus: Send + Sync {
    /// Publish to a room; returns the number of subscribers reached
    async fn publish(&self, room: &str, envelope: BusEnvelope) -> Result<usize, BusError>;

    /// Subscribe to a room. Dropping the receiver unsubscribes.
    async fn subscribe(&self, room: &str) -> Result<broadcast::Receiver<BusEnvelope>, BusError>;

    /// Release per-room resources left without subscribers; returns how many
    fn prune(&self) -> usize {
        0
    }
}

/// In-process bus backed by one tokio broadcast channel per room
pub struct LocalBus {
    capacity: usize,
    channels: DashMap<String, broadcast::Sender<BusEnvelope>>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            channels: DashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl PubSubBus for LocalBus {
    async fn publish(&self, room: &str, envelope: BusEnvelope) -> Result<usize, BusError> {
        let Some(tx) = self.channels.get(room).map(|tx| tx.clone()) else {
            trace!("No subscribers for room {}", room);
            return Ok(0);
        };
        // a send error only means every receiver is gone
        Ok(tx.send(envelope).unwrap_or(0))
    }

    async fn subscribe(&self, room: &str) -> Result<broadcast::Receiver<BusEnvelope>, BusError> {
        let rx = self
            .channels
            .entry(room.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        Ok(rx)
    }

    fn prune(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, tx| tx.receiver_count() > 0);
        let pruned = before.saturating_sub(self.channels.len());
        if pruned > 0 {
            trace!("Pruned {} idle bus channels", pruned);
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pong(ts: u64) -> ServerMessage {
        ServerMessage::Pong {
            timestamp: ts,
            server_time: 0,
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = LocalBus::default();
        let mut a = bus.subscribe("doc").await.unwrap();
        let mut b = bus.subscribe("doc").await.unwrap();

        let reached = bus
            .publish("doc", BusEnvelope::new("node-1", "doc", None, pong(1)))
            .await
            .unwrap();
        assert_eq!(reached, 2);
        assert_eq!(a.recv().await.unwrap().message, pong(1));
        assert_eq!(b.recv().await.unwrap().origin_node, "node-1");
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let bus = LocalBus::default();
        let mut other = bus.subscribe("other").await.unwrap();

        let reached = bus
            .publish("doc", BusEnvelope::new("node-1", "doc", None, pong(1)))
            .await
            .unwrap();
        assert_eq!(reached, 0);
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_prune_drops_abandoned_channels() {
        let bus = LocalBus::default();
        let rx = bus.subscribe("doc").await.unwrap();
        let _keep = bus.subscribe("busy").await.unwrap();
        drop(rx);

        assert_eq!(bus.prune(), 1);
        assert_eq!(bus.channel_count(), 1);
    }
}
