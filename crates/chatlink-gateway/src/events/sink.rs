//! Application event sink

use super::DispatchEvent;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

/// What a shard reports to the application
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// A connection's socket is up; the handshake may still be in flight
    Connected,
    /// A connection's reader stopped
    Disconnected,
    Dispatch(DispatchEvent),
}

#[derive(Debug, Clone)]
pub struct ShardEvent {
    pub shard_id: u32,
    pub event: GatewayEvent,
}

/// Receives every decoded event of the shards it is attached to
///
/// Called from the reader task, so a slow sink applies backpressure to the socket.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn deliver(&self, event: ShardEvent);
}

#[async_trait]
impl EventSink for mpsc::Sender<ShardEvent> {
    async fn deliver(&self, event: ShardEvent) {
        if self.send(event).await.is_err() {
            warn!("Event receiver dropped, discarding event");
        }
    }
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn deliver(&self, _event: ShardEvent) {}
}
