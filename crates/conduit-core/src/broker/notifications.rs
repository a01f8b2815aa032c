//! Fan-out hub for client-bound notifications.
//!
//! Upstream managers push every `list_changed` notification they receive
//! here; every client holding the broker's GET stream gets a copy.

use crate::protocol::JsonRpcNotification;
use crate::upstream::NotificationSink;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Broadcast hub connecting upstream managers to client streams.
pub struct NotificationHub {
    tx: broadcast::Sender<JsonRpcNotification>,
}

impl NotificationHub {
    /// Create a hub buffering up to `capacity` notifications per client.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe a client stream.
    pub fn subscribe(&self) -> broadcast::Receiver<JsonRpcNotification> {
        self.tx.subscribe()
    }

    /// Number of currently connected client streams.
    pub fn connected_clients(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl NotificationSink for NotificationHub {
    async fn relay(&self, notification: JsonRpcNotification) {
        // With no connected clients the send fails; that is not an error,
        // there is simply nobody to tell.
        let receivers = self.tx.send(notification.clone()).unwrap_or(0);
        tracing::debug!(method = %notification.method, receivers, "Relayed backend notification");
    }
}
