//! Backend connections and their lifecycle controllers.
//!
//! One [`UpstreamClient`] owns the persistent connection to one backend
//! MCP server; one [`UpstreamManager`] drives that client through its
//! lifecycle (initialize, periodic validation, tool reconciliation,
//! teardown) and keeps the tool registry in sync.

pub mod client;
pub mod manager;
pub mod status;

use crate::protocol::JsonRpcNotification;
use async_trait::async_trait;

pub use client::{UpstreamClient, UpstreamEvent};
pub use manager::UpstreamManager;
pub use status::ValidationStatus;

/// Callback surface a manager uses to hand client-bound notifications to
/// the broker, which fans them out to every connected client.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Relay one backend notification to all connected clients.
    async fn relay(&self, notification: JsonRpcNotification);
}
