//! Per-backend lifecycle controller.
//!
//! Exactly one manager runs per enabled backend. It owns the backend's
//! connection, its slice of the tool registry, and its validation status.
//! A periodic tick (and any `list_changed` notification) drives
//! reconciliation; transient unreachability withdraws the backend's tools
//! from the catalog but keeps the manager alive for recovery.

use crate::config::{BackendConfig, BackendIdentity, UpstreamSettings};
use crate::error::{Error, Result};
use crate::protocol::JsonRpcNotification;
use crate::registry::{BackendRoute, ToolRecord, ToolRegistry};
use crate::upstream::client::{UpstreamClient, UpstreamEvent};
use crate::upstream::status::ValidationStatus;
use crate::upstream::NotificationSink;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Mutable manager state. The lock is held only for in-memory mutation,
/// never across I/O or registry calls.
struct ManagerState {
    /// Records currently published to the registry for this backend.
    published: Vec<ToolRecord>,
    /// Most recent validation record.
    status: ValidationStatus,
}

/// Lifecycle controller for one backend.
pub struct UpstreamManager {
    config: BackendConfig,
    registry: Arc<ToolRegistry>,
    sink: Arc<dyn NotificationSink>,
    settings: UpstreamSettings,
    /// Connection handle; `None` means absent, the next reconcile connects.
    client: Mutex<Option<UpstreamClient>>,
    state: Mutex<ManagerState>,
    cancel: CancellationToken,
    stopped: AtomicBool,
    events_tx: mpsc::Sender<UpstreamEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<UpstreamEvent>>>,
    run_handle: Mutex<Option<JoinHandle<()>>>,
    stream_handle: Mutex<Option<JoinHandle<()>>>,
}

impl UpstreamManager {
    /// Create a manager for the backend.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the backend URL is unparseable;
    /// this is fatal and the manager never starts.
    pub fn new(
        config: BackendConfig,
        registry: Arc<ToolRegistry>,
        sink: Arc<dyn NotificationSink>,
        settings: UpstreamSettings,
    ) -> Result<Self> {
        config.parsed_url()?;
        let (events_tx, events_rx) = mpsc::channel(8);
        let status = ValidationStatus::new(&config.name);
        Ok(Self {
            config,
            registry,
            sink,
            settings,
            client: Mutex::new(None),
            state: Mutex::new(ManagerState { published: Vec::new(), status }),
            cancel: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            run_handle: Mutex::new(None),
            stream_handle: Mutex::new(None),
        })
    }

    /// The backend configuration this manager was built from.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// The backend's identity key.
    pub fn identity(&self) -> BackendIdentity {
        self.config.identity()
    }

    /// Current validation record.
    pub async fn status(&self) -> ValidationStatus {
        self.state.lock().await.status.clone()
    }

    /// Start the control loop: register the backend's route, then run an
    /// immediate reconcile followed by the periodic tick.
    ///
    /// # Errors
    ///
    /// Returns an error if the manager was already started or stopped.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::Config(format!("manager for '{}' is stopped", self.config.name)));
        }
        let Some(events) = self.events_rx.lock().await.take() else {
            return Err(Error::Config(format!("manager for '{}' already started", self.config.name)));
        };

        self.registry
            .register_backend(BackendRoute {
                backend: self.config.name.clone(),
                tool_prefix: self.config.tool_prefix.clone(),
                hostname: self.config.hostname.clone(),
            })
            .await;

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move { manager.run_loop(events).await });
        *self.run_handle.lock().await = Some(handle);

        tracing::info!(
            backend = %self.config.name,
            prefix = %self.config.tool_prefix,
            hostname = %self.config.hostname,
            "Upstream manager started"
        );
        Ok(())
    }

    /// Stop the manager: withdraw tools, disconnect, and join the control
    /// loop. Idempotent; repeated calls return immediately.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();
        self.withdraw_tools().await;
        self.registry.deregister_backend(&self.config.name).await;

        if let Some(mut client) = self.client.lock().await.take() {
            client.disconnect().await;
        }
        if let Some(handle) = self.stream_handle.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.run_handle.lock().await.take() {
            let _ = handle.await;
        }

        tracing::info!(backend = %self.config.name, "Upstream manager stopped");
    }

    async fn run_loop(self: Arc<Self>, mut events: mpsc::Receiver<UpstreamEvent>) {
        let mut ticker = tokio::time::interval(self.settings.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.reconcile().await;
                }
                event = events.recv() => match event {
                    Some(UpstreamEvent::ListChanged { method }) => {
                        tracing::debug!(backend = %self.config.name, %method, "Backend list changed");
                        self.sink.relay(JsonRpcNotification::new(&method)).await;
                        self.refresh_tools().await;
                    }
                    Some(UpstreamEvent::ConnectionLost) => {
                        // Keep tools: transient loss recovers on the next
                        // tick without churning the catalog.
                        tracing::warn!(backend = %self.config.name, "Backend connection lost");
                        *self.client.lock().await = None;
                    }
                    None => break,
                }
            }
        }
    }

    /// One validation + publication pass.
    pub async fn reconcile(&self) {
        if !self.validate().await {
            self.withdraw_tools().await;
            return;
        }
        let needs_fetch = self.state.lock().await.published.is_empty();
        if needs_fetch {
            self.refresh_tools().await;
        }
    }

    /// Validate the backend: connect if the connection is absent, always
    /// ping, then check the initialize result. Returns whether the
    /// backend is reachable and protocol-valid.
    async fn validate(&self) -> bool {
        let mut guard = self.client.lock().await;

        if guard.is_none() {
            let mut client = match UpstreamClient::new(&self.config, self.settings.request_timeout) {
                Ok(client) => client,
                Err(e) => {
                    drop(guard);
                    self.record_unreachable(e.to_string()).await;
                    return false;
                }
            };
            match client.connect().await {
                Ok(_) => {
                    let stream =
                        client.subscribe(self.events_tx.clone(), self.cancel.child_token());
                    *guard = Some(client);
                    drop(guard);
                    if let Some(old) = self.stream_handle.lock().await.replace(stream) {
                        old.abort();
                    }
                    guard = self.client.lock().await;
                }
                Err(e) => {
                    drop(guard);
                    tracing::warn!(backend = %self.config.name, error = %e, "Backend connect failed");
                    self.record_unreachable(e.to_string()).await;
                    return false;
                }
            }
        }

        let Some(client) = guard.as_ref() else { return false };
        let ping = client.ping().await;
        let init = client.init_result().cloned();

        if let Err(e) = ping {
            if matches!(e, Error::SessionGone { .. }) {
                // The backend dropped our session: discard the connection
                // so the next pass re-initializes.
                *guard = None;
            }
            drop(guard);
            tracing::warn!(backend = %self.config.name, error = %e, "Backend ping failed");
            self.record_unreachable(e.to_string()).await;
            return false;
        }
        drop(guard);

        let Some(init) = init else { return false };
        let protocol_valid = init.protocol_accepted();
        let has_tools = init.has_tools_capability();

        let valid = protocol_valid && has_tools;
        let error = if protocol_valid && !has_tools {
            Some("backend does not advertise the tools capability".to_string())
        } else if !protocol_valid {
            Some(format!("unsupported protocol version '{}'", init.protocol_version))
        } else {
            None
        };

        {
            let mut state = self.state.lock().await;
            state.status.reachable = true;
            state.status.protocol_valid = protocol_valid;
            state.status.has_tools_capability = has_tools;
            state.status.last_error = error;
            state.status.checked_at = Some(Utc::now());
        }
        valid
    }

    /// Fetch the backend's tool list and publish the diff.
    async fn refresh_tools(&self) {
        let fetched = {
            let guard = self.client.lock().await;
            let Some(client) = guard.as_ref() else { return };
            client.list_tools().await
        };

        match fetched {
            Ok(tools) => {
                let records = tools
                    .iter()
                    .map(|d| ToolRecord::from_descriptor(d, &self.config.name, &self.config.tool_prefix))
                    .collect();
                self.publish(records).await;
            }
            Err(e) => {
                if matches!(e, Error::SessionGone { .. }) {
                    *self.client.lock().await = None;
                }
                tracing::warn!(backend = %self.config.name, error = %e, "Failed to list backend tools");
                let mut state = self.state.lock().await;
                state.status.last_error = Some(e.to_string());
            }
        }
    }

    /// Diff the fresh tool set against the published one and apply the
    /// difference to the registry. The diff is computed under the local
    /// lock; the lock is released before any registry call.
    async fn publish(&self, records: Vec<ToolRecord>) {
        let (added, removed) = {
            let state = self.state.lock().await;
            let previous: HashMap<&str, &ToolRecord> =
                state.published.iter().map(|r| (r.prefixed_name.as_str(), r)).collect();
            let fresh: HashSet<&str> = records.iter().map(|r| r.prefixed_name.as_str()).collect();

            // Changed records count as added: a same-backend re-add
            // replaces the entry in place.
            let added: Vec<ToolRecord> = records
                .iter()
                .filter(|r| previous.get(r.prefixed_name.as_str()) != Some(r))
                .cloned()
                .collect();
            let removed: Vec<String> = state
                .published
                .iter()
                .filter(|r| !fresh.contains(r.prefixed_name.as_str()))
                .map(|r| r.prefixed_name.clone())
                .collect();
            (added, removed)
        };

        if added.is_empty() && removed.is_empty() {
            return;
        }

        self.registry.remove(&removed).await;
        match self.registry.add(added).await {
            Ok(()) => {
                tracing::info!(
                    backend = %self.config.name,
                    tools = records.len(),
                    removed = removed.len(),
                    "Published backend tools"
                );
                let mut state = self.state.lock().await;
                state.status.tool_count = records.len();
                state.published = records;
            }
            Err(e) => {
                // Conflicting names never enter the catalog; the conflict
                // is recorded and shows up in /status.
                tracing::error!(backend = %self.config.name, error = %e, "Tool registration conflict");
                let mut state = self.state.lock().await;
                state.published.retain(|r| !removed.contains(&r.prefixed_name));
                state.status.tool_count = state.published.len();
                state.status.last_error = Some(e.to_string());
            }
        }
    }

    /// Remove everything this backend published from the registry.
    async fn withdraw_tools(&self) {
        let names: Vec<String> = {
            let mut state = self.state.lock().await;
            state.status.tool_count = 0;
            state.published.drain(..).map(|r| r.prefixed_name).collect()
        };
        if !names.is_empty() {
            self.registry.remove(&names).await;
            tracing::info!(
                backend = %self.config.name,
                tools = names.len(),
                "Withdrew backend tools from the catalog"
            );
        }
    }

    async fn record_unreachable(&self, error: String) {
        let mut state = self.state.lock().await;
        state.status.reachable = false;
        state.status.last_error = Some(error);
        state.status.checked_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    struct NullSink;

    #[async_trait]
    impl NotificationSink for NullSink {
        async fn relay(&self, _notification: JsonRpcNotification) {}
    }

    fn backend(url: &str) -> BackendConfig {
        BackendConfig {
            name: "weather".to_string(),
            url: url.to_string(),
            hostname: "w.mcp.local".to_string(),
            tool_prefix: "w_".to_string(),
            enabled: true,
            credential: None,
        }
    }

    fn settings() -> UpstreamSettings {
        UpstreamSettings {
            reconcile_interval: Duration::from_secs(3600),
            request_timeout: Duration::from_secs(1),
        }
    }

    fn manager(url: &str) -> Arc<UpstreamManager> {
        Arc::new(
            UpstreamManager::new(
                backend(url),
                Arc::new(ToolRegistry::new()),
                Arc::new(NullSink),
                settings(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_new_rejects_unparseable_url() {
        let result = UpstreamManager::new(
            backend("no scheme here"),
            Arc::new(ToolRegistry::new()),
            Arc::new(NullSink),
            settings(),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_start_registers_route() {
        let registry = Arc::new(ToolRegistry::new());
        let manager = Arc::new(
            UpstreamManager::new(
                backend("http://127.0.0.1:1/mcp"),
                Arc::clone(&registry),
                Arc::new(NullSink),
                settings(),
            )
            .unwrap(),
        );

        manager.start().await.unwrap();
        let route = registry.backend_route("weather").await.unwrap();
        assert_eq!(route.tool_prefix, "w_");
        assert_eq!(route.hostname, "w.mcp.local");

        manager.stop().await;
        assert!(registry.backend_route("weather").await.is_none());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let manager = manager("http://127.0.0.1:1/mcp");
        manager.start().await.unwrap();
        assert!(manager.start().await.is_err());
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_recorded_not_fatal() {
        let manager = manager("http://127.0.0.1:1/mcp");
        manager.reconcile().await;

        let status = manager.status().await;
        assert!(!status.reachable);
        assert!(status.last_error.is_some());
        assert!(status.checked_at.is_some());
        assert_eq!(status.tool_count, 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let manager = manager("http://127.0.0.1:1/mcp");
        manager.start().await.unwrap();
        manager.stop().await;
        manager.stop().await;
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_start_after_stop_fails() {
        let manager = manager("http://127.0.0.1:1/mcp");
        manager.start().await.unwrap();
        manager.stop().await;
        assert!(manager.start().await.is_err());
    }

    #[tokio::test]
    async fn test_publish_diffs_against_published_slice() {
        let registry = Arc::new(ToolRegistry::new());
        let manager = Arc::new(
            UpstreamManager::new(
                backend("http://127.0.0.1:1/mcp"),
                Arc::clone(&registry),
                Arc::new(NullSink),
                settings(),
            )
            .unwrap(),
        );

        let record = |name: &str| ToolRecord {
            original_name: name.to_string(),
            prefixed_name: format!("w_{name}"),
            description: None,
            input_schema: None,
            backend: "weather".to_string(),
        };

        manager.publish(vec![record("fetch"), record("list")]).await;
        assert!(registry.lookup("w_fetch").await.is_some());
        assert!(registry.lookup("w_list").await.is_some());
        assert_eq!(manager.status().await.tool_count, 2);

        // list disappears, create appears.
        manager.publish(vec![record("fetch"), record("create")]).await;
        assert!(registry.lookup("w_fetch").await.is_some());
        assert!(registry.lookup("w_list").await.is_none());
        assert!(registry.lookup("w_create").await.is_some());
        assert_eq!(manager.status().await.tool_count, 2);
    }

    #[tokio::test]
    async fn test_publish_conflict_marks_status() {
        let registry = Arc::new(ToolRegistry::new());
        registry
            .add(vec![ToolRecord {
                original_name: "fetch".to_string(),
                prefixed_name: "w_fetch".to_string(),
                description: None,
                input_schema: None,
                backend: "rival".to_string(),
            }])
            .await
            .unwrap();

        let manager = Arc::new(
            UpstreamManager::new(
                backend("http://127.0.0.1:1/mcp"),
                Arc::clone(&registry),
                Arc::new(NullSink),
                settings(),
            )
            .unwrap(),
        );

        let record = ToolRecord {
            original_name: "fetch".to_string(),
            prefixed_name: "w_fetch".to_string(),
            description: None,
            input_schema: None,
            backend: "weather".to_string(),
        };
        manager.publish(vec![record]).await;

        let status = manager.status().await;
        assert_eq!(status.tool_count, 0);
        assert!(status.last_error.as_deref().unwrap_or_default().contains("w_fetch"));
        // The rival's registration is untouched.
        assert_eq!(registry.lookup("w_fetch").await.unwrap().backend, "rival");
    }

    #[tokio::test]
    async fn test_withdraw_tools_clears_slice() {
        let registry = Arc::new(ToolRegistry::new());
        let manager = Arc::new(
            UpstreamManager::new(
                backend("http://127.0.0.1:1/mcp"),
                Arc::clone(&registry),
                Arc::new(NullSink),
                settings(),
            )
            .unwrap(),
        );

        manager
            .publish(vec![ToolRecord {
                original_name: "fetch".to_string(),
                prefixed_name: "w_fetch".to_string(),
                description: None,
                input_schema: None,
                backend: "weather".to_string(),
            }])
            .await;
        assert_eq!(registry.list_all().await.len(), 1);

        manager.withdraw_tools().await;
        assert!(registry.list_all().await.is_empty());
        assert_eq!(manager.status().await.tool_count, 0);

        // Idempotent.
        manager.withdraw_tools().await;
    }
}
