//! Config observer: reconciles snapshots against live upstream managers.
//!
//! Every snapshot is diffed against the running set by backend identity.
//! Replaced or removed backends are stopped before any new manager is
//! started, so tool deregistration strictly precedes a successor claiming
//! the same prefix namespace. Applying the same snapshot twice changes
//! nothing.

use crate::config::{BackendConfig, BackendIdentity, GatewayConfig, UpstreamSettings};
use crate::registry::ToolRegistry;
use crate::upstream::{NotificationSink, UpstreamManager, ValidationStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

struct ObserverInner {
    managers: HashMap<BackendIdentity, Arc<UpstreamManager>>,
    /// Backends excluded from the last snapshot, with the reason.
    conflicts: Vec<ValidationStatus>,
}

/// Applies configuration snapshots to the set of upstream managers.
pub struct ConfigObserver {
    registry: Arc<ToolRegistry>,
    sink: Arc<dyn NotificationSink>,
    settings: UpstreamSettings,
    /// Guards the manager set and serializes applies.
    inner: Mutex<ObserverInner>,
}

impl ConfigObserver {
    /// Create an observer with no managed backends.
    pub fn new(
        registry: Arc<ToolRegistry>,
        sink: Arc<dyn NotificationSink>,
        settings: UpstreamSettings,
    ) -> Self {
        Self {
            registry,
            sink,
            settings,
            inner: Mutex::new(ObserverInner { managers: HashMap::new(), conflicts: Vec::new() }),
        }
    }

    /// Apply one snapshot. Serialized: concurrent calls queue.
    pub async fn apply(&self, snapshot: GatewayConfig) {
        let mut inner = self.inner.lock().await;
        let (desired, conflicts) = partition(snapshot);

        // Stop managers whose backend disappeared or changed in any way.
        // A changed field with the same identity still means replace.
        let mut to_stop = Vec::new();
        inner.managers.retain(|identity, manager| {
            let keep = desired.get(identity).is_some_and(|config| config == manager.config());
            if !keep {
                to_stop.push(Arc::clone(manager));
            }
            keep
        });
        for manager in to_stop {
            manager.stop().await;
        }

        // Start managers for new or replaced backends. A backend that
        // fails to start is isolated: the others proceed.
        let mut conflicts = conflicts;
        for (identity, config) in desired {
            if inner.managers.contains_key(&identity) {
                continue;
            }
            let manager = match UpstreamManager::new(
                config,
                Arc::clone(&self.registry),
                Arc::clone(&self.sink),
                self.settings.clone(),
            ) {
                Ok(manager) => Arc::new(manager),
                Err(e) => {
                    tracing::error!(backend = %identity.name, error = %e, "Backend rejected at config apply");
                    conflicts.push(ValidationStatus::config_error(&identity.name, &e.to_string()));
                    continue;
                }
            };
            if let Err(e) = manager.start().await {
                tracing::error!(backend = %identity.name, error = %e, "Backend manager failed to start");
                conflicts.push(ValidationStatus::config_error(&identity.name, &e.to_string()));
                continue;
            }
            inner.managers.insert(identity, manager);
        }

        inner.conflicts = conflicts;
    }

    /// Consume snapshots from `rx` until cancellation.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<GatewayConfig>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                snapshot = rx.recv() => match snapshot {
                    Some(snapshot) => self.apply(snapshot).await,
                    None => break,
                }
            }
        }
    }

    /// Aggregated validation records: every live manager plus every
    /// backend excluded by the last snapshot.
    pub async fn status(&self) -> Vec<ValidationStatus> {
        let inner = self.inner.lock().await;
        let mut records = inner.conflicts.clone();
        for manager in inner.managers.values() {
            records.push(manager.status().await);
        }
        records.sort_by(|a, b| a.backend.cmp(&b.backend));
        records
    }

    /// Number of live managers.
    pub async fn managed_count(&self) -> usize {
        self.inner.lock().await.managers.len()
    }

    /// Stop every manager. Used at process shutdown.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        for (_, manager) in inner.managers.drain() {
            manager.stop().await;
        }
    }

    #[cfg(test)]
    pub(crate) async fn manager(&self, identity: &BackendIdentity) -> Option<Arc<UpstreamManager>> {
        self.inner.lock().await.managers.get(identity).cloned()
    }
}

/// Split a snapshot into the backends to run and the excluded ones.
///
/// Exclusion reasons: disabled (silently dropped), duplicate name,
/// duplicate identity, or a second enabled backend claiming the empty
/// wildcard prefix (the first one in file order keeps it).
fn partition(
    snapshot: GatewayConfig,
) -> (HashMap<BackendIdentity, BackendConfig>, Vec<ValidationStatus>) {
    let mut desired: HashMap<BackendIdentity, BackendConfig> = HashMap::new();
    let mut conflicts = Vec::new();
    let mut names = std::collections::HashSet::new();
    let mut wildcard: Option<String> = None;

    for server in snapshot.servers {
        if !server.enabled {
            continue;
        }
        if !names.insert(server.name.clone()) {
            tracing::warn!(backend = %server.name, "Duplicate backend name in config");
            conflicts.push(ValidationStatus::config_error(&server.name, "duplicate backend name"));
            continue;
        }
        if server.tool_prefix.is_empty() {
            if let Some(holder) = &wildcard {
                tracing::warn!(
                    backend = %server.name,
                    wildcard = %holder,
                    "Second empty tool prefix rejected"
                );
                conflicts.push(ValidationStatus::config_error(
                    &server.name,
                    &format!("empty tool prefix already claimed by '{holder}'"),
                ));
                continue;
            }
            wildcard = Some(server.name.clone());
        }
        desired.insert(server.identity(), server);
    }

    (desired, conflicts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JsonRpcNotification;
    use async_trait::async_trait;
    use std::time::Duration;

    struct NullSink;

    #[async_trait]
    impl NotificationSink for NullSink {
        async fn relay(&self, _notification: JsonRpcNotification) {}
    }

    fn observer() -> Arc<ConfigObserver> {
        Arc::new(ConfigObserver::new(
            Arc::new(ToolRegistry::new()),
            Arc::new(NullSink),
            UpstreamSettings {
                reconcile_interval: Duration::from_secs(3600),
                request_timeout: Duration::from_secs(1),
            },
        ))
    }

    fn backend(name: &str, prefix: &str) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            url: "http://127.0.0.1:1/mcp".to_string(),
            hostname: format!("{name}.mcp.local"),
            tool_prefix: prefix.to_string(),
            enabled: true,
            credential: None,
        }
    }

    fn snapshot(servers: Vec<BackendConfig>) -> GatewayConfig {
        GatewayConfig { servers, virtual_servers: Vec::new() }
    }

    #[tokio::test]
    async fn test_apply_spawns_managers_for_enabled_backends() {
        let observer = observer();
        let mut disabled = backend("calendar", "c_");
        disabled.enabled = false;

        observer.apply(snapshot(vec![backend("weather", "w_"), disabled])).await;
        assert_eq!(observer.managed_count().await, 1);
        assert!(observer.manager(&backend("weather", "w_").identity()).await.is_some());

        observer.shutdown().await;
        assert_eq!(observer.managed_count().await, 0);
    }

    #[tokio::test]
    async fn test_apply_twice_causes_no_churn() {
        let observer = observer();
        let config = snapshot(vec![backend("weather", "w_"), backend("calendar", "c_")]);

        observer.apply(config.clone()).await;
        let weather_before = observer.manager(&backend("weather", "w_").identity()).await.unwrap();

        observer.apply(config).await;
        let weather_after = observer.manager(&backend("weather", "w_").identity()).await.unwrap();

        // Same manager instance: nothing was stopped or restarted.
        assert!(Arc::ptr_eq(&weather_before, &weather_after));
        assert_eq!(observer.managed_count().await, 2);

        observer.shutdown().await;
    }

    #[tokio::test]
    async fn test_changed_identity_replaces_manager() {
        let observer = observer();
        observer.apply(snapshot(vec![backend("weather", "w_")])).await;
        let before = observer.manager(&backend("weather", "w_").identity()).await.unwrap();

        observer.apply(snapshot(vec![backend("weather", "wx_")])).await;
        assert!(observer.manager(&backend("weather", "w_").identity()).await.is_none());
        let after = observer.manager(&backend("weather", "wx_").identity()).await.unwrap();
        assert!(!Arc::ptr_eq(&before, &after));

        observer.shutdown().await;
    }

    #[tokio::test]
    async fn test_changed_url_replaces_manager_in_place() {
        let observer = observer();
        observer.apply(snapshot(vec![backend("weather", "w_")])).await;
        let before = observer.manager(&backend("weather", "w_").identity()).await.unwrap();

        let mut moved = backend("weather", "w_");
        moved.url = "http://127.0.0.2:1/mcp".to_string();
        observer.apply(snapshot(vec![moved.clone()])).await;

        let after = observer.manager(&moved.identity()).await.unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.config().url, "http://127.0.0.2:1/mcp");

        observer.shutdown().await;
    }

    #[tokio::test]
    async fn test_removed_backend_is_stopped() {
        let observer = observer();
        observer.apply(snapshot(vec![backend("weather", "w_"), backend("calendar", "c_")])).await;
        assert_eq!(observer.managed_count().await, 2);

        observer.apply(snapshot(vec![backend("calendar", "c_")])).await;
        assert_eq!(observer.managed_count().await, 1);
        assert!(observer.manager(&backend("weather", "w_").identity()).await.is_none());

        observer.shutdown().await;
    }

    #[tokio::test]
    async fn test_second_wildcard_is_rejected_and_reported() {
        let observer = observer();
        observer.apply(snapshot(vec![backend("first", ""), backend("second", "")])).await;

        assert_eq!(observer.managed_count().await, 1);
        assert!(observer.manager(&backend("first", "").identity()).await.is_some());

        let status = observer.status().await;
        let second = status.iter().find(|s| s.backend == "second").unwrap();
        assert!(second.last_error.as_deref().unwrap().contains("first"));

        observer.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_backend_is_isolated() {
        let observer = observer();
        let mut broken = backend("broken", "b_");
        broken.url = "not a url at all".to_string();

        observer.apply(snapshot(vec![backend("weather", "w_"), broken])).await;

        assert_eq!(observer.managed_count().await, 1);
        let status = observer.status().await;
        let broken = status.iter().find(|s| s.backend == "broken").unwrap();
        assert!(broken.last_error.is_some());

        observer.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_name_is_rejected() {
        let observer = observer();
        observer.apply(snapshot(vec![backend("weather", "w_"), backend("weather", "x_")])).await;

        assert_eq!(observer.managed_count().await, 1);
        let status = observer.status().await;
        assert!(status.iter().any(|s| s.last_error.as_deref() == Some("duplicate backend name")));

        observer.shutdown().await;
    }
}
