//! Aggregated tool catalog and prefix routing.
//!
//! The registry is the single consolidated view of every tool the enabled
//! backends expose, keyed by prefixed name. Managers mutate it (add and
//! remove their backend's slice), the broker reads it for `tools/list`,
//! and the router resolves tool names to backends through it. The lock is
//! internal and never held across I/O by any caller.

use crate::error::{Error, Result};
use crate::protocol::ToolDescriptor;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// One tool in the aggregated catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRecord {
    /// Name as the backend knows it.
    pub original_name: String,
    /// Name as clients see it: `tool_prefix` + `original_name`.
    pub prefixed_name: String,
    /// Tool description.
    pub description: Option<String>,
    /// Tool input schema.
    pub input_schema: Option<Value>,
    /// Name of the owning backend.
    pub backend: String,
}

impl ToolRecord {
    /// Build a record from a wire descriptor and the backend's prefix.
    pub fn from_descriptor(descriptor: &ToolDescriptor, backend: &str, tool_prefix: &str) -> Self {
        Self {
            original_name: descriptor.name.clone(),
            prefixed_name: format!("{tool_prefix}{}", descriptor.name),
            description: descriptor.description.clone(),
            input_schema: descriptor.input_schema.clone(),
            backend: backend.to_string(),
        }
    }

    /// Wire descriptor under the prefixed name.
    pub fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.prefixed_name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }
}

/// Routing coordinates of a registered backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRoute {
    /// Backend name.
    pub backend: String,
    /// Prefix claimed by this backend (may be empty for the wildcard).
    pub tool_prefix: String,
    /// Authority the proxy routes to for this backend.
    pub hostname: String,
}

#[derive(Default)]
struct Inner {
    tools: HashMap<String, ToolRecord>,
    routes: HashMap<String, BackendRoute>,
}

/// Thread-safe aggregated catalog of tools from all managed backends.
#[derive(Default)]
pub struct ToolRegistry {
    inner: RwLock<Inner>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend's routing coordinates. Called when its manager
    /// starts, before any of its tools appear.
    pub async fn register_backend(&self, route: BackendRoute) {
        let mut inner = self.inner.write().await;
        inner.routes.insert(route.backend.clone(), route);
    }

    /// Remove a backend's routing coordinates and any leftover tools.
    pub async fn deregister_backend(&self, backend: &str) {
        let mut inner = self.inner.write().await;
        inner.routes.remove(backend);
        inner.tools.retain(|_, record| record.backend != backend);
    }

    /// Routing coordinates of a backend, if registered.
    pub async fn backend_route(&self, backend: &str) -> Option<BackendRoute> {
        self.inner.read().await.routes.get(backend).cloned()
    }

    /// Snapshot of every registered backend route.
    pub async fn routes(&self) -> Vec<BackendRoute> {
        self.inner.read().await.routes.values().cloned().collect()
    }

    /// Add records to the catalog.
    ///
    /// The add is atomic: if any prefixed name collides with an existing
    /// entry owned by another backend (or repeats within the batch),
    /// nothing is inserted. The catalog never serves an ambiguous entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateTool`] naming the first collision.
    pub async fn add(&self, records: Vec<ToolRecord>) -> Result<()> {
        let mut inner = self.inner.write().await;

        let mut seen = std::collections::HashSet::with_capacity(records.len());
        for record in &records {
            if !seen.insert(record.prefixed_name.clone()) {
                return Err(Error::DuplicateTool(record.prefixed_name.clone()));
            }
            if let Some(existing) = inner.tools.get(&record.prefixed_name) {
                if existing.backend != record.backend {
                    return Err(Error::DuplicateTool(record.prefixed_name.clone()));
                }
            }
        }

        for record in records {
            inner.tools.insert(record.prefixed_name.clone(), record);
        }
        Ok(())
    }

    /// Remove records by prefixed name. Absent names are ignored.
    pub async fn remove(&self, names: &[String]) {
        let mut inner = self.inner.write().await;
        for name in names {
            inner.tools.remove(name);
        }
    }

    /// Snapshot of the whole catalog, ordered by prefixed name.
    pub async fn list_all(&self) -> Vec<ToolRecord> {
        let inner = self.inner.read().await;
        let mut records: Vec<ToolRecord> = inner.tools.values().cloned().collect();
        records.sort_by(|a, b| a.prefixed_name.cmp(&b.prefixed_name));
        records
    }

    /// Look up one record by prefixed name.
    pub async fn lookup(&self, prefixed_name: &str) -> Option<ToolRecord> {
        self.inner.read().await.tools.get(prefixed_name).cloned()
    }

    /// Resolve a client-visible tool name to the backend that owns it.
    ///
    /// Among backends with a non-empty prefix, the longest prefix of the
    /// name wins; a length tie is a configuration error and the name is
    /// unroutable. With no prefixed match, the single empty-prefix
    /// wildcard (if any) takes the call.
    ///
    /// # Errors
    ///
    /// [`Error::AmbiguousPrefix`] on a tie, [`Error::Unroutable`] when no
    /// backend matches.
    pub async fn resolve(&self, tool_name: &str) -> Result<BackendRoute> {
        let inner = self.inner.read().await;

        let mut best: Option<&BackendRoute> = None;
        let mut tie = false;
        for route in inner.routes.values() {
            if route.tool_prefix.is_empty() || !tool_name.starts_with(&route.tool_prefix) {
                continue;
            }
            match best {
                Some(current) if route.tool_prefix.len() == current.tool_prefix.len() => tie = true,
                Some(current) if route.tool_prefix.len() < current.tool_prefix.len() => {}
                _ => {
                    best = Some(route);
                    tie = false;
                }
            }
        }

        if let Some(route) = best {
            if tie {
                return Err(Error::AmbiguousPrefix(tool_name.to_string()));
            }
            return Ok(route.clone());
        }

        inner
            .routes
            .values()
            .find(|route| route.tool_prefix.is_empty())
            .cloned()
            .ok_or_else(|| Error::Unroutable(tool_name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(backend: &str, prefix: &str, name: &str) -> ToolRecord {
        ToolRecord {
            original_name: name.to_string(),
            prefixed_name: format!("{prefix}{name}"),
            description: None,
            input_schema: None,
            backend: backend.to_string(),
        }
    }

    fn route(backend: &str, prefix: &str) -> BackendRoute {
        BackendRoute {
            backend: backend.to_string(),
            tool_prefix: prefix.to_string(),
            hostname: format!("{backend}.mcp.local"),
        }
    }

    #[tokio::test]
    async fn test_add_list_lookup_remove() {
        let registry = ToolRegistry::new();
        registry
            .add(vec![record("weather", "w_", "fetch"), record("calendar", "c_", "list")])
            .await
            .unwrap();

        let all = registry.list_all().await;
        let names: Vec<&str> = all.iter().map(|r| r.prefixed_name.as_str()).collect();
        assert_eq!(names, vec!["c_list", "w_fetch"]);

        let looked = registry.lookup("w_fetch").await.unwrap();
        assert_eq!(looked.original_name, "fetch");
        assert_eq!(looked.backend, "weather");
        assert!(registry.lookup("nope").await.is_none());

        registry.remove(&["w_fetch".to_string()]).await;
        assert!(registry.lookup("w_fetch").await.is_none());
        assert_eq!(registry.list_all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_add_fails_and_inserts_nothing() {
        let registry = ToolRegistry::new();
        registry.add(vec![record("weather", "w_", "fetch")]).await.unwrap();

        let err = registry
            .add(vec![record("forecast", "", "w_fetch"), record("forecast", "", "other")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateTool(name) if name == "w_fetch"));

        // The batch is atomic: the non-conflicting record was not added.
        assert!(registry.lookup("other").await.is_none());
        assert_eq!(registry.lookup("w_fetch").await.unwrap().backend, "weather");
    }

    #[tokio::test]
    async fn test_readd_by_same_backend_replaces() {
        let registry = ToolRegistry::new();
        registry.add(vec![record("weather", "w_", "fetch")]).await.unwrap();

        let mut updated = record("weather", "w_", "fetch");
        updated.description = Some("fresh".to_string());
        registry.add(vec![updated]).await.unwrap();

        assert_eq!(registry.lookup("w_fetch").await.unwrap().description.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_remove_absent_is_noop() {
        let registry = ToolRegistry::new();
        registry.remove(&["ghost".to_string()]).await;
    }

    #[tokio::test]
    async fn test_resolve_longest_prefix_wins() {
        let registry = ToolRegistry::new();
        registry.register_backend(route("weather", "w_")).await;
        registry.register_backend(route("weather-extra", "w_ext_")).await;

        let plain = registry.resolve("w_fetch").await.unwrap();
        assert_eq!(plain.backend, "weather");

        let extra = registry.resolve("w_ext_fetch").await.unwrap();
        assert_eq!(extra.backend, "weather-extra");
    }

    #[tokio::test]
    async fn test_resolve_tie_is_ambiguous() {
        let registry = ToolRegistry::new();
        registry.register_backend(route("one", "x_")).await;
        registry.register_backend(route("two", "x_")).await;

        let err = registry.resolve("x_tool").await.unwrap_err();
        assert!(matches!(err, Error::AmbiguousPrefix(_)));
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_wildcard() {
        let registry = ToolRegistry::new();
        registry.register_backend(route("weather", "w_")).await;
        registry.register_backend(route("catchall", "")).await;

        let matched = registry.resolve("w_fetch").await.unwrap();
        assert_eq!(matched.backend, "weather");

        let fallback = registry.resolve("unprefixed_tool").await.unwrap();
        assert_eq!(fallback.backend, "catchall");
    }

    #[tokio::test]
    async fn test_resolve_unroutable_without_wildcard() {
        let registry = ToolRegistry::new();
        registry.register_backend(route("weather", "w_")).await;

        let err = registry.resolve("c_list").await.unwrap_err();
        assert!(matches!(err, Error::Unroutable(name) if name == "c_list"));
    }

    #[tokio::test]
    async fn test_deregister_backend_drops_routes_and_tools() {
        let registry = ToolRegistry::new();
        registry.register_backend(route("weather", "w_")).await;
        registry.add(vec![record("weather", "w_", "fetch")]).await.unwrap();

        registry.deregister_backend("weather").await;
        assert!(registry.lookup("w_fetch").await.is_none());
        assert!(registry.backend_route("weather").await.is_none());
        assert!(matches!(registry.resolve("w_fetch").await, Err(Error::Unroutable(_))));
    }
}
