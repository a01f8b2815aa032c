//! Lazy per-client/per-backend session map with single-flight init.
//!
//! The router creates backend sessions on the hot path: the first
//! `tools/call` for a `(gateway session, backend)` pair triggers a backend
//! initialize, and a burst of concurrent calls for the same pair must
//! collapse onto one in-flight initialization. Entries never expire on
//! their own; a stale backend session shows up as a 404 upstream, which
//! invalidates it here.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Key of a session-map entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// Backend name.
    pub backend: String,
    /// Gateway session token as presented by the client.
    pub gateway_session: String,
}

impl SessionKey {
    /// Build a key.
    pub fn new(backend: &str, gateway_session: &str) -> Self {
        Self { backend: backend.to_string(), gateway_session: gateway_session.to_string() }
    }
}

/// Backing storage for the session map.
///
/// The default is in-process memory; a shared store (e.g. a remote
/// key-value server) can replace it, in which case single-flight holds
/// per replica rather than globally.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Look up the backend session for a key.
    async fn load(&self, key: &SessionKey) -> Option<String>;

    /// Record the backend session for a key.
    async fn store(&self, key: SessionKey, backend_session: String);

    /// Remove one entry. Removing an absent key is a no-op.
    async fn discard(&self, key: &SessionKey);

    /// Remove every entry belonging to a gateway session.
    async fn discard_gateway_session(&self, gateway_session: &str);
}

/// In-memory session store.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<SessionKey, String>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load(&self, key: &SessionKey) -> Option<String> {
        self.entries.read().await.get(key).cloned()
    }

    async fn store(&self, key: SessionKey, backend_session: String) {
        self.entries.write().await.insert(key, backend_session);
    }

    async fn discard(&self, key: &SessionKey) {
        self.entries.write().await.remove(key);
    }

    async fn discard_gateway_session(&self, gateway_session: &str) {
        self.entries.write().await.retain(|k, _| k.gateway_session != gateway_session);
    }
}

/// Session cache used by the router.
pub struct SessionCache {
    store: Arc<dyn SessionStore>,
    /// Per-key init gates. A caller holds the gate for its key while the
    /// initializer runs; concurrent callers for the same key queue on it
    /// and re-check the store once they acquire it.
    gates: Mutex<HashMap<SessionKey, Arc<Mutex<()>>>>,
}

impl SessionCache {
    /// Create a cache over the in-memory store.
    pub fn in_memory() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    /// Create a cache over an explicit store implementation.
    pub fn with_store(store: Arc<dyn SessionStore>) -> Self {
        Self { store, gates: Mutex::new(HashMap::new()) }
    }

    /// Return the cached backend session for the pair, or run `init` to
    /// create one. At most one initializer runs per key at a time; callers
    /// that queued behind a successful initialization receive its result
    /// without running their own. Initializer errors cache nothing.
    ///
    /// # Errors
    ///
    /// Propagates the initializer's error.
    pub async fn get_or_init<F, Fut>(
        &self,
        backend: &str,
        gateway_session: &str,
        init: F,
    ) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>> + Send,
    {
        let key = SessionKey::new(backend, gateway_session);

        if let Some(existing) = self.store.load(&key).await {
            return Ok(existing);
        }

        let gate = {
            let mut gates = self.gates.lock().await;
            Arc::clone(gates.entry(key.clone()).or_default())
        };
        let _held = gate.lock().await;

        // A queued caller may find the winner's entry here.
        if let Some(existing) = self.store.load(&key).await {
            return Ok(existing);
        }

        let backend_session = init().await?;
        self.store.store(key, backend_session.clone()).await;
        Ok(backend_session)
    }

    /// Remove the entry for the pair. Idempotent.
    pub async fn invalidate(&self, backend: &str, gateway_session: &str) {
        let key = SessionKey::new(backend, gateway_session);
        self.store.discard(&key).await;
        self.gates.lock().await.remove(&key);
    }

    /// Remove every entry (and init gate) belonging to a gateway session.
    /// Called when the client terminates its session at the broker.
    pub async fn invalidate_gateway_session(&self, gateway_session: &str) {
        self.store.discard_gateway_session(gateway_session).await;
        self.gates.lock().await.retain(|k, _| k.gateway_session != gateway_session);
    }
}
