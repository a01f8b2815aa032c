//! Gateway configuration: the backend set and runtime settings.
//!
//! The backend list arrives as a file snapshot (written by an external
//! controller, or edited by hand) and is re-applied on every change by the
//! config observer. Runtime settings come from the binary's flags and are
//! fixed for the process lifetime.

pub mod watcher;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// A full configuration snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Backend MCP servers federated behind the gateway.
    #[serde(default)]
    pub servers: Vec<BackendConfig>,
    /// Grouping hint used by external tooling; carried but not interpreted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub virtual_servers: Vec<VirtualServer>,
}

impl GatewayConfig {
    /// Load a snapshot from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: GatewayConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }
}

/// One backend MCP server behind the gateway.
///
/// Identity is `(name, tool_prefix, hostname)`; a change to any of those
/// means the backend is replaced, never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Stable identifier.
    pub name: String,
    /// Origin of the backend MCP endpoint.
    pub url: String,
    /// Synthetic authority the proxy uses to route to this backend.
    pub hostname: String,
    /// Prefix prepended to every tool name this backend exposes.
    /// Empty marks the wildcard fallback; at most one enabled backend
    /// may leave it empty.
    #[serde(default)]
    pub tool_prefix: String,
    /// Whether this backend participates in the catalog.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Credential presented to the backend on every request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<Credential>,
}

fn default_enabled() -> bool {
    true
}

impl BackendConfig {
    /// Identity key for replace-vs-keep decisions.
    pub fn identity(&self) -> BackendIdentity {
        BackendIdentity {
            name: self.name.clone(),
            tool_prefix: self.tool_prefix.clone(),
            hostname: self.hostname.clone(),
        }
    }

    /// Parse and validate the backend URL.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the URL is unparseable. This is
    /// fatal for the backend's manager; it is surfaced once at start.
    pub fn parsed_url(&self) -> Result<reqwest::Url> {
        reqwest::Url::parse(&self.url).map_err(|e| {
            Error::Config(format!("backend '{}' has unparseable url '{}': {e}", self.name, self.url))
        })
    }
}

/// Identity key of a backend: any change means "replace", not "mutate".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendIdentity {
    pub name: String,
    pub tool_prefix: String,
    pub hostname: String,
}

impl std::fmt::Display for BackendIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.name, self.tool_prefix, self.hostname)
    }
}

/// Backend credential: a literal bearer value or an environment reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", untagged)]
pub enum Credential {
    /// Literal bearer token.
    Bearer { bearer: String },
    /// Name of an environment variable holding the bearer token.
    EnvVar { env: String },
}

impl Credential {
    /// Resolve to the value of an `Authorization` header.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a referenced environment variable
    /// is unset.
    pub fn authorization_value(&self) -> Result<String> {
        match self {
            Credential::Bearer { bearer } => Ok(format!("Bearer {bearer}")),
            Credential::EnvVar { env } => std::env::var(env)
                .map(|v| format!("Bearer {v}"))
                .map_err(|_| Error::Config(format!("credential env var '{env}' is not set"))),
        }
    }
}

/// Grouping hint for external tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualServer {
    /// Group name.
    pub name: String,
    /// Member backend names.
    #[serde(default)]
    pub servers: Vec<String>,
}

/// Settings for the components talking to backends.
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    /// Reconcile tick interval.
    pub reconcile_interval: Duration,
    /// Per-operation deadline for backend HTTP calls.
    pub request_timeout: Duration,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self { reconcile_interval: Duration::from_secs(300), request_timeout: Duration::from_secs(10) }
    }
}

/// Settings for the client-facing broker listener.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// Address the broker listens on.
    pub listen: SocketAddr,
    /// Hostname clients reach the gateway under.
    pub public_hostname: String,
}

/// Settings for the router sidecar.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// Address the router hook endpoints listen on.
    pub listen: SocketAddr,
    /// URL of the public proxy endpoint; hair-pinned backend initialize
    /// requests are sent back through it so route-level policies apply.
    pub proxy_url: String,
    /// Deadline for a hair-pinned initialize.
    pub init_timeout: Duration,
}
