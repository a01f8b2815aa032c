//! Conduit daemon - the aggregating MCP gateway.
//!
//! Wires the core subsystems together: loads the backend config file,
//! starts the broker listener, the router sidecar, and the config
//! watcher, then runs until a shutdown signal arrives. Everything
//! interesting lives in `conduit-core`; this binary only parses runtime
//! parameters and owns process lifecycle.

use anyhow::{Context, Result, bail};
use clap::Parser;
use conduit_core::broker::{Broker, NotificationHub, TrustedHeaderFilter};
use conduit_core::config::watcher::ConfigWatcher;
use conduit_core::config::{BrokerSettings, GatewayConfig, RouterSettings, UpstreamSettings};
use conduit_core::observer::ConfigObserver;
use conduit_core::registry::ToolRegistry;
use conduit_core::router::Router;
use conduit_core::session::{SessionCache, SessionSigner};
use conduit_core::upstream::NotificationSink;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Conduit - one MCP endpoint in front of many MCP servers.
#[derive(Parser, Debug)]
#[command(
    name = "conduit",
    author,
    version,
    about = "Aggregating gateway for the Model Context Protocol",
    long_about = "Conduit federates a set of backend MCP servers behind a single MCP endpoint.\nClients see one consolidated tool catalog; every tool call is steered to the\nbackend that owns it, with per-backend sessions and credentials handled here."
)]
struct Args {
    /// Address the public MCP listener binds to
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Hostname clients reach the gateway under (session token audience)
    #[arg(long, default_value = "localhost")]
    public_hostname: String,

    /// Address the router hook endpoints bind to
    #[arg(long, default_value = "127.0.0.1:9090")]
    router_listen: SocketAddr,

    /// Proxy endpoint hair-pinned backend initialize requests go through
    #[arg(long, default_value = "http://127.0.0.1:8080/mcp")]
    proxy_url: String,

    /// Gateway session signing secret
    #[arg(long, env = "CONDUIT_SESSION_SECRET", hide_env_values = true)]
    session_secret: String,

    /// Gateway session lifetime in seconds
    #[arg(long, default_value_t = 3600)]
    session_ttl_secs: u64,

    /// Ed25519 public key (PEM) enabling x-allowed-tools filtering
    #[arg(long)]
    trusted_header_key: Option<PathBuf>,

    /// Backend configuration file, re-applied on every change
    #[arg(long, default_value = "conduit.yaml")]
    config: PathBuf,

    /// Seconds between backend reconcile passes
    #[arg(long, default_value_t = 300)]
    reconcile_interval_secs: u64,

    /// Per-operation deadline for backend calls in seconds
    #[arg(long, default_value_t = 10)]
    upstream_timeout_secs: u64,

    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting conduit");

    let registry = Arc::new(ToolRegistry::new());
    let hub = Arc::new(NotificationHub::default());
    let observer = Arc::new(ConfigObserver::new(
        Arc::clone(&registry),
        Arc::clone(&hub) as Arc<dyn NotificationSink>,
        UpstreamSettings {
            reconcile_interval: Duration::from_secs(args.reconcile_interval_secs),
            request_timeout: Duration::from_secs(args.upstream_timeout_secs),
        },
    ));
    let signer = Arc::new(SessionSigner::new(
        args.session_secret.as_bytes(),
        "conduit",
        &args.public_hostname,
        Duration::from_secs(args.session_ttl_secs),
    ));
    let cache = Arc::new(SessionCache::in_memory());

    let trusted_filter = match &args.trusted_header_key {
        Some(path) => {
            let pem = std::fs::read(path)
                .with_context(|| format!("failed to read trusted-header key '{}'", path.display()))?;
            Some(TrustedHeaderFilter::from_ed25519_pem(&pem)?)
        }
        None => None,
    };

    let broker = Arc::new(Broker::new(
        BrokerSettings { listen: args.listen, public_hostname: args.public_hostname.clone() },
        Arc::clone(&signer),
        Arc::clone(&registry),
        Arc::clone(&observer),
        Arc::clone(&cache),
        Arc::clone(&hub),
        trusted_filter,
    ));
    let router = Arc::new(Router::new(
        RouterSettings {
            listen: args.router_listen,
            proxy_url: args.proxy_url.clone(),
            init_timeout: Duration::from_secs(args.upstream_timeout_secs),
        },
        Arc::clone(&registry),
        Arc::clone(&signer),
        Arc::clone(&cache),
    ));

    let cancel = CancellationToken::new();

    // A missing or broken config file is not fatal: the gateway starts
    // with no backends and picks the file up once it becomes readable.
    match GatewayConfig::from_file(&args.config) {
        Ok(snapshot) => observer.apply(snapshot).await,
        Err(e) => {
            tracing::warn!(
                path = %args.config.display(),
                error = %e,
                "Starting without an initial config snapshot"
            );
        }
    }

    let (snapshot_tx, snapshot_rx) = mpsc::channel(4);
    let watcher_handle = ConfigWatcher::new(args.config.clone())
        .spawn(snapshot_tx, cancel.clone())
        .context("failed to watch the config file")?;
    let observer_handle = tokio::spawn(Arc::clone(&observer).run(snapshot_rx, cancel.clone()));

    let broker_handle = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(e) = broker.serve(cancel.clone()).await {
                tracing::error!(error = %e, "Broker failed");
                cancel.cancel();
            }
        }
    });
    let router_handle = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(e) = router.serve(cancel.clone()).await {
                tracing::error!(error = %e, "Router failed");
                cancel.cancel();
            }
        }
    });

    let failed = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for the shutdown signal")?;
            tracing::info!("Shutdown signal received");
            false
        }
        () = cancel.cancelled() => true,
    };

    cancel.cancel();
    let _ = watcher_handle.await;
    let _ = observer_handle.await;
    let _ = broker_handle.await;
    let _ = router_handle.await;
    observer.shutdown().await;

    if failed {
        bail!("a server task failed; see the log for details");
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_session_secret_is_required() {
        let result = Args::try_parse_from(["conduit"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_defaults_parse() {
        let args = Args::try_parse_from(["conduit", "--session-secret", "s3cret"]).unwrap();
        assert_eq!(args.listen.port(), 8080);
        assert_eq!(args.router_listen.port(), 9090);
        assert_eq!(args.reconcile_interval_secs, 300);
        assert_eq!(args.upstream_timeout_secs, 10);
        assert!(args.trusted_header_key.is_none());
    }
}
