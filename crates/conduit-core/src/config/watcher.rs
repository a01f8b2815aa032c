//! File watcher turning config edits into snapshots.
//!
//! An external controller (or an operator) rewrites the config file; the
//! watcher parses every change and hands the resulting [`GatewayConfig`]
//! snapshot to the config observer. Unparseable edits are logged and
//! dropped so a bad write never takes down the running backend set.

use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Quiet period after a change before the file is re-read, so editors
/// that write in multiple syscalls produce one snapshot.
const DEBOUNCE: Duration = Duration::from_millis(200);

/// Watches one config file and emits parsed snapshots.
pub struct ConfigWatcher {
    path: PathBuf,
}

impl ConfigWatcher {
    /// Create a watcher for the given config file path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Start watching. Snapshots are sent on `tx` until the token is
    /// cancelled or the channel closes.
    ///
    /// # Errors
    ///
    /// Returns an error if the filesystem watch cannot be established.
    pub fn spawn(
        self,
        tx: mpsc::Sender<GatewayConfig>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let path = self.path.canonicalize().unwrap_or(self.path);
        let dir = path
            .parent()
            .map(PathBuf::from)
            .ok_or_else(|| Error::Config(format!("config path '{}' has no parent", path.display())))?;

        let (event_tx, mut event_rx) = mpsc::channel::<notify::Result<Event>>(16);
        let mut watcher = notify::recommended_watcher(move |res| {
            // Runs on the notify thread; dropped events are fine, the
            // file is re-read on the next one.
            let _ = event_tx.blocking_send(res);
        })
        .map_err(|e| Error::Config(format!("failed to create file watcher: {e}")))?;

        // Watch the directory, not the file: editors and controllers
        // typically replace the file, which unbinds a file-level watch.
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Config(format!("failed to watch '{}': {e}", dir.display())))?;

        let handle = tokio::spawn(async move {
            let _watcher = watcher;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = event_rx.recv() => {
                        let Some(event) = event else { break };
                        match event {
                            Ok(event) if touches(&event, &path) => {
                                tokio::time::sleep(DEBOUNCE).await;
                                while event_rx.try_recv().is_ok() {}
                                match GatewayConfig::from_file(&path) {
                                    Ok(snapshot) => {
                                        tracing::info!(
                                            path = %path.display(),
                                            servers = snapshot.servers.len(),
                                            "Config file changed, applying snapshot"
                                        );
                                        if tx.send(snapshot).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        tracing::warn!(
                                            path = %path.display(),
                                            error = %e,
                                            "Ignoring unreadable config snapshot"
                                        );
                                    }
                                }
                            }
                            Ok(_) => {}
                            Err(e) => {
                                tracing::warn!(error = %e, "File watcher error");
                            }
                        }
                    }
                }
            }
            tracing::debug!("Config watcher stopped");
        });

        Ok(handle)
    }
}

/// Whether an event concerns the watched file.
fn touches(event: &Event, path: &std::path::Path) -> bool {
    let relevant = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any | EventKind::Other
    );
    relevant && (event.paths.is_empty() || event.paths.iter().any(|p| p == path))
}
