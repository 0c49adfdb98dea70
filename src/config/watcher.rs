//! Hot reload of the route and cluster configuration.
//!
//! The parent directory is watched rather than the file itself so that
//! editors replacing the file atomically are still seen. Repeated events for
//! unchanged content are dropped; a file that fails to parse or validate
//! never replaces the running configuration.

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::loader::parse_config;
use crate::config::schema::ProxyConfig;

pub struct ConfigWatcher {
    path: PathBuf,
    updates: mpsc::UnboundedSender<ProxyConfig>,
}

impl ConfigWatcher {
    /// Returns the watcher and the receiving end of validated updates.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<ProxyConfig>) {
        let (updates, rx) = mpsc::unbounded_channel();
        let watcher = Self {
            path: path.to_path_buf(),
            updates,
        };
        (watcher, rx)
    }

    /// Start watching. Updates stop once the returned handle is dropped.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let last = Mutex::new(fs::read_to_string(&self.path).ok());
        let path = self.path.clone();
        let updates = self.updates;

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::error!(error = %e, "Config watch error");
                        return;
                    }
                };
                if !touches(&event, &path) {
                    return;
                }
                reload(&path, &last, &updates);
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        tracing::info!(path = %self.path.display(), "Config watcher started");
        Ok(watcher)
    }
}

fn touches(event: &Event, path: &Path) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == path.file_name())
}

fn reload(path: &Path, last: &Mutex<Option<String>>, updates: &mpsc::UnboundedSender<ProxyConfig>) {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Config file unreadable, keeping current configuration"
            );
            return;
        }
    };

    let mut last = last.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    if last.as_deref() == Some(content.as_str()) {
        return;
    }

    match parse_config(&content) {
        Ok(config) => {
            tracing::info!(
                path = %path.display(),
                routes = config.routes.len(),
                clusters = config.clusters.len(),
                "Config reloaded"
            );
            *last = Some(content);
            let _ = updates.send(config);
        }
        Err(e) => {
            tracing::error!(error = %e, "Config reload rejected, keeping current configuration");
        }
    }
}
