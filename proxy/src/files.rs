//! Route config file loading and watching.
//!
//! File format:
//!
//! ```json
//! { "defaultServer": "host:port",
//!   "mappings": { "hostname1": "host:port", "hostname2": "host:port" } }
//! ```
//!
//! The file is polled by mtime; each reload replaces the file-sourced
//! slice of routes in one batch, leaving routes published through the
//! management API untouched.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::routing::{Route, RouteStore, RouteTable};

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RoutesFile {
    pub default_server: Option<String>,
    pub mappings: HashMap<String, String>,
}

pub struct RouteFileLoader {
    path: PathBuf,
    table: Arc<RouteTable>,
    /// hostname → waker id bindings from the service config, applied to
    /// file-sourced routes by normalized key.
    waker_bindings: HashMap<String, String>,
    /// Normalized keys currently owned by the file.
    owned_keys: Mutex<HashSet<String>>,
    owns_default: Mutex<bool>,
    poll_interval: Duration,
    last_modified: Mutex<Option<SystemTime>>,
}

impl RouteFileLoader {
    pub fn new(
        path: PathBuf,
        table: Arc<RouteTable>,
        waker_bindings: &HashMap<String, String>,
        poll_interval: Duration,
    ) -> Self {
        let waker_bindings = waker_bindings
            .iter()
            .map(|(host, waker)| (table.normalize_key(host), waker.clone()))
            .collect();
        Self {
            path,
            table,
            waker_bindings,
            owned_keys: Mutex::new(HashSet::new()),
            owns_default: Mutex::new(false),
            poll_interval,
            last_modified: Mutex::new(None),
        }
    }

    /// Load the file and swap the file-sourced route slice.
    pub async fn load(&self) -> anyhow::Result<()> {
        let raw = tokio::fs::read(&self.path).await?;
        let parsed: RoutesFile = serde_json::from_slice(&raw)?;
        self.apply(parsed);

        if let Ok(meta) = tokio::fs::metadata(&self.path).await {
            *self.last_modified.lock() = meta.modified().ok();
        }
        Ok(())
    }

    fn apply(&self, parsed: RoutesFile) {
        let new_routes: Vec<(String, Route)> = parsed
            .mappings
            .iter()
            .map(|(host, backend)| {
                let key = self.table.normalize_key(host);
                let waker_id = self.waker_bindings.get(&key).cloned();
                (
                    key,
                    Route {
                        backend: backend.clone(),
                        waker_id,
                        proxy_protocol: None,
                    },
                )
            })
            .collect();
        let new_keys: HashSet<String> = new_routes.iter().map(|(k, _)| k.clone()).collect();

        let removed: Vec<String> = {
            let mut owned = self.owned_keys.lock();
            let removed = owned.difference(&new_keys).cloned().collect();
            *owned = new_keys;
            removed
        };

        info!(
            path = %self.path.display(),
            routes = new_routes.len(),
            removed = removed.len(),
            "applying route file"
        );
        self.table.apply_batch(removed, new_routes);

        let mut owns_default = self.owns_default.lock();
        match &parsed.default_server {
            Some(backend) => {
                self.table.set_default(Route::new(backend.clone()));
                *owns_default = true;
            }
            None if *owns_default => {
                self.table.clear_default();
                *owns_default = false;
            }
            None => {}
        }
    }

    /// Poll the file's mtime and reload on change, until shutdown.
    pub async fn run_watch(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = interval.tick() => {}
            }

            let modified = match tokio::fs::metadata(&self.path).await {
                Ok(meta) => meta.modified().ok(),
                Err(e) => {
                    debug!(path = %self.path.display(), error = %e, "route file unreadable");
                    continue;
                }
            };
            let changed = {
                let last = self.last_modified.lock();
                modified.is_some() && *last != modified
            };
            if !changed {
                continue;
            }
            match self.load().await {
                Ok(()) => debug!(path = %self.path.display(), "route file reloaded"),
                Err(e) => warn!(path = %self.path.display(), error = %e, "route file reload failed"),
            }
        }
    }
}
