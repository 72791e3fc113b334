//! The route table.
//!
//! Reads vastly outnumber writes: lookups hit a sharded concurrent map
//! directly, writers serialize on a mutex, and change events are broadcast
//! to observers only after the write-critical section ends. Removing a
//! route never touches connections already spliced to its backend.

use std::collections::BTreeMap;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

use super::normalize::normalize;

/// A published route: backend address plus an optional waker binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Backend `host:port`.
    pub backend: String,
    /// Opaque token identifying the waker that can start this backend.
    pub waker_id: Option<String>,
    /// Per-route PROXY protocol override; `None` uses the service default.
    pub proxy_protocol: Option<bool>,
}

impl Route {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            waker_id: None,
            proxy_protocol: None,
        }
    }

    pub fn with_waker(backend: impl Into<String>, waker_id: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            waker_id: Some(waker_id.into()),
            proxy_protocol: None,
        }
    }
}

/// A successful lookup.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub backend: String,
    pub waker_id: Option<String>,
    /// Per-route PROXY protocol override.
    pub proxy_protocol: Option<bool>,
    /// The normalized key that matched; `None` for the default slot.
    pub matched_key: Option<String>,
}

/// Change notifications delivered to observers.
#[derive(Debug, Clone)]
pub enum RouteEvent {
    Set { hostname: String, route: Route },
    Deleted { hostname: String, route: Route },
    DefaultSet { route: Route },
    DefaultCleared,
}

/// Lookup capability. The connection handler needs nothing more.
pub trait RouteFinder: Send + Sync {
    fn lookup(&self, raw_hostname: &str) -> Option<RouteMatch>;

    /// Canonicalize a hostname the way lookups do, for labeling and
    /// diagnostics.
    fn normalize_key(&self, raw_hostname: &str) -> String;
}

/// Mutation capability, for the management API and route publishers.
pub trait RouteStore: Send + Sync {
    fn set(&self, hostname: &str, route: Route) -> String;
    fn delete(&self, hostname: &str) -> bool;
    fn set_default(&self, route: Route);
    fn clear_default(&self);
    fn snapshot(&self) -> RouteSnapshot;
}

/// Consistent immutable view of the table.
#[derive(Debug, Clone)]
pub struct RouteSnapshot {
    pub routes: BTreeMap<String, Route>,
    pub default_route: Option<Route>,
}

pub struct RouteTable {
    routes: DashMap<String, Route>,
    default_route: RwLock<Option<Route>>,
    /// Serializes writers (and snapshots) with each other. Lookups never
    /// take it.
    writer: Mutex<()>,
    events: broadcast::Sender<RouteEvent>,
    simplify_srv: bool,
}

impl RouteTable {
    pub fn new(simplify_srv: bool) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            routes: DashMap::new(),
            default_route: RwLock::new(None),
            writer: Mutex::new(()),
            events,
            simplify_srv,
        }
    }

    /// Subscribe to change events. Slow observers miss events rather than
    /// stalling writers.
    pub fn subscribe(&self) -> broadcast::Receiver<RouteEvent> {
        self.events.subscribe()
    }

    /// Normalize a hostname with this table's settings.
    pub fn normalize_key(&self, raw_hostname: &str) -> String {
        normalize(raw_hostname, self.simplify_srv)
    }

    fn emit(&self, event: RouteEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    /// Apply a batch of removals and upserts under one writer critical
    /// section, so concurrent lookups observe either the old or the new
    /// slice, never a partial mix. Keys must already be normalized.
    /// Events are emitted after the critical section ends.
    pub fn apply_batch(&self, remove: Vec<String>, set: Vec<(String, Route)>) {
        let mut events = Vec::with_capacity(remove.len() + set.len());
        {
            let _guard = self.writer.lock();
            for key in remove {
                if let Some((_, route)) = self.routes.remove(&key) {
                    events.push(RouteEvent::Deleted {
                        hostname: key,
                        route,
                    });
                }
            }
            for (key, route) in set {
                self.routes.insert(key.clone(), route.clone());
                events.push(RouteEvent::Set {
                    hostname: key,
                    route,
                });
            }
        }
        for event in events {
            self.emit(event);
        }
    }
}

impl RouteFinder for RouteTable {
    fn normalize_key(&self, raw_hostname: &str) -> String {
        RouteTable::normalize_key(self, raw_hostname)
    }

    fn lookup(&self, raw_hostname: &str) -> Option<RouteMatch> {
        let key = RouteTable::normalize_key(self, raw_hostname);

        if let Some(route) = self.routes.get(&key) {
            return Some(RouteMatch {
                backend: route.backend.clone(),
                waker_id: route.waker_id.clone(),
                proxy_protocol: route.proxy_protocol,
                matched_key: Some(key),
            });
        }

        self.default_route.read().as_ref().map(|route| RouteMatch {
            backend: route.backend.clone(),
            waker_id: route.waker_id.clone(),
            proxy_protocol: route.proxy_protocol,
            matched_key: None,
        })
    }
}

impl RouteStore for RouteTable {
    /// Upsert a route. Returns the normalized key it was stored under.
    fn set(&self, hostname: &str, route: Route) -> String {
        let key = self.normalize_key(hostname);
        {
            let _guard = self.writer.lock();
            self.routes.insert(key.clone(), route.clone());
        }
        debug!(hostname = %key, backend = %route.backend, "route set");
        self.emit(RouteEvent::Set {
            hostname: key.clone(),
            route,
        });
        key
    }

    fn delete(&self, hostname: &str) -> bool {
        let key = self.normalize_key(hostname);
        let removed = {
            let _guard = self.writer.lock();
            self.routes.remove(&key)
        };
        match removed {
            Some((_, route)) => {
                debug!(hostname = %key, backend = %route.backend, "route deleted");
                self.emit(RouteEvent::Deleted {
                    hostname: key,
                    route,
                });
                true
            }
            None => false,
        }
    }

    fn set_default(&self, route: Route) {
        {
            let _guard = self.writer.lock();
            *self.default_route.write() = Some(route.clone());
        }
        debug!(backend = %route.backend, "default route set");
        self.emit(RouteEvent::DefaultSet { route });
    }

    fn clear_default(&self) {
        let cleared = {
            let _guard = self.writer.lock();
            self.default_route.write().take()
        };
        if cleared.is_some() {
            debug!("default route cleared");
            self.emit(RouteEvent::DefaultCleared);
        }
    }

    fn snapshot(&self) -> RouteSnapshot {
        let _guard = self.writer.lock();
        let routes = self
            .routes
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let default_route = self.default_route.read().clone();
        RouteSnapshot {
            routes,
            default_route,
        }
    }
}
