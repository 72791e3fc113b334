//! Scale-to-zero accounting.
//!
//! Tracks active connections per backend, keyed by waker id (several
//! hostnames may share one backend). When a backend's count reaches zero
//! and auto-down is enabled, a one-shot timer is armed for the idle grace
//! period; its firing invokes the backend's sleeper callback. A connection
//! arriving before the timer fires cancels it atomically with the
//! increment.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::wake::WakerRegistry;

#[derive(Default)]
struct BackendState {
    active: u64,
    /// Bumped on every arm; a fired timer only acts if its generation is
    /// still current.
    generation: u64,
    pending: Option<AbortHandle>,
}

pub struct DownScaler {
    backends: DashMap<String, Arc<Mutex<BackendState>>>,
    wakers: Arc<WakerRegistry>,
    idle_grace: Duration,
    enabled: bool,
    closed: Arc<AtomicBool>,
}

impl DownScaler {
    pub fn new(wakers: Arc<WakerRegistry>, idle_grace: Duration, enabled: bool) -> Self {
        Self {
            backends: DashMap::new(),
            wakers,
            idle_grace,
            enabled,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn state(&self, waker_id: &str) -> Arc<Mutex<BackendState>> {
        Arc::clone(
            self.backends
                .entry(waker_id.to_string())
                .or_default()
                .value(),
        )
    }

    /// Current active-connection count for a backend.
    pub fn active_count(&self, waker_id: &str) -> u64 {
        self.backends
            .get(waker_id)
            .map(|entry| entry.value().lock().active)
            .unwrap_or(0)
    }

    /// A connection to this backend entered splice. Cancels any pending
    /// scale-down atomically with the increment.
    pub fn on_connected(&self, waker_id: &str) {
        let state = self.state(waker_id);
        let mut state = state.lock();
        state.active += 1;
        if let Some(handle) = state.pending.take() {
            handle.abort();
            debug!(waker_id, "scale-down canceled by new connection");
        }
    }

    /// A connection to this backend fully ended. Arms the scale-down timer
    /// when the count returns to zero.
    pub fn on_disconnected(&self, waker_id: &str) {
        let state_arc = self.state(waker_id);
        let mut state = state_arc.lock();
        if state.active == 0 {
            warn!(waker_id, "disconnect without matching connect");
        }
        state.active = state.active.saturating_sub(1);
        if state.active > 0 || !self.enabled || self.closed.load(Ordering::SeqCst) {
            return;
        }

        // Timers need a runtime; a late drop during process teardown
        // simply skips arming.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        if let Some(old) = state.pending.take() {
            old.abort();
        }
        state.generation += 1;
        let generation = state.generation;

        let wakers = Arc::clone(&self.wakers);
        let closed = Arc::clone(&self.closed);
        let state_for_timer = Arc::clone(&state_arc);
        let waker_id = waker_id.to_string();
        let idle_grace = self.idle_grace;
        let task = handle.spawn(async move {
            tokio::time::sleep(idle_grace).await;
            fire_scale_down(wakers, closed, state_for_timer, waker_id, generation).await;
        });
        state.pending = Some(task.abort_handle());
        debug!(generation, "scale-down armed");
    }

    /// The route referencing this backend was removed; the publisher is
    /// authoritative, so any pending timer is dropped.
    pub fn on_route_removed(&self, waker_id: &str) {
        if let Some(entry) = self.backends.get(waker_id) {
            let mut state = entry.value().lock();
            if let Some(handle) = state.pending.take() {
                handle.abort();
                debug!(waker_id, "scale-down canceled by route removal");
            }
        }
    }

    /// Cancel every pending timer without firing. Part of process shutdown.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for entry in self.backends.iter() {
            let mut state = entry.value().lock();
            if let Some(handle) = state.pending.take() {
                handle.abort();
            }
        }
    }
}

async fn fire_scale_down(
    wakers: Arc<WakerRegistry>,
    closed: Arc<AtomicBool>,
    state_arc: Arc<Mutex<BackendState>>,
    waker_id: String,
    generation: u64,
) {
    {
        let mut state = state_arc.lock();
        if state.generation != generation || state.active != 0 || state.pending.is_none() {
            return;
        }
        state.pending = None;
    }

    if closed.load(Ordering::SeqCst) {
        return;
    }

    let Some(waker) = wakers.get(&waker_id) else {
        warn!(waker_id, "scale-down fired but waker is gone");
        return;
    };
    info!(waker_id, "backend idle, scaling down");
    match waker.sleep().await {
        Ok(()) => metrics::SCALE_DOWNS_TOTAL.inc(),
        Err(e) => warn!(waker_id, error = %e, "sleeper callback failed"),
    }
}
