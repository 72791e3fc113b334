//! Connection admission control.
//!
//! Two layers, checked before a single byte is read from the client: a
//! per-IP token bucket and a global semaphore capping live handlers. The
//! keyed limiter's idle entries are pruned periodically to bound memory.

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use hoppergate_common::config::LimitSettings;

/// Held for the lifetime of one connection handler; dropping it releases
/// the global slot.
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}

pub struct ConnectionLimiter {
    per_ip: DefaultKeyedRateLimiter<IpAddr>,
    global: Arc<Semaphore>,
    prune_interval: Duration,
}

impl ConnectionLimiter {
    pub fn new(settings: &LimitSettings) -> Self {
        let per_second = NonZeroU32::new(settings.rate_per_second.max(1)).unwrap();
        let burst = NonZeroU32::new(settings.rate_burst.max(1)).unwrap();
        let quota = Quota::per_second(per_second).allow_burst(burst);

        Self {
            per_ip: RateLimiter::keyed(quota),
            global: Arc::new(Semaphore::new(settings.max_connections)),
            prune_interval: Duration::from_millis(settings.prune_interval_ms.max(1_000)),
        }
    }

    /// Admit or reject a just-accepted connection.
    pub fn admit(&self, ip: IpAddr) -> Option<ConnectionPermit> {
        if self.per_ip.check_key(&ip).is_err() {
            trace!(client_ip = %ip, "rate limited");
            return None;
        }
        match Arc::clone(&self.global).try_acquire_owned() {
            Ok(permit) => Some(ConnectionPermit { _permit: permit }),
            Err(_) => {
                trace!(client_ip = %ip, "global connection cap reached");
                None
            }
        }
    }

    /// Currently free global slots.
    pub fn available(&self) -> usize {
        self.global.available_permits()
    }

    /// Periodically drop per-IP entries whose buckets have refilled.
    pub async fn run_pruner(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.prune_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.per_ip.retain_recent();
                    trace!(entries = self.per_ip.len(), "pruned rate limiter");
                }
                _ = shutdown.cancelled() => return,
            }
        }
    }
}
