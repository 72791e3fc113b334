//! Backend wake-up.
//!
//! A [`Waker`] brings a sleeping backend to a dialable state and can put it
//! back to sleep. The [`WakeCoordinator`] makes sure concurrent
//! connections to the same backend share a single in-flight wake: the
//! first arrival invokes the waker and probes for readiness, later
//! arrivals wait on the same readiness signal.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use rand::Rng;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use hoppergate_common::config::WakerSettings;

use crate::metrics;

/// Capability to start and stop a backend.
#[async_trait]
pub trait Waker: Send + Sync {
    /// Bring the backend toward a dialable state. Readiness is probed
    /// separately; this only has to kick off the start.
    async fn wake(&self) -> anyhow::Result<()>;

    /// Scale the backend back down. Invoked by the down scaler.
    async fn sleep(&self) -> anyhow::Result<()>;
}

/// Waker driven by HTTP callbacks, e.g. an orchestrator's scale endpoint.
pub struct WebhookWaker {
    client: reqwest::Client,
    wake_url: String,
    sleep_url: Option<String>,
}

impl WebhookWaker {
    pub fn new(settings: &WakerSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            wake_url: settings.wake_url.clone(),
            sleep_url: settings.sleep_url.clone(),
        })
    }
}

#[async_trait]
impl Waker for WebhookWaker {
    async fn wake(&self) -> anyhow::Result<()> {
        self.client
            .post(&self.wake_url)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn sleep(&self) -> anyhow::Result<()> {
        let Some(url) = &self.sleep_url else {
            return Ok(());
        };
        self.client.post(url).send().await?.error_for_status()?;
        Ok(())
    }
}

/// Wakers by opaque id, as referenced from routes.
#[derive(Default)]
pub struct WakerRegistry {
    wakers: DashMap<String, Arc<dyn Waker>>,
}

impl WakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(
        settings: &std::collections::HashMap<String, WakerSettings>,
    ) -> anyhow::Result<Self> {
        let registry = Self::new();
        for (id, waker_settings) in settings {
            registry.insert(id.clone(), Arc::new(WebhookWaker::new(waker_settings)?));
        }
        Ok(registry)
    }

    pub fn insert(&self, id: String, waker: Arc<dyn Waker>) {
        self.wakers.insert(id, waker);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Waker>> {
        self.wakers.get(id).map(|w| Arc::clone(w.value()))
    }
}

#[derive(Debug, Error)]
pub enum WakeError {
    #[error("no waker registered for id {0:?}")]
    UnknownWaker(String),

    #[error("waker callback failed: {0}")]
    CallbackFailed(String),

    #[error("backend did not become dialable within {0:?}")]
    ReadinessTimeout(Duration),
}

/// Shares one in-flight wake per waker id.
pub struct WakeCoordinator {
    wakers: Arc<WakerRegistry>,
    inflight: Arc<DashMap<String, watch::Receiver<Option<bool>>>>,
    probe_timeout: Duration,
    wake_timeout: Duration,
}

/// Removes the in-flight entry when the leader finishes or is canceled,
/// which also drops the watch sender and releases any followers.
struct InflightGuard {
    map: Arc<DashMap<String, watch::Receiver<Option<bool>>>>,
    key: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

impl WakeCoordinator {
    pub fn new(wakers: Arc<WakerRegistry>, probe_timeout: Duration, wake_timeout: Duration) -> Self {
        Self {
            wakers,
            inflight: Arc::new(DashMap::new()),
            probe_timeout,
            wake_timeout,
        }
    }

    /// Make sure the backend behind `waker_id` is dialable.
    ///
    /// Fast path: one probe connect. Otherwise the first caller becomes
    /// the leader, invokes the waker and probes with exponential backoff
    /// until `wake_timeout`; everyone else waits on the leader's result.
    pub async fn ensure_ready(&self, waker_id: &str, backend: &str) -> Result<(), WakeError> {
        if self.probe(backend).await {
            return Ok(());
        }

        enum Role {
            Leader(watch::Sender<Option<bool>>, InflightGuard),
            Follower(watch::Receiver<Option<bool>>),
        }

        let role = match self.inflight.entry(waker_id.to_string()) {
            Entry::Occupied(entry) => Role::Follower(entry.get().clone()),
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(None);
                entry.insert(rx);
                let guard = InflightGuard {
                    map: Arc::clone(&self.inflight),
                    key: waker_id.to_string(),
                };
                Role::Leader(tx, guard)
            }
        };

        match role {
            Role::Leader(tx, _guard) => {
                let result = self.lead_wake(waker_id, backend).await;
                let _ = tx.send(Some(result.is_ok()));
                result
            }
            Role::Follower(mut rx) => {
                debug!(waker_id, backend, "waiting on in-flight wake");
                let wait = async {
                    loop {
                        if let Some(ready) = *rx.borrow_and_update() {
                            return ready;
                        }
                        if rx.changed().await.is_err() {
                            // Leader canceled without publishing.
                            return false;
                        }
                    }
                };
                match tokio::time::timeout(self.wake_timeout, wait).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(WakeError::CallbackFailed(
                        "shared wake did not succeed".to_string(),
                    )),
                    Err(_) => Err(WakeError::ReadinessTimeout(self.wake_timeout)),
                }
            }
        }
    }

    async fn lead_wake(&self, waker_id: &str, backend: &str) -> Result<(), WakeError> {
        let waker = self
            .wakers
            .get(waker_id)
            .ok_or_else(|| WakeError::UnknownWaker(waker_id.to_string()))?;

        info!(waker_id, backend, "waking backend");
        metrics::WAKES_TOTAL.inc();
        waker
            .wake()
            .await
            .map_err(|e| WakeError::CallbackFailed(e.to_string()))?;

        let deadline = tokio::time::Instant::now() + self.wake_timeout;
        let mut backoff = Duration::from_millis(100);
        loop {
            if self.probe(backend).await {
                info!(waker_id, backend, "backend became dialable");
                return Ok(());
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                warn!(waker_id, backend, "backend never became dialable");
                return Err(WakeError::ReadinessTimeout(self.wake_timeout));
            }
            let jitter = rand::rng().random_range(0.88..1.12);
            let wait = backoff.mul_f64(jitter).min(deadline - now);
            tokio::time::sleep(wait).await;
            backoff = (backoff * 2).min(Duration::from_secs(2));
        }
    }

    async fn probe(&self, backend: &str) -> bool {
        matches!(
            tokio::time::timeout(self.probe_timeout, TcpStream::connect(backend)).await,
            Ok(Ok(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    /// Waker that binds a real listener a little while after the first
    /// wake, flipping the backend from unreachable to dialable the way a
    /// container start would.
    struct BindingWaker {
        addr: std::net::SocketAddr,
        bind_delay: Duration,
        wakes: AtomicUsize,
    }

    #[async_trait]
    impl Waker for BindingWaker {
        async fn wake(&self) -> anyhow::Result<()> {
            if self.wakes.fetch_add(1, Ordering::SeqCst) > 0 {
                return Ok(());
            }
            let addr = self.addr;
            let delay = self.bind_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let Ok(listener) = TcpListener::bind(addr).await else {
                    return;
                };
                loop {
                    if listener.accept().await.is_err() {
                        break;
                    }
                }
            });
            Ok(())
        }

        async fn sleep(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn free_addr() -> std::net::SocketAddr {
        // Bind port 0 to reserve an address, then free it for the waker.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn test_ensure_ready_when_already_dialable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        let registry = Arc::new(WakerRegistry::new());
        let coordinator = WakeCoordinator::new(
            registry,
            Duration::from_millis(500),
            Duration::from_secs(2),
        );
        // No waker registered, but the probe succeeds before one is needed.
        coordinator.ensure_ready("missing", &backend).await.unwrap();
    }

    #[tokio::test]
    async fn test_wake_invoked_once_for_staggered_arrivals() {
        let addr = free_addr();
        let waker = Arc::new(BindingWaker {
            addr,
            bind_delay: Duration::from_millis(300),
            wakes: AtomicUsize::new(0),
        });
        let registry = Arc::new(WakerRegistry::new());
        registry.insert("lobby".to_string(), Arc::clone(&waker) as Arc<dyn Waker>);

        let coordinator = Arc::new(WakeCoordinator::new(
            registry,
            Duration::from_millis(500),
            Duration::from_secs(5),
        ));
        let backend = addr.to_string();

        // First arrival becomes the leader.
        let leader = {
            let coordinator = Arc::clone(&coordinator);
            let backend = backend.clone();
            tokio::spawn(async move { coordinator.ensure_ready("lobby", &backend).await })
        };
        // Two more arrive while the backend is still starting; they must
        // share the in-flight wake.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut followers = Vec::new();
        for _ in 0..2 {
            let coordinator = Arc::clone(&coordinator);
            let backend = backend.clone();
            followers.push(tokio::spawn(async move {
                coordinator.ensure_ready("lobby", &backend).await
            }));
        }

        leader.await.unwrap().unwrap();
        for follower in followers {
            follower.await.unwrap().unwrap();
        }

        assert_eq!(waker.wakes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_waker_fails_when_not_dialable() {
        let addr = free_addr();
        let registry = Arc::new(WakerRegistry::new());
        let coordinator = WakeCoordinator::new(
            registry,
            Duration::from_millis(200),
            Duration::from_millis(500),
        );
        let err = coordinator
            .ensure_ready("ghost", &addr.to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, WakeError::UnknownWaker(_)));
    }

    #[tokio::test]
    async fn test_readiness_timeout() {
        struct NoopWaker;
        #[async_trait]
        impl Waker for NoopWaker {
            async fn wake(&self) -> anyhow::Result<()> {
                Ok(())
            }
            async fn sleep(&self) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let addr = free_addr();
        let registry = Arc::new(WakerRegistry::new());
        registry.insert("dead".to_string(), Arc::new(NoopWaker));
        let coordinator = WakeCoordinator::new(
            registry,
            Duration::from_millis(100),
            Duration::from_millis(400),
        );
        let err = coordinator
            .ensure_ready("dead", &addr.to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, WakeError::ReadinessTimeout(_)));
    }
}
