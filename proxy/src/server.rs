//! Listener lifecycle.
//!
//! The accept loop spawns one handler task per connection. On shutdown it
//! stops accepting, grants in-flight handlers a bounded drain window, then
//! force-closes whatever remains by aborting the tasks (accounting guards
//! fire on abort, so counters stay balanced).

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connection::{handle_connection, ConnectionContext};
use crate::routing::RouteEvent;
use crate::scaler::DownScaler;

/// Accept Minecraft connections until shutdown, then drain.
pub async fn run_listener(
    listener: TcpListener,
    ctx: Arc<ConnectionContext>,
    shutdown: CancellationToken,
    drain_window: Duration,
) {
    let mut handlers = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let ctx = Arc::clone(&ctx);
                        handlers.spawn(handle_connection(ctx, stream, peer));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                }
            }
        }
        // Reap whatever already finished so the set stays small.
        while handlers.try_join_next().is_some() {}
    }
    drop(listener);

    let remaining = handlers.len();
    if remaining > 0 {
        info!(in_flight = remaining, "draining connections");
        let drained = tokio::time::timeout(drain_window, async {
            while handlers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                in_flight = handlers.len(),
                "drain window expired, closing remaining connections"
            );
            handlers.abort_all();
            while handlers.join_next().await.is_some() {}
        }
    }
    info!("listener stopped");
}

/// Forward route-removal events to the down scaler so pending scale-down
/// timers for removed backends are canceled.
pub async fn run_route_event_bridge(
    mut events: broadcast::Receiver<RouteEvent>,
    scaler: Arc<DownScaler>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            event = events.recv() => match event {
                Ok(RouteEvent::Deleted { route, .. }) => {
                    if let Some(waker_id) = &route.waker_id {
                        scaler.on_route_removed(waker_id);
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "route event observer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{Route, RouteStore, RouteTable};
    use crate::wake::{Waker, WakerRegistry};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingWaker {
        sleeps: AtomicUsize,
    }

    #[async_trait]
    impl Waker for CountingWaker {
        async fn wake(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn sleep(&self) -> anyhow::Result<()> {
            self.sleeps.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_removal_cancels_pending_scale_down() {
        let waker = Arc::new(CountingWaker {
            sleeps: AtomicUsize::new(0),
        });
        let registry = Arc::new(WakerRegistry::new());
        registry.insert("lobby".to_string(), Arc::clone(&waker) as Arc<dyn Waker>);
        let scaler = Arc::new(DownScaler::new(
            Arc::clone(&registry),
            Duration::from_secs(60),
            true,
        ));
        let table = Arc::new(RouteTable::new(false));
        let shutdown = CancellationToken::new();

        tokio::spawn(run_route_event_bridge(
            table.subscribe(),
            Arc::clone(&scaler),
            shutdown.clone(),
        ));

        table.set(
            "mc.example.com",
            Route::with_waker("10.0.0.5:25565", "lobby"),
        );
        scaler.on_connected("lobby");
        scaler.on_disconnected("lobby");

        table.delete("mc.example.com");
        // Give the bridge task a chance to observe the event.
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The pending timer was canceled; the sleeper never fires.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(waker.sleeps.load(Ordering::SeqCst), 0);
        shutdown.cancel();
    }
}
