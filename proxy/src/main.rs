//! Hoppergate service entrypoint.
//!
//! Builds the route table, filters, limiter, wake coordinator, down
//! scaler and notifier from configuration, starts the Minecraft and
//! management listeners, and runs until ctrl-c. Bind failures and fatal
//! config errors exit non-zero; a signal-driven shutdown exits zero.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use hoppergate_common::{telemetry, Settings};
use hoppergate_proxy::api::{self, ApiState};
use hoppergate_proxy::connection::ConnectionContext;
use hoppergate_proxy::files::RouteFileLoader;
use hoppergate_proxy::filter::{IpFilter, PlayerFilter};
use hoppergate_proxy::limiter::ConnectionLimiter;
use hoppergate_proxy::notify::{ConnectionNotifier, NullNotifier, WebhookNotifier};
use hoppergate_proxy::routing::{Route, RouteStore, RouteTable};
use hoppergate_proxy::scaler::DownScaler;
use hoppergate_proxy::server;
use hoppergate_proxy::wake::{WakeCoordinator, WakerRegistry};

const SERVICE_NAME: &str = "hoppergate";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load(SERVICE_NAME).context("failed to load configuration")?;
    telemetry::init(SERVICE_NAME, &settings.telemetry)?;

    info!(
        "Starting {} v{}",
        SERVICE_NAME,
        env!("CARGO_PKG_VERSION")
    );

    // Route table, seeded from inline config.
    let table = Arc::new(RouteTable::new(settings.routes.simplify_srv));
    for (hostname, backend) in &settings.routes.mappings {
        let key = table.normalize_key(hostname);
        let waker_id = settings.routes.waker_bindings.get(&key).cloned().or_else(|| {
            settings.routes.waker_bindings.get(hostname).cloned()
        });
        table.set(
            hostname,
            Route {
                backend: backend.clone(),
                waker_id,
                proxy_protocol: None,
            },
        );
    }
    if let Some(backend) = &settings.routes.default_backend {
        table.set_default(Route::new(backend.clone()));
    }

    // Wakers and the machinery around them.
    let wakers = Arc::new(
        WakerRegistry::from_settings(&settings.wakers).context("invalid waker configuration")?,
    );
    let scaler = Arc::new(DownScaler::new(
        Arc::clone(&wakers),
        settings.scaler.idle_grace(),
        settings.scaler.auto_down,
    ));
    let wake = Arc::new(WakeCoordinator::new(
        Arc::clone(&wakers),
        settings.timeouts.connect(),
        settings.timeouts.wake(),
    ));

    let limiter = Arc::new(ConnectionLimiter::new(&settings.limits));
    let ip_filter =
        Arc::new(IpFilter::from_settings(&settings.filters).context("invalid IP filter")?);
    let player_filter = Arc::new(PlayerFilter::from_settings(&settings.filters));

    let notifier: Arc<dyn ConnectionNotifier> = match WebhookNotifier::new(&settings.webhook)
        .context("invalid webhook configuration")?
    {
        Some(webhook) => {
            info!("connection webhook enabled");
            Arc::new(webhook)
        }
        None => Arc::new(NullNotifier),
    };

    let ctx = Arc::new(ConnectionContext {
        routes: Arc::clone(&table) as Arc<dyn hoppergate_proxy::RouteFinder>,
        limiter: Arc::clone(&limiter),
        ip_filter,
        player_filter,
        wake,
        scaler: Arc::clone(&scaler),
        notifier,
        timeouts: settings.timeouts.clone(),
        proxy_protocol: settings.proxy_protocol.clone(),
        disconnect_reason: settings.filters.disconnect_reason.clone(),
    });

    let shutdown = CancellationToken::new();

    // Route file: initial load is fatal, the watcher only logs.
    if let Some(path) = &settings.routes.file {
        let loader = Arc::new(RouteFileLoader::new(
            path.clone(),
            Arc::clone(&table),
            &settings.routes.waker_bindings,
            std::time::Duration::from_millis(settings.routes.file_poll_ms.max(250)),
        ));
        loader
            .load()
            .await
            .with_context(|| format!("failed to load route file {}", path.display()))?;
        tokio::spawn(Arc::clone(&loader).run_watch(shutdown.clone()));
    }

    tokio::spawn(Arc::clone(&limiter).run_pruner(shutdown.clone()));
    tokio::spawn(server::run_route_event_bridge(
        table.subscribe(),
        Arc::clone(&scaler),
        shutdown.clone(),
    ));

    // Management listener.
    if let Some(api_bind) = &settings.listener.api_bind {
        let api_listener = TcpListener::bind(api_bind)
            .await
            .with_context(|| format!("failed to bind management API on {api_bind}"))?;
        info!(bind = %api_bind, "management API listening");
        let state = ApiState {
            routes: Arc::clone(&table),
        };
        let api_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = api::serve(api_listener, state, api_shutdown).await {
                warn!(error = %e, "management API exited");
            }
        });
    }

    // Minecraft listener.
    let listener = TcpListener::bind(&settings.listener.bind)
        .await
        .with_context(|| format!("failed to bind listener on {}", settings.listener.bind))?;
    info!(bind = %settings.listener.bind, "accepting Minecraft connections");

    // Signal handling.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    server::run_listener(
        listener,
        ctx,
        shutdown.clone(),
        settings.timeouts.shutdown_drain(),
    )
    .await;

    // Cancel pending scale-down timers without firing.
    scaler.shutdown();
    shutdown.cancel();

    info!("shutdown complete");
    Ok(())
}
