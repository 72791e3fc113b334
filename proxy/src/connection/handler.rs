//! The per-connection state machine.
//!
//! Strictly sequential per accepted socket:
//! admit → filter-ip → sniff → filter-player → resolve → wake → dial →
//! splice → account. Every failure closes this connection only, records a
//! metric labeled with the error kind and hostname, and never propagates
//! to other connections or the route table.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use hoppergate_common::config::{ProxyProtocolSettings, TimeoutSettings};
use hoppergate_common::error::ProxyError;

use crate::connection::proxy_header::{encode_header, ProxyProtocolVersion};
use crate::connection::splice::splice;
use crate::filter::{IpFilter, PlayerFilter};
use crate::limiter::ConnectionLimiter;
use crate::metrics;
use crate::notify::{ConnectionEvent, ConnectionNotifier};
use crate::protocol::packets::login_disconnect;
use crate::protocol::{handshake, SniffResult, Sniffed};
use crate::routing::RouteFinder;
use crate::scaler::DownScaler;
use crate::wake::WakeCoordinator;

/// Shared dependencies for every connection handler, built once at
/// startup and passed by reference.
pub struct ConnectionContext {
    pub routes: Arc<dyn RouteFinder>,
    pub limiter: Arc<ConnectionLimiter>,
    pub ip_filter: Arc<IpFilter>,
    pub player_filter: Arc<PlayerFilter>,
    pub wake: Arc<WakeCoordinator>,
    pub scaler: Arc<DownScaler>,
    pub notifier: Arc<dyn ConnectionNotifier>,
    pub timeouts: TimeoutSettings,
    pub proxy_protocol: ProxyProtocolSettings,
    pub disconnect_reason: String,
}

/// Decrements the backend counter and the active gauge exactly once, even
/// when the handler task is aborted mid-splice.
struct ActiveGuard {
    scaler: Arc<DownScaler>,
    waker_id: Option<String>,
}

impl ActiveGuard {
    fn new(scaler: Arc<DownScaler>, waker_id: Option<String>) -> Self {
        metrics::ACTIVE_CONNECTIONS.inc();
        if let Some(id) = &waker_id {
            scaler.on_connected(id);
        }
        Self { scaler, waker_id }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        metrics::ACTIVE_CONNECTIONS.dec();
        if let Some(id) = &self.waker_id {
            self.scaler.on_disconnected(id);
        }
    }
}

/// Handle one accepted client socket from admission to teardown.
pub async fn handle_connection(ctx: Arc<ConnectionContext>, stream: TcpStream, peer: SocketAddr) {
    // Admit: rejected connections are dropped without reading a byte.
    let Some(_permit) = ctx.limiter.admit(peer.ip()) else {
        metrics::ADMISSION_REJECTED_TOTAL.inc();
        return;
    };

    let session_id = Uuid::new_v4();
    match run(&ctx, stream, peer, session_id).await {
        Ok(Outcome::Proxied) => {
            metrics::CONNECTIONS_TOTAL.with_label_values(&["proxied"]).inc();
        }
        Ok(Outcome::LegacyPing) => {
            metrics::CONNECTIONS_TOTAL
                .with_label_values(&["legacy_ping"])
                .inc();
        }
        Err(failure) => {
            let hostname = failure.hostname.as_deref();
            metrics::record_error(failure.error.kind(), hostname);
            match &failure.error {
                ProxyError::Internal(msg) => {
                    warn!(%session_id, client = %peer, error = %msg, "internal error");
                }
                other => {
                    debug!(
                        %session_id,
                        client = %peer,
                        hostname = hostname.unwrap_or(""),
                        kind = other.kind(),
                        error = %other,
                        "connection ended with error"
                    );
                }
            }
        }
    }
}

enum Outcome {
    Proxied,
    LegacyPing,
}

/// An error plus the normalized hostname, when it was learned before the
/// failure.
struct Failure {
    error: ProxyError,
    hostname: Option<String>,
}

impl Failure {
    fn bare(error: ProxyError) -> Self {
        Self {
            error,
            hostname: None,
        }
    }

    fn at(hostname: &str, error: ProxyError) -> Self {
        Self {
            error,
            hostname: Some(hostname.to_string()),
        }
    }
}

async fn run(
    ctx: &ConnectionContext,
    mut stream: TcpStream,
    peer: SocketAddr,
    session_id: Uuid,
) -> Result<Outcome, Failure> {
    // Filter-IP: close silently.
    if !ctx.ip_filter.permits(peer.ip()) {
        return Err(Failure::bare(ProxyError::Filtered("ip")));
    }

    // Sniff: decode the handshake under the read deadline.
    let sniffed = match tokio::time::timeout(ctx.timeouts.sniff(), handshake::sniff(&mut stream))
        .await
    {
        Ok(Ok(SniffResult::Handshake(sniffed))) => sniffed,
        Ok(Ok(SniffResult::LegacyPing { hostname })) => {
            debug!(%session_id, client = %peer, hostname = ?hostname, "legacy ping, closing");
            return Ok(Outcome::LegacyPing);
        }
        Ok(Err(e)) => {
            return Err(Failure::bare(ProxyError::BadClient(format!(
                "handshake sniff failed: {e}"
            ))));
        }
        Err(_) => {
            return Err(Failure::bare(ProxyError::BadClient(
                "handshake sniff timed out".to_string(),
            )));
        }
    };

    let hostname = ctx.routes.normalize_key(&sniffed.handshake.server_address);

    // Filter-player: reject with a proper disconnect packet.
    if let Some(player) = &sniffed.player_name {
        if ctx.player_filter.is_active() && !ctx.player_filter.permits(player) {
            let packet = login_disconnect(&ctx.disconnect_reason);
            let _ = stream.write_all(&packet).await;
            let _ = stream.shutdown().await;

            let mut event = ConnectionEvent::new(session_id, peer.to_string());
            event.hostname = Some(hostname.clone());
            event.player_name = Some(player.clone());
            event.reason = Some("filtered".to_string());
            ctx.notifier.disconnected(&event).await;

            return Err(Failure::at(&hostname, ProxyError::Filtered("player")));
        }
    }

    // Resolve.
    let Some(route) = ctx.routes.lookup(&sniffed.handshake.server_address) else {
        return Err(Failure::at(&hostname, ProxyError::NoRoute(hostname.clone())));
    };

    // Wake: only routes with a bound waker can be sleeping.
    if let Some(waker_id) = &route.waker_id {
        ctx.wake
            .ensure_ready(waker_id, &route.backend)
            .await
            .map_err(|e| {
                Failure::at(
                    &hostname,
                    ProxyError::WakeFailed {
                        backend: route.backend.clone(),
                        reason: e.to_string(),
                    },
                )
            })?;
    }

    // Dial.
    let backend_stream =
        match tokio::time::timeout(ctx.timeouts.connect(), TcpStream::connect(&route.backend))
            .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                return Err(Failure::at(
                    &hostname,
                    ProxyError::DialFailed {
                        backend: route.backend.clone(),
                        source: e,
                    },
                ));
            }
            Err(_) => {
                return Err(Failure::at(
                    &hostname,
                    ProxyError::DialFailed {
                        backend: route.backend.clone(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "connect timed out",
                        ),
                    },
                ));
            }
        };

    let _ = stream.set_nodelay(true);
    let _ = backend_stream.set_nodelay(true);

    info!(
        %session_id,
        client = %peer,
        hostname = %hostname,
        backend = %route.backend,
        player = sniffed.player_name.as_deref().unwrap_or(""),
        "proxying connection"
    );

    relay(ctx, stream, backend_stream, peer, session_id, &hostname, &route, &sniffed).await
}

async fn relay(
    ctx: &ConnectionContext,
    stream: TcpStream,
    mut backend_stream: TcpStream,
    peer: SocketAddr,
    session_id: Uuid,
    hostname: &str,
    route: &crate::routing::RouteMatch,
    sniffed: &Sniffed,
) -> Result<Outcome, Failure> {
    // Optional PROXY protocol header, then the captured handshake bytes,
    // byte-for-byte as the client sent them. Routes can override the
    // service-wide PROXY protocol setting.
    if route.proxy_protocol.unwrap_or(ctx.proxy_protocol.enabled) {
        if let Some(version) = ProxyProtocolVersion::from_config(ctx.proxy_protocol.version) {
            let local = stream.local_addr().map_err(|e| {
                Failure::at(hostname, ProxyError::Internal(format!("local_addr: {e}")))
            })?;
            let header = encode_header(version, peer, local);
            backend_stream.write_all(&header).await.map_err(|e| {
                Failure::at(
                    hostname,
                    ProxyError::DialFailed {
                        backend: route.backend.clone(),
                        source: e,
                    },
                )
            })?;
        }
    }

    backend_stream
        .write_all(&sniffed.captured)
        .await
        .map_err(|e| {
            Failure::at(
                hostname,
                ProxyError::DialFailed {
                    backend: route.backend.clone(),
                    source: e,
                },
            )
        })?;

    // Account: increment at splice entry, decrement when both copies
    // finish (the guard survives task abort during shutdown).
    let guard = ActiveGuard::new(Arc::clone(&ctx.scaler), route.waker_id.clone());

    let mut event = ConnectionEvent::new(session_id, peer.to_string());
    event.hostname = Some(hostname.to_string());
    event.backend = Some(route.backend.clone());
    event.player_name = sniffed.player_name.clone();
    ctx.notifier.connected(&event).await;

    let summary = splice(
        stream,
        backend_stream,
        ctx.timeouts.idle(),
        ctx.timeouts.max_lifetime(),
    )
    .await;

    drop(guard);

    let mut event = ConnectionEvent::new(session_id, peer.to_string());
    event.hostname = Some(hostname.to_string());
    event.backend = Some(route.backend.clone());
    event.player_name = sniffed.player_name.clone();

    debug!(
        %session_id,
        to_backend = summary.client_to_backend,
        to_client = summary.backend_to_client,
        "splice finished"
    );

    match summary.error {
        Some(error) if !summary.expired => {
            event.reason = Some("relay_aborted".to_string());
            ctx.notifier.disconnected(&event).await;
            Err(Failure::at(hostname, ProxyError::RelayAborted(error)))
        }
        _ => {
            if summary.expired {
                event.reason = Some("lifetime_expired".to_string());
            }
            ctx.notifier.disconnected(&event).await;
            Ok(Outcome::Proxied)
        }
    }
}
