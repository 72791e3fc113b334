//! Proxy-wide error taxonomy.
//!
//! Every failure the connection handler can observe collapses into one of
//! these kinds. Each kind carries the context of the state it occurred in
//! and exposes a stable label for metrics. Only `Internal` is worth an
//! error-level log line; everything else is client- or backend-caused and
//! logs at debug/info.

use thiserror::Error;

/// Errors observable to the proxy core.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed framing, bad packet id, unsupported next-state.
    #[error("bad client: {0}")]
    BadClient(String),

    /// Connection rejected by an IP or player filter.
    #[error("filtered: {0}")]
    Filtered(&'static str),

    /// Hostname lookup missed and no default route is configured.
    #[error("no route for hostname {0:?}")]
    NoRoute(String),

    /// Waker callback errored or the backend never became dialable.
    #[error("wake failed for backend {backend}: {reason}")]
    WakeFailed { backend: String, reason: String },

    /// TCP connect to the backend refused or timed out.
    #[error("dial failed for backend {backend}")]
    DialFailed {
        backend: String,
        #[source]
        source: std::io::Error,
    },

    /// Mid-splice I/O error on either direction.
    #[error("relay aborted")]
    RelayAborted(#[source] std::io::Error),

    /// Process-wide cancellation interrupted the connection.
    #[error("shutting down")]
    Shutdown,

    /// Invariant violation. Should be unreachable.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Stable label for metrics, one per kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::BadClient(_) => "bad_client",
            ProxyError::Filtered(_) => "filtered",
            ProxyError::NoRoute(_) => "no_route",
            ProxyError::WakeFailed { .. } => "wake_failed",
            ProxyError::DialFailed { .. } => "dial_failed",
            ProxyError::RelayAborted(_) => "relay_aborted",
            ProxyError::Shutdown => "shutdown",
            ProxyError::Internal(_) => "internal",
        }
    }
}
