//! Prometheus collectors.
//!
//! Registered once in the default registry and rendered by the management
//! listener at `GET /metrics`. Hostname labels use the normalized form, so
//! cardinality is bounded by the route table.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    /// Accepted connections by final outcome (`proxied`, `legacy_ping`, or
    /// an error kind).
    pub static ref CONNECTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "hoppergate_connections_total",
        "Accepted connections by outcome",
        &["outcome"]
    )
    .unwrap();

    /// Connections currently spliced to a backend.
    pub static ref ACTIVE_CONNECTIONS: IntGauge = register_int_gauge!(
        "hoppergate_active_connections",
        "Connections currently spliced to a backend"
    )
    .unwrap();

    /// Connections dropped before any byte was read.
    pub static ref ADMISSION_REJECTED_TOTAL: IntCounter = register_int_counter!(
        "hoppergate_admission_rejected_total",
        "Connections dropped by rate limiting or the global cap"
    )
    .unwrap();

    /// Errors by kind and normalized hostname (empty when unknown).
    pub static ref ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "hoppergate_errors_total",
        "Connection errors by kind and hostname",
        &["kind", "hostname"]
    )
    .unwrap();

    /// Relayed bytes by direction (`client_to_backend`, `backend_to_client`).
    pub static ref RELAY_BYTES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "hoppergate_relay_bytes_total",
        "Bytes relayed by direction",
        &["direction"]
    )
    .unwrap();

    /// Waker invocations.
    pub static ref WAKES_TOTAL: IntCounter = register_int_counter!(
        "hoppergate_wakes_total",
        "Waker invocations for sleeping backends"
    )
    .unwrap();

    /// Sleeper callbacks fired by the down scaler.
    pub static ref SCALE_DOWNS_TOTAL: IntCounter = register_int_counter!(
        "hoppergate_scale_downs_total",
        "Idle backends scaled down"
    )
    .unwrap();
}

/// Record an error against the metrics, labeled by kind and hostname when
/// known.
pub fn record_error(kind: &str, hostname: Option<&str>) {
    ERRORS_TOTAL
        .with_label_values(&[kind, hostname.unwrap_or("")])
        .inc();
    CONNECTIONS_TOTAL.with_label_values(&[kind]).inc();
}

/// Render all registered collectors in the Prometheus text format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
