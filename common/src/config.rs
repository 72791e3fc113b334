//! Layered configuration loading.
//!
//! Settings come from an optional config file (`config/<service>.toml`, or
//! the path in `HOPPERGATE_CONFIG`) with `HOPPERGATE__*` environment
//! variables layered on top, e.g. `HOPPERGATE__LISTENER__BIND`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Top-level settings tree for the proxy service.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub listener: ListenerSettings,
    pub timeouts: TimeoutSettings,
    pub limits: LimitSettings,
    pub filters: FilterSettings,
    pub routes: RouteSettings,
    pub scaler: ScalerSettings,
    /// Waker definitions keyed by the opaque waker id routes reference.
    pub wakers: HashMap<String, WakerSettings>,
    pub webhook: WebhookSettings,
    pub proxy_protocol: ProxyProtocolSettings,
    pub telemetry: TelemetrySettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerSettings {
    /// Minecraft listener bind address.
    pub bind: String,
    /// Management API bind address. Disabled when absent.
    pub api_bind: Option<String>,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:25565".to_string(),
            api_bind: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Deadline for reading the handshake (and LoginStart) frames.
    pub sniff_ms: u64,
    /// Backend TCP connect timeout.
    pub connect_ms: u64,
    /// How long to wait for a woken backend to become dialable.
    pub wake_ms: u64,
    /// Per-direction idle deadline during splice. 0 disables.
    pub idle_ms: u64,
    /// Whole-connection lifetime cap. 0 disables.
    pub max_lifetime_ms: u64,
    /// Drain window granted to in-flight connections on shutdown.
    pub shutdown_drain_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            sniff_ms: 10_000,
            connect_ms: 5_000,
            wake_ms: 120_000,
            idle_ms: 0,
            max_lifetime_ms: 0,
            shutdown_drain_ms: 10_000,
        }
    }
}

impl TimeoutSettings {
    pub fn sniff(&self) -> Duration {
        Duration::from_millis(self.sniff_ms)
    }

    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn wake(&self) -> Duration {
        Duration::from_millis(self.wake_ms)
    }

    pub fn idle(&self) -> Option<Duration> {
        (self.idle_ms > 0).then(|| Duration::from_millis(self.idle_ms))
    }

    pub fn max_lifetime(&self) -> Option<Duration> {
        (self.max_lifetime_ms > 0).then(|| Duration::from_millis(self.max_lifetime_ms))
    }

    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_millis(self.shutdown_drain_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    /// Token-bucket refill rate per client IP, connections per second.
    pub rate_per_second: u32,
    /// Token-bucket burst per client IP.
    pub rate_burst: u32,
    /// Global cap on concurrently live connection handlers.
    pub max_connections: usize,
    /// Interval for pruning idle per-IP limiter entries.
    pub prune_interval_ms: u64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            rate_per_second: 5,
            rate_burst: 20,
            max_connections: 10_000,
            prune_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    /// CIDR allow list for client IPs. Empty allows all.
    pub ip_allow: Vec<String>,
    /// CIDR deny list for client IPs, checked after the allow list.
    pub ip_deny: Vec<String>,
    /// Player-name allow list. Empty allows all.
    pub player_allow: Vec<String>,
    /// Player-name deny list, checked after the allow list.
    pub player_deny: Vec<String>,
    /// Reason shown to players rejected by the name filters.
    pub disconnect_reason: String,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            ip_allow: Vec::new(),
            ip_deny: Vec::new(),
            player_allow: Vec::new(),
            player_deny: Vec::new(),
            disconnect_reason: "You are not allowed on this server.".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouteSettings {
    /// Optional JSON route file (`{"defaultServer": ..., "mappings": {...}}`).
    pub file: Option<PathBuf>,
    /// Poll interval for detecting route-file changes.
    pub file_poll_ms: u64,
    /// Fallback backend used when hostname lookup misses.
    pub default_backend: Option<String>,
    /// Inline hostname → backend mappings, merged over the file's.
    pub mappings: HashMap<String, String>,
    /// Strip a leading `_minecraft._tcp.` SRV label pair from lookups.
    pub simplify_srv: bool,
    /// hostname → waker id, binding routes to a configured waker.
    pub waker_bindings: HashMap<String, String>,
}

impl Default for RouteSettings {
    fn default() -> Self {
        Self {
            file: None,
            file_poll_ms: 3_000,
            default_backend: None,
            mappings: HashMap::new(),
            simplify_srv: false,
            waker_bindings: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScalerSettings {
    /// Scale idle backends to zero after the grace period.
    pub auto_down: bool,
    /// Idle grace period before the sleeper callback fires.
    pub idle_grace_ms: u64,
}

impl Default for ScalerSettings {
    fn default() -> Self {
        Self {
            auto_down: false,
            idle_grace_ms: 600_000,
        }
    }
}

impl ScalerSettings {
    pub fn idle_grace(&self) -> Duration {
        Duration::from_millis(self.idle_grace_ms)
    }
}

/// A waker brings a sleeping backend to a dialable state (and optionally
/// puts it back to sleep) via HTTP callbacks.
#[derive(Debug, Clone, Deserialize)]
pub struct WakerSettings {
    pub wake_url: String,
    #[serde(default)]
    pub sleep_url: Option<String>,
    #[serde(default = "default_waker_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_waker_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WebhookSettings {
    /// Connection event webhook URL. Disabled when absent.
    pub url: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyProtocolSettings {
    /// Prepend a PROXY protocol header to every backend stream.
    pub enabled: bool,
    /// Header version, 1 (text) or 2 (binary).
    pub version: u8,
}

impl Default for ProxyProtocolSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            version: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Default tracing filter, overridable via RUST_LOG.
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones.
    pub json: bool,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}

impl Settings {
    /// Load settings for a service: optional file, then environment overrides.
    pub fn load(service: &str) -> Result<Self, config::ConfigError> {
        let file = std::env::var("HOPPERGATE_CONFIG")
            .unwrap_or_else(|_| format!("config/{service}"));

        let settings = config::Config::builder()
            .add_source(config::File::with_name(&file).required(false))
            .add_source(
                config::Environment::with_prefix("HOPPERGATE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        settings.try_deserialize()
    }
}
