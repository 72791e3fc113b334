//! Tracing initialization.
//!
//! `RUST_LOG` wins over the configured default filter so operators can turn
//! individual targets up without touching config files.

use tracing_subscriber::filter::EnvFilter;

use crate::config::TelemetrySettings;

/// Initialize the global tracing subscriber for a service.
pub fn init(service: &str, settings: &TelemetrySettings) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level));

    if settings.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to init tracing: {e}"))?;
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to init tracing: {e}"))?;
    }

    tracing::info!(service, "telemetry initialized");
    Ok(())
}
