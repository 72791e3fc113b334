//! Hoppergate shared foundation: configuration loading, telemetry
//! initialization and the proxy-wide error taxonomy.

pub mod config;
pub mod error;
pub mod telemetry;

pub use config::Settings;
pub use error::ProxyError;
