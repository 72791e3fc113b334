//! Hoppergate proxy core.
//!
//! A reverse proxy for the Minecraft Java Edition wire protocol: one
//! public TCP endpoint, a handshake sniffer that learns which virtual
//! server the client dialed, a hostname route table, wake-on-connect for
//! sleeping backends, bidirectional byte relay, and scale-to-zero
//! accounting.

pub mod api;
pub mod connection;
pub mod files;
pub mod filter;
pub mod limiter;
pub mod metrics;
pub mod notify;
pub mod protocol;
pub mod routing;
pub mod scaler;
pub mod server;
pub mod wake;

pub use connection::{handle_connection, ConnectionContext};
pub use routing::{Route, RouteFinder, RouteStore, RouteTable};
