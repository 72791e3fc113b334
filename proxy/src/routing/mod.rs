//! Virtual-hostname routing.
//!
//! Maps the hostname a client dialed to a backend address, with an
//! optional waker binding and a distinguished default slot. Lookups
//! canonicalize through [`normalize::normalize`] first.

pub mod normalize;
pub mod table;

pub use normalize::normalize;
pub use table::{Route, RouteEvent, RouteFinder, RouteMatch, RouteSnapshot, RouteStore, RouteTable};
