//! Port pool module for Tunnelrat
//!
//! Relay-side ports (public listeners and private tunnels alike) come from a
//! single [`PortPool`] and are handed out as [`PortLease`] guards.

mod guard;
mod port_pool;
mod stats;

pub use guard::PortLease;
pub use port_pool::PortPool;
pub use stats::{PoolStats, PoolStatsSnapshot};
