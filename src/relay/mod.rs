//! Relay module for Tunnelrat
//!
//! Data-plane building blocks: the unidirectional byte pump and the TCP
//! session that runs one pump per direction.

mod pump;
mod session;

pub use pump::{pump, PumpEnd, PumpOutcome};
pub use session::{Session, SessionStats};
