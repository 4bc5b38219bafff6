//! # Tunnelrat - Reverse Tunnel Relay Daemon
//!
//! Tunnelrat runs on a publicly reachable host and lets backends behind NAT
//! or a firewall expose TCP and UDP services through one outbound control
//! connection. The relay binds the public port, asks the backend to dial a
//! private tunnel port for every data path, and splices bytes between public
//! clients and the backend.
//!
//! ## Features
//!
//! - **TCP and UDP**: one tunnel per TCP client, one shared tunnel per UDP listener
//! - **Port Pool**: public and tunnel ports drawn at random from one shared range
//! - **Cascading Teardown**: losing a backend closes all of its listeners and
//!   sessions and returns every port to the pool
//! - **Contained Failures**: a stalled tunnel or a dead peer ends one session only
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tunnelrat::config::load_config;
//! use tunnelrat::server::run_daemon;
//! use tokio::sync::broadcast;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("config.toml")?;
//!     let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
//!
//!     run_daemon(config, shutdown_rx).await
//! }
//! ```
//!
//! ## Architecture
//!
//! A backend connects to the control port and sends a listen request. The
//! relay binds a public port and announces it. For each public client the
//! relay binds a private tunnel port and sends an open-tunnel frame; the
//! backend dials it and the two connections are joined.
//!
//! ```text
//! Client -> Tunnelrat public port -> private tunnel <- Backend -> Local service
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod helper;
pub mod pool;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod shutdown;
pub mod tasks;
pub mod transport;

// Re-export commonly used items
pub use config::{load_config, Config};
pub use error::RelayError;
pub use server::{run_daemon, Daemon};

/// Version of the Tunnelrat library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
