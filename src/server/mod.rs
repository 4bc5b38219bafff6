//! Server module for Tunnelrat
//!
//! This module contains the relay side of the tunnel: the daemon accepting
//! backends, one control channel per backend, the public listeners it
//! exposes and the private tunnels that carry each data path.

mod control_channel;
mod daemon;
mod listener;
mod private_tunnel;
mod tcp_listener;
mod udp_listener;

pub use control_channel::{ControlChannel, ControlSender};
pub use daemon::Daemon;
pub use listener::{ListenerState, PublicListener};
pub use private_tunnel::PrivateTunnel;
pub use tcp_listener::TcpPublicListener;
pub use udp_listener::UdpPublicListener;

use crate::config::{Config, ServerConfig};
use crate::error::RelayError;
use crate::helper::BIND_ATTEMPTS;
use crate::pool::{PortLease, PortPool};
use anyhow::Result;
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// What a listener needs from its control channel besides the sender
#[derive(Debug, Clone)]
pub(crate) struct ListenerContext {
    pub config: Arc<ServerConfig>,
    pub pool: Arc<PortPool>,
}

/// Allocate a port and bind a socket on it
///
/// A port can be free in the pool but taken by another process. Such ports
/// are kept leased until a bind succeeds so the next pick cannot land on
/// them again, then all of them are released.
pub(crate) async fn bind_leased<T, F, Fut>(
    pool: &Arc<PortPool>,
    preferred: Option<u16>,
    mut bind: F,
) -> Result<(PortLease, T), RelayError>
where
    F: FnMut(u16) -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    let mut lease = match preferred {
        Some(port) => pool.allocate_preferred(port)?,
        None => pool.allocate()?,
    };
    let mut busy = Vec::new();

    loop {
        match bind(lease.port()).await {
            Ok(socket) => return Ok((lease, socket)),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse && busy.len() + 1 < BIND_ATTEMPTS => {
                debug!("Port {} is in use outside the pool, picking another", lease.port());
                busy.push(lease);
                lease = pool.allocate()?;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Run the relay daemon with the given configuration
pub async fn run_daemon(config: Config, shutdown_rx: broadcast::Receiver<bool>) -> Result<()> {
    let daemon = Daemon::bind(config.server).await?;
    daemon.run(shutdown_rx).await
}
