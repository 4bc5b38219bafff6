//! TCP session
//!
//! Pairs one public client socket with the tunnel socket the backend dialed
//! for it, and forwards bytes both ways with two independent pumps.

use super::pump::{pump, PumpEnd, PumpOutcome};
use crate::helper::is_peer_reset;
use crate::pool::PortLease;
use crate::shutdown::Shutdown;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Bytes moved by a finished session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Client -> backend
    pub upstream_bytes: u64,
    /// Backend -> client
    pub downstream_bytes: u64,
}

/// One public-client-to-backend data path
#[derive(Debug)]
pub struct Session {
    /// Public client connection
    client: TcpStream,
    /// Public client address
    client_addr: SocketAddr,
    /// Connection the backend dialed into the private tunnel
    tunnel: TcpStream,
    /// Tunnel port, held until the session ends
    tunnel_lease: PortLease,
    /// Shared by both pumps
    shutdown: Shutdown,
    /// Copy buffer per direction
    buffer_size: usize,
}

impl Session {
    /// Create a session from an established tunnel
    pub fn new(
        client: TcpStream,
        client_addr: SocketAddr,
        tunnel: TcpStream,
        tunnel_lease: PortLease,
        shutdown: Shutdown,
        buffer_size: usize,
    ) -> Self {
        Session {
            client,
            client_addr,
            tunnel,
            tunnel_lease,
            shutdown,
            buffer_size,
        }
    }

    /// Public client address
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Tunnel port held by this session
    pub fn tunnel_port(&self) -> u16 {
        self.tunnel_lease.port()
    }

    /// Run both pumps to completion
    ///
    /// Whichever direction ends first shuts the other down; both sockets are
    /// closed and the tunnel port released before this returns.
    pub async fn run(self) -> SessionStats {
        let Session {
            client,
            client_addr,
            tunnel,
            tunnel_lease,
            shutdown,
            buffer_size,
        } = self;
        let tunnel_port = tunnel_lease.port();

        info!(
            "Session {} <-> tunnel port {} established",
            client_addr, tunnel_port
        );

        let (client_read, client_write) = client.into_split();
        let (tunnel_read, tunnel_write) = tunnel.into_split();

        let upstream = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { pump(client_read, tunnel_write, buffer_size, &shutdown).await })
        };
        let downstream = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { pump(tunnel_read, client_write, buffer_size, &shutdown).await })
        };

        let (upstream, downstream) = tokio::join!(upstream, downstream);
        // A pump that panicked never triggered the handle itself.
        shutdown.trigger();

        let upstream = settle("client->tunnel", upstream);
        let downstream = settle("tunnel->client", downstream);
        drop(tunnel_lease);

        debug!(
            "Session {} ended: client->tunnel {:?}, tunnel->client {:?}",
            client_addr, upstream.end, downstream.end
        );
        for (direction, outcome) in [("client->tunnel", &upstream), ("tunnel->client", &downstream)] {
            match (outcome.end, outcome.error()) {
                (PumpEnd::Error(kind), Some(e)) if !is_peer_reset(&kind.into()) => {
                    warn!("Session {} {}: {}", client_addr, direction, e)
                }
                (_, Some(e)) => debug!("Session {} {}: {}", client_addr, direction, e),
                _ => {}
            }
        }
        info!(
            "Session {} closed ({} bytes up, {} bytes down)",
            client_addr, upstream.bytes, downstream.bytes
        );

        SessionStats {
            upstream_bytes: upstream.bytes,
            downstream_bytes: downstream.bytes,
        }
    }
}

fn settle(direction: &str, result: Result<PumpOutcome, tokio::task::JoinError>) -> PumpOutcome {
    result.unwrap_or_else(|e| {
        warn!("Pump {} failed: {}", direction, e);
        PumpOutcome {
            bytes: 0,
            end: PumpEnd::Error(std::io::ErrorKind::Other),
        }
    })
}
