//! Private tunnel
//!
//! An ephemeral listener on a pool port whose only purpose is to receive the
//! backend's reverse connection for one session (TCP) or one listener (UDP).

use super::bind_leased;
use crate::error::RelayError;
use crate::pool::{PortLease, PortPool};
use crate::shutdown::Shutdown;
use crate::transport::bind_tcp;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Ephemeral listener awaiting the backend's dial
#[derive(Debug)]
pub struct PrivateTunnel {
    /// Tunnel port; released when the tunnel (or whoever took the lease) is dropped
    lease: PortLease,
    /// Listener, consumed by the single accept
    listener: Option<TcpListener>,
    /// Closing this fails a pending accept
    shutdown: Shutdown,
}

impl PrivateTunnel {
    /// Allocate a port and start listening on it
    pub async fn bind(
        pool: &Arc<PortPool>,
        ip: IpAddr,
        shutdown: Shutdown,
    ) -> Result<Self, RelayError> {
        let (lease, listener) = bind_leased(pool, None, |port| bind_tcp(ip, port)).await?;
        debug!("Private tunnel listening on {}:{}", ip, lease.port());

        Ok(PrivateTunnel {
            lease,
            listener: Some(listener),
            shutdown,
        })
    }

    /// Tunnel port the backend must dial
    pub fn port(&self) -> u16 {
        self.lease.port()
    }

    /// Handle that closes the tunnel from another task
    pub fn close_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Wait for the backend to dial in
    ///
    /// The listener is consumed: a tunnel accepts exactly one connection.
    /// Fails with [`RelayError::TunnelTimeout`] once `timeout` expires and
    /// with [`RelayError::TunnelClosed`] if the tunnel is closed meanwhile.
    pub async fn accept(&mut self, timeout: Duration) -> Result<(TcpStream, SocketAddr), RelayError> {
        let port = self.port();
        let listener = self.listener.take().ok_or(RelayError::TunnelClosed(port))?;

        tokio::select! {
            biased;
            _ = self.shutdown.wait() => Err(RelayError::TunnelClosed(port)),
            res = tokio::time::timeout(timeout, listener.accept()) => match res {
                Ok(Ok((stream, addr))) => {
                    debug!("Backend {} dialed tunnel port {}", addr, port);
                    Ok((stream, addr))
                }
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(RelayError::TunnelTimeout { port, timeout }),
            },
        }
    }

    /// Close the listener; a pending accept fails with `TunnelClosed`
    pub fn close(&mut self) {
        self.shutdown.trigger();
        self.listener = None;
    }

    /// Check whether the tunnel can still accept
    pub fn is_closed(&self) -> bool {
        self.listener.is_none() || self.shutdown.is_triggered()
    }

    /// Keep holding the port after the tunnel has served its accept
    pub fn into_lease(self) -> PortLease {
        self.lease
    }
}
