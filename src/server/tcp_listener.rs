//! TCP public listener
//!
//! Accepts public clients and, for each one, bootstraps a private tunnel and
//! runs a [`Session`] between the client and the connection the backend
//! dialed for it. Sessions are contained: a failed handshake or a dead peer
//! ends that session only.

use super::control_channel::ControlSender;
use super::listener::{ListenerCore, ListenerState, PublicListener};
use super::private_tunnel::PrivateTunnel;
use super::{bind_leased, ListenerContext};
use crate::error::RelayError;
use crate::pool::PortLease;
use crate::protocol::Protocol;
use crate::relay::Session;
use crate::shutdown::Shutdown;
use crate::tasks::TaskSet;
use crate::transport::{bind_tcp, SocketOpts};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Public TCP service exposed for one backend
#[derive(Debug)]
pub struct TcpPublicListener {
    core: ListenerCore,
    ctx: ListenerContext,
    sessions: Arc<TaskSet>,
    /// Bound socket waiting for [`serve`](Self::serve)
    bound: Mutex<Option<(PortLease, TcpListener)>>,
}

impl TcpPublicListener {
    /// Allocate the public port and bind it
    pub(crate) async fn bind(
        ctx: ListenerContext,
        shutdown: Shutdown,
        preferred: Option<u16>,
    ) -> Result<Self, RelayError> {
        let ip = ctx.config.listen_ip;
        let (lease, listener) = bind_leased(&ctx.pool, preferred, |port| bind_tcp(ip, port)).await?;
        debug!("TCP public port {}:{} bound", ip, lease.port());

        Ok(TcpPublicListener {
            core: ListenerCore::new(Protocol::Tcp, lease.port(), shutdown),
            ctx,
            sessions: TaskSet::new(),
            bound: Mutex::new(Some((lease, listener))),
        })
    }

    /// Start the accept loop
    ///
    /// Only the first call has an effect.
    pub(crate) fn serve(&self, sender: ControlSender) {
        let bound = self.bound.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some((lease, listener)) = bound else {
            return;
        };

        let handle = tokio::spawn(accept_loop(
            listener,
            lease,
            self.ctx.clone(),
            sender,
            Arc::clone(&self.sessions),
            self.core.shutdown().clone(),
        ));
        self.core.set_task(handle);
        self.core.set_listening();
    }

    /// Number of sessions in flight, including ones still waiting for their tunnel
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[async_trait]
impl PublicListener for TcpPublicListener {
    fn protocol(&self) -> Protocol {
        self.core.protocol()
    }

    fn port(&self) -> u16 {
        self.core.port()
    }

    fn state(&self) -> ListenerState {
        self.core.state()
    }

    async fn close(&self) {
        // Never served: dropping the bound socket releases the port
        drop(self.bound.lock().unwrap_or_else(PoisonError::into_inner).take());
        self.core.close().await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    lease: PortLease,
    ctx: ListenerContext,
    sender: ControlSender,
    sessions: Arc<TaskSet>,
    shutdown: Shutdown,
) {
    let port = lease.port();
    info!("TCP listener on port {} serving {}", port, sender.peer());

    loop {
        let (client, addr) = tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("TCP listener on port {} failed to accept: {}", port, e);
                    tokio::select! {
                        _ = shutdown.wait() => break,
                        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => continue,
                    }
                }
            },
        };

        sessions.reap();
        debug!("Public client {} connected to port {}", addr, port);
        sessions.spawn(handle_client(
            client,
            addr,
            ctx.clone(),
            sender.clone(),
            shutdown.child(),
        ));
    }

    drop(listener);
    sessions.close_all().await;
    drop(lease);
    info!("TCP listener on port {} closed", port);
}

async fn handle_client(
    client: TcpStream,
    addr: SocketAddr,
    ctx: ListenerContext,
    sender: ControlSender,
    shutdown: Shutdown,
) {
    match bridge_client(client, addr, &ctx, &sender, shutdown.clone()).await {
        Ok(()) => {}
        Err(e) if e.is_transient() => warn!("Dropping client {}: {}", addr, e),
        Err(e) => debug!("Dropping client {}: {}", addr, e),
    }
    shutdown.trigger();
}

/// Tunnel handshake for one client, then the session itself
async fn bridge_client(
    client: TcpStream,
    addr: SocketAddr,
    ctx: &ListenerContext,
    sender: &ControlSender,
    shutdown: Shutdown,
) -> Result<(), RelayError> {
    let opts = SocketOpts::from_tcp_config(&ctx.config.tcp);
    opts.hint(&client);

    let mut tunnel = PrivateTunnel::bind(&ctx.pool, ctx.config.listen_ip, shutdown.clone()).await?;
    sender.open_tunnel(tunnel.port(), client_ipv4(&addr)).await?;

    let (backend, _) = tunnel.accept(ctx.config.tunnel_accept_timeout()).await?;
    opts.hint(&backend);

    Session::new(
        client,
        addr,
        backend,
        tunnel.into_lease(),
        shutdown,
        ctx.config.buffer_size,
    )
    .run()
    .await;
    Ok(())
}

/// IPv4 form of a client address, if it has one
fn client_ipv4(addr: &SocketAddr) -> Option<Ipv4Addr> {
    match addr.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(ip) => ip.to_ipv4_mapped(),
    }
}
