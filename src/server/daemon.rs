//! Relay daemon
//!
//! Accepts backend control connections and runs one [`ControlChannel`] per
//! backend. A backend's failure never reaches the accept loop.

use super::control_channel::ControlChannel;
use crate::config::ServerConfig;
use crate::pool::PortPool;
use crate::protocol::read_listen_request;
use crate::shutdown::Shutdown;
use crate::tasks::TaskSet;
use crate::transport::SocketOpts;
use anyhow::{anyhow, Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Relay daemon bound to its control address
#[derive(Debug)]
pub struct Daemon {
    config: Arc<ServerConfig>,
    pool: Arc<PortPool>,
    listener: TcpListener,
    backends: Arc<TaskSet>,
}

impl Daemon {
    /// Validate `config` and bind the control listener
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let pool = PortPool::from_config(&config.ports);
        Self::with_pool(config, pool).await
    }

    /// Like [`bind`](Self::bind), drawing ports from an existing pool
    pub async fn with_pool(config: ServerConfig, pool: Arc<PortPool>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow!("Invalid configuration: {}", e))?;
        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind control listener on {}", config.bind_addr))?;

        Ok(Daemon {
            config: Arc::new(config),
            pool,
            listener,
            backends: TaskSet::new(),
        })
    }

    /// Address backends connect to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .with_context(|| "Failed to read control listener address")
    }

    /// Port pool shared by every backend
    pub fn pool(&self) -> &Arc<PortPool> {
        &self.pool
    }

    /// Number of backends currently connected
    pub fn channel_count(&self) -> usize {
        self.backends.len()
    }

    /// Accept backends until `shutdown_rx` fires
    ///
    /// On shutdown every control channel is closed and the call resolves
    /// once all of their ports are released.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<bool>) -> Result<()> {
        let addr = self.local_addr()?;
        info!("Tunnelrat listening for backends on {}", addr);
        info!(
            "Port range {}-{} ({} ports)",
            self.config.ports.start,
            self.config.ports.end,
            self.pool.capacity()
        );

        let shutdown = Shutdown::new();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping daemon");
                    break;
                }
                res = self.listener.accept() => match res {
                    Ok((stream, peer)) => {
                        self.backends.reap();
                        info!("Backend connected from {}", peer);
                        self.backends.spawn(serve_backend(
                            stream,
                            peer,
                            Arc::clone(&self.config),
                            Arc::clone(&self.pool),
                            shutdown.child(),
                        ));
                    }
                    Err(e) => {
                        error!("Failed to accept backend: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        shutdown.trigger();
        self.backends.close_all().await;
        self.pool.stats().log_health();
        info!("Daemon stopped");
        Ok(())
    }
}

/// One backend: handshake, expose, then watch the connection
async fn serve_backend(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<ServerConfig>,
    pool: Arc<PortPool>,
    shutdown: Shutdown,
) {
    SocketOpts::for_control_channel().hint(&stream);
    let (mut reader, writer) = stream.into_split();

    let handshake_timeout = config.handshake_timeout();
    let request = tokio::select! {
        biased;
        _ = shutdown.wait() => return,
        res = tokio::time::timeout(handshake_timeout, read_listen_request(&mut reader)) => match res {
            Ok(Ok(request)) => request,
            Ok(Err(e)) => {
                warn!("Backend {} sent no valid listen request: {:#}", peer, e);
                return;
            }
            Err(_) => {
                warn!("Backend {} sent no listen request within {:?}", peer, handshake_timeout);
                return;
            }
        },
    };
    debug!(
        "Backend {} requests {} port {}",
        peer, request.protocol, request.port
    );

    let channel = ControlChannel::new(peer, writer, config, pool, shutdown);
    match channel
        .expose(request.protocol, request.requested_port())
        .await
    {
        Ok(port) => {
            info!("Backend {} exposed on {} port {}", peer, request.protocol, port);
            if let Err(e) = channel.watch(reader).await {
                info!("Backend {} disconnected: {}", peer, e);
            }
        }
        Err(e) => warn!("Failed to expose {} for backend {}: {}", request.protocol, peer, e),
    }

    channel.close().await;
}
