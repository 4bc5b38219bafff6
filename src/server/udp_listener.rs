//! UDP public listener
//!
//! All public senders share one tunnel connection to the backend. The
//! tunnel stream carries no addressing, so replies go to whoever sent the
//! most recent datagram; only single-client traffic is relayed correctly.

use super::control_channel::ControlSender;
use super::listener::{ListenerCore, ListenerState, PublicListener};
use super::private_tunnel::PrivateTunnel;
use super::{bind_leased, ListenerContext};
use crate::config::UdpFraming;
use crate::error::RelayError;
use crate::helper::{is_peer_reset, MAX_DATAGRAM_SIZE};
use crate::pool::PortLease;
use crate::protocol::{read_chunk, write_chunk, Protocol};
use crate::shutdown::Shutdown;
use crate::transport::{bind_udp, SocketOpts};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Public UDP service exposed for one backend
#[derive(Debug)]
pub struct UdpPublicListener {
    core: Arc<ListenerCore>,
    ctx: ListenerContext,
    tunnel_port: u16,
    bound: Mutex<Option<Bound>>,
}

/// Sockets held between bind and serve
#[derive(Debug)]
struct Bound {
    lease: PortLease,
    socket: UdpSocket,
    tunnel: PrivateTunnel,
}

impl UdpPublicListener {
    /// Allocate and bind the public socket and its private tunnel
    pub(crate) async fn bind(
        ctx: ListenerContext,
        shutdown: Shutdown,
        preferred: Option<u16>,
    ) -> Result<Self, RelayError> {
        let ip = ctx.config.listen_ip;
        let (lease, socket) = bind_leased(&ctx.pool, preferred, |port| bind_udp(ip, port)).await?;
        let tunnel = PrivateTunnel::bind(&ctx.pool, ip, shutdown.clone()).await?;
        debug!(
            "UDP public port {}:{} bound, tunnel port {}",
            ip,
            lease.port(),
            tunnel.port()
        );

        Ok(UdpPublicListener {
            core: Arc::new(ListenerCore::new(Protocol::Udp, lease.port(), shutdown)),
            ctx,
            tunnel_port: tunnel.port(),
            bound: Mutex::new(Some(Bound {
                lease,
                socket,
                tunnel,
            })),
        })
    }

    /// Ask the backend for the tunnel and start relaying once it dials in
    ///
    /// Only the first call has an effect. The listener moves to `Listening`
    /// when the tunnel is established and closes itself if it never is.
    pub(crate) fn serve(&self, sender: ControlSender) {
        let bound = self.bound.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(bound) = bound else {
            return;
        };

        let handle = tokio::spawn(run(bound, self.ctx.clone(), sender, Arc::clone(&self.core)));
        self.core.set_task(handle);
    }

    /// Port the backend dials for the shared tunnel
    pub fn tunnel_port(&self) -> u16 {
        self.tunnel_port
    }
}

#[async_trait]
impl PublicListener for UdpPublicListener {
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
        drop(self.bound.lock().unwrap_or_else(PoisonError::into_inner).take());
        self.core.close().await;
    }
}

async fn run(bound: Bound, ctx: ListenerContext, sender: ControlSender, core: Arc<ListenerCore>) {
    let Bound {
        lease,
        socket,
        mut tunnel,
    } = bound;
    let port = lease.port();
    let shutdown = core.shutdown().clone();

    let stream = match open_tunnel(&mut tunnel, &ctx, &sender).await {
        Ok(stream) => stream,
        Err(e) => {
            match e {
                RelayError::TunnelClosed(_) | RelayError::ChannelLost(_) => {
                    debug!("UDP listener on port {} stopped before its tunnel opened: {}", port, e)
                }
                _ => warn!("UDP listener on port {} has no tunnel: {}", port, e),
            }
            shutdown.trigger();
            return;
        }
    };
    let tunnel_lease = tunnel.into_lease();
    SocketOpts::from_tcp_config(&ctx.config.tcp).hint(&stream);
    core.set_listening();
    info!(
        "UDP listener on port {} serving {} through tunnel port {}",
        port,
        sender.peer(),
        tunnel_lease.port()
    );

    let udp = &ctx.config.udp;
    let socket = Arc::new(socket);
    let (reader, writer) = stream.into_split();
    let (target_tx, target_rx) = watch::channel(None);

    let inbound = tokio::spawn(inbound(
        Arc::clone(&socket),
        writer,
        target_tx,
        udp.framing,
        shutdown.clone(),
    ));
    let outbound = tokio::spawn(outbound(
        socket,
        reader,
        target_rx,
        udp.framing,
        ctx.config.buffer_size.min(udp.max_datagram_size),
        shutdown.clone(),
    ));

    let (inbound, outbound) = tokio::join!(inbound, outbound);
    shutdown.trigger();
    let upstream = inbound.unwrap_or_else(|e| {
        warn!("UDP inbound pump on port {} ended abnormally: {}", port, e);
        0
    });
    let downstream = outbound.unwrap_or_else(|e| {
        warn!("UDP outbound pump on port {} ended abnormally: {}", port, e);
        0
    });

    drop(tunnel_lease);
    drop(lease);
    info!(
        "UDP listener on port {} closed (up {} bytes, down {} bytes)",
        port, upstream, downstream
    );
}

async fn open_tunnel(
    tunnel: &mut PrivateTunnel,
    ctx: &ListenerContext,
    sender: &ControlSender,
) -> Result<tokio::net::TcpStream, RelayError> {
    sender.open_tunnel(tunnel.port(), None).await?;
    let (stream, _) = tunnel.accept(ctx.config.tunnel_accept_timeout()).await?;
    Ok(stream)
}

/// Public datagrams -> tunnel stream
async fn inbound(
    socket: Arc<UdpSocket>,
    mut tunnel: OwnedWriteHalf,
    target: watch::Sender<Option<SocketAddr>>,
    framing: UdpFraming,
    shutdown: Shutdown,
) -> u64 {
    // Large enough that no datagram is truncated
    let mut buf = vec![0u8; u16::MAX as usize];
    let mut bytes = 0u64;

    loop {
        let (n, from) = tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            res = socket.recv_from(&mut buf) => match res {
                Ok(received) => received,
                Err(e) if is_peer_reset(&e) || e.kind() == io::ErrorKind::ConnectionRefused => {
                    trace!("Ignoring UDP receive error: {}", e);
                    continue;
                }
                Err(e) => {
                    warn!("UDP receive failed: {}", e);
                    break;
                }
            },
        };

        target.send_if_modified(|last| {
            if *last == Some(from) {
                false
            } else {
                trace!("UDP reply target is now {}", from);
                *last = Some(from);
                true
            }
        });

        let written = tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            res = write_datagram(&mut tunnel, &buf[..n], framing) => res,
        };
        if let Err(e) = written {
            debug!("UDP tunnel write failed: {}", e);
            break;
        }
        bytes += n as u64;
    }

    shutdown.trigger();
    bytes
}

/// Tunnel stream -> datagrams to the most recent public sender
async fn outbound(
    socket: Arc<UdpSocket>,
    mut tunnel: OwnedReadHalf,
    target: watch::Receiver<Option<SocketAddr>>,
    framing: UdpFraming,
    read_size: usize,
    shutdown: Shutdown,
) -> u64 {
    let mut buf = vec![0u8; read_size.clamp(1, MAX_DATAGRAM_SIZE)];
    let mut bytes = 0u64;

    loop {
        let datagram = tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            res = read_datagram(&mut tunnel, &mut buf, framing) => match res {
                Ok(Some(datagram)) => datagram,
                Ok(None) => {
                    debug!("Backend closed the UDP tunnel");
                    break;
                }
                Err(e) => {
                    debug!("UDP tunnel read failed: {}", e);
                    break;
                }
            },
        };

        let last = *target.borrow();
        let Some(to) = last else {
            debug!("Dropping {} byte reply, no public sender yet", datagram.len());
            continue;
        };
        tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            res = socket.send_to(&datagram, to) => match res {
                Ok(n) => bytes += n as u64,
                Err(e) => warn!("Failed to send {} byte datagram to {}: {}", datagram.len(), to, e),
            },
        }
    }

    shutdown.trigger();
    bytes
}

async fn write_datagram<W>(tunnel: &mut W, payload: &[u8], framing: UdpFraming) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match framing {
        UdpFraming::Raw => {
            tunnel.write_all(payload).await?;
            tunnel.flush().await
        }
        UdpFraming::LengthPrefixed => write_chunk(tunnel, payload).await,
    }
}

/// Next reply datagram; `None` on end of stream
///
/// Raw framing sends whatever one read returns as one datagram.
async fn read_datagram<R>(
    tunnel: &mut R,
    buf: &mut [u8],
    framing: UdpFraming,
) -> io::Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    match framing {
        UdpFraming::Raw => match tunnel.read(buf).await? {
            0 => Ok(None),
            n => Ok(Some(Bytes::copy_from_slice(&buf[..n]))),
        },
        UdpFraming::LengthPrefixed => read_chunk(tunnel).await,
    }
}
