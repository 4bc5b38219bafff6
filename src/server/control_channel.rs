//! Control channel management
//!
//! Owns one backend's control connection. Frames are written through a
//! single [`ControlSender`] so concurrent listeners never interleave partial
//! frames, and the read side is only watched for liveness. Losing the
//! connection either way tears down every listener the channel exposed.

use super::listener::PublicListener;
use super::tcp_listener::TcpPublicListener;
use super::udp_listener::UdpPublicListener;
use super::ListenerContext;
use crate::config::ServerConfig;
use crate::error::RelayError;
use crate::pool::PortPool;
use crate::protocol::{write_frame, ControlFrame, Protocol};
use crate::shutdown::Shutdown;
use anyhow::anyhow;
use futures::future::join_all;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, info, trace, warn};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Serialized writer for control frames
///
/// Cheap to clone; every listener of a channel holds one. A failed or
/// timed-out write triggers the channel's shutdown.
#[derive(Clone)]
pub struct ControlSender {
    inner: Arc<SenderInner>,
}

struct SenderInner {
    peer: SocketAddr,
    writer: tokio::sync::Mutex<BoxedWriter>,
    write_timeout: Duration,
    shutdown: Shutdown,
}

impl fmt::Debug for ControlSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlSender")
            .field("peer", &self.inner.peer)
            .field("write_timeout", &self.inner.write_timeout)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ControlSender {
    /// Wrap the write half of a control connection
    pub fn new<W>(peer: SocketAddr, writer: W, write_timeout: Duration, shutdown: Shutdown) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        ControlSender {
            inner: Arc::new(SenderInner {
                peer,
                writer: tokio::sync::Mutex::new(Box::new(writer)),
                write_timeout,
                shutdown,
            }),
        }
    }

    /// Write one frame
    ///
    /// Any failure is reported as [`RelayError::ChannelLost`] after the
    /// channel's shutdown has been triggered.
    pub async fn send(&self, frame: ControlFrame) -> Result<(), RelayError> {
        let inner = &self.inner;
        if inner.shutdown.is_triggered() {
            return Err(RelayError::ChannelLost("control channel closed".to_string()));
        }

        let mut writer = inner.writer.lock().await;
        let result = tokio::select! {
            biased;
            _ = inner.shutdown.wait() => Err(anyhow!("control channel closed")),
            res = tokio::time::timeout(inner.write_timeout, write_frame(&mut *writer, &frame)) => {
                match res {
                    Ok(res) => res,
                    Err(_) => Err(anyhow!("write timed out after {:?}", inner.write_timeout)),
                }
            }
        };
        drop(writer);

        match result {
            Ok(()) => {
                debug!("Sent {} to {}", frame, inner.peer);
                Ok(())
            }
            Err(e) => {
                if inner.shutdown.trigger() {
                    warn!("Failed to send {} to {}: {:#}", frame, inner.peer, e);
                }
                Err(RelayError::ChannelLost(format!("{:#}", e)))
            }
        }
    }

    /// Report a freshly bound public port
    pub async fn announce(&self, port: u16) -> Result<(), RelayError> {
        self.send(ControlFrame::announce(port)).await
    }

    /// Ask the backend to dial `tunnel_port`
    pub async fn open_tunnel(&self, tunnel_port: u16, client: Option<Ipv4Addr>) -> Result<(), RelayError> {
        self.send(ControlFrame::open_tunnel(tunnel_port, client)).await
    }

    /// Backend address
    pub fn peer(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Check whether the channel has been torn down
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_triggered()
    }
}

/// One backend's control connection and the listeners exposed for it
#[derive(Debug)]
pub struct ControlChannel {
    peer: SocketAddr,
    sender: ControlSender,
    ctx: ListenerContext,
    listeners: Mutex<Vec<Arc<dyn PublicListener>>>,
    shutdown: Shutdown,
}

impl ControlChannel {
    /// Create a channel over the write half of a backend connection
    pub fn new<W>(
        peer: SocketAddr,
        writer: W,
        config: Arc<ServerConfig>,
        pool: Arc<PortPool>,
        shutdown: Shutdown,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let sender = ControlSender::new(peer, writer, config.write_timeout(), shutdown.clone());
        ControlChannel {
            peer,
            sender,
            ctx: ListenerContext { config, pool },
            listeners: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    /// Expose a public listener and announce it
    ///
    /// `port` is honoured when it is in the pool range and free; otherwise a
    /// random free port is used. Returns the public port.
    pub async fn expose(&self, protocol: Protocol, port: Option<u16>) -> Result<u16, RelayError> {
        if self.shutdown.is_triggered() {
            return Err(RelayError::ChannelLost("control channel closed".to_string()));
        }
        self.prune();

        let shutdown = self.shutdown.child();
        let listener: Arc<dyn PublicListener> = match protocol {
            Protocol::Tcp => {
                let listener = TcpPublicListener::bind(self.ctx.clone(), shutdown, port).await?;
                self.announce(&listener).await?;
                listener.serve(self.sender.clone());
                Arc::new(listener)
            }
            Protocol::Udp => {
                let listener = UdpPublicListener::bind(self.ctx.clone(), shutdown, port).await?;
                self.announce(&listener).await?;
                listener.serve(self.sender.clone());
                Arc::new(listener)
            }
        };
        let public_port = listener.port();
        self.lock().push(Arc::clone(&listener));

        // close() may have drained the list while the listener was starting
        if self.shutdown.is_triggered() {
            listener.close().await;
            return Err(RelayError::ChannelLost("control channel closed".to_string()));
        }

        info!("Exposed {} port {} for {}", protocol, public_port, self.peer);
        Ok(public_port)
    }

    /// Send an announce frame for `listener`'s public port
    pub async fn announce(&self, listener: &dyn PublicListener) -> Result<(), RelayError> {
        self.sender.announce(listener.port()).await
    }

    /// Send an open-tunnel frame for a freshly bound tunnel port
    pub async fn open(&self, tunnel_port: u16, client: Option<Ipv4Addr>) -> Result<(), RelayError> {
        self.sender.open_tunnel(tunnel_port, client).await
    }

    /// Watch the read half for liveness until the channel ends
    ///
    /// Any byte counts as a heartbeat. End of stream, a read error or
    /// `heartbeat_timeout` of silence is [`RelayError::ChannelLost`]; a local
    /// [`close`](Self::close) returns `Ok`. Either way the channel's
    /// shutdown is triggered on return.
    pub async fn watch<R: AsyncRead + Unpin>(&self, mut reader: R) -> Result<(), RelayError> {
        let heartbeat_timeout = self.ctx.config.heartbeat_timeout();
        let mut buf = [0u8; 64];

        let result = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.wait() => break Ok(()),
                res = tokio::time::timeout(heartbeat_timeout, reader.read(&mut buf)) => match res {
                    Ok(Ok(0)) => {
                        break Err(RelayError::ChannelLost("backend closed the connection".to_string()))
                    }
                    Ok(Ok(n)) => trace!("{} heartbeat bytes from {}", n, self.peer),
                    Ok(Err(e)) => break Err(RelayError::ChannelLost(format!("read failed: {}", e))),
                    Err(_) => {
                        break Err(RelayError::ChannelLost(format!(
                            "heartbeat timeout - nothing received in {:?}",
                            heartbeat_timeout
                        )))
                    }
                },
            }
        };

        self.shutdown.trigger();
        result
    }

    /// Tear down every listener and release every port they hold
    ///
    /// Idempotent.
    pub async fn close(&self) {
        self.shutdown.trigger();
        let listeners: Vec<_> = self.lock().drain(..).collect();
        if listeners.is_empty() {
            return;
        }

        debug!("Closing {} listener(s) of {}", listeners.len(), self.peer);
        join_all(listeners.iter().map(|listener| listener.close())).await;
        info!("Control channel {} closed", self.peer);
    }

    /// Drop listeners that have already closed on their own
    pub fn prune(&self) -> usize {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|listener| !listener.is_closed());
        before - listeners.len()
    }

    /// Number of live listeners
    pub fn listener_count(&self) -> usize {
        self.lock().iter().filter(|l| !l.is_closed()).count()
    }

    /// Public ports of live listeners
    pub fn ports(&self) -> Vec<u16> {
        self.lock()
            .iter()
            .filter(|l| !l.is_closed())
            .map(|l| l.port())
            .collect()
    }

    /// Backend address
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Frame writer shared with the listeners
    pub fn sender(&self) -> &ControlSender {
        &self.sender
    }

    /// Check whether the channel has been torn down
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_triggered()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<dyn PublicListener>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortRangeConfig;
    use crate::protocol::read_frame;
    use std::net::IpAddr;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn test_config(start: u16, end: u16) -> Arc<ServerConfig> {
        Arc::new(ServerConfig {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            heartbeat_timeout: 1,
            write_timeout: 1,
            ports: PortRangeConfig { start, end },
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_sender_writes_whole_frames() {
        let (relay, mut backend) = duplex(4096);
        let sender = ControlSender::new(peer(), relay, Duration::from_secs(1), Shutdown::new());

        let tasks: Vec<_> = (0..8u16)
            .map(|i| {
                let sender = sender.clone();
                tokio::spawn(async move { sender.announce(20000 + i).await })
            })
            .collect();
        for result in join_all(tasks).await {
            result.unwrap().unwrap();
        }

        let mut ports = Vec::new();
        for _ in 0..8 {
            match read_frame(&mut backend).await.unwrap() {
                ControlFrame::Announce { port } => ports.push(port),
                other => panic!("unexpected frame {}", other),
            }
        }
        ports.sort_unstable();
        assert_eq!(ports, (20000..20008).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn test_sender_failure_triggers_shutdown() {
        let (relay, backend) = duplex(4096);
        let shutdown = Shutdown::new();
        let sender = ControlSender::new(peer(), relay, Duration::from_secs(1), shutdown.clone());
        drop(backend);

        let err = sender.open_tunnel(30000, None).await.unwrap_err();
        assert!(matches!(err, RelayError::ChannelLost(_)));
        assert!(shutdown.is_triggered());
        assert!(sender.is_closed());

        // Later sends fail fast
        assert!(matches!(
            sender.announce(30001).await,
            Err(RelayError::ChannelLost(_))
        ));
    }

    #[tokio::test]
    async fn test_sender_write_timeout() {
        // Buffer smaller than one frame and nobody reading
        let (relay, _backend) = duplex(16);
        let shutdown = Shutdown::new();
        let sender = ControlSender::new(peer(), relay, Duration::from_millis(50), shutdown.clone());

        let err = sender.announce(20000).await.unwrap_err();
        assert!(matches!(err, RelayError::ChannelLost(msg) if msg.contains("timed out")));
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_open_carries_client_addr() {
        let (relay, mut backend) = duplex(4096);
        let channel = ControlChannel::new(
            peer(),
            relay,
            test_config(13000, 13099),
            PortPool::new(13000..=13099),
            Shutdown::new(),
        );

        channel.open(13010, Some(Ipv4Addr::new(1, 2, 3, 4))).await.unwrap();
        let frame = read_frame(&mut backend).await.unwrap();
        assert_eq!(frame.port(), 13010);
        assert_eq!(frame.client_addr(), Some(Ipv4Addr::new(1, 2, 3, 4)));
    }

    #[tokio::test]
    async fn test_watch_eof_is_channel_lost() {
        let (relay, _backend) = duplex(4096);
        let (reader, mut writer) = duplex(64);
        let shutdown = Shutdown::new();
        let channel = ControlChannel::new(
            peer(),
            relay,
            test_config(13100, 13199),
            PortPool::new(13100..=13199),
            shutdown.clone(),
        );

        writer.write_all(b"\0").await.unwrap();
        drop(writer);

        let err = channel.watch(reader).await.unwrap_err();
        assert!(matches!(err, RelayError::ChannelLost(_)));
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_watch_heartbeat_timeout() {
        let (relay, _backend) = duplex(4096);
        let (reader, _writer) = duplex(64);
        let channel = ControlChannel::new(
            peer(),
            relay,
            test_config(13200, 13299),
            PortPool::new(13200..=13299),
            Shutdown::new(),
        );

        let err = tokio::time::timeout(Duration::from_secs(3), channel.watch(reader))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, RelayError::ChannelLost(msg) if msg.contains("heartbeat")));
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn test_watch_returns_on_local_close() {
        let (relay, _backend) = duplex(4096);
        let (reader, _writer) = duplex(64);
        let channel = Arc::new(ControlChannel::new(
            peer(),
            relay,
            test_config(13300, 13399),
            PortPool::new(13300..=13399),
            Shutdown::new(),
        ));

        let watcher = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.watch(reader).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        channel.close().await;

        let result = tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_expose_announces_and_close_releases() {
        let (relay, mut backend) = duplex(4096);
        let pool = PortPool::new(13400..=13499);
        let channel = ControlChannel::new(
            peer(),
            relay,
            test_config(13400, 13499),
            pool.clone(),
            Shutdown::new(),
        );

        let tcp_port = channel.expose(Protocol::Tcp, Some(13450)).await.unwrap();
        assert_eq!(tcp_port, 13450);
        assert_eq!(
            read_frame(&mut backend).await.unwrap(),
            ControlFrame::announce(13450)
        );

        let udp_port = channel.expose(Protocol::Udp, None).await.unwrap();
        assert_eq!(
            read_frame(&mut backend).await.unwrap(),
            ControlFrame::announce(udp_port)
        );
        // UDP asks for its tunnel straight away
        let open = read_frame(&mut backend).await.unwrap();
        assert!(matches!(open, ControlFrame::OpenTunnel { .. }));
        assert_eq!(open.client_addr(), None);

        assert_eq!(channel.listener_count(), 2);
        let mut ports = channel.ports();
        ports.sort_unstable();
        let mut expected = vec![tcp_port, udp_port];
        expected.sort_unstable();
        assert_eq!(ports, expected);
        assert_eq!(pool.available_count(), pool.capacity() - 3);

        // Public port is really listening
        TcpStream::connect(("127.0.0.1", tcp_port)).await.unwrap();

        channel.close().await;
        assert_eq!(channel.listener_count(), 0);
        assert_eq!(pool.available_count(), pool.capacity());
        assert!(matches!(
            channel.expose(Protocol::Tcp, None).await,
            Err(RelayError::ChannelLost(_))
        ));
    }

    #[tokio::test]
    async fn test_expose_fails_when_announce_fails() {
        let (relay, backend) = duplex(4096);
        let pool = PortPool::new(13500..=13599);
        let channel = ControlChannel::new(
            peer(),
            relay,
            test_config(13500, 13599),
            pool.clone(),
            Shutdown::new(),
        );
        drop(backend);

        let err = channel.expose(Protocol::Tcp, None).await.unwrap_err();
        assert!(matches!(err, RelayError::ChannelLost(_)));
        assert!(channel.is_closed());
        assert_eq!(pool.available_count(), pool.capacity());
    }

    #[tokio::test]
    async fn test_channel_loss_closes_every_listener_and_session() {
        let (relay, mut backend) = duplex(64 * 1024);
        let (reader, writer) = duplex(64);
        let pool = PortPool::new(13600..=13699);
        let channel = ControlChannel::new(
            peer(),
            relay,
            test_config(13600, 13699),
            pool.clone(),
            Shutdown::new(),
        );

        let mut public_ports = Vec::new();
        for _ in 0..3 {
            let port = channel.expose(Protocol::Tcp, None).await.unwrap();
            assert_eq!(
                read_frame(&mut backend).await.unwrap(),
                ControlFrame::announce(port)
            );
            public_ports.push(port);
        }

        let mut sessions = Vec::new();
        for port in &public_ports {
            for i in 0..3u8 {
                let mut client = TcpStream::connect(("127.0.0.1", *port)).await.unwrap();
                let frame = read_frame(&mut backend).await.unwrap();
                assert!(matches!(frame, ControlFrame::OpenTunnel { .. }));
                let mut tunnel = TcpStream::connect(("127.0.0.1", frame.port() as u16))
                    .await
                    .unwrap();

                client.write_all(&[i]).await.unwrap();
                let mut buf = [0u8; 1];
                tunnel.read_exact(&mut buf).await.unwrap();
                assert_eq!(buf, [i]);
                sessions.push((client, tunnel));
            }
        }
        assert_eq!(channel.listener_count(), 3);
        assert_eq!(pool.available_count(), pool.capacity() - 12);

        drop(writer);
        let err = channel.watch(reader).await.unwrap_err();
        assert!(matches!(err, RelayError::ChannelLost(_)));
        channel.close().await;

        let mut closed = 0;
        for (mut client, mut tunnel) in sessions {
            let mut buf = [0u8; 1];
            let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
                .await
                .unwrap()
                .unwrap_or(0);
            assert_eq!(n, 0);
            let n = tokio::time::timeout(Duration::from_secs(2), tunnel.read(&mut buf))
                .await
                .unwrap()
                .unwrap_or(0);
            assert_eq!(n, 0);
            closed += 1;
        }
        assert_eq!(closed, 9);
        assert_eq!(channel.listener_count(), 0);
        assert_eq!(pool.available_count(), pool.capacity());
    }
}
