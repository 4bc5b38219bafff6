//! Test utilities and mocks for Tunnelrat
//!
//! This module provides common test utilities used across integration tests:
//! a daemon running on loopback and a simulated backend speaking the control
//! protocol.

#![allow(dead_code)]

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tunnelrat::config::{PortRangeConfig, ServerConfig, UdpConfig, UdpFraming};
use tunnelrat::pool::PortPool;
use tunnelrat::protocol::{
    read_frame, write_listen_request, ControlFrame, ListenRequest, Protocol, OPCODE_OPEN_TUNNEL,
};
use tunnelrat::server::Daemon;

/// Poll `condition` until it holds, panicking after `timeout`
pub async fn wait_until<F>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// Await `fut`, panicking after `timeout`
pub async fn within<F: Future>(timeout: Duration, fut: F) -> F::Output {
    tokio::time::timeout(timeout, fut)
        .await
        .expect("operation timed out")
}

/// Test configuration builder
pub struct TestConfigBuilder {
    ports: (u16, u16),
    heartbeat_timeout: u64,
    tunnel_accept_timeout: u64,
    framing: UdpFraming,
}

impl TestConfigBuilder {
    /// Create a new test config builder over a port range
    pub fn new(start: u16, end: u16) -> Self {
        TestConfigBuilder {
            ports: (start, end),
            heartbeat_timeout: 40,
            tunnel_accept_timeout: 10,
            framing: UdpFraming::Raw,
        }
    }

    /// Set heartbeat timeout
    pub fn heartbeat_timeout(mut self, secs: u64) -> Self {
        self.heartbeat_timeout = secs;
        self
    }

    /// Set tunnel accept timeout
    pub fn tunnel_accept_timeout(mut self, secs: u64) -> Self {
        self.tunnel_accept_timeout = secs;
        self
    }

    /// Set UDP tunnel framing
    pub fn framing(mut self, framing: UdpFraming) -> Self {
        self.framing = framing;
        self
    }

    /// Build the configuration
    pub fn build(self) -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            heartbeat_timeout: self.heartbeat_timeout,
            handshake_timeout: 5,
            tunnel_accept_timeout: self.tunnel_accept_timeout,
            buffer_size: 64 * 1024,
            ports: PortRangeConfig {
                start: self.ports.0,
                end: self.ports.1,
            },
            udp: UdpConfig {
                framing: self.framing,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Daemon running in the background
pub struct TestDaemon {
    /// Control address
    pub addr: SocketAddr,
    /// Pool the daemon allocates from
    pub pool: Arc<PortPool>,
    shutdown_tx: broadcast::Sender<bool>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestDaemon {
    /// Bind and run a daemon
    pub async fn start(config: ServerConfig) -> Self {
        let daemon = Daemon::bind(config).await.unwrap();
        let addr = daemon.local_addr().unwrap();
        let pool = daemon.pool().clone();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(daemon.run(shutdown_rx));
        TestDaemon {
            addr,
            pool,
            shutdown_tx,
            handle,
        }
    }

    /// Check that every port is back in the pool
    pub fn all_ports_free(&self) -> bool {
        self.pool.available_count() == self.pool.capacity()
    }

    /// Stop the daemon and wait for it
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        within(Duration::from_secs(5), self.handle)
            .await
            .unwrap()
            .unwrap();
    }
}

/// Simulated backend holding a control connection
pub struct MockBackend {
    /// Control connection
    pub control: TcpStream,
    /// Public port announced by the relay
    pub public_port: u16,
}

impl MockBackend {
    /// Connect, send a listen request and wait for the announce frame
    pub async fn connect(addr: SocketAddr, protocol: Protocol, port: u32) -> Self {
        let mut control = TcpStream::connect(addr).await.unwrap();
        write_listen_request(&mut control, &ListenRequest::new(protocol, port))
            .await
            .unwrap();

        let frame = within(Duration::from_secs(5), read_frame(&mut control))
            .await
            .unwrap();
        let public_port = match frame {
            ControlFrame::Announce { port } => port as u16,
            other => panic!("expected announce, got {}", other),
        };
        MockBackend {
            control,
            public_port,
        }
    }

    /// Wait for the next open-tunnel frame
    pub async fn next_open_tunnel(&mut self) -> (u16, Option<Ipv4Addr>) {
        let frame = within(Duration::from_secs(5), read_frame(&mut self.control))
            .await
            .unwrap();
        assert_eq!(frame.opcode(), OPCODE_OPEN_TUNNEL, "unexpected frame {}", frame);
        (frame.port() as u16, frame.client_addr())
    }

    /// Wait for an open-tunnel frame and dial the requested port
    pub async fn accept_tunnel(&mut self) -> TcpStream {
        let (port, _) = self.next_open_tunnel().await;
        TcpStream::connect(("127.0.0.1", port)).await.unwrap()
    }

    /// Send a liveness byte
    pub async fn heartbeat(&mut self) {
        self.control.write_all(&[0]).await.unwrap();
    }
}

/// Connect a public TCP client to `port` on loopback
pub async fn connect_public(port: u16) -> TcpStream {
    TcpStream::connect(("127.0.0.1", port)).await.unwrap()
}
