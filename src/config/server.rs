//! Server configuration types
//!
//! Defines the main configuration structures for the relay daemon.

use super::{PortRangeConfig, TcpConfig, UdpConfig};
use crate::helper::{
    duration_from_secs, DEFAULT_BUFFER_SIZE, DEFAULT_HANDSHAKE_TIMEOUT_SECS,
    DEFAULT_HEARTBEAT_TIMEOUT_SECS, DEFAULT_TUNNEL_ACCEPT_TIMEOUT_SECS,
    DEFAULT_WRITE_TIMEOUT_SECS,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Default control listener address
fn default_bind_addr() -> String {
    "0.0.0.0:7000".to_string()
}

/// Default IP for public and tunnel listeners
fn default_listen_ip() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

/// Default heartbeat timeout in seconds
fn default_heartbeat_timeout() -> u64 {
    DEFAULT_HEARTBEAT_TIMEOUT_SECS
}

/// Default handshake timeout in seconds
fn default_handshake_timeout() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_SECS
}

/// Default tunnel accept timeout in seconds
fn default_tunnel_accept_timeout() -> u64 {
    DEFAULT_TUNNEL_ACCEPT_TIMEOUT_SECS
}

/// Default control frame write timeout in seconds
fn default_write_timeout() -> u64 {
    DEFAULT_WRITE_TIMEOUT_SECS
}

/// Default pump buffer size
fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

/// Root configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
}

/// Relay daemon configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    /// Address backends connect to (e.g., "0.0.0.0:7000")
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// IP the public listeners and private tunnels bind to
    #[serde(default = "default_listen_ip")]
    pub listen_ip: IpAddr,

    /// Seconds without any byte on the control connection before it is presumed dead
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: u64,

    /// Seconds a new backend has to send its listen request
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,

    /// Seconds the backend has to dial a requested tunnel port
    #[serde(default = "default_tunnel_accept_timeout")]
    pub tunnel_accept_timeout: u64,

    /// Seconds a control frame write may take
    #[serde(default = "default_write_timeout")]
    pub write_timeout: u64,

    /// Copy buffer size for each pump direction
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Port range shared by public ports and tunnel ports
    #[serde(default)]
    pub ports: PortRangeConfig,

    /// TCP socket options
    #[serde(default)]
    pub tcp: TcpConfig,

    /// UDP listener options
    #[serde(default)]
    pub udp: UdpConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: default_bind_addr(),
            listen_ip: default_listen_ip(),
            heartbeat_timeout: default_heartbeat_timeout(),
            handshake_timeout: default_handshake_timeout(),
            tunnel_accept_timeout: default_tunnel_accept_timeout(),
            write_timeout: default_write_timeout(),
            buffer_size: default_buffer_size(),
            ports: PortRangeConfig::default(),
            tcp: TcpConfig::default(),
            udp: UdpConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Heartbeat timeout as a duration
    pub fn heartbeat_timeout(&self) -> Duration {
        duration_from_secs(self.heartbeat_timeout)
    }

    /// Handshake timeout as a duration
    pub fn handshake_timeout(&self) -> Duration {
        duration_from_secs(self.handshake_timeout)
    }

    /// Tunnel accept timeout as a duration
    pub fn tunnel_accept_timeout(&self) -> Duration {
        duration_from_secs(self.tunnel_accept_timeout)
    }

    /// Control frame write timeout as a duration
    pub fn write_timeout(&self) -> Duration {
        duration_from_secs(self.write_timeout)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.bind_addr.trim().is_empty() {
            return Err("bind_addr cannot be empty".to_string());
        }
        if self.heartbeat_timeout == 0 {
            return Err("heartbeat_timeout must be greater than 0".to_string());
        }
        if self.handshake_timeout == 0 {
            return Err("handshake_timeout must be greater than 0".to_string());
        }
        if self.tunnel_accept_timeout == 0 {
            return Err("tunnel_accept_timeout must be greater than 0".to_string());
        }
        if self.write_timeout == 0 {
            return Err("write_timeout must be greater than 0".to_string());
        }
        if self.buffer_size == 0 {
            return Err("buffer_size must be greater than 0".to_string());
        }
        self.ports.validate()?;
        self.udp.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.listen_ip, IpAddr::from([0, 0, 0, 0]));
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(40));
        assert_eq!(config.tunnel_accept_timeout(), Duration::from_secs(10));
        assert_eq!(config.buffer_size, 3_000_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_config_validate_timeouts() {
        let config = ServerConfig {
            heartbeat_timeout: 0,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("heartbeat_timeout"));

        let config = ServerConfig {
            tunnel_accept_timeout: 0,
            ..Default::default()
        };
        assert!(config
            .validate()
            .unwrap_err()
            .contains("tunnel_accept_timeout"));
    }

    #[test]
    fn test_server_config_validate_buffer() {
        let config = ServerConfig {
            buffer_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_config_validate_nested() {
        let config = ServerConfig {
            ports: PortRangeConfig {
                start: 20000,
                end: 10000,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_heartbeat_timeout() {
        assert_eq!(default_heartbeat_timeout(), 40);
    }
}
