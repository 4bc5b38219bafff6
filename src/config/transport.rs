//! Transport configuration types
//!
//! Socket tuning for TCP data paths and the UDP tunnel framing mode.

use crate::helper::MAX_DATAGRAM_SIZE;
use serde::{Deserialize, Serialize};

/// Default TCP_NODELAY setting
fn default_nodelay() -> bool {
    true
}

/// Default keepalive seconds
fn default_keepalive_secs() -> u64 {
    20
}

/// Default keepalive interval
fn default_keepalive_interval() -> u64 {
    8
}

/// TCP socket configuration applied to control, client and tunnel sockets
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TcpConfig {
    /// Enable TCP_NODELAY
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,

    /// TCP keepalive timeout in seconds
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// TCP keepalive interval in seconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            nodelay: default_nodelay(),
            keepalive_secs: default_keepalive_secs(),
            keepalive_interval: default_keepalive_interval(),
        }
    }
}

/// How datagrams are laid out on the UDP tunnel stream
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum UdpFraming {
    /// Payload bytes are written as-is; every tunnel read becomes one datagram
    #[default]
    #[serde(rename = "raw")]
    Raw,
    /// Every datagram is preceded by a big-endian u16 length
    #[serde(rename = "length_prefixed")]
    LengthPrefixed,
}

/// Default maximum datagram size
fn default_max_datagram_size() -> usize {
    MAX_DATAGRAM_SIZE
}

/// UDP listener configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UdpConfig {
    /// Tunnel stream framing
    #[serde(default)]
    pub framing: UdpFraming,

    /// Largest datagram relayed in either direction
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        UdpConfig {
            framing: UdpFraming::default(),
            max_datagram_size: default_max_datagram_size(),
        }
    }
}

impl UdpConfig {
    /// Validate the UDP configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_datagram_size == 0 || self.max_datagram_size > MAX_DATAGRAM_SIZE {
            return Err(format!(
                "max_datagram_size must be between 1 and {}",
                MAX_DATAGRAM_SIZE
            ));
        }
        Ok(())
    }
}
