//! Protocol type definitions
//!
//! Relay -> backend control frames and the backend's listen request.
//! Layouts are fixed; see [`super::codec`] for the byte-level format.

use std::fmt;
use std::net::Ipv4Addr;

/// Size of every control frame on the wire
pub const FRAME_SIZE: usize = 256;

/// Opcode announcing a freshly bound public port
pub const OPCODE_ANNOUNCE: u8 = 0;

/// Opcode asking the backend to dial a private tunnel port
pub const OPCODE_OPEN_TUNNEL: u8 = 1;

/// Offset of the big-endian u32 port field
pub const PORT_OFFSET: usize = 1;

/// Offset of the four biased IPv4 octets
pub const ADDR_OFFSET: usize = 128;

/// Value subtracted from every address octet before it is stored
pub const ADDR_BIAS: u8 = 128;

/// "No specific client": encodes to four zero bytes
pub const NO_CLIENT_ADDR: Ipv4Addr = Ipv4Addr::new(128, 128, 128, 128);

/// Size of the listen request a backend sends after connecting
pub const LISTEN_REQUEST_SIZE: usize = 5;

/// Control frame sent from the relay to a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFrame {
    /// A public port was bound for the backend (informational)
    Announce {
        /// Public port
        port: u32,
    },
    /// The backend should dial `port` to open a data tunnel
    OpenTunnel {
        /// Private tunnel port
        port: u32,
        /// Public client's IPv4 address, or [`NO_CLIENT_ADDR`]
        addr: Ipv4Addr,
    },
}

impl ControlFrame {
    /// Create an announce frame
    pub fn announce(port: u16) -> Self {
        ControlFrame::Announce { port: port.into() }
    }

    /// Create an open-tunnel frame
    ///
    /// `client` is the requesting public client, if there is one.
    pub fn open_tunnel(port: u16, client: Option<Ipv4Addr>) -> Self {
        ControlFrame::OpenTunnel {
            port: port.into(),
            addr: client.unwrap_or(NO_CLIENT_ADDR),
        }
    }

    /// Wire opcode of this frame
    pub fn opcode(&self) -> u8 {
        match self {
            ControlFrame::Announce { .. } => OPCODE_ANNOUNCE,
            ControlFrame::OpenTunnel { .. } => OPCODE_OPEN_TUNNEL,
        }
    }

    /// Port carried by the frame
    pub fn port(&self) -> u32 {
        match self {
            ControlFrame::Announce { port } | ControlFrame::OpenTunnel { port, .. } => *port,
        }
    }

    /// Client address of an open-tunnel frame, `None` for the sentinel
    pub fn client_addr(&self) -> Option<Ipv4Addr> {
        match self {
            ControlFrame::OpenTunnel { addr, .. } if *addr != NO_CLIENT_ADDR => Some(*addr),
            _ => None,
        }
    }
}

impl fmt::Display for ControlFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlFrame::Announce { port } => write!(f, "announce(port={})", port),
            ControlFrame::OpenTunnel { port, addr } => {
                write!(f, "open-tunnel(port={}, addr={})", port, addr)
            }
        }
    }
}

/// Transport protocol of a public listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// TCP: one tunnel per public client
    Tcp,
    /// UDP: one shared tunnel per listener
    Udp,
}

impl Protocol {
    /// Wire value used in the listen request
    pub fn as_u8(&self) -> u8 {
        match self {
            Protocol::Tcp => 0,
            Protocol::Udp => 1,
        }
    }
}

impl TryFrom<u8> for Protocol {
    type Error = crate::error::RelayError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Protocol::Tcp),
            1 => Ok(Protocol::Udp),
            other => Err(crate::error::RelayError::Protocol(format!(
                "unknown listener protocol {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// First message of a backend's control connection
///
/// Asks the relay to expose one service. A port of `0`, outside the pool or
/// already taken means "any free port".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenRequest {
    /// Listener protocol
    pub protocol: Protocol,
    /// Requested public port
    pub port: u32,
}

impl ListenRequest {
    /// Create a new listen request
    pub fn new(protocol: Protocol, port: u32) -> Self {
        ListenRequest { protocol, port }
    }

    /// Requested port if it fits a real port number
    pub fn requested_port(&self) -> Option<u16> {
        match u16::try_from(self.port) {
            Ok(0) | Err(_) => None,
            Ok(port) => Some(port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_constructors() {
        let frame = ControlFrame::announce(20000);
        assert_eq!(frame.opcode(), OPCODE_ANNOUNCE);
        assert_eq!(frame.port(), 20000);
        assert_eq!(frame.client_addr(), None);

        let frame = ControlFrame::open_tunnel(30000, Some(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(frame.opcode(), OPCODE_OPEN_TUNNEL);
        assert_eq!(frame.port(), 30000);
        assert_eq!(frame.client_addr(), Some(Ipv4Addr::new(1, 2, 3, 4)));
    }

    #[test]
    fn test_open_tunnel_without_client() {
        let frame = ControlFrame::open_tunnel(30000, None);
        assert_eq!(
            frame,
            ControlFrame::OpenTunnel {
                port: 30000,
                addr: NO_CLIENT_ADDR
            }
        );
        assert_eq!(frame.client_addr(), None);
    }

    #[test]
    fn test_frame_display() {
        assert_eq!(
            ControlFrame::announce(20000).to_string(),
            "announce(port=20000)"
        );
        assert_eq!(
            ControlFrame::open_tunnel(1, Some(Ipv4Addr::new(10, 0, 0, 1))).to_string(),
            "open-tunnel(port=1, addr=10.0.0.1)"
        );
    }

    #[test]
    fn test_protocol_from_u8() {
        assert_eq!(Protocol::try_from(0).unwrap(), Protocol::Tcp);
        assert_eq!(Protocol::try_from(1).unwrap(), Protocol::Udp);
        assert!(Protocol::try_from(2).is_err());
        assert_eq!(Protocol::Udp.as_u8(), 1);
        assert_eq!(Protocol::Tcp.to_string(), "tcp");
    }

    #[test]
    fn test_listen_request_requested_port() {
        assert_eq!(
            ListenRequest::new(Protocol::Tcp, 20000).requested_port(),
            Some(20000)
        );
        assert_eq!(ListenRequest::new(Protocol::Tcp, 0).requested_port(), None);
        assert_eq!(
            ListenRequest::new(Protocol::Udp, 70000).requested_port(),
            None
        );
    }
}
