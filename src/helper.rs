//! Helper utilities for Tunnelrat
//!
//! Shared defaults and small conversions used throughout the application.

use std::time::Duration;

/// Default copy buffer for each Byte Pump direction
pub const DEFAULT_BUFFER_SIZE: usize = 3_000_000;

/// Default heartbeat timeout in seconds
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 40;

/// Default time the backend has to send its listen request
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Default time the backend has to dial a private tunnel port
pub const DEFAULT_TUNNEL_ACCEPT_TIMEOUT_SECS: u64 = 10;

/// Default bound on a single control frame write
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 10;

/// First port of the shared public/tunnel range
pub const DEFAULT_PORT_RANGE_START: u16 = 10000;

/// Last port of the shared public/tunnel range
pub const DEFAULT_PORT_RANGE_END: u16 = 60000;

/// Largest payload a single UDP/IPv4 datagram can carry
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// How many freshly allocated ports to try when a bind hits `AddrInUse`
pub const BIND_ATTEMPTS: usize = 8;

/// Parse duration from seconds
pub fn duration_from_secs(secs: u64) -> Duration {
    Duration::from_secs(secs)
}

/// Whether an IO error means the peer went away rather than a local fault
pub fn is_peer_reset(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_constants() {
        assert_eq!(DEFAULT_BUFFER_SIZE, 3_000_000);
        assert_eq!(DEFAULT_HEARTBEAT_TIMEOUT_SECS, 40);
        assert_eq!(DEFAULT_PORT_RANGE_START, 10000);
        assert_eq!(DEFAULT_PORT_RANGE_END, 60000);
        assert!(DEFAULT_PORT_RANGE_START < DEFAULT_PORT_RANGE_END);
    }

    #[test]
    fn test_duration_from_secs() {
        assert_eq!(duration_from_secs(5), Duration::from_secs(5));
        assert_eq!(duration_from_secs(0), Duration::from_secs(0));
        assert_eq!(duration_from_secs(3600), Duration::from_secs(3600));
    }

    #[test]
    fn test_is_peer_reset() {
        assert!(is_peer_reset(&io::Error::new(
            io::ErrorKind::ConnectionReset,
            "reset"
        )));
        assert!(is_peer_reset(&io::Error::new(io::ErrorKind::BrokenPipe, "pipe")));
        assert!(!is_peer_reset(&io::Error::new(
            io::ErrorKind::PermissionDenied,
            "denied"
        )));
    }
}
