//! Error types for Tunnelrat
//!
//! This module defines the error taxonomy shared by the relay machinery.
//! Failures local to one session or listener are contained; only
//! [`RelayError::ChannelLost`] cascades, and only within one backend.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Main error type for relay operations
#[derive(Error, Debug)]
pub enum RelayError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed control frame or listen request
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No free port left in the pool
    #[error("No free port in range {start}-{end}")]
    PortExhausted {
        /// First port of the pool range
        start: u16,
        /// Last port of the pool range
        end: u16,
    },

    /// The backend did not dial a tunnel port in time
    #[error("Backend did not dial tunnel port {port} within {timeout:?}")]
    TunnelTimeout {
        /// Tunnel port that was never dialed
        port: u16,
        /// Timeout that expired
        timeout: Duration,
    },

    /// The tunnel was closed while an accept was pending
    #[error("Tunnel on port {0} was closed")]
    TunnelClosed(u16),

    /// Control connection failed or reached end of stream
    #[error("Control channel lost: {0}")]
    ChannelLost(String),

    /// A data socket closed or errored mid-transfer
    #[error("Peer reset: {0}")]
    PeerReset(String),
}

impl RelayError {
    /// Whether the condition is a transient resource problem rather than a failure
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayError::PortExhausted { .. } | RelayError::TunnelTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_error_display() {
        let err = RelayError::Config("invalid config".to_string());
        assert_eq!(format!("{}", err), "Configuration error: invalid config");

        let err = RelayError::Protocol("bad opcode".to_string());
        assert_eq!(format!("{}", err), "Protocol error: bad opcode");

        let err = RelayError::PortExhausted {
            start: 10000,
            end: 60000,
        };
        assert_eq!(format!("{}", err), "No free port in range 10000-60000");

        let err = RelayError::TunnelTimeout {
            port: 12345,
            timeout: Duration::from_secs(10),
        };
        assert_eq!(
            format!("{}", err),
            "Backend did not dial tunnel port 12345 within 10s"
        );

        let err = RelayError::TunnelClosed(20000);
        assert_eq!(format!("{}", err), "Tunnel on port 20000 was closed");

        let err = RelayError::ChannelLost("eof".to_string());
        assert_eq!(format!("{}", err), "Control channel lost: eof");

        let err = RelayError::PeerReset("reset".to_string());
        assert_eq!(format!("{}", err), "Peer reset: reset");
    }

    #[test]
    fn test_relay_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::Other, "io error");
        let err: RelayError = io_err.into();
        assert!(matches!(err, RelayError::Io(_)));
    }

    #[test]
    fn test_transient_errors() {
        assert!(RelayError::PortExhausted { start: 1, end: 2 }.is_transient());
        assert!(RelayError::TunnelTimeout {
            port: 1,
            timeout: Duration::from_secs(1)
        }
        .is_transient());
        assert!(!RelayError::ChannelLost("x".into()).is_transient());
        assert!(!RelayError::TunnelClosed(1).is_transient());
    }
}
