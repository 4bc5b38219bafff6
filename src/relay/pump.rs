//! Byte pump
//!
//! Unidirectional copy from a source stream to a sink, the building block of
//! every data path. A pump ends on end-of-stream, on an error on either side,
//! or when its owner's [`Shutdown`] fires, and it triggers that same handle on
//! the way out so the opposite direction is torn down with it.

use crate::error::RelayError;
use crate::shutdown::Shutdown;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Why a pump stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// The source reached end of stream
    Eof,
    /// Reading or writing failed
    Error(io::ErrorKind),
    /// The owner shut the pump down
    Cancelled,
}

/// Result of a finished pump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpOutcome {
    /// Bytes forwarded to the sink
    pub bytes: u64,
    /// Termination reason
    pub end: PumpEnd,
}

impl PumpOutcome {
    /// Failure that ended the pump, if any
    pub fn error(&self) -> Option<RelayError> {
        match self.end {
            PumpEnd::Error(kind) => Some(RelayError::PeerReset(io::Error::from(kind).to_string())),
            PumpEnd::Eof | PumpEnd::Cancelled => None,
        }
    }
}

/// Copy `src` into `dst` until end of stream, error or shutdown
///
/// Uses one `buffer_size` buffer; bytes are forwarded in the order they are
/// read. `shutdown` is triggered when the pump returns.
pub async fn pump<R, W>(mut src: R, mut dst: W, buffer_size: usize, shutdown: &Shutdown) -> PumpOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut bytes = 0u64;

    let end = loop {
        let n = tokio::select! {
            biased;
            _ = shutdown.wait() => break PumpEnd::Cancelled,
            res = src.read(&mut buf) => match res {
                Ok(0) => break PumpEnd::Eof,
                Ok(n) => n,
                Err(e) => break PumpEnd::Error(e.kind()),
            },
        };

        let written = tokio::select! {
            biased;
            _ = shutdown.wait() => break PumpEnd::Cancelled,
            res = async {
                dst.write_all(&buf[..n]).await?;
                dst.flush().await
            } => res,
        };
        if let Err(e) = written {
            break PumpEnd::Error(e.kind());
        }
        bytes += n as u64;
    };

    shutdown.trigger();
    PumpOutcome { bytes, end }
}
