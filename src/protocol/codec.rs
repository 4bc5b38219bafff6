//! Protocol codec for serialization and deserialization
//!
//! Control frame layout (256 bytes, unused bytes zero):
//!
//! ```text
//! offset 0      opcode        0 = announce, 1 = open tunnel
//! offset 1..5   port          big-endian u32
//! offset 128..  address       4 IPv4 octets, each stored as octet - 128
//! ```
//!
//! The listen request is 5 bytes: protocol byte followed by a big-endian
//! u32 port. UDP tunnels optionally carry datagrams as u16-length-prefixed
//! chunks.

use super::types::{
    ControlFrame, ListenRequest, Protocol, ADDR_BIAS, ADDR_OFFSET, FRAME_SIZE,
    LISTEN_REQUEST_SIZE, OPCODE_ANNOUNCE, OPCODE_OPEN_TUNNEL, PORT_OFFSET,
};
use crate::error::RelayError;
use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use std::io;
use std::net::Ipv4Addr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Encode a control frame into its fixed-size wire form
pub fn encode_frame(frame: &ControlFrame) -> [u8; FRAME_SIZE] {
    let mut buf = [0u8; FRAME_SIZE];
    buf[0] = frame.opcode();
    buf[PORT_OFFSET..PORT_OFFSET + 4].copy_from_slice(&frame.port().to_be_bytes());

    if let ControlFrame::OpenTunnel { addr, .. } = frame {
        for (i, octet) in addr.octets().iter().enumerate() {
            buf[ADDR_OFFSET + i] = octet.wrapping_sub(ADDR_BIAS);
        }
    }

    buf
}

/// Decode a control frame from its fixed-size wire form
pub fn decode_frame(buf: &[u8]) -> Result<ControlFrame, RelayError> {
    if buf.len() != FRAME_SIZE {
        return Err(RelayError::Protocol(format!(
            "control frame must be {} bytes, got {}",
            FRAME_SIZE,
            buf.len()
        )));
    }

    let mut port = [0u8; 4];
    port.copy_from_slice(&buf[PORT_OFFSET..PORT_OFFSET + 4]);
    let port = u32::from_be_bytes(port);

    match buf[0] {
        OPCODE_ANNOUNCE => Ok(ControlFrame::Announce { port }),
        OPCODE_OPEN_TUNNEL => {
            let b = &buf[ADDR_OFFSET..ADDR_OFFSET + 4];
            let addr = Ipv4Addr::new(
                b[0].wrapping_add(ADDR_BIAS),
                b[1].wrapping_add(ADDR_BIAS),
                b[2].wrapping_add(ADDR_BIAS),
                b[3].wrapping_add(ADDR_BIAS),
            );
            Ok(ControlFrame::OpenTunnel { port, addr })
        }
        other => Err(RelayError::Protocol(format!("unknown opcode {}", other))),
    }
}

/// Write a control frame to the stream
pub async fn write_frame<T: AsyncWrite + Unpin + ?Sized>(
    conn: &mut T,
    frame: &ControlFrame,
) -> Result<()> {
    let buf = encode_frame(frame);
    trace!("Write {}", frame);
    conn.write_all(&buf)
        .await
        .with_context(|| "Failed to write control frame")?;
    conn.flush()
        .await
        .with_context(|| "Failed to flush control frame")?;
    Ok(())
}

/// Read a control frame from the stream
pub async fn read_frame<T: AsyncRead + Unpin + ?Sized>(conn: &mut T) -> Result<ControlFrame> {
    let mut buf = [0u8; FRAME_SIZE];
    conn.read_exact(&mut buf)
        .await
        .with_context(|| "Failed to read control frame")?;
    decode_frame(&buf).with_context(|| "Failed to decode control frame")
}

/// Read the listen request a backend sends after connecting
pub async fn read_listen_request<T: AsyncRead + Unpin + ?Sized>(
    conn: &mut T,
) -> Result<ListenRequest> {
    let mut buf = [0u8; LISTEN_REQUEST_SIZE];
    conn.read_exact(&mut buf)
        .await
        .with_context(|| "Failed to read listen request")?;

    let protocol = Protocol::try_from(buf[0]).with_context(|| "Invalid listen request")?;
    let mut port = [0u8; 4];
    port.copy_from_slice(&buf[1..LISTEN_REQUEST_SIZE]);

    Ok(ListenRequest::new(protocol, u32::from_be_bytes(port)))
}

/// Write a listen request to the stream
pub async fn write_listen_request<T: AsyncWrite + Unpin + ?Sized>(
    conn: &mut T,
    request: &ListenRequest,
) -> Result<()> {
    let mut buf = [0u8; LISTEN_REQUEST_SIZE];
    buf[0] = request.protocol.as_u8();
    buf[1..].copy_from_slice(&request.port.to_be_bytes());
    conn.write_all(&buf)
        .await
        .with_context(|| "Failed to write listen request")?;
    conn.flush()
        .await
        .with_context(|| "Failed to flush listen request")?;
    Ok(())
}

/// Write one length-prefixed datagram chunk
pub async fn write_chunk<T: AsyncWrite + Unpin + ?Sized>(
    writer: &mut T,
    data: &[u8],
) -> io::Result<()> {
    let len = u16::try_from(data.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("chunk of {} bytes exceeds u16 length prefix", data.len()),
        )
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await
}

/// Read one length-prefixed datagram chunk
///
/// Returns `Ok(None)` on a clean end of stream.
pub async fn read_chunk<T: AsyncRead + Unpin + ?Sized>(reader: &mut T) -> io::Result<Option<Bytes>> {
    let mut len = [0u8; 2];
    match reader.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let mut data = BytesMut::new();
    data.resize(u16::from_be_bytes(len) as usize, 0);
    reader.read_exact(&mut data).await?;
    Ok(Some(data.freeze()))
}
