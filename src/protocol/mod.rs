//! Protocol module for Tunnelrat
//!
//! This module implements the relay's control protocol: fixed-size frames
//! sent to the backend over its control connection, the listen request the
//! backend sends first, and the optional chunk framing for UDP tunnels.

mod codec;
mod types;

pub use codec::{
    decode_frame, encode_frame, read_chunk, read_frame, read_listen_request, write_chunk,
    write_frame, write_listen_request,
};
pub use types::{
    ControlFrame, ListenRequest, Protocol, ADDR_BIAS, ADDR_OFFSET, FRAME_SIZE,
    LISTEN_REQUEST_SIZE, NO_CLIENT_ADDR, OPCODE_ANNOUNCE, OPCODE_OPEN_TUNNEL, PORT_OFFSET,
};
