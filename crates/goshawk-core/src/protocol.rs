//! Wire-level constants and parsing primitives.
//!
//! Every frame is a length-prefixed unit whose first byte after the prefix
//! selects a command. All multi-byte integers are big-endian. Strings are
//! NUL-terminated modified UTF-8: an embedded NUL character travels as the
//! two-byte form `C0 80` so the terminator stays unambiguous.

use bitflags::bitflags;
use bytes::{Buf, Bytes};

use crate::error::ProtocolError;

/// Command byte values.
///
/// A stable assignment starting at 0x10; both peers must agree on it.
pub mod cmd {
    pub const SERVICE_REQUEST: u8 = 0x10;
    pub const SERVICE_NOT_FOUND: u8 = 0x11;
    pub const SERVICE_ERROR: u8 = 0x12;
    pub const SERVICE_CLIENT_OPENED: u8 = 0x13;
    pub const CHANNEL_CLOSE: u8 = 0x14;
    pub const CLIENT_ASYNC_CLOSE: u8 = 0x15;
    pub const REQUEST: u8 = 0x16;
    pub const REQUEST_ABORT: u8 = 0x17;
    pub const REQUEST_ACK_CHUNK: u8 = 0x18;
    pub const REPLY: u8 = 0x19;
    pub const REPLY_ACK_CHUNK: u8 = 0x1A;
    pub const REPLY_EXCEPTION: u8 = 0x1B;
    pub const REPLY_EXCEPTION_ABORT: u8 = 0x1C;
    pub const ALIVE: u8 = 0x1D;
    pub const STREAM_DATA: u8 = 0x1E;
    pub const STREAM_CLOSE: u8 = 0x1F;
    pub const STREAM_EXCEPTION: u8 = 0x20;
    pub const STREAM_ACK: u8 = 0x21;
    pub const STREAM_ASYNC_START: u8 = 0x22;
    pub const STREAM_ASYNC_CLOSE: u8 = 0x23;
    pub const STREAM_ASYNC_EXCEPTION: u8 = 0x24;
}

bitflags! {
    /// Flags byte carried by REQUEST, REPLY and REPLY_EXCEPTION frames.
    ///
    /// Reserved bits must be zero on send and are ignored on receive.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MsgFlags: u8 {
        /// First frame of a multi-frame payload; establishes the per-id
        /// byte input that subsequent frames feed.
        const FIRST = 0b0000_0001;
    }
}

/// Four zero bytes written at the head of every composed frame.
///
/// The transport overwrites them with the frame length before transmission.
pub const LENGTH_PLACEHOLDER: [u8; 4] = [0; 4];

pub fn take_u8(frame: &mut Bytes) -> Result<u8, ProtocolError> {
    if frame.remaining() < 1 {
        return Err(ProtocolError::Truncated("u8"));
    }
    Ok(frame.get_u8())
}

pub fn take_u32(frame: &mut Bytes) -> Result<u32, ProtocolError> {
    if frame.remaining() < 4 {
        return Err(ProtocolError::Truncated("u32"));
    }
    Ok(frame.get_u32())
}

/// Read a NUL-terminated modified-UTF-8 string, consuming the terminator.
pub fn take_string_z(frame: &mut Bytes) -> Result<String, ProtocolError> {
    let nul = frame
        .iter()
        .position(|&b| b == 0)
        .ok_or(ProtocolError::Truncated("string terminator"))?;
    let raw = frame.split_to(nul);
    frame.advance(1);
    decode_modified_utf8(&raw)
}

/// Append a string in NUL-terminated modified-UTF-8 form.
pub fn put_string_z(out: &mut Vec<u8>, value: &str) {
    for &b in value.as_bytes() {
        if b == 0 {
            out.extend_from_slice(&[0xC0, 0x80]);
        } else {
            out.push(b);
        }
    }
    out.push(0);
}

fn decode_modified_utf8(raw: &[u8]) -> Result<String, ProtocolError> {
    let mut bytes = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == 0xC0 && raw.get(i + 1) == Some(&0x80) {
            bytes.push(0);
            i += 2;
        } else {
            bytes.push(raw[i]);
            i += 1;
        }
    }
    String::from_utf8(bytes).map_err(|_| ProtocolError::MalformedString)
}
