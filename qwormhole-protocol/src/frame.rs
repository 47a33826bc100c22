//! Length-prefixed frame format.
//!
//! Frame layout (4 bytes header + payload):
//!
//! ```text
//! +----------------+---------------------+
//! | payload_len    | payload             |
//! | 4 bytes (BE)   | payload_len bytes   |
//! +----------------+---------------------+
//! ```
//!
//! There is no magic, padding or checksum. A zero-length payload is a valid
//! frame.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Encodes a payload into a single length-prefixed frame.
pub fn encode_frame(payload: &[u8], max_frame_length: u32) -> Result<BytesMut, ProtocolError> {
    let size = payload.len() as u64;
    if size > max_frame_length as u64 {
        return Err(ProtocolError::FrameTooLarge {
            size,
            max: max_frame_length,
        });
    }

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf)
}

/// Reads the declared payload length without consuming anything.
///
/// Returns `None` until all four header bytes are buffered.
pub fn peek_length(buf: &[u8]) -> Option<u32> {
    if buf.len() < FRAME_HEADER_SIZE {
        return None;
    }
    Some(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]))
}

/// Decodes one frame from the front of `buf`.
///
/// Returns `Ok(Some(payload))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` if the declared length
/// exceeds `max_frame_length`. The length check happens as soon as the
/// header is complete, before any payload bytes arrive.
pub fn decode_frame(buf: &mut BytesMut, max_frame_length: u32) -> Result<Option<Bytes>, ProtocolError> {
    let declared = match peek_length(buf) {
        Some(len) => len,
        None => return Ok(None),
    };

    if declared > max_frame_length {
        return Err(ProtocolError::FrameTooLarge {
            size: declared as u64,
            max: max_frame_length,
        });
    }

    let total_len = FRAME_HEADER_SIZE + declared as usize;
    if buf.len() < total_len {
        buf.reserve(total_len - buf.len());
        return Ok(None);
    }

    buf.advance(FRAME_HEADER_SIZE);
    Ok(Some(buf.split_to(declared as usize).freeze()))
}
