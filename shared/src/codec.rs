//! Length-prefixed codec for TCP framing
//!
//! All messages are framed as:
//! ```text
//! [ 4 bytes: length (u32, big-endian) ][ N bytes: JSON payload ]
//! ```
//!
//! The codec only preserves message boundaries. It never looks inside the
//! payload, so a malformed JSON body still decodes into a frame and is left to
//! the server to reject.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use thiserror::Error;

/// Maximum frame size (1 MiB) to prevent memory exhaustion
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Size of the length prefix in bytes
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("Invalid frame length prefix: {0}")]
    InvalidLength(u32),

    #[error("JSON encode error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a raw payload into a length-prefixed byte buffer
pub fn encode(payload: &[u8]) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    encode_into(payload, &mut buf)?;
    Ok(buf.freeze())
}

/// Serialize a value as JSON and frame it
pub fn encode_json<T: Serialize + ?Sized>(value: &T) -> Result<Bytes, CodecError> {
    let payload = serde_json::to_vec(value)?;
    encode(&payload)
}

/// Encode a payload directly into a provided buffer
pub fn encode_into(payload: &[u8], buf: &mut BytesMut) -> Result<(), CodecError> {
    if payload.len() > MAX_FRAME_SIZE as usize {
        return Err(CodecError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_LEN + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);

    Ok(())
}

/// Try to decode one length-prefixed payload from a buffer
///
/// Returns:
/// - `Ok(Some(payload))` if a complete frame was decoded
/// - `Ok(None)` if more data is needed
/// - `Err(...)` if the length prefix exceeds `max_len`
pub fn decode(buf: &mut BytesMut, max_len: u32) -> Result<Option<Bytes>, CodecError> {
    if buf.len() < LENGTH_PREFIX_LEN {
        return Ok(None);
    }

    // Peek at the length prefix without consuming
    let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);

    if frame_len > max_len {
        return Err(CodecError::InvalidLength(frame_len));
    }

    let total_len = LENGTH_PREFIX_LEN + frame_len as usize;
    if buf.len() < total_len {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_LEN);
    Ok(Some(buf.split_to(frame_len as usize).freeze()))
}

/// Decoder state machine for streaming decoding
#[derive(Debug)]
pub struct FrameDecoder {
    /// Partial frame data being accumulated
    buffer: BytesMut,
    max_len: u32,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a new frame decoder accepting frames up to `MAX_FRAME_SIZE`
    pub fn new() -> Self {
        Self::with_max_len(MAX_FRAME_SIZE)
    }

    /// Create a decoder with a tighter frame limit
    pub fn with_max_len(max_len: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_len: max_len.min(MAX_FRAME_SIZE),
        }
    }

    /// Add data to the decoder buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next frame from the buffer
    ///
    /// Call this repeatedly until it returns `Ok(None)` to drain all complete frames
    pub fn decode_next(&mut self) -> Result<Option<Bytes>, CodecError> {
        decode(&mut self.buffer, self.max_len)
    }

    /// Get the current buffer length (for debugging)
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}
