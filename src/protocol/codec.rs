//! Frame codec.
//!
//! Every message travels as `[u32 little-endian length][body]`, where the body is the
//! bincode encoding of a [`Request`](super::Request) or [`Response`](super::Response).
//! The codec is stateless apart from [`FrameBuffer`], which reassembles frames when a
//! transport hands over an arbitrary slice of the byte stream.
use bincode::{
    Decode, Encode,
    config::{Configuration, Fixint, LittleEndian},
};

use crate::error::FramingError;

/// Size of the length prefix.
pub const LENGTH_PREFIX: usize = 4;

/// Largest body accepted in either direction (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub(crate) fn wire_config() -> Configuration<LittleEndian, Fixint> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

/// Prefix `body` with its length.
pub fn frame(body: &[u8]) -> Result<Vec<u8>, FramingError> {
    if body.len() > MAX_FRAME_SIZE {
        return Err(FramingError::TooLarge {
            size: body.len(),
            limit: MAX_FRAME_SIZE,
        });
    }

    let mut buf = Vec::with_capacity(LENGTH_PREFIX + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(body);
    Ok(buf)
}

/// Strip the length prefix from a single, complete frame.
pub fn unframe(frame: &[u8]) -> Result<&[u8], FramingError> {
    let declared = declared_length(frame)?;
    let body = &frame[LENGTH_PREFIX..];

    if declared != body.len() {
        return Err(FramingError::LengthMismatch {
            declared,
            actual: body.len(),
        });
    }
    Ok(body)
}

/// Encode a message into a complete frame.
pub fn encode<T: Encode>(message: &T) -> Result<Vec<u8>, FramingError> {
    let body = bincode::encode_to_vec(message, wire_config())
        .map_err(|e| FramingError::Encode(e.to_string()))?;
    frame(&body)
}

/// Decode a complete frame into a message.
pub fn decode<T: Decode<()>>(frame: &[u8]) -> Result<T, FramingError> {
    decode_body(unframe(frame)?)
}

/// Decode a frame body (length prefix already removed).
pub fn decode_body<T: Decode<()>>(body: &[u8]) -> Result<T, FramingError> {
    let (message, read) = bincode::decode_from_slice(body, wire_config())
        .map_err(|e| FramingError::SchemaViolation(e.to_string()))?;

    if read != body.len() {
        return Err(FramingError::SchemaViolation(format!(
            "{} trailing bytes after message",
            body.len() - read
        )));
    }
    Ok(message)
}

fn declared_length(bytes: &[u8]) -> Result<usize, FramingError> {
    let header: [u8; LENGTH_PREFIX] = bytes
        .get(..LENGTH_PREFIX)
        .and_then(|h| h.try_into().ok())
        .ok_or(FramingError::TruncatedHeader(bytes.len()))?;
    Ok(u32::from_le_bytes(header) as usize)
}

/// Accumulates raw stream bytes and yields complete frame bodies in arrival order.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    limit: usize,
}

impl FrameBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete body, or `None` until enough bytes have arrived.
    pub fn next_body(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        if self.buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let declared = declared_length(&self.buf)?;
        if declared > self.limit {
            return Err(FramingError::TooLarge {
                size: declared,
                limit: self.limit,
            });
        }

        let end = LENGTH_PREFIX + declared;
        if self.buf.len() < end {
            return Ok(None);
        }

        let body = self.buf[LENGTH_PREFIX..end].to_vec();
        self.buf.drain(..end);
        Ok(Some(body))
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}
