//! Length-prefixed wire frames.
//!
//! Frame layout:
//!
//! ```text
//! +-------------+---------+--------------+---------------------+
//! | length      | version | header block | payload             |
//! | 4 bytes BE  | 1 byte  | (see headers)| length - header len |
//! +-------------+---------+--------------+---------------------+
//! ```
//!
//! `length` counts every byte after the prefix.

use crate::error::ProtocolError;
use crate::headers::{decode_headers, encoded_len, HeaderVersion, Headers, MIN_HEADER_SIZE};
use crate::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the big-endian length prefix.
pub const FRAME_PREFIX_SIZE: usize = 4;

/// Smallest well-formed frame: prefix, version byte and an empty header block.
pub const MIN_FRAME_SIZE: usize = FRAME_PREFIX_SIZE + MIN_HEADER_SIZE;

/// Returns the body of a complete frame after validating its length prefix.
pub fn frame_body(frame: &[u8]) -> Result<&[u8], ProtocolError> {
    if frame.len() < MIN_FRAME_SIZE {
        return Err(ProtocolError::FrameTooShort {
            len: frame.len(),
            min: MIN_FRAME_SIZE,
        });
    }
    let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    let body = &frame[FRAME_PREFIX_SIZE..];
    if declared != body.len() {
        return Err(ProtocolError::LengthPrefixMismatch {
            declared,
            actual: body.len(),
        });
    }
    Ok(body)
}

/// A decoded frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    /// Frame headers.
    pub headers: Headers,
    /// Opaque payload bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a new frame with no headers.
    pub fn new(payload: Bytes) -> Self {
        Self {
            headers: Headers::new(),
            payload,
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Size of the encoded frame, prefix included.
    pub fn encoded_len(&self) -> usize {
        FRAME_PREFIX_SIZE + encoded_len(&self.headers) + self.payload.len()
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let total = self.encoded_len();
        if total > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: total,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u32((total - FRAME_PREFIX_SIZE) as u32);
        HeaderVersion::CURRENT.marshal(&self.headers, &mut buf);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Parses one complete frame (length prefix included).
    pub fn parse(frame: &[u8]) -> Result<Self, ProtocolError> {
        let body = frame_body(frame)?;
        let (headers, consumed) = decode_headers(body)?;
        Ok(Self {
            headers,
            payload: Bytes::copy_from_slice(&body[consumed..]),
        })
    }

    /// Decodes a frame from a stream buffer.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on protocol errors.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_PREFIX_SIZE {
            return Ok(None);
        }

        let body_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if body_len + FRAME_PREFIX_SIZE > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: body_len + FRAME_PREFIX_SIZE,
                max: MAX_FRAME_SIZE,
            });
        }
        if body_len < MIN_HEADER_SIZE {
            return Err(ProtocolError::FrameTooShort {
                len: body_len + FRAME_PREFIX_SIZE,
                min: MIN_FRAME_SIZE,
            });
        }
        if buf.len() < FRAME_PREFIX_SIZE + body_len {
            return Ok(None);
        }

        buf.advance(FRAME_PREFIX_SIZE);
        let body = buf.split_to(body_len).freeze();
        let (headers, consumed) = decode_headers(&body)?;

        Ok(Some(Self {
            headers,
            payload: body.slice(consumed..),
        }))
    }
}
