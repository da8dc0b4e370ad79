//! Bounded framing buffer.

use crate::error::TransportError;
use bytes::{BufMut, Bytes, BytesMut};
use muxbus_protocol::FRAME_PREFIX_SIZE;

/// Accumulates a frame body behind a reserved 4-byte length prefix.
///
/// The limit counts the prefix. A write that would cross it fails with
/// [`TransportError::TooLarge`] and discards everything buffered so far, so
/// the next write starts from an empty frame. A limit of 0 disables the check.
#[derive(Debug)]
pub struct WriteBuffer {
    buf: BytesMut,
    limit: usize,
}

impl WriteBuffer {
    pub fn new(limit: usize) -> Self {
        let mut buf = BytesMut::with_capacity(1024);
        buf.put_u32(0);
        Self { buf, limit }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of body bytes buffered (prefix excluded).
    pub fn len(&self) -> usize {
        self.buf.len() - FRAME_PREFIX_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `data` to the frame body.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let size = self.buf.len() + data.len();
        if self.limit > 0 && size > self.limit {
            self.reset();
            return Err(TransportError::TooLarge {
                size,
                max: self.limit,
            });
        }
        self.buf.put_slice(data);
        Ok(data.len())
    }

    /// Discards buffered bytes.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.buf.put_u32(0);
    }

    /// Returns the complete frame and leaves the buffer empty.
    pub fn finish(&mut self) -> Bytes {
        let body_len = self.len() as u32;
        self.buf[..FRAME_PREFIX_SIZE].copy_from_slice(&body_len.to_be_bytes());
        let frame = self.buf.split().freeze();
        self.buf.put_u32(0);
        frame
    }
}
