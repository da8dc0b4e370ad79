//! Payload codec seam.
//!
//! The runtime never interprets payloads. A [`PayloadCodec`] is how an
//! external serialization layer plugs into [`FrameProtocol`](crate::FrameProtocol).

use crate::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};

/// Encodes and decodes call arguments to and from payload bytes.
pub trait PayloadCodec: Send + Sync {
    type Item;

    fn encode(&self, item: &Self::Item, buf: &mut BytesMut) -> Result<(), ProtocolError>;

    fn decode(&self, payload: Bytes) -> Result<Self::Item, ProtocolError>;
}

/// Identity codec over raw bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl PayloadCodec for RawCodec {
    type Item = Bytes;

    fn encode(&self, item: &Bytes, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_slice(item);
        Ok(())
    }

    fn decode(&self, payload: Bytes) -> Result<Bytes, ProtocolError> {
        Ok(payload)
    }
}
