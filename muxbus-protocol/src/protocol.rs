//! Frame protocol handle: writes and reads context headers around payloads.

use crate::codec::PayloadCodec;
use crate::context::{Context, OPID_HEADER};
use crate::error::ProtocolError;
use crate::frame::{frame_body, FRAME_PREFIX_SIZE};
use crate::headers::{decode_headers, encoded_len, HeaderVersion, Headers};
use crate::MAX_FRAME_SIZE;
use bytes::{BufMut, Bytes, BytesMut};

/// Extracts the operation id that routes a frame to its caller.
///
/// A frame without a parsable `_opid` cannot be correlated and is rejected.
pub fn op_id_from_headers(headers: &Headers) -> Result<u64, ProtocolError> {
    let raw = headers
        .get(OPID_HEADER)
        .ok_or(ProtocolError::MissingHeader(OPID_HEADER))?;
    raw.parse::<u64>().map_err(|_| ProtocolError::InvalidHeader {
        name: OPID_HEADER,
        value: raw.clone(),
    })
}

/// Encodes request/response frames for a [`Context`].
#[derive(Debug, Clone, Copy)]
pub struct FrameProtocol {
    version: HeaderVersion,
}

impl Default for FrameProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameProtocol {
    pub fn new() -> Self {
        Self {
            version: HeaderVersion::CURRENT,
        }
    }

    pub fn version(&self) -> HeaderVersion {
        self.version
    }

    /// Returns the request header block (`[version][block]`) without a length prefix.
    pub fn request_header_block(&self, ctx: &Context) -> Bytes {
        self.header_block(&ctx.request_headers())
    }

    /// Returns the response header block (`[version][block]`) without a length prefix.
    pub fn response_header_block(&self, ctx: &Context) -> Bytes {
        self.header_block(&ctx.response_headers())
    }

    fn header_block(&self, headers: &Headers) -> Bytes {
        let mut buf = BytesMut::with_capacity(encoded_len(headers));
        self.version.marshal(headers, &mut buf);
        buf.freeze()
    }

    fn encode(&self, headers: &Headers, payload: &[u8]) -> Result<Bytes, ProtocolError> {
        let total = FRAME_PREFIX_SIZE + encoded_len(headers) + payload.len();
        if total > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: total,
                max: MAX_FRAME_SIZE,
            });
        }
        let mut buf = BytesMut::with_capacity(total);
        buf.put_u32((total - FRAME_PREFIX_SIZE) as u32);
        self.version.marshal(headers, &mut buf);
        buf.put_slice(payload);
        Ok(buf.freeze())
    }

    /// Frames `payload` behind the context's request headers.
    pub fn encode_request(&self, ctx: &Context, payload: &[u8]) -> Result<Bytes, ProtocolError> {
        self.encode(&ctx.request_headers(), payload)
    }

    /// Frames `payload` behind the context's response headers.
    pub fn encode_response(&self, ctx: &Context, payload: &[u8]) -> Result<Bytes, ProtocolError> {
        self.encode(&ctx.response_headers(), payload)
    }

    /// Decodes a request frame into a callee-side context and its payload.
    pub fn decode_request(&self, frame: &[u8]) -> Result<(Context, Bytes), ProtocolError> {
        let body = frame_body(frame)?;
        let (headers, consumed) = decode_headers(body)?;
        let op_id = op_id_from_headers(&headers)?;
        let ctx = Context::from_request(op_id, headers);
        Ok((ctx, Bytes::copy_from_slice(&body[consumed..])))
    }

    /// Decodes a response frame, merging its headers into `ctx`.
    pub fn decode_response(&self, ctx: &Context, frame: &[u8]) -> Result<Bytes, ProtocolError> {
        let body = frame_body(frame)?;
        let (headers, consumed) = decode_headers(body)?;
        ctx.merge_response_headers(headers);
        Ok(Bytes::copy_from_slice(&body[consumed..]))
    }

    pub fn encode_request_with<C: PayloadCodec>(
        &self,
        ctx: &Context,
        codec: &C,
        item: &C::Item,
    ) -> Result<Bytes, ProtocolError> {
        let mut payload = BytesMut::new();
        codec.encode(item, &mut payload)?;
        self.encode_request(ctx, &payload)
    }

    pub fn encode_response_with<C: PayloadCodec>(
        &self,
        ctx: &Context,
        codec: &C,
        item: &C::Item,
    ) -> Result<Bytes, ProtocolError> {
        let mut payload = BytesMut::new();
        codec.encode(item, &mut payload)?;
        self.encode_response(ctx, &payload)
    }

    pub fn decode_request_with<C: PayloadCodec>(
        &self,
        codec: &C,
        frame: &[u8],
    ) -> Result<(Context, C::Item), ProtocolError> {
        let (ctx, payload) = self.decode_request(frame)?;
        Ok((ctx, codec.decode(payload)?))
    }

    pub fn decode_response_with<C: PayloadCodec>(
        &self,
        ctx: &Context,
        codec: &C,
        frame: &[u8],
    ) -> Result<C::Item, ProtocolError> {
        let payload = self.decode_response(ctx, frame)?;
        codec.decode(payload)
    }
}
