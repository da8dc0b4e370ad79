//! Versioned header block codec.
//!
//! Header block layout for version 0:
//!
//! ```text
//! +---------+------------+--------------------------------------------------+
//! | version | block_size | pairs                                            |
//! | 1 byte  | 4 bytes BE | (u32 name_len, name, u32 value_len, value) * N   |
//! +---------+------------+--------------------------------------------------+
//! ```
//!
//! `block_size` counts the pair bytes only. Every declared length is checked
//! against the bytes that remain before anything is sliced.

use crate::error::ProtocolError;
use crate::frame::{frame_body, FRAME_PREFIX_SIZE};
use crate::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

/// Header name to value map carried in every frame.
pub type Headers = HashMap<String, String>;

/// Size of the version tag plus the v0 block size field.
pub const MIN_HEADER_SIZE: usize = 1 + 4;

/// Header block version tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HeaderVersion {
    V0 = 0,
}

impl HeaderVersion {
    /// Version written by this implementation.
    pub const CURRENT: HeaderVersion = HeaderVersion::V0;

    /// Marshals `headers` into `[version][block]`.
    pub fn marshal(&self, headers: &Headers, buf: &mut impl BufMut) {
        match self {
            HeaderVersion::V0 => {
                buf.put_u8(*self as u8);
                buf.put_u32(pairs_len(headers) as u32);
                for (name, value) in headers {
                    buf.put_u32(name.len() as u32);
                    buf.put_slice(name.as_bytes());
                    buf.put_u32(value.len() as u32);
                    buf.put_slice(value.as_bytes());
                }
            }
        }
    }

    /// Unmarshals the block that follows the version byte.
    ///
    /// Returns the headers and the number of bytes consumed from `buf`.
    pub fn unmarshal(&self, buf: &[u8]) -> Result<(Headers, usize), ProtocolError> {
        match self {
            HeaderVersion::V0 => unmarshal_v0(buf),
        }
    }
}

impl TryFrom<u8> for HeaderVersion {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(HeaderVersion::V0),
            v => Err(ProtocolError::BadVersion(v)),
        }
    }
}

fn pairs_len(headers: &Headers) -> usize {
    headers
        .iter()
        .map(|(name, value)| 8 + name.len() + value.len())
        .sum()
}

/// Returns the encoded size of `headers` including version and size fields.
pub fn encoded_len(headers: &Headers) -> usize {
    MIN_HEADER_SIZE + pairs_len(headers)
}

/// Encodes `headers` with the current version.
pub fn encode_headers(headers: &Headers) -> Bytes {
    let mut buf = BytesMut::with_capacity(encoded_len(headers));
    HeaderVersion::CURRENT.marshal(headers, &mut buf);
    buf.freeze()
}

/// Decodes a header block starting at the version byte.
///
/// Returns the headers and the total bytes consumed (version byte included),
/// so the caller can find where the payload starts.
pub fn decode_headers(buf: &[u8]) -> Result<(Headers, usize), ProtocolError> {
    let Some((&tag, rest)) = buf.split_first() else {
        return Err(ProtocolError::FrameTooShort {
            len: 0,
            min: MIN_HEADER_SIZE,
        });
    };
    let version = HeaderVersion::try_from(tag)?;
    let (headers, consumed) = version.unmarshal(rest)?;
    Ok((headers, consumed + 1))
}

fn unmarshal_v0(buf: &[u8]) -> Result<(Headers, usize), ProtocolError> {
    let mut cursor = buf;
    let block_size = read_len(&mut cursor, "header block size")?;
    if block_size > cursor.remaining() {
        return Err(ProtocolError::SizeMismatch {
            field: "header block",
            declared: block_size,
            remaining: cursor.remaining(),
        });
    }

    let mut block = &cursor[..block_size];
    let mut headers = Headers::new();
    while block.has_remaining() {
        let name = read_string(&mut block, "header name")?;
        let value = read_string(&mut block, "header value")?;
        headers.insert(name, value);
    }

    Ok((headers, 4 + block_size))
}

fn read_len(cursor: &mut &[u8], field: &'static str) -> Result<usize, ProtocolError> {
    if cursor.remaining() < 4 {
        return Err(ProtocolError::SizeMismatch {
            field,
            declared: 4,
            remaining: cursor.remaining(),
        });
    }
    Ok(cursor.get_u32() as usize)
}

fn read_string(cursor: &mut &[u8], field: &'static str) -> Result<String, ProtocolError> {
    let len = read_len(cursor, field)?;
    if len > cursor.remaining() {
        return Err(ProtocolError::SizeMismatch {
            field,
            declared: len,
            remaining: cursor.remaining(),
        });
    }
    let raw = cursor[..len].to_vec();
    cursor.advance(len);
    String::from_utf8(raw).map_err(|_| ProtocolError::InvalidUtf8(field))
}

/// Reads the headers of a complete frame (length prefix included).
pub fn headers_from_frame(frame: &[u8]) -> Result<Headers, ProtocolError> {
    let body = frame_body(frame)?;
    let (headers, _) = decode_headers(body)?;
    Ok(headers)
}

/// Merges `extra` into the header block of an already framed buffer.
///
/// The payload bytes are copied through untouched and the length prefix is
/// recomputed. Names present in both maps take the value from `extra`.
pub fn add_headers_to_frame(frame: &[u8], extra: &Headers) -> Result<BytesMut, ProtocolError> {
    let body = frame_body(frame)?;
    let (mut headers, consumed) = decode_headers(body)?;
    let payload = &body[consumed..];

    for (name, value) in extra {
        headers.insert(name.clone(), value.clone());
    }

    let body_len = encoded_len(&headers) + payload.len();
    let total = FRAME_PREFIX_SIZE + body_len;
    if total > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: total,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut out = BytesMut::with_capacity(FRAME_PREFIX_SIZE + body_len);
    out.put_u32(body_len as u32);
    HeaderVersion::CURRENT.marshal(&headers, &mut out);
    out.put_slice(payload);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_headers() -> Headers {
        let mut headers = Headers::new();
        headers.insert("_cid".to_string(), "abc".to_string());
        headers.insert("_opid".to_string(), "42".to_string());
        headers.insert("foo".to_string(), "bar".to_string());
        headers
    }

    fn framed(headers: &Headers, payload: &[u8]) -> BytesMut {
        let mut out = BytesMut::new();
        out.put_u32((encoded_len(headers) + payload.len()) as u32);
        HeaderVersion::CURRENT.marshal(headers, &mut out);
        out.put_slice(payload);
        out
    }

    #[test]
    fn test_headers_roundtrip() {
        let headers = sample_headers();
        let encoded = encode_headers(&headers);
        assert_eq!(encoded.len(), encoded_len(&headers));

        let (decoded, consumed) = decode_headers(&encoded).unwrap();
        assert_eq!(decoded, headers);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_empty_headers() {
        let encoded = encode_headers(&Headers::new());
        assert_eq!(&encoded[..], &[0, 0, 0, 0, 0]);

        let (decoded, consumed) = decode_headers(&encoded).unwrap();
        assert!(decoded.is_empty());
        assert_eq!(consumed, MIN_HEADER_SIZE);
    }

    #[test]
    fn test_known_bytes() {
        let mut headers = Headers::new();
        headers.insert("a".to_string(), "bc".to_string());
        let encoded = encode_headers(&headers);
        assert_eq!(
            &encoded[..],
            &[0, 0, 0, 0, 11, 0, 0, 0, 1, b'a', 0, 0, 0, 2, b'b', b'c']
        );
    }

    #[test]
    fn test_bad_version() {
        let mut encoded = encode_headers(&sample_headers()).to_vec();
        encoded[0] = 3;
        let result = decode_headers(&encoded);
        assert!(matches!(result, Err(ProtocolError::BadVersion(3))));
    }

    #[test]
    fn test_block_size_exceeds_buffer() {
        // Declares 100 bytes of pairs but only carries 2
        let buf = [0u8, 0, 0, 0, 100, 1, 2];
        let result = decode_headers(&buf);
        assert!(matches!(
            result,
            Err(ProtocolError::SizeMismatch {
                field: "header block",
                declared: 100,
                ..
            })
        ));
    }

    #[test]
    fn test_name_length_exceeds_block() {
        // Block of 6 bytes whose name declares 50 bytes
        let buf = [0u8, 0, 0, 0, 6, 0, 0, 0, 50, b'x', b'y'];
        let result = decode_headers(&buf);
        assert!(matches!(
            result,
            Err(ProtocolError::SizeMismatch {
                field: "header name",
                declared: 50,
                remaining: 2,
            })
        ));
    }

    #[test]
    fn test_value_length_missing() {
        // Name is complete but the value length field is cut short
        let buf = [0u8, 0, 0, 0, 7, 0, 0, 0, 1, b'k', 0, 0];
        let result = decode_headers(&buf);
        assert!(matches!(
            result,
            Err(ProtocolError::SizeMismatch {
                field: "header value",
                ..
            })
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        let buf = [0u8, 0, 0, 0, 10, 0, 0, 0, 1, 0xFF, 0, 0, 0, 1, b'v'];
        let result = decode_headers(&buf);
        assert!(matches!(result, Err(ProtocolError::InvalidUtf8("header name"))));
    }

    #[test]
    fn test_empty_input() {
        let result = decode_headers(&[]);
        assert!(matches!(result, Err(ProtocolError::FrameTooShort { .. })));
    }

    #[test]
    fn test_headers_from_frame() {
        let headers = sample_headers();
        let frame = framed(&headers, b"payload");
        assert_eq!(headers_from_frame(&frame).unwrap(), headers);
    }

    #[test]
    fn test_add_headers_to_frame() {
        let headers = sample_headers();
        let frame = framed(&headers, b"opaque payload");

        let mut extra = Headers::new();
        extra.insert("_seq".to_string(), "7".to_string());
        extra.insert("foo".to_string(), "baz".to_string());

        let spliced = add_headers_to_frame(&frame, &extra).unwrap();
        let body = frame_body(&spliced).unwrap();
        let (merged, consumed) = decode_headers(body).unwrap();

        assert_eq!(merged.get("_seq").map(String::as_str), Some("7"));
        assert_eq!(merged.get("foo").map(String::as_str), Some("baz"));
        assert_eq!(merged.get("_cid").map(String::as_str), Some("abc"));
        assert_eq!(&body[consumed..], b"opaque payload");
    }

    #[test]
    fn test_add_headers_past_max_frame_size() {
        let empty = Headers::new();
        let payload = vec![0u8; MAX_FRAME_SIZE - FRAME_PREFIX_SIZE - encoded_len(&empty)];
        let frame = framed(&empty, &payload);
        assert_eq!(frame.len(), MAX_FRAME_SIZE);

        // Unchanged headers still fit
        assert_eq!(add_headers_to_frame(&frame, &empty).unwrap().len(), MAX_FRAME_SIZE);

        let mut extra = Headers::new();
        extra.insert("_seq".to_string(), "1".to_string());
        let err = add_headers_to_frame(&frame, &extra).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::FrameTooLarge { size, max } if size > max && max == MAX_FRAME_SIZE
        ));
    }

    #[test]
    fn test_add_headers_to_short_frame() {
        let result = add_headers_to_frame(&[0, 0, 0, 1, 0], &Headers::new());
        assert!(matches!(result, Err(ProtocolError::FrameTooShort { .. })));
    }

    proptest! {
        #[test]
        fn prop_headers_roundtrip(headers in proptest::collection::hash_map(".{0,16}", ".{0,32}", 0..8)) {
            let encoded = encode_headers(&headers);
            let (decoded, consumed) = decode_headers(&encoded).unwrap();
            prop_assert_eq!(decoded, headers);
            prop_assert_eq!(consumed, encoded.len());
        }

        #[test]
        fn prop_truncated_block_never_panics(
            headers in proptest::collection::hash_map("[a-z]{1,8}", "[a-z]{0,8}", 1..6),
            cut in 0usize..64,
        ) {
            let encoded = encode_headers(&headers);
            let cut = cut % encoded.len();
            // Every strict prefix is missing declared bytes and must be rejected
            prop_assert!(decode_headers(&encoded[..cut]).is_err());
        }

        #[test]
        fn prop_arbitrary_bytes_never_panic(buf in proptest::collection::vec(any::<u8>(), 0..128)) {
            if let Ok((_, consumed)) = decode_headers(&buf) {
                prop_assert!(consumed <= buf.len());
            }
        }

        #[test]
        fn prop_corrupted_length_fields(
            headers in proptest::collection::hash_map("[a-z]{1,8}", "[a-z]{1,8}", 1..4),
            offset in 1usize..64,
            byte in any::<u8>(),
        ) {
            let mut encoded = encode_headers(&headers).to_vec();
            let offset = offset % encoded.len();
            encoded[offset] = byte;
            if let Ok((_, consumed)) = decode_headers(&encoded) {
                prop_assert!(consumed <= encoded.len());
            }
        }
    }
}
