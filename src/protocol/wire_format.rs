//! Wire format encoding and decoding.
//!
//! Implements the 22-byte ASCII header:
//! ```text
//! ┌──────────┬──────────────┬────────────────┐
//! │ Marker   │ Request ID   │ Payload length │
//! │ "START_" │ 8 dec digits │ 8 dec digits   │
//! │ 6 bytes  │ zero-padded  │ zero-padded    │
//! └──────────┴──────────────┴────────────────┘
//! ```
//!
//! The header is followed by the payload. Responses additionally end with
//! the literal `END_OF_MESSAGE`, which is not counted in the payload length.

use std::ops::Range;

use crate::error::{PipeIpcError, Result};

/// Marker opening every frame.
pub const START_MARKER: &[u8; 6] = b"START_";

/// Marker closing every response frame.
pub const END_MARKER: &[u8; 14] = b"END_OF_MESSAGE";

/// Number of decimal digits in each numeric header field.
pub const FIELD_DIGITS: usize = 8;

/// Header size in bytes (fixed, exactly 22).
pub const HEADER_SIZE: usize = START_MARKER.len() + 2 * FIELD_DIGITS;

/// Largest value an 8-digit field can carry.
pub const MAX_FIELD_VALUE: u64 = 99_999_999;

/// Largest payload the length field can describe.
pub const MAX_PAYLOAD_SIZE: usize = MAX_FIELD_VALUE as usize;

/// Byte range of the request id field within the header.
const REQUEST_ID_FIELD: Range<usize> = START_MARKER.len()..START_MARKER.len() + FIELD_DIGITS;

/// Byte range of the payload length field within the header.
const LENGTH_FIELD: Range<usize> = REQUEST_ID_FIELD.end..HEADER_SIZE;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Request identifier used for correlation.
    pub request_id: u64,
    /// Payload length in bytes, excluding any end marker.
    pub payload_length: usize,
}

impl FrameHeader {
    /// Create a new header.
    pub fn new(request_id: u64, payload_length: usize) -> Self {
        Self {
            request_id,
            payload_length,
        }
    }

    /// Check that both fields fit their 8-digit wire representation.
    pub fn validate(&self) -> Result<()> {
        if self.request_id > MAX_FIELD_VALUE {
            return Err(PipeIpcError::FrameEncode(format!(
                "request id {} exceeds {} digits",
                self.request_id, FIELD_DIGITS
            )));
        }

        if self.payload_length > MAX_PAYLOAD_SIZE {
            return Err(PipeIpcError::FrameEncode(format!(
                "payload size {} exceeds maximum {}",
                self.payload_length, MAX_PAYLOAD_SIZE
            )));
        }

        Ok(())
    }

    /// Encode the header to its 22 ASCII bytes.
    ///
    /// # Example
    ///
    /// ```
    /// use pipeipc::protocol::FrameHeader;
    ///
    /// let bytes = FrameHeader::new(42, 7).encode().unwrap();
    /// assert_eq!(&bytes, b"START_0000004200000007");
    /// ```
    pub fn encode(&self) -> Result<[u8; HEADER_SIZE]> {
        self.validate()?;

        let mut buf = [0u8; HEADER_SIZE];
        buf[..START_MARKER.len()].copy_from_slice(START_MARKER);
        write_padded(&mut buf[REQUEST_ID_FIELD], self.request_id);
        write_padded(&mut buf[LENGTH_FIELD], self.payload_length as u64);
        Ok(buf)
    }

    /// Decode a header from its 22 ASCII bytes.
    ///
    /// Fails with `FrameParse` if the buffer is short, the marker does not
    /// match, or either field contains anything but decimal digits.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(PipeIpcError::FrameParse(format!(
                "header needs {} bytes, got {}",
                HEADER_SIZE,
                buf.len()
            )));
        }

        if &buf[..START_MARKER.len()] != START_MARKER {
            return Err(PipeIpcError::FrameParse(format!(
                "bad start marker {:?}",
                String::from_utf8_lossy(&buf[..START_MARKER.len()])
            )));
        }

        let request_id = parse_digits(&buf[REQUEST_ID_FIELD], "request id")?;
        let payload_length = parse_digits(&buf[LENGTH_FIELD], "payload length")?;

        Ok(Self {
            request_id,
            payload_length: payload_length as usize,
        })
    }
}

fn write_padded(out: &mut [u8], mut value: u64) {
    for slot in out.iter_mut().rev() {
        *slot = b'0' + (value % 10) as u8;
        value /= 10;
    }
}

fn parse_digits(field: &[u8], name: &str) -> Result<u64> {
    if !field.iter().all(u8::is_ascii_digit) {
        return Err(PipeIpcError::FrameParse(format!(
            "{} field {:?} is not decimal",
            name,
            String::from_utf8_lossy(field)
        )));
    }
    Ok(field
        .iter()
        .fold(0u64, |acc, digit| acc * 10 + u64::from(digit - b'0')))
}

/// Decode a header from bytes (standalone function).
#[inline]
pub fn decode_header(buf: &[u8]) -> Result<FrameHeader> {
    FrameHeader::decode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_size_is_exactly_22() {
        assert_eq!(HEADER_SIZE, 22);
        assert_eq!(FrameHeader::new(1, 0).encode().unwrap().len(), 22);
    }

    #[test]
    fn test_encode_zero_pads_both_fields() {
        let bytes = FrameHeader::new(42, 7).encode().unwrap();
        assert_eq!(&bytes, b"START_0000004200000007");
    }

    #[test]
    fn test_decode_known_header() {
        let header = decode_header(b"START_0000000100000015").unwrap();
        assert_eq!(header.request_id, 1);
        assert_eq!(header.payload_length, 15);
    }

    #[test]
    fn test_encode_decode_max_values() {
        let original = FrameHeader::new(MAX_FIELD_VALUE, MAX_PAYLOAD_SIZE);
        let decoded = FrameHeader::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_bad_marker_rejected() {
        let err = FrameHeader::decode(b"BEGIN_0000000100000015").unwrap_err();
        assert!(matches!(err, PipeIpcError::FrameParse(_)));
        assert!(err.to_string().contains("start marker"));
    }

    #[test]
    fn test_non_digit_field_rejected() {
        let err = FrameHeader::decode(b"START_00000x0100000015").unwrap_err();
        assert!(err.to_string().contains("request id"));

        let err = FrameHeader::decode(b"START_00000001 0000015").unwrap_err();
        assert!(err.to_string().contains("payload length"));
    }

    #[test]
    fn test_fields_follow_marker_without_gaps() {
        assert_eq!(REQUEST_ID_FIELD, 6..14);
        assert_eq!(LENGTH_FIELD, 14..22);

        let bytes = FrameHeader::new(12_345_678, 87_654_321).encode().unwrap();
        assert_eq!(&bytes[REQUEST_ID_FIELD], b"12345678");
        assert_eq!(&bytes[LENGTH_FIELD], b"87654321");
    }

    #[test]
    fn test_short_buffer_rejected() {
        assert!(FrameHeader::decode(b"START_000000").is_err());
    }

    #[test]
    fn test_oversized_fields_rejected_on_encode() {
        let err = FrameHeader::new(MAX_FIELD_VALUE + 1, 0).encode().unwrap_err();
        assert!(matches!(err, PipeIpcError::FrameEncode(_)));

        let err = FrameHeader::new(1, MAX_PAYLOAD_SIZE + 1)
            .encode()
            .unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }
}
