//! Frame struct and frame builders.
//!
//! Represents one decoded frame with header and payload.
//! Uses `bytes::Bytes` for cheap payload sharing.
//!
//! # Example
//!
//! ```
//! use pipeipc::protocol::encode_request;
//!
//! let bytes = encode_request(42, b"PLUGINS").unwrap();
//! assert_eq!(&bytes[..], b"START_0000004200000007PLUGINS");
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{FrameHeader, END_MARKER, HEADER_SIZE};
use crate::error::Result;

/// A complete decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Decoded header.
    pub header: FrameHeader,
    /// Payload bytes, end marker already stripped.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: FrameHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the request ID.
    #[inline]
    pub fn request_id(&self) -> u64 {
        self.header.request_id
    }
}

/// Build a request frame: header followed by the payload.
///
/// No trailing delimiter is added; the companion delimits by length.
pub fn encode_request(request_id: u64, payload: &[u8]) -> Result<Bytes> {
    let header = FrameHeader::new(request_id, payload.len()).encode()?;

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_slice(&header);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Build a request frame with a trailing newline.
///
/// Used when the transport coalesces writes and the peer reads by line.
pub fn encode_request_line(request_id: u64, payload: &[u8]) -> Result<Bytes> {
    let frame = encode_request(request_id, payload)?;

    let mut buf = BytesMut::with_capacity(frame.len() + 1);
    buf.put_slice(&frame);
    buf.put_u8(b'\n');
    Ok(buf.freeze())
}

/// Build a response frame: header, payload, then `END_OF_MESSAGE`.
///
/// This is what the companion writes back; it is exposed for peers and
/// test doubles.
pub fn encode_response(request_id: u64, payload: &[u8]) -> Result<Bytes> {
    let header = FrameHeader::new(request_id, payload.len()).encode()?;

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len() + END_MARKER.len());
    buf.put_slice(&header);
    buf.put_slice(payload);
    buf.put_slice(END_MARKER);
    Ok(buf.freeze())
}
