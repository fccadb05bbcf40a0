//! Protocol module - wire format, framing, and frame reading.
//!
//! This module implements the ASCII framing used on both pipes:
//! - 22-byte `START_` header encoding/decoding
//! - Request and response frame builders
//! - Frame reader that polls a pipe until the end marker arrives

mod frame;
mod frame_reader;
mod wire_format;

pub use frame::{encode_request, encode_request_line, encode_response, Frame};
pub use frame_reader::{
    FrameReader, ReadOptions, DEFAULT_CHUNK_SIZE, DEFAULT_READ_RETRY, DEFAULT_READ_TIMEOUT,
};
pub use wire_format::{
    decode_header, FrameHeader, END_MARKER, FIELD_DIGITS, HEADER_SIZE, MAX_FIELD_VALUE,
    MAX_PAYLOAD_SIZE, START_MARKER,
};
