//! Frame reader for pulling responses off a pipe.
//!
//! The companion writes a response whenever its own tick comes around, so a
//! read that returns zero bytes means "nothing yet", not end-of-stream. The
//! reader keeps polling with a fixed delay until the frame is complete or the
//! empty-read budget runs out.
//!
//! Reads never go past the frame: the header is read as exactly 22 bytes and
//! the body as exactly `payload_length + 14` bytes, in chunks of at most
//! `chunk_size`. The end marker is only accepted at the tail of a full-length
//! body, so payloads may contain the marker text.
//!
//! # Example
//!
//! ```ignore
//! use pipeipc::protocol::{FrameReader, ReadOptions};
//!
//! let reader = FrameReader::new(ReadOptions::default(), cancel.clone());
//! let frame = reader.read_frame(&mut receiver).await?;
//! println!("response {} carried {} bytes", frame.request_id(), frame.payload.len());
//! ```

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use super::wire_format::{FrameHeader, END_MARKER, HEADER_SIZE};
use super::Frame;
use crate::error::{PipeIpcError, Result};
use crate::retry::{Backoff, RetryError, RetryPolicy};

/// Default number of bytes requested per read call.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Default empty-read budget: 400 polls, 10 ms apart.
pub const DEFAULT_READ_RETRY: RetryPolicy = RetryPolicy::new(400, Duration::from_millis(10));

/// Default time a single read call may wait before it counts as empty.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Tunables for reading frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    /// Budget for reads that return no data.
    pub retry: RetryPolicy,
    /// Longest a single read call may wait for data.
    pub read_timeout: Duration,
    /// Upper bound on bytes requested per read call.
    pub chunk_size: usize,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            retry: DEFAULT_READ_RETRY,
            read_timeout: DEFAULT_READ_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Reads whole frames from a byte source.
#[derive(Debug, Clone)]
pub struct FrameReader {
    options: ReadOptions,
    cancel: CancellationToken,
}

impl FrameReader {
    /// Create a reader that stops early once `cancel` fires.
    pub fn new(options: ReadOptions, cancel: CancellationToken) -> Self {
        Self { options, cancel }
    }

    /// Read one complete response frame.
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<Frame>
    where
        R: AsyncRead + Unpin + Send,
    {
        let header = self.read_header(reader).await?;
        let payload = self.read_body(reader, header.payload_length).await?;
        Ok(Frame::new(header, payload.freeze()))
    }

    /// Read and parse the fixed 22-byte header.
    pub async fn read_header<R>(&self, reader: &mut R) -> Result<FrameHeader>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        self.fill(reader, &mut buf, HEADER_SIZE).await?;
        FrameHeader::decode(&buf)
    }

    /// Read `payload_length` bytes plus the end marker and strip the marker.
    pub async fn read_body<R>(&self, reader: &mut R, payload_length: usize) -> Result<BytesMut>
    where
        R: AsyncRead + Unpin + Send,
    {
        let expected = payload_length + END_MARKER.len();
        // The length comes from an unverified header; grow as bytes arrive.
        let mut buf = BytesMut::with_capacity(self.initial_capacity(expected));
        self.fill(reader, &mut buf, expected).await?;

        if !buf.ends_with(END_MARKER) {
            return Err(PipeIpcError::FrameParse(format!(
                "frame of {} payload bytes does not end with the end marker",
                payload_length
            )));
        }

        buf.truncate(payload_length);
        Ok(buf)
    }

    fn initial_capacity(&self, target: usize) -> usize {
        target.min(self.options.chunk_size.max(1))
    }

    /// Read until `buf` holds exactly `target` bytes.
    async fn fill<R>(&self, reader: &mut R, buf: &mut BytesMut, target: usize) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let chunk_size = self.options.chunk_size.max(1);
        let mut chunk = vec![0u8; chunk_size.min(target.max(1))];
        let mut backoff = Backoff::new(self.options.retry, &self.cancel);

        // The first attempt never sleeps; consume it up front so every empty
        // read below waits the full delay.
        backoff.next_attempt().await.map_err(|e| incomplete(e, target, 0))?;

        while buf.len() < target {
            let want = (target - buf.len()).min(chunk.len());
            let read = tokio::time::timeout(
                self.options.read_timeout,
                reader.read(&mut chunk[..want]),
            )
            .await;

            let n = match read {
                Err(_elapsed) => 0,
                Ok(Ok(n)) => n,
                Ok(Err(e))
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
                    ) =>
                {
                    0
                }
                Ok(Err(e)) => return Err(PipeIpcError::transport("pipe read failed", e)),
            };

            if n == 0 {
                backoff
                    .next_attempt()
                    .await
                    .map_err(|e| incomplete(e, target, buf.len()))?;
                continue;
            }

            buf.extend_from_slice(&chunk[..n]);
        }

        Ok(())
    }
}

fn incomplete(error: RetryError, expected: usize, received: usize) -> PipeIpcError {
    error.into_error(|_| PipeIpcError::FrameIncomplete { expected, received })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_response;
    use tokio::io::{duplex, AsyncWriteExt};

    fn fast_reader() -> FrameReader {
        FrameReader::new(
            ReadOptions {
                retry: RetryPolicy::new(5, Duration::from_millis(1)),
                read_timeout: Duration::from_millis(5),
                chunk_size: 4,
            },
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_decodes_companion_response() {
        let bytes = b"START_00000001000000141,Foo,#VST3uriEND_OF_MESSAGE";
        let mut source: &[u8] = bytes;

        let frame = fast_reader().read_frame(&mut source).await.unwrap();
        assert_eq!(frame.request_id(), 1);
        assert_eq!(frame.payload(), b"1,Foo,#VST3uri");
    }

    #[tokio::test]
    async fn test_payload_containing_end_marker() {
        let payload = b"before END_OF_MESSAGE after";
        let bytes = encode_response(5, payload).unwrap();
        let mut source: &[u8] = &bytes;

        let frame = fast_reader().read_frame(&mut source).await.unwrap();
        assert_eq!(frame.payload(), payload);
    }

    #[tokio::test]
    async fn test_empty_payload() {
        let bytes = encode_response(3, b"").unwrap();
        let mut source: &[u8] = &bytes;

        let frame = fast_reader().read_frame(&mut source).await.unwrap();
        assert!(frame.payload.is_empty());
        assert_eq!(frame.header.payload_length, 0);
    }

    #[tokio::test]
    async fn test_does_not_read_past_frame() {
        let mut bytes = encode_response(1, b"first").unwrap().to_vec();
        bytes.extend_from_slice(&encode_response(2, b"second").unwrap());
        let mut source: &[u8] = &bytes;

        let reader = fast_reader();
        let first = reader.read_frame(&mut source).await.unwrap();
        let second = reader.read_frame(&mut source).await.unwrap();

        assert_eq!(first.payload(), b"first");
        assert_eq!(second.request_id(), 2);
        assert_eq!(second.payload(), b"second");
    }

    #[tokio::test]
    async fn test_truncated_body_is_incomplete() {
        let bytes = encode_response(1, b"truncated payload").unwrap();
        let mut source: &[u8] = &bytes[..bytes.len() - 5];

        let err = fast_reader().read_frame(&mut source).await.unwrap_err();
        match err {
            PipeIpcError::FrameIncomplete { expected, received } => {
                assert_eq!(expected, 17 + END_MARKER.len());
                assert_eq!(received, expected - 5);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_end_marker_is_parse_error() {
        let mut bytes = encode_response(1, b"abc").unwrap().to_vec();
        let len = bytes.len();
        bytes[len - 1] = b'X';
        let mut source: &[u8] = &bytes;

        let err = fast_reader().read_frame(&mut source).await.unwrap_err();
        assert!(matches!(err, PipeIpcError::FrameParse(_)));
    }

    #[tokio::test]
    async fn test_garbage_header_is_parse_error() {
        let mut source: &[u8] = b"HELLO_WORLD_THIS_IS_NOT_A_FRAME";
        let err = fast_reader().read_frame(&mut source).await.unwrap_err();
        assert!(err.is_frame_error());
    }

    #[tokio::test]
    async fn test_silent_peer_exhausts_budget() {
        let (_writer, mut reader) = duplex(64);
        let err = fast_reader().read_header(&mut reader).await.unwrap_err();
        assert!(matches!(
            err,
            PipeIpcError::FrameIncomplete {
                expected: HEADER_SIZE,
                received: 0
            }
        ));
    }

    #[test]
    fn test_initial_capacity_is_bounded_by_chunk_size() {
        let reader = fast_reader();
        assert_eq!(reader.initial_capacity(3), 3);
        assert_eq!(reader.initial_capacity(99_999_999 + END_MARKER.len()), 4);
    }

    #[tokio::test]
    async fn test_corrupted_length_fails_as_incomplete() {
        let mut source: &[u8] = b"START_0000000199999999shortEND_OF_MESSAGE";

        let err = fast_reader().read_frame(&mut source).await.unwrap_err();
        assert!(matches!(
            err,
            PipeIpcError::FrameIncomplete {
                expected: 100_000_013,
                received: 19,
            }
        ));
    }

    #[tokio::test]
    async fn test_fragmented_arrival() {
        let (mut writer, mut reader) = duplex(256);
        let bytes = encode_response(77, b"slow companion").unwrap();

        tokio::spawn(async move {
            for piece in bytes.chunks(3) {
                writer.write_all(piece).await.unwrap();
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });

        let reader_with_budget = FrameReader::new(
            ReadOptions {
                retry: RetryPolicy::new(200, Duration::from_millis(1)),
                read_timeout: Duration::from_millis(20),
                chunk_size: 8,
            },
            CancellationToken::new(),
        );
        let frame = reader_with_budget.read_frame(&mut reader).await.unwrap();
        assert_eq!(frame.request_id(), 77);
        assert_eq!(frame.payload(), b"slow companion");
    }

    #[tokio::test]
    async fn test_cancel_stops_waiting() {
        let (_writer, mut reader) = duplex(64);
        let cancel = CancellationToken::new();
        let frame_reader = FrameReader::new(
            ReadOptions {
                retry: RetryPolicy::new(10_000, Duration::from_millis(50)),
                read_timeout: Duration::from_millis(5),
                chunk_size: 16,
            },
            cancel.clone(),
        );

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = frame_reader.read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(err, PipeIpcError::Cancelled));
    }
}
