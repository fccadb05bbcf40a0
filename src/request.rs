//! Requests and request ids.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::{PipeIpcError, Result};
use crate::protocol::MAX_FIELD_VALUE;

/// Callback invoked with the response payload.
pub type Continuation = Box<dyn FnOnce(Bytes) + Send + 'static>;

/// Seed of the process-wide id counter.
const REQUEST_ID_SEED: u64 = 1;

static REQUEST_IDS: RequestIdGenerator = RequestIdGenerator::new(REQUEST_ID_SEED);

/// Next id from the process-wide generator.
pub fn next_request_id() -> u64 {
    REQUEST_IDS.next_id()
}

/// Monotonic request id counter.
///
/// Ids stay within the 8-digit wire field: after `99_999_999` the counter
/// wraps back to 1. Zero is never handed out.
#[derive(Debug)]
pub struct RequestIdGenerator {
    next: AtomicU64,
}

impl RequestIdGenerator {
    pub const fn new(seed: u64) -> Self {
        Self {
            next: AtomicU64::new(seed),
        }
    }

    pub fn next_id(&self) -> u64 {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        (raw.wrapping_sub(1) % MAX_FIELD_VALUE) + 1
    }
}

/// Where a request's outcome goes.
pub(crate) enum Reply {
    /// Nobody is waiting.
    Discard,
    /// Fire-and-forget callback from `enqueue`.
    Callback(Continuation),
    /// Awaiting caller from `request`.
    Waiter(oneshot::Sender<Result<Bytes>>),
}

/// A queued request, owned by the dispatcher until it completes.
///
/// Dropping an uncompleted request (for example when the queue halts) never
/// fires its continuation; an awaiting caller sees `QueueHalted`.
pub struct Request {
    id: u64,
    payload: Bytes,
    reply: Reply,
}

impl Request {
    pub(crate) fn new(payload: Bytes, reply: Reply) -> Self {
        Self {
            id: next_request_id(),
            payload,
            reply,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Resolve with a response payload.
    pub(crate) fn complete(self, payload: Bytes) {
        match self.reply {
            Reply::Discard => {}
            Reply::Callback(continuation) => continuation(payload),
            Reply::Waiter(tx) => {
                let _ = tx.send(Ok(payload));
            }
        }
    }

    /// Resolve with a hard failure.
    ///
    /// Callbacks cannot carry an error, so they receive an empty payload and
    /// the caller is never left waiting.
    pub(crate) fn fail(self, error: PipeIpcError) {
        match self.reply {
            Reply::Discard => {}
            Reply::Callback(continuation) => continuation(Bytes::new()),
            Reply::Waiter(tx) => {
                let _ = tx.send(Err(error));
            }
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reply = match self.reply {
            Reply::Discard => "discard",
            Reply::Callback(_) => "callback",
            Reply::Waiter(_) => "waiter",
        };
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("payload_len", &self.payload.len())
            .field("reply", &reply)
            .finish()
    }
}
