//! The IPC contract and its implementations.
//!
//! [`IpcChannel`] is the capability the dispatcher drives: bring the pipes
//! up, write one request, read one response, tear down.
//!
//! - [`PipeChannel`] implements it over a pair of FIFOs.
//! - [`ResilientChannel`] wraps any implementation and rebuilds it through a
//!   factory when a transport error leaves it unusable.

mod pipe_channel;
mod resilient;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::Frame;

pub use pipe_channel::PipeChannel;
pub use resilient::ResilientChannel;

/// Low-level request/response channel to the companion.
#[async_trait]
pub trait IpcChannel: Send {
    /// Create and open the transports. Calling it again once up is a no-op.
    async fn init(&mut self) -> Result<()>;

    /// Whether both transports are open and usable.
    fn is_initialized(&self) -> bool;

    /// Write one framed request.
    async fn write_request(&mut self, request_id: u64, payload: &[u8]) -> Result<()>;

    /// Read one framed response.
    async fn read_response(&mut self) -> Result<Frame>;

    /// Close and remove the transports. Safe to call repeatedly.
    async fn stop(&mut self);
}
