//! # pipeipc
//!
//! Request/response IPC with a companion process over a pair of named pipes.
//!
//! The host creates `<app>_request` and `<app>_response` FIFOs, writes framed
//! commands to the first and reads framed replies from the second. The
//! companion handles commands on a fixed tick, so requests are dispatched one
//! at a time with a pause in between.
//!
//! ## Architecture
//!
//! - **Transport** (FIFO): create, open with retry, read, write, remove
//! - **Protocol**: `START_` + 8-digit id + 8-digit length + payload;
//!   responses end with `END_OF_MESSAGE`
//! - **Channel**: one request out, one response in; the resilient wrapper
//!   rebuilds the pipes after a transport failure and retries once
//! - **Dispatcher**: FIFO queue, single worker, lifecycle state machine
//!
//! Unix only.
//!
//! ## Example
//!
//! ```ignore
//! use pipeipc::Dispatcher;
//!
//! #[tokio::main]
//! async fn main() -> pipeipc::Result<()> {
//!     let dispatcher = Dispatcher::builder().app_name("live").start();
//!     dispatcher.wait_until_ready().await?;
//!
//!     let plugins = dispatcher.request("PLUGINS").await?;
//!     println!("{}", String::from_utf8_lossy(&plugins));
//!
//!     dispatcher.halt().await;
//!     Ok(())
//! }
//! ```

#[cfg(not(unix))]
compile_error!("pipeipc uses named pipes and only supports Unix platforms");

pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod request;
pub mod retry;
pub mod state;
pub mod transport;

pub use channel::{IpcChannel, PipeChannel, ResilientChannel};
pub use config::IpcConfig;
pub use dispatcher::{Dispatcher, DispatcherBuilder};
pub use error::{PipeIpcError, Result, Severity};
pub use request::Continuation;
pub use retry::RetryPolicy;
pub use state::{QueueState, QueueStateMachine};
