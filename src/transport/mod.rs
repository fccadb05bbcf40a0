//! Transport module - named pipe (FIFO) handling.
//!
//! Each [`PipeTransport`] is one direction of one pipe. The companion
//! process holds the opposite end of each.

mod pipe;

pub use pipe::{
    default_pipe_dir, PipeDirection, PipePaths, PipeTransport, TransportOptions,
    DEFAULT_OPEN_RETRY, DEFAULT_PIPE_MODE,
};
