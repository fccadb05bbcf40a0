//! Configuration for the IPC subsystem.
//!
//! [`IpcConfig`] carries every tunable with working defaults. It derives
//! serde so a collaborator that already parsed its own settings can hand
//! them over; reading settings files is not done here.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::{ReadOptions, DEFAULT_CHUNK_SIZE, DEFAULT_READ_RETRY, DEFAULT_READ_TIMEOUT};
use crate::retry::RetryPolicy;
use crate::transport::{
    default_pipe_dir, PipePaths, TransportOptions, DEFAULT_OPEN_RETRY, DEFAULT_PIPE_MODE,
};

/// Default application name used for pipe names.
pub const DEFAULT_APP_NAME: &str = "companion";

/// Default pause between two requests. The companion runs on a fixed tick
/// and drops a command that arrives before the previous one was consumed.
pub const DEFAULT_REQUEST_INTERVAL: Duration = Duration::from_millis(50);

/// Default budget for rebuilding a broken channel.
pub const DEFAULT_RECONNECT: RetryPolicy = RetryPolicy::new(3, Duration::from_millis(500));

/// Default number of mismatched responses discarded before giving up.
pub const DEFAULT_MAX_STALE_RESPONSES: u32 = 8;

/// Full configuration of the IPC subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Prefix of both pipe names (`<app>_request`, `<app>_response`).
    pub app_name: String,
    /// Directory holding the pipes. `None` uses [`default_pipe_dir`].
    pub pipe_dir: Option<PathBuf>,
    /// Permission bits applied to created pipes.
    pub pipe_mode: u32,
    /// Budget for opening a pipe before the companion opened its end.
    pub open_retry: RetryPolicy,
    /// Budget for reads that return no data while waiting for a response.
    pub read_retry: RetryPolicy,
    /// Longest a single read call may wait before counting as empty.
    pub read_timeout: Duration,
    /// Bytes requested per read call.
    pub chunk_size: usize,
    /// Budget for rebuilding the channel after a fatal transport error.
    pub reconnect: RetryPolicy,
    /// Mandatory pause between two requests.
    pub request_interval: Duration,
    /// Match responses to requests by id instead of by arrival order.
    pub match_request_ids: bool,
    /// Mismatched responses discarded per request before giving up.
    pub max_stale_responses: u32,
    /// Append `\n` after each request frame.
    pub append_newline: bool,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            app_name: DEFAULT_APP_NAME.to_string(),
            pipe_dir: None,
            pipe_mode: DEFAULT_PIPE_MODE,
            open_retry: DEFAULT_OPEN_RETRY,
            read_retry: DEFAULT_READ_RETRY,
            read_timeout: DEFAULT_READ_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            reconnect: DEFAULT_RECONNECT,
            request_interval: DEFAULT_REQUEST_INTERVAL,
            match_request_ids: true,
            max_stale_responses: DEFAULT_MAX_STALE_RESPONSES,
            append_newline: false,
        }
    }
}

impl IpcConfig {
    /// Directory the pipes live in.
    pub fn pipe_dir(&self) -> PathBuf {
        self.pipe_dir
            .clone()
            .unwrap_or_else(|| default_pipe_dir(&self.app_name))
    }

    /// Request and response pipe paths.
    pub fn pipe_paths(&self) -> PipePaths {
        PipePaths::for_app(&self.pipe_dir(), &self.app_name)
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            mode: self.pipe_mode,
            open_retry: self.open_retry,
        }
    }

    pub fn read_options(&self) -> ReadOptions {
        ReadOptions {
            retry: self.read_retry,
            read_timeout: self.read_timeout,
            chunk_size: self.chunk_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = IpcConfig::default();
        assert_eq!(config.app_name, DEFAULT_APP_NAME);
        assert_eq!(config.pipe_mode, 0o666);
        assert_eq!(config.request_interval, DEFAULT_REQUEST_INTERVAL);
        assert!(config.match_request_ids);
        assert!(!config.append_newline);
    }

    #[test]
    fn test_pipe_paths_use_explicit_dir() {
        let config = IpcConfig {
            app_name: "live".into(),
            pipe_dir: Some(PathBuf::from("/tmp/live-ipc")),
            ..IpcConfig::default()
        };
        let paths = config.pipe_paths();
        assert_eq!(paths.request, PathBuf::from("/tmp/live-ipc/live_request"));
        assert_eq!(paths.response, PathBuf::from("/tmp/live-ipc/live_response"));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: IpcConfig = serde_json::from_str(
            r#"{"app_name": "live", "match_request_ids": false, "chunk_size": 256}"#,
        )
        .unwrap();

        assert_eq!(config.app_name, "live");
        assert!(!config.match_request_ids);
        assert_eq!(config.chunk_size, 256);
        assert_eq!(config.open_retry, DEFAULT_OPEN_RETRY);
        assert_eq!(config.reconnect, DEFAULT_RECONNECT);
    }

    #[test]
    fn test_derived_options() {
        let config = IpcConfig {
            chunk_size: 64,
            read_timeout: Duration::from_millis(7),
            ..IpcConfig::default()
        };
        let read = config.read_options();
        assert_eq!(read.chunk_size, 64);
        assert_eq!(read.read_timeout, Duration::from_millis(7));
        assert_eq!(config.transport_options().mode, DEFAULT_PIPE_MODE);
    }
}
