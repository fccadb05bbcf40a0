//! Error types for pipeipc.

use std::path::PathBuf;

use thiserror::Error;

/// Severity carried by a fatal transport error.
///
/// The resilience layer logs a failure at the level the error itself asks
/// for, so a peer that simply went away (broken pipe) stays quieter than an
/// unexpected OS error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl Severity {
    /// Emit `message` through `tracing` at this severity.
    pub fn log(self, message: &str) {
        match self {
            Severity::Debug => tracing::debug!("{}", message),
            Severity::Info => tracing::info!("{}", message),
            Severity::Warn => tracing::warn!("{}", message),
            Severity::Error => tracing::error!("{}", message),
        }
    }
}

/// Main error type for all pipeipc operations.
#[derive(Debug, Error)]
pub enum PipeIpcError {
    /// The pipe (or its parent directory) could not be created.
    #[error("failed to create pipe at {}: {source}", path.display())]
    TransportCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The peer never opened its end within the attempt budget.
    #[error("failed to open pipe at {} after {attempts} attempts", path.display())]
    TransportOpen { path: PathBuf, attempts: u32 },

    /// Fatal, non-retryable transport failure (write error, hard read error).
    #[error("transport failure: {message}")]
    Transport {
        severity: Severity,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Header digits or marker did not parse.
    #[error("frame parse error: {0}")]
    FrameParse(String),

    /// The end marker never arrived before the read retry budget ran out.
    #[error("incomplete frame: expected {expected} bytes, received {received}")]
    FrameIncomplete { expected: usize, received: usize },

    /// A request id or payload does not fit the 8-digit wire fields.
    #[error("frame encode error: {0}")]
    FrameEncode(String),

    /// Operation attempted after the queue halted.
    #[error("queue halted")]
    QueueHalted,

    /// The stop flag was raised while waiting.
    #[error("operation cancelled")]
    Cancelled,

    /// Plain I/O error outside the pipe read/write paths.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipeIpcError {
    /// Build a fatal transport error from an I/O error.
    ///
    /// A broken pipe means the companion closed its end, which the
    /// resilience layer expects and recovers from, so it is logged at `Warn`.
    pub fn transport(message: impl Into<String>, source: std::io::Error) -> Self {
        let severity = match source.kind() {
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset => Severity::Warn,
            _ => Severity::Error,
        };
        PipeIpcError::Transport {
            severity,
            message: message.into(),
            source: Some(source),
        }
    }

    /// Fatal transport error without an underlying OS error.
    pub fn disconnected(message: impl Into<String>) -> Self {
        PipeIpcError::Transport {
            severity: Severity::Warn,
            message: message.into(),
            source: None,
        }
    }

    /// Whether the resilience layer should reconnect and retry on this error.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            PipeIpcError::TransportCreate { .. }
                | PipeIpcError::TransportOpen { .. }
                | PipeIpcError::Transport { .. }
                | PipeIpcError::Io(_)
        )
    }

    /// Whether this is malformed or truncated wire data.
    pub fn is_frame_error(&self) -> bool {
        matches!(
            self,
            PipeIpcError::FrameParse(_) | PipeIpcError::FrameIncomplete { .. }
        )
    }

    /// Severity to log this error at.
    pub fn severity(&self) -> Severity {
        match self {
            PipeIpcError::Transport { severity, .. } => *severity,
            PipeIpcError::TransportOpen { .. } => Severity::Warn,
            PipeIpcError::Cancelled | PipeIpcError::QueueHalted => Severity::Debug,
            _ => Severity::Error,
        }
    }
}

/// Result type alias using PipeIpcError.
pub type Result<T> = std::result::Result<T, PipeIpcError>;
