//! FIFO transport: one direction of one named pipe.
//!
//! A [`PipeTransport`] owns the filesystem object at its path and, once
//! opened, the native handle for either reading or writing. Opening races
//! against the companion opening its own end, so every open path retries
//! with a fixed backoff instead of failing fast.
//!
//! # Example
//!
//! ```ignore
//! use pipeipc::transport::{PipeDirection, PipePaths, PipeTransport, TransportOptions};
//!
//! let paths = PipePaths::for_app(&dir, "live");
//! let mut request = PipeTransport::new(&paths.request, PipeDirection::Write, options, cancel);
//! request.create()?;
//! request.open(false).await?;
//! request.write(b"START_0000000100000007PLUGINS").await?;
//! ```

use std::fs::{File, Permissions};
use std::io;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::stat::Mode;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::unix::pipe;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{PipeIpcError, Result};
use crate::retry::{retry, Attempt, RetryPolicy};

/// Default permission bits for created pipes.
pub const DEFAULT_PIPE_MODE: u32 = 0o666;

/// Default open budget: 50 attempts, 100 ms apart.
pub const DEFAULT_OPEN_RETRY: RetryPolicy = RetryPolicy::new(50, Duration::from_millis(100));

/// Bytes discarded per read call while draining.
const DRAIN_CHUNK: usize = 4096;

/// Attempts to wake an abandoned blocking open, `RELEASE_POLL` apart.
const RELEASE_ATTEMPTS: u32 = 100;
const RELEASE_POLL: Duration = Duration::from_millis(10);

/// Which end of the pipe this process holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeDirection {
    /// This process reads (the companion writes).
    Read,
    /// This process writes (the companion reads).
    Write,
}

/// The pair of pipe paths shared with the companion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipePaths {
    /// `<app>_request`: this process writes, the companion reads.
    pub request: PathBuf,
    /// `<app>_response`: the companion writes, this process reads.
    pub response: PathBuf,
}

impl PipePaths {
    /// Build the conventional paths for `app` under `dir`.
    pub fn for_app(dir: &Path, app: &str) -> Self {
        Self {
            request: dir.join(format!("{}_request", app)),
            response: dir.join(format!("{}_response", app)),
        }
    }
}

/// Default writable directory for an application's pipes.
///
/// The user runtime directory when the platform has one, otherwise the
/// system temp directory, joined with `app`.
pub fn default_pipe_dir(app: &str) -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(app)
}

/// Tunables for a single transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    /// Permission bits applied to the pipe after creation.
    pub mode: u32,
    /// Budget for opening while the companion has not opened its end.
    pub open_retry: RetryPolicy,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            mode: DEFAULT_PIPE_MODE,
            open_retry: DEFAULT_OPEN_RETRY,
        }
    }
}

enum Handle {
    Closed,
    Reader(pipe::Receiver),
    Writer(pipe::Sender),
}

/// One direction of one named pipe.
pub struct PipeTransport {
    path: PathBuf,
    direction: PipeDirection,
    options: TransportOptions,
    cancel: CancellationToken,
    handle: Handle,
}

impl std::fmt::Debug for PipeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeTransport")
            .field("path", &self.path)
            .field("direction", &self.direction)
            .field("is_open", &self.is_open())
            .finish()
    }
}

impl PipeTransport {
    /// Create a closed transport for `path`.
    pub fn new(
        path: impl Into<PathBuf>,
        direction: PipeDirection,
        options: TransportOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            path: path.into(),
            direction,
            options,
            cancel,
            handle: Handle::Closed,
        }
    }

    /// Get the pipe path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the direction this transport was opened for.
    pub fn direction(&self) -> PipeDirection {
        self.direction
    }

    /// Whether a native handle is currently held.
    pub fn is_open(&self) -> bool {
        !matches!(self.handle, Handle::Closed)
    }

    /// Create the pipe (and its parent directory) if it does not exist.
    ///
    /// An existing FIFO at the path is reused. Anything else at the path is
    /// an error.
    pub fn create(&self) -> Result<()> {
        let create_error = |source: io::Error| PipeIpcError::TransportCreate {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(create_error)?;
        }

        let mode = Mode::from_bits_truncate(self.options.mode as nix::libc::mode_t);
        match nix::unistd::mkfifo(&self.path, mode) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "created pipe");
            }
            Err(Errno::EEXIST) => {
                let meta = std::fs::symlink_metadata(&self.path).map_err(create_error)?;
                if !meta.file_type().is_fifo() {
                    return Err(create_error(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        "path exists and is not a pipe",
                    )));
                }
            }
            Err(errno) => return Err(create_error(io::Error::from(errno))),
        }

        // mkfifo is subject to the umask; apply the configured bits explicitly.
        std::fs::set_permissions(&self.path, Permissions::from_mode(self.options.mode))
            .map_err(create_error)
    }

    /// Open the native handle for this transport's direction.
    ///
    /// Non-blocking opens are retried while the companion has not opened
    /// its end (a write-only open fails with `ENXIO` until a reader exists).
    /// Blocking opens wait on the blocking pool, bounded by the same budget;
    /// on timeout or cancellation the pending open is woken, so no blocking
    /// thread outlives the call. Either way the call fails with `TransportOpen` once the budget is spent.
    pub async fn open(&mut self, blocking: bool) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }

        let handle = if blocking {
            self.open_blocking().await?
        } else {
            self.open_nonblocking().await?
        };

        tracing::debug!(path = %self.path.display(), direction = ?self.direction, "opened pipe");
        self.handle = handle;
        Ok(())
    }

    async fn open_nonblocking(&self) -> Result<Handle> {
        let path = self.path.as_path();
        let direction = self.direction;

        retry(self.options.open_retry, &self.cancel, |attempt| async move {
            let opened = match direction {
                PipeDirection::Read => pipe::OpenOptions::new()
                    .open_receiver(path)
                    .map(Handle::Reader),
                PipeDirection::Write => pipe::OpenOptions::new()
                    .open_sender(path)
                    .map(Handle::Writer),
            };

            match opened {
                Ok(handle) => Ok(Attempt::Done(handle)),
                Err(e) if peer_not_ready(&e) => {
                    tracing::trace!(path = %path.display(), attempt, "peer not ready");
                    Ok(Attempt::Retry)
                }
                Err(e) => Err(PipeIpcError::transport(
                    format!("cannot open {}", path.display()),
                    e,
                )),
            }
        })
        .await
        .map_err(|e| {
            e.into_error(|attempts| PipeIpcError::TransportOpen {
                path: self.path.clone(),
                attempts,
            })
        })
    }

    async fn open_blocking(&self) -> Result<Handle> {
        let path = self.path.clone();
        let direction = self.direction;
        let policy = self.options.open_retry;
        let budget = policy.delay.saturating_mul(policy.max_attempts.max(1));

        let mut task = tokio::task::spawn_blocking(move || {
            let mut options = std::fs::OpenOptions::new();
            match direction {
                PipeDirection::Read => options.read(true),
                PipeDirection::Write => options.write(true),
            };
            options.open(&path)
        });

        let joined = tokio::select! {
            _ = self.cancel.cancelled() => None,
            joined = tokio::time::timeout(budget, &mut task) => joined.ok(),
        };

        let Some(joined) = joined else {
            self.release_pending_open(task).await;
            if self.cancel.is_cancelled() {
                return Err(PipeIpcError::Cancelled);
            }
            return Err(PipeIpcError::TransportOpen {
                path: self.path.clone(),
                attempts: policy.max_attempts.max(1),
            });
        };

        let file = joined
            .map_err(|e| PipeIpcError::Io(io::Error::other(e)))?
            .map_err(|e| {
                PipeIpcError::transport(format!("cannot open {}", self.path.display()), e)
            })?;

        let handle = match direction {
            PipeDirection::Read => pipe::Receiver::from_file(file).map(Handle::Reader),
            PipeDirection::Write => pipe::Sender::from_file(file).map(Handle::Writer),
        };
        handle.map_err(|e| PipeIpcError::transport("cannot register pipe", e))
    }

    /// Wake a blocking open that gave up waiting for the companion.
    ///
    /// A blocked `open(2)` on a FIFO returns once the opposite end is opened,
    /// so this opens that end without blocking until the pending open
    /// finishes. The file it produces is dropped.
    async fn release_pending_open(&self, mut task: JoinHandle<io::Result<File>>) {
        let mut partner = std::fs::OpenOptions::new();
        match self.direction {
            PipeDirection::Read => partner.write(true),
            PipeDirection::Write => partner.read(true),
        };
        partner.custom_flags(nix::libc::O_NONBLOCK);

        for _ in 0..RELEASE_ATTEMPTS {
            // A write-side partner only opens once the pending reader is
            // inside open(2); retry until then.
            let opened = partner.open(&self.path);
            if tokio::time::timeout(RELEASE_POLL, &mut task).await.is_ok() {
                tracing::trace!(path = %self.path.display(), "released pending open");
                return;
            }
            drop(opened);
        }

        tracing::warn!(path = %self.path.display(), "pending blocking open did not return");
    }

    /// Read whatever is available into `buf`.
    ///
    /// Zero means "no data yet"; callers retry with a delay.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        use tokio::io::AsyncReadExt;

        let cancel = self.cancel.clone();
        let receiver = match &mut self.handle {
            Handle::Reader(receiver) => receiver,
            _ => return Err(self.not_open("read")),
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(PipeIpcError::Cancelled),
            read = receiver.read(buf) => match read {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
                Err(e) => Err(PipeIpcError::transport("pipe read failed", e)),
            },
        }
    }

    /// Write all of `buf`, returning the number of bytes written.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let cancel = self.cancel.clone();
        let sender = match &mut self.handle {
            Handle::Writer(sender) => sender,
            _ => return Err(self.not_open("write")),
        };

        let written = async {
            sender.write_all(buf).await?;
            sender.flush().await
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(PipeIpcError::Cancelled),
            result = written => match result {
                Ok(()) => Ok(buf.len()),
                Err(e) => Err(PipeIpcError::transport("pipe write failed", e)),
            },
        }
    }

    /// Discard any bytes currently queued for reading.
    ///
    /// Returns the number of bytes discarded. A no-op on the write side.
    pub fn drain(&mut self) -> Result<usize> {
        let receiver = match &self.handle {
            Handle::Reader(receiver) => receiver,
            Handle::Writer(_) => return Ok(0),
            Handle::Closed => return Err(self.not_open("drain")),
        };

        let mut scratch = [0u8; DRAIN_CHUNK];
        let mut discarded = 0;
        loop {
            match receiver.try_read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => discarded += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(PipeIpcError::transport("pipe drain failed", e)),
            }
        }

        if discarded > 0 {
            tracing::debug!(path = %self.path.display(), discarded, "drained stale bytes");
        }
        Ok(discarded)
    }

    /// Release the native handle. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.is_open() {
            tracing::debug!(path = %self.path.display(), "closed pipe");
        }
        self.handle = Handle::Closed;
    }

    /// Close the handle and unlink the pipe. Safe to call repeatedly.
    pub async fn remove(&mut self) -> Result<()> {
        self.close();
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "removed pipe");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PipeIpcError::Io(e)),
        }
    }

    fn not_open(&self, operation: &str) -> PipeIpcError {
        PipeIpcError::disconnected(format!(
            "cannot {} {}: pipe is not open for {:?}",
            operation,
            self.path.display(),
            self.direction
        ))
    }
}

/// Errors that mean the companion simply has not opened its end yet.
fn peer_not_ready(e: &io::Error) -> bool {
    e.raw_os_error() == Some(Errno::ENXIO as i32) || e.kind() == io::ErrorKind::NotFound
}

impl AsyncRead for PipeTransport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().handle {
            Handle::Reader(receiver) => Pin::new(receiver).poll_read(cx, buf),
            _ => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "pipe is not open for reading",
            ))),
        }
    }
}

impl AsyncWrite for PipeTransport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().handle {
            Handle::Writer(sender) => Pin::new(sender).poll_write(cx, buf),
            _ => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "pipe is not open for writing",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().handle {
            Handle::Writer(sender) => Pin::new(sender).poll_flush(cx),
            _ => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().handle {
            Handle::Writer(sender) => Pin::new(sender).poll_shutdown(cx),
            _ => Poll::Ready(Ok(())),
        }
    }
}
