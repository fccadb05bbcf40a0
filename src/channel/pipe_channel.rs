//! Channel over a pair of named pipes.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::IpcChannel;
use crate::config::IpcConfig;
use crate::error::{PipeIpcError, Result};
use crate::protocol::{encode_request, encode_request_line, Frame, FrameReader};
use crate::transport::{PipeDirection, PipePaths, PipeTransport};

/// Request/response channel over `<app>_request` and `<app>_response`.
#[derive(Debug)]
pub struct PipeChannel {
    /// This process writes, the companion reads.
    request: PipeTransport,
    /// The companion writes, this process reads.
    response: PipeTransport,
    frames: FrameReader,
    append_newline: bool,
    initialized: bool,
}

impl PipeChannel {
    /// Build a closed channel from `config`. Nothing touches the filesystem
    /// until [`IpcChannel::init`].
    pub fn new(config: &IpcConfig, cancel: CancellationToken) -> Self {
        let paths = config.pipe_paths();
        let options = config.transport_options();

        Self {
            request: PipeTransport::new(
                paths.request,
                PipeDirection::Write,
                options,
                cancel.clone(),
            ),
            response: PipeTransport::new(
                paths.response,
                PipeDirection::Read,
                options,
                cancel.clone(),
            ),
            frames: FrameReader::new(config.read_options(), cancel),
            append_newline: config.append_newline,
            initialized: false,
        }
    }

    pub fn paths(&self) -> PipePaths {
        PipePaths {
            request: self.request.path().to_path_buf(),
            response: self.response.path().to_path_buf(),
        }
    }

    /// Drop both handles after a fatal error so the channel reports itself
    /// uninitialized. The pipes stay on disk until `stop`.
    fn mark_broken(&mut self) {
        self.request.close();
        self.response.close();
        self.initialized = false;
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(PipeIpcError::disconnected("pipe channel is not initialized"))
        }
    }
}

#[async_trait]
impl IpcChannel for PipeChannel {
    async fn init(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }

        self.request.create()?;
        self.response.create()?;

        // Either open may wait on the companion; run them side by side.
        let opened = tokio::try_join!(self.request.open(false), self.response.open(false));
        if let Err(e) = opened {
            tracing::warn!(error = %e, "failed to open pipes");
            self.mark_broken();
            return Err(e);
        }

        tracing::info!(
            request = %self.request.path().display(),
            response = %self.response.path().display(),
            "pipe channel initialized"
        );
        self.initialized = true;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    async fn write_request(&mut self, request_id: u64, payload: &[u8]) -> Result<()> {
        self.ensure_initialized()?;

        let frame = if self.append_newline {
            encode_request_line(request_id, payload)?
        } else {
            encode_request(request_id, payload)?
        };

        // Leftovers from a previous, partially consumed exchange would be
        // read as this request's response.
        let written = match self.response.drain() {
            Ok(_) => self.request.write(&frame).await.map(|_| ()),
            Err(e) => Err(e),
        };

        if let Err(e) = written {
            if e.is_transport() {
                self.mark_broken();
            }
            return Err(e);
        }

        tracing::debug!(request_id, len = payload.len(), "request written");
        Ok(())
    }

    async fn read_response(&mut self) -> Result<Frame> {
        self.ensure_initialized()?;

        match self.frames.read_frame(&mut self.response).await {
            Ok(frame) => {
                tracing::debug!(
                    request_id = frame.request_id(),
                    len = frame.payload.len(),
                    "response read"
                );
                Ok(frame)
            }
            Err(e) => {
                if e.is_transport() {
                    self.mark_broken();
                }
                Err(e)
            }
        }
    }

    async fn stop(&mut self) {
        self.initialized = false;
        for transport in [&mut self.request, &mut self.response] {
            if let Err(e) = transport.remove().await {
                tracing::warn!(path = %transport.path().display(), error = %e, "failed to remove pipe");
            }
        }
    }
}
