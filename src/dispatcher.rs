//! Single-flight request dispatcher.
//!
//! The [`DispatcherBuilder`] configures the subsystem; [`Dispatcher`] is the
//! whole surface other code calls. Requests go through a FIFO queue to one
//! worker task, which owns the channel:
//!
//! ```text
//! enqueue ─┐
//! enqueue ─┼─► mpsc::UnboundedSender<Request> ─► Worker ─► request pipe
//! request ─┘                                        ▲
//!                                                   └──── response pipe
//! ```
//!
//! The worker writes one request, reads its response, fires the
//! continuation, then sleeps the request interval before taking the next
//! request. At most one request is ever in flight: the companion processes
//! commands on a fixed tick and drops one that overlaps the previous.
//!
//! # Example
//!
//! ```ignore
//! use pipeipc::Dispatcher;
//!
//! let dispatcher = Dispatcher::builder()
//!     .app_name("live")
//!     .pipe_dir("/run/user/1000/live")
//!     .start();
//! dispatcher.wait_until_ready().await?;
//!
//! dispatcher.enqueue_with("PLUGINS", |payload| {
//!     println!("plugins: {}", String::from_utf8_lossy(&payload));
//! });
//! let tracks = dispatcher.request("TRACKS").await?;
//!
//! dispatcher.halt().await;
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::{IpcChannel, PipeChannel, ResilientChannel};
use crate::config::IpcConfig;
use crate::error::{PipeIpcError, Result};
use crate::request::{Continuation, Reply, Request};
use crate::retry::RetryPolicy;
use crate::state::{QueueState, QueueStateMachine};

/// Builder for configuring and starting a [`Dispatcher`] over named pipes.
#[derive(Debug, Clone, Default)]
pub struct DispatcherBuilder {
    config: IpcConfig,
}

impl DispatcherBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: IpcConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the pipe name prefix (`<app>_request`, `<app>_response`).
    pub fn app_name(mut self, app_name: impl Into<String>) -> Self {
        self.config.app_name = app_name.into();
        self
    }

    /// Set the directory holding the pipes.
    pub fn pipe_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.pipe_dir = Some(dir.into());
        self
    }

    /// Set the pause between two requests.
    ///
    /// Default: 50 ms
    pub fn request_interval(mut self, interval: Duration) -> Self {
        self.config.request_interval = interval;
        self
    }

    /// Set the budget for opening the pipes.
    ///
    /// Default: 50 attempts, 100 ms apart
    pub fn open_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.open_retry = policy;
        self
    }

    /// Set the budget for empty reads while waiting for a response.
    ///
    /// Default: 400 attempts, 10 ms apart
    pub fn read_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.read_retry = policy;
        self
    }

    /// Set the longest a single read call may wait.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    /// Set the budget for rebuilding the channel after a transport failure.
    ///
    /// Default: 3 attempts, 500 ms apart
    pub fn reconnect(mut self, policy: RetryPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    /// Match responses by request id (default) or by arrival order.
    pub fn match_request_ids(mut self, enabled: bool) -> Self {
        self.config.match_request_ids = enabled;
        self
    }

    /// Append a newline after each request frame.
    pub fn append_newline(mut self, enabled: bool) -> Self {
        self.config.append_newline = enabled;
        self
    }

    /// Start the dispatcher over a reconnecting pipe channel.
    ///
    /// Pipes are created and opened in the background; use
    /// [`Dispatcher::wait_until_ready`] to wait for them. Must be called from
    /// within a tokio runtime.
    pub fn start(self) -> Dispatcher {
        let config = self.config;
        let cancel = CancellationToken::new();
        let state = QueueStateMachine::new();

        let initial = PipeChannel::new(&config, cancel.clone());
        let factory_config = config.clone();
        let factory_cancel = cancel.clone();
        let channel = ResilientChannel::new(initial, move || {
            PipeChannel::new(&factory_config, factory_cancel.clone())
        })
        .with_reconnect(config.reconnect)
        .with_cancel(cancel.clone())
        .with_state(state.clone());

        Dispatcher::spawn(channel, &config, state, cancel)
    }
}

/// Handle to the running IPC subsystem.
///
/// `enqueue` may be called from any thread. Dropping the dispatcher stops
/// the worker, which then removes the pipes on its own.
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Request>,
    state: QueueStateMachine,
    cancel: CancellationToken,
    backlog: Arc<AtomicUsize>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Create a new dispatcher builder.
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    /// Spawn the worker over an arbitrary channel.
    ///
    /// `state` must be in `Initializing`; the worker moves it to `Running`
    /// once `channel.init()` succeeds, or to `Halted` if it fails.
    pub fn spawn<C>(
        channel: C,
        config: &IpcConfig,
        state: QueueStateMachine,
        cancel: CancellationToken,
    ) -> Self
    where
        C: IpcChannel + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));

        let worker = Worker {
            channel,
            rx,
            state: state.clone(),
            cancel: cancel.clone(),
            backlog: backlog.clone(),
            request_interval: config.request_interval,
            match_request_ids: config.match_request_ids,
            max_stale_responses: config.max_stale_responses,
        };
        let handle = tokio::spawn(worker.run());

        Self {
            tx,
            state,
            cancel,
            backlog,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Queue `payload`; `continuation` receives the response payload.
    ///
    /// Outside `Running`/`Processing` the request is dropped with a warning
    /// and the continuation never fires.
    pub fn enqueue(&self, payload: impl Into<Bytes>, continuation: Option<Continuation>) {
        let reply = match continuation {
            Some(continuation) => Reply::Callback(continuation),
            None => Reply::Discard,
        };
        self.submit(payload.into(), reply);
    }

    /// Queue `payload` with a closure continuation.
    pub fn enqueue_with<F>(&self, payload: impl Into<Bytes>, continuation: F)
    where
        F: FnOnce(Bytes) + Send + 'static,
    {
        self.submit(payload.into(), Reply::Callback(Box::new(continuation)));
    }

    /// Queue `payload` and wait for its response.
    ///
    /// Unlike continuations, this surfaces an unrecoverable transport
    /// failure as an error. A request dropped by a halt yields `QueueHalted`.
    pub async fn request(&self, payload: impl Into<Bytes>) -> Result<Bytes> {
        let (tx, rx) = oneshot::channel();
        if !self.submit(payload.into(), Reply::Waiter(tx)) {
            return Err(PipeIpcError::QueueHalted);
        }
        rx.await.unwrap_or(Err(PipeIpcError::QueueHalted))
    }

    fn submit(&self, payload: Bytes, reply: Reply) -> bool {
        let state = self.state.current();
        if !state.accepts_work() {
            tracing::warn!(state = %state, "queue not accepting work, dropping request");
            return false;
        }

        let request = Request::new(payload, reply);
        let request_id = request.id();

        self.backlog.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(request).is_err() {
            self.backlog.fetch_sub(1, Ordering::AcqRel);
            tracing::warn!(request_id, "worker gone, dropping request");
            return false;
        }

        tracing::debug!(request_id, "request enqueued");
        true
    }

    /// Whether the pipes came up and the queue has not halted.
    pub fn is_initialized(&self) -> bool {
        matches!(
            self.state.current(),
            QueueState::Running | QueueState::Processing | QueueState::Recovering
        )
    }

    /// Current lifecycle state.
    pub fn state(&self) -> QueueState {
        self.state.current()
    }

    /// Receiver that observes every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<QueueState> {
        self.state.subscribe()
    }

    /// Requests queued but not yet taken by the worker.
    pub fn backlog_len(&self) -> usize {
        self.backlog.load(Ordering::Acquire)
    }

    /// Wait until initialization finished.
    ///
    /// Returns `QueueHalted` if the pipes could not be opened.
    pub async fn wait_until_ready(&self) -> Result<()> {
        let state = self
            .state
            .wait_for(|state| state != QueueState::Initializing)
            .await;
        if state.is_halted() {
            Err(PipeIpcError::QueueHalted)
        } else {
            Ok(())
        }
    }

    /// Stop the worker, drop queued requests, and remove the pipes.
    ///
    /// Waits until the worker has closed and unlinked both pipes. Calling it
    /// again is a no-op.
    pub async fn halt(&self) {
        let mut worker = self.worker.lock().await;
        let Some(handle) = worker.take() else {
            return;
        };

        self.state.halt();
        self.cancel.cancel();
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "dispatcher worker panicked");
        }
        tracing::info!("dispatcher halted");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Owns the channel and services the queue.
struct Worker<C> {
    channel: C,
    rx: mpsc::UnboundedReceiver<Request>,
    state: QueueStateMachine,
    cancel: CancellationToken,
    backlog: Arc<AtomicUsize>,
    request_interval: Duration,
    match_request_ids: bool,
    max_stale_responses: u32,
}

impl<C: IpcChannel> Worker<C> {
    async fn run(mut self) {
        match self.channel.init().await {
            Ok(()) => {
                self.state.transition(QueueState::Running);
            }
            Err(e) => {
                tracing::error!(error = %e, "IPC initialization failed");
                self.state.halt();
                self.shutdown().await;
                return;
            }
        }

        loop {
            let request = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = self.rx.recv() => match next {
                    Some(request) => request,
                    None => break,
                },
            };
            self.backlog.fetch_sub(1, Ordering::AcqRel);

            if self.state.is_halted() {
                break;
            }

            self.service(request).await;

            if self.state.is_halted() {
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.request_interval) => {}
            }
        }

        self.shutdown().await;
    }

    /// Serve one request from write to continuation.
    async fn service(&mut self, request: Request) {
        if !self.state.transition(QueueState::Processing) {
            tracing::debug!(request_id = request.id(), "queue halted, dropping request");
            return;
        }

        let request_id = request.id();
        let payload = request.payload().clone();

        match self.exchange(request_id, &payload).await {
            Ok(response) => request.complete(response),
            Err(e) if e.is_frame_error() => {
                tracing::warn!(request_id, error = %e, "unreadable response, completing empty");
                request.complete(Bytes::new());
            }
            Err(PipeIpcError::Cancelled) => {
                tracing::debug!(request_id, "request cancelled by halt");
            }
            Err(e) => {
                e.severity()
                    .log(&format!("request {} failed: {}", request_id, e));
                request.fail(e);
            }
        }

        self.state.transition(QueueState::Running);
    }

    /// Write one request and read its response.
    async fn exchange(&mut self, request_id: u64, payload: &[u8]) -> Result<Bytes> {
        self.channel.write_request(request_id, payload).await?;

        let mut stale = 0;
        loop {
            let frame = self.channel.read_response().await?;
            if !self.match_request_ids || frame.request_id() == request_id {
                return Ok(frame.payload);
            }

            stale += 1;
            tracing::warn!(
                request_id,
                received = frame.request_id(),
                "discarding stale response"
            );
            if stale >= self.max_stale_responses {
                return Err(PipeIpcError::FrameParse(format!(
                    "no response for request {} after {} stale frames",
                    request_id, stale
                )));
            }
        }
    }

    async fn shutdown(&mut self) {
        self.rx.close();
        let mut dropped = 0;
        while let Ok(request) = self.rx.try_recv() {
            tracing::debug!(request_id = request.id(), "dropping queued request on halt");
            dropped += 1;
        }
        if dropped > 0 {
            self.backlog.fetch_sub(dropped, Ordering::AcqRel);
        }

        self.channel.stop().await;
        self.state.halt();
        tracing::debug!("dispatcher worker stopped");
    }
}
