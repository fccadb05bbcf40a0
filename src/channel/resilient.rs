//! Reconnect-and-retry-once wrapper around any [`IpcChannel`].
//!
//! Every operation is attempted once. If it fails with a transport error the
//! wrapper logs the error at the severity it carries, rebuilds the inner
//! channel when it reports itself uninitialized, and attempts the operation
//! exactly once more. A second failure is returned to the caller. Errors that
//! are not transport errors are returned at once; retrying them cannot help.
//!
//! # Example
//!
//! ```ignore
//! use pipeipc::channel::{PipeChannel, ResilientChannel};
//!
//! let initial = PipeChannel::new(&config, cancel.clone());
//! let channel = ResilientChannel::new(initial, move || PipeChannel::new(&config, cancel.clone()))
//!     .with_reconnect(config.reconnect);
//! ```

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::IpcChannel;
use crate::config::DEFAULT_RECONNECT;
use crate::error::{PipeIpcError, Result};
use crate::protocol::Frame;
use crate::retry::{Backoff, RetryPolicy};
use crate::state::{QueueState, QueueStateMachine};

/// Channel decorator that rebuilds its inner channel through `factory`.
pub struct ResilientChannel<C, F> {
    inner: C,
    factory: F,
    reconnect: RetryPolicy,
    cancel: CancellationToken,
    state: Option<QueueStateMachine>,
}

impl<C, F> ResilientChannel<C, F>
where
    C: IpcChannel,
    F: FnMut() -> C + Send,
{
    /// Wrap `inner`; `factory` builds each replacement.
    pub fn new(inner: C, factory: F) -> Self {
        Self {
            inner,
            factory,
            reconnect: DEFAULT_RECONNECT,
            cancel: CancellationToken::new(),
            state: None,
        }
    }

    /// Budget for rebuilding the inner channel.
    pub fn with_reconnect(mut self, policy: RetryPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Stop token checked between reconnect attempts.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Report recovery through the queue state machine.
    ///
    /// While a request is in flight, a rebuild moves the queue to
    /// `Recovering`, then back through `Running` to `Processing` on success,
    /// or to `Halted` once the budget is spent.
    pub fn with_state(mut self, state: QueueStateMachine) -> Self {
        self.state = Some(state);
        self
    }

    /// The current inner channel.
    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Rebuild the inner channel if it reports itself uninitialized.
    pub async fn check_and_reestablish(&mut self) -> Result<()> {
        if self.inner.is_initialized() {
            return Ok(());
        }

        let recovering = self
            .state
            .as_ref()
            .is_some_and(|state| state.transition(QueueState::Recovering));

        let outcome = self.reestablish().await;

        if recovering {
            if let Some(state) = &self.state {
                match &outcome {
                    Ok(()) => {
                        state.transition(QueueState::Running);
                        state.transition(QueueState::Processing);
                    }
                    Err(_) => {
                        state.halt();
                    }
                }
            }
        }

        outcome
    }

    async fn reestablish(&mut self) -> Result<()> {
        let mut backoff = Backoff::new(self.reconnect, &self.cancel);
        let mut last_error = None;

        loop {
            let attempt = match backoff.next_attempt().await {
                Ok(attempt) => attempt,
                Err(stop) => {
                    let error = stop.into_error(|attempts| {
                        last_error.take().unwrap_or_else(|| {
                            PipeIpcError::disconnected(format!(
                                "reconnect gave up after {} attempts",
                                attempts
                            ))
                        })
                    });
                    tracing::error!(error = %error, "could not re-establish IPC channel");
                    return Err(error);
                }
            };

            tracing::info!(attempt, "re-establishing IPC channel");
            self.inner.stop().await;
            self.inner = (self.factory)();

            match self.inner.init().await {
                Ok(()) => {
                    tracing::info!(attempt, "IPC channel re-established");
                    return Ok(());
                }
                Err(e) if e.is_transport() => {
                    tracing::warn!(attempt, error = %e, "reconnect attempt failed");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Decide whether a failed operation may be retried, rebuilding the
    /// inner channel first when needed.
    async fn recover_from(&mut self, operation: &'static str, error: PipeIpcError) -> Result<()> {
        if !error.is_transport() {
            error
                .severity()
                .log(&format!("{} failed: {}", operation, error));
            return Err(error);
        }

        error
            .severity()
            .log(&format!("{} failed, reconnecting: {}", operation, error));
        self.check_and_reestablish().await
    }
}

#[async_trait]
impl<C, F> IpcChannel for ResilientChannel<C, F>
where
    C: IpcChannel,
    F: FnMut() -> C + Send,
{
    async fn init(&mut self) -> Result<()> {
        match self.inner.init().await {
            Ok(()) => return Ok(()),
            Err(e) => self.recover_from("init", e).await?,
        }
        self.inner.init().await
    }

    fn is_initialized(&self) -> bool {
        self.inner.is_initialized()
    }

    async fn write_request(&mut self, request_id: u64, payload: &[u8]) -> Result<()> {
        match self.inner.write_request(request_id, payload).await {
            Ok(()) => return Ok(()),
            Err(e) => self.recover_from("write_request", e).await?,
        }
        self.inner.write_request(request_id, payload).await
    }

    async fn read_response(&mut self) -> Result<Frame> {
        match self.inner.read_response().await {
            Ok(frame) => return Ok(frame),
            Err(e) => self.recover_from("read_response", e).await?,
        }
        self.inner.read_response().await
    }

    async fn stop(&mut self) {
        self.inner.stop().await
    }
}
