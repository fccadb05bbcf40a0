//! Bounded retry with a fixed backoff.
//!
//! Every open and read path in the transport layer polls a peer whose
//! timing we do not control. They all share [`Backoff`], which allows at
//! most `max_attempts` attempts, sleeps `delay` between them, and gives up
//! early once the stop token fires. [`retry`] wraps it for closures.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::PipeIpcError;

/// Attempt budget and fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (at least one attempt always runs).
    pub max_attempts: u32,
    /// Sleep between two attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

/// Outcome of a single attempt.
#[derive(Debug)]
pub enum Attempt<T> {
    /// The operation finished.
    Done(T),
    /// Nothing yet (peer absent, zero-byte read); try again after the delay.
    Retry,
}

/// Why a retry loop stopped without a result.
#[derive(Debug)]
pub enum RetryError {
    /// Every attempt asked for a retry.
    Exhausted { attempts: u32 },
    /// The stop token fired.
    Cancelled,
    /// An attempt failed hard.
    Failed(PipeIpcError),
}

impl RetryError {
    /// Collapse into a crate error, mapping exhaustion with `on_exhausted`.
    pub fn into_error(self, on_exhausted: impl FnOnce(u32) -> PipeIpcError) -> PipeIpcError {
        match self {
            RetryError::Exhausted { attempts } => on_exhausted(attempts),
            RetryError::Cancelled => PipeIpcError::Cancelled,
            RetryError::Failed(e) => e,
        }
    }
}

/// Attempt counter for hand-written retry loops.
///
/// Call [`Backoff::next_attempt`] at the top of each iteration: it sleeps the
/// fixed delay before every attempt but the first, and stops the loop once
/// the budget is spent or the stop token fires.
#[derive(Debug)]
pub struct Backoff<'a> {
    policy: RetryPolicy,
    cancel: &'a CancellationToken,
    attempt: u32,
}

impl<'a> Backoff<'a> {
    pub fn new(policy: RetryPolicy, cancel: &'a CancellationToken) -> Self {
        Self {
            policy,
            cancel,
            attempt: 0,
        }
    }

    /// Wait for and return the next 1-based attempt number.
    pub async fn next_attempt(&mut self) -> Result<u32, RetryError> {
        if self.attempt >= self.policy.max_attempts.max(1) {
            return Err(RetryError::Exhausted {
                attempts: self.attempt,
            });
        }

        if self.attempt > 0 {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(self.policy.delay) => {}
            }
        }

        if self.cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        self.attempt += 1;
        Ok(self.attempt)
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// Run `op` until it returns [`Attempt::Done`], fails, or the budget runs out.
///
/// `op` receives the 1-based attempt number.
pub async fn retry<T, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Attempt<T>, PipeIpcError>>,
{
    let mut backoff = Backoff::new(policy, cancel);

    loop {
        let attempt = backoff.next_attempt().await?;
        match op(attempt).await {
            Ok(Attempt::Done(value)) => return Ok(value),
            Ok(Attempt::Retry) => {}
            Err(e) => return Err(RetryError::Failed(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    const FAST: RetryPolicy = RetryPolicy::new(5, Duration::from_millis(1));

    #[tokio::test]
    async fn test_done_on_first_attempt() {
        let cancel = CancellationToken::new();
        let value = retry(FAST, &cancel, |_| async { Ok(Attempt::Done(7)) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_succeeds_after_retries() {
        let cancel = CancellationToken::new();
        let value = retry(FAST, &cancel, |attempt| async move {
            if attempt < 3 {
                Ok(Attempt::Retry)
            } else {
                Ok(Attempt::Done(attempt))
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn test_exhausted_after_budget() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = retry(FAST, &cancel, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(Attempt::Retry) }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 5 })));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_hard_failure_stops_immediately() {
        let cancel = CancellationToken::new();
        let result: Result<(), _> = retry(FAST, &cancel, |_| async {
            Err(PipeIpcError::FrameParse("bad".into()))
        })
        .await;
        assert!(matches!(
            result,
            Err(RetryError::Failed(PipeIpcError::FrameParse(_)))
        ));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let slow = RetryPolicy::new(1000, Duration::from_secs(60));
        let trigger = cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result: Result<(), _> = retry(slow, &cancel, |_| async { Ok(Attempt::Retry) }).await;
        assert!(matches!(result, Err(RetryError::Cancelled)));
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::new(0, Duration::from_millis(1));
        let value = retry(policy, &cancel, |_| async { Ok(Attempt::Done("ok")) })
            .await
            .unwrap();
        assert_eq!(value, "ok");
    }

    #[tokio::test]
    async fn test_backoff_counts_attempts() {
        let cancel = CancellationToken::new();
        let mut backoff = Backoff::new(RetryPolicy::new(3, Duration::from_millis(1)), &cancel);

        assert_eq!(backoff.next_attempt().await.unwrap(), 1);
        assert_eq!(backoff.next_attempt().await.unwrap(), 2);
        assert_eq!(backoff.next_attempt().await.unwrap(), 3);
        assert!(matches!(
            backoff.next_attempt().await,
            Err(RetryError::Exhausted { attempts: 3 })
        ));
        assert_eq!(backoff.attempts(), 3);
    }

    #[tokio::test]
    async fn test_backoff_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        let mut backoff = Backoff::new(FAST, &cancel);
        backoff.next_attempt().await.unwrap();

        cancel.cancel();
        assert!(matches!(
            backoff.next_attempt().await,
            Err(RetryError::Cancelled)
        ));
    }

    #[test]
    fn test_into_error_maps_exhaustion() {
        let err = RetryError::Exhausted { attempts: 4 }.into_error(|attempts| {
            PipeIpcError::FrameIncomplete {
                expected: attempts as usize,
                received: 0,
            }
        });
        assert!(matches!(
            err,
            PipeIpcError::FrameIncomplete { expected: 4, .. }
        ));
        assert!(matches!(
            RetryError::Cancelled.into_error(|_| PipeIpcError::QueueHalted),
            PipeIpcError::Cancelled
        ));
    }
}
