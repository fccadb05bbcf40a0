//! Lifecycle state machine of the IPC subsystem.
//!
//! ```text
//! Initializing ──► Running ⇄ Processing ──► Recovering ──► Running
//!      │              │           │              │
//!      └──────────────┴───────────┴──────────────┴──► Halted (terminal)
//! ```
//!
//! The current state lives in a `tokio::sync::watch` channel so other tasks
//! can wait for a change (for example, for init to finish).

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

/// Lifecycle state of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueState {
    /// Pipes are being created and opened.
    Initializing,
    /// Idle, accepting work.
    Running,
    /// A request is in flight.
    Processing,
    /// The channel is being rebuilt after a fatal transport error.
    Recovering,
    /// Shut down. Terminal.
    Halted,
}

impl QueueState {
    /// Whether `self -> to` is an allowed transition.
    pub fn can_transition_to(self, to: QueueState) -> bool {
        use QueueState::*;

        matches!(
            (self, to),
            (Initializing, Running)
                | (Initializing, Halted)
                | (Running, Processing)
                | (Running, Halted)
                | (Processing, Running)
                | (Processing, Recovering)
                | (Processing, Halted)
                | (Recovering, Running)
                | (Recovering, Halted)
        )
    }

    /// Whether `enqueue` accepts new requests in this state.
    pub fn accepts_work(self) -> bool {
        matches!(self, QueueState::Running | QueueState::Processing)
    }

    pub fn is_halted(self) -> bool {
        self == QueueState::Halted
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueueState::Initializing => "initializing",
            QueueState::Running => "running",
            QueueState::Processing => "processing",
            QueueState::Recovering => "recovering",
            QueueState::Halted => "halted",
        };
        f.write_str(name)
    }
}

/// Shared handle to the queue state.
///
/// Cheap to clone; all clones observe and mutate the same state, and only
/// through the transition table above.
#[derive(Debug, Clone)]
pub struct QueueStateMachine {
    tx: Arc<watch::Sender<QueueState>>,
}

impl QueueStateMachine {
    /// Create a state machine in `Initializing`.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(QueueState::Initializing);
        Self { tx: Arc::new(tx) }
    }

    /// Current state.
    pub fn current(&self) -> QueueState {
        *self.tx.borrow()
    }

    /// Move to `to` if the table allows it. Returns whether the state changed.
    pub fn transition(&self, to: QueueState) -> bool {
        let mut from = None;
        let changed = self.tx.send_if_modified(|state| {
            from = Some(*state);
            if state.can_transition_to(to) {
                *state = to;
                true
            } else {
                false
            }
        });

        if changed {
            tracing::debug!(from = ?from, to = %to, "queue state changed");
        } else {
            tracing::trace!(from = ?from, to = %to, "queue state transition ignored");
        }
        changed
    }

    /// Move to `Halted` from any state. Returns whether this call halted it.
    pub fn halt(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if state.is_halted() {
                false
            } else {
                tracing::debug!(from = %state, "queue halted");
                *state = QueueState::Halted;
                true
            }
        })
    }

    pub fn is_halted(&self) -> bool {
        self.current().is_halted()
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<QueueState> {
        self.tx.subscribe()
    }

    /// Wait until the state satisfies `predicate` and return that state.
    pub async fn wait_for(&self, mut predicate: impl FnMut(QueueState) -> bool) -> QueueState {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let observed = rx.wait_for(|state| predicate(*state)).await.map(|state| *state);
        observed.unwrap_or_else(|_| self.current())
    }
}

impl Default for QueueStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_initial_state_is_initializing() {
        let machine = QueueStateMachine::new();
        assert_eq!(machine.current(), QueueState::Initializing);
        assert!(!machine.current().accepts_work());
    }

    #[test]
    fn test_happy_path_transitions() {
        let machine = QueueStateMachine::new();
        assert!(machine.transition(QueueState::Running));
        assert!(machine.transition(QueueState::Processing));
        assert!(machine.current().accepts_work());
        assert!(machine.transition(QueueState::Running));
    }

    #[test]
    fn test_recovery_path() {
        let machine = QueueStateMachine::new();
        machine.transition(QueueState::Running);
        machine.transition(QueueState::Processing);
        assert!(machine.transition(QueueState::Recovering));
        assert!(!machine.current().accepts_work());
        assert!(machine.transition(QueueState::Running));
        assert!(machine.transition(QueueState::Processing));
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let machine = QueueStateMachine::new();
        assert!(!machine.transition(QueueState::Processing));
        assert!(!machine.transition(QueueState::Recovering));
        machine.transition(QueueState::Running);
        assert!(!machine.transition(QueueState::Recovering));
        assert!(!machine.transition(QueueState::Initializing));
        assert_eq!(machine.current(), QueueState::Running);
    }

    #[test]
    fn test_halted_is_terminal() {
        let machine = QueueStateMachine::new();
        assert!(machine.halt());
        assert!(!machine.halt());

        for to in [
            QueueState::Initializing,
            QueueState::Running,
            QueueState::Processing,
            QueueState::Recovering,
        ] {
            assert!(!machine.transition(to));
        }
        assert!(machine.is_halted());
    }

    #[test]
    fn test_halt_reachable_from_every_state() {
        for path in [
            vec![],
            vec![QueueState::Running],
            vec![QueueState::Running, QueueState::Processing],
            vec![
                QueueState::Running,
                QueueState::Processing,
                QueueState::Recovering,
            ],
        ] {
            let machine = QueueStateMachine::new();
            for step in path {
                assert!(machine.transition(step));
            }
            assert!(machine.halt());
        }
    }

    #[test]
    fn test_clones_share_state() {
        let machine = QueueStateMachine::new();
        let other = machine.clone();
        machine.transition(QueueState::Running);
        assert_eq!(other.current(), QueueState::Running);
    }

    #[tokio::test]
    async fn test_wait_for_observes_change() {
        let machine = QueueStateMachine::new();
        let setter = machine.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            setter.transition(QueueState::Running);
        });

        let state = machine
            .wait_for(|state| state != QueueState::Initializing)
            .await;
        assert_eq!(state, QueueState::Running);
    }

    #[tokio::test]
    async fn test_wait_for_returns_current_state_when_already_satisfied() {
        let machine = QueueStateMachine::new();
        machine.halt();

        let state = machine.wait_for(QueueState::is_halted).await;
        assert_eq!(state, QueueState::Halted);
    }
}
