//! Monotonic lifecycle state shared by a session and its waiters.

use rpty_core::RptyError;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a reconnecting PTY. States only move forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    /// Attaching blocks until the backend has started.
    #[default]
    Starting,
    /// Connections may attach.
    Ready,
    /// Shutdown has begun; the process may still be exiting.
    Closing,
    /// The backend is closed and the process has been killed.
    Done,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Starting => "starting",
            State::Ready => "ready",
            State::Closing => "closing",
            State::Done => "done",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
struct Status {
    state: State,
    errors: Vec<Arc<RptyError>>,
}

impl Status {
    fn error(&self) -> Option<RptyError> {
        if self.errors.is_empty() {
            None
        } else {
            Some(RptyError::Joined(self.errors.clone()))
        }
    }
}

/// Broadcasts state changes, and the errors that came with them, to every waiter.
#[derive(Debug)]
pub struct StateMachine {
    tx: watch::Sender<Status>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Status::default());
        Self { tx }
    }

    /// Move to `next` and append `err` to the accumulated error.
    ///
    /// Does nothing (and drops `err`) unless `next` is past the current state.
    /// Returns whether the transition happened.
    pub fn set_state(&self, next: State, err: Option<RptyError>) -> bool {
        self.tx.send_if_modified(|status| {
            if next <= status.state {
                return false;
            }
            match err {
                Some(RptyError::Joined(parts)) => status.errors.extend(parts),
                Some(other) => status.errors.push(Arc::new(other)),
                None => {}
            }
            status.state = next;
            true
        })
    }

    pub fn state(&self) -> State {
        self.tx.borrow().state
    }

    /// Current state and accumulated error.
    pub fn snapshot(&self) -> (State, Option<RptyError>) {
        let status = self.tx.borrow();
        (status.state, status.error())
    }

    /// Block until `target` or a later state is reached.
    pub async fn wait_for_state(&self, target: State) -> (State, Option<RptyError>) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|status| status.state >= target).await;
        self.snapshot()
    }

    /// Like [`wait_for_state`](Self::wait_for_state) but also wakes when
    /// `token` is cancelled, in which case the error is
    /// [`RptyError::Cancelled`] whatever the state.
    pub async fn wait_for_state_or_cancel(
        &self,
        token: &CancellationToken,
        target: State,
    ) -> (State, Option<RptyError>) {
        let mut rx = self.tx.subscribe();
        tokio::select! {
            _ = token.cancelled() => {}
            _ = rx.wait_for(|status| status.state >= target) => {}
        }
        let (state, err) = self.snapshot();
        if token.is_cancelled() {
            return (state, Some(RptyError::Cancelled));
        }
        (state, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn never_regresses() {
        let sm = StateMachine::new();
        assert!(sm.set_state(State::Ready, None));
        assert!(sm.set_state(State::Done, Some(RptyError::Done)));
        assert!(!sm.set_state(State::Closing, Some(RptyError::Closing("late".into()))));
        assert!(!sm.set_state(State::Starting, None));
        assert_eq!(sm.state(), State::Done);

        // The rejected transitions did not touch the error.
        let (_, err) = sm.snapshot();
        assert_eq!(err.unwrap().to_string(), "reconnecting pty is done");
    }

    #[test]
    fn errors_accumulate() {
        let sm = StateMachine::new();
        sm.set_state(State::Closing, Some(RptyError::Closing("timeout".into())));
        sm.set_state(
            State::Done,
            RptyError::join(Some(RptyError::Other("close failed".into())), Some(RptyError::Done)),
        );
        let (_, err) = sm.snapshot();
        assert_eq!(err.unwrap().parts().len(), 3);
    }

    #[test]
    fn observed_states_are_monotonic() {
        let sm = StateMachine::new();
        let sequence = [
            State::Ready,
            State::Starting,
            State::Closing,
            State::Ready,
            State::Done,
            State::Closing,
        ];
        let mut last = sm.state();
        for next in sequence {
            sm.set_state(next, None);
            let now = sm.state();
            assert!(now >= last, "state went from {last} to {now}");
            last = now;
        }
        assert_eq!(last, State::Done);
    }

    #[tokio::test]
    async fn waiters_wake_on_later_state() {
        let sm = Arc::new(StateMachine::new());
        let waiter = {
            let sm = sm.clone();
            tokio::spawn(async move { sm.wait_for_state(State::Ready).await })
        };
        tokio::task::yield_now().await;
        // Skipping straight past the target still wakes the waiter.
        sm.set_state(State::Closing, Some(RptyError::Closing("test".into())));
        let (state, err) = waiter.await.unwrap();
        assert_eq!(state, State::Closing);
        assert!(err.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_wakes_waiter() {
        let sm = Arc::new(StateMachine::new());
        let token = CancellationToken::new();
        let waiter = {
            let sm = sm.clone();
            let token = token.clone();
            tokio::spawn(async move { sm.wait_for_state_or_cancel(&token, State::Ready).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        token.cancel();
        let (state, err) = waiter.await.unwrap();
        assert_eq!(state, State::Starting);
        assert!(err.unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn already_reached_returns_immediately() {
        let sm = StateMachine::new();
        sm.set_state(State::Ready, None);
        let token = CancellationToken::new();
        let (state, err) = sm.wait_for_state_or_cancel(&token, State::Ready).await;
        assert_eq!(state, State::Ready);
        assert!(err.is_none());
    }
}
