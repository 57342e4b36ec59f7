//! Restartable one-shot timer driving the idle timeout.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deadline {
    Unarmed,
    At(Instant),
    Stopped,
}

/// Runs a callback once when its deadline passes.
///
/// The deadline can be pushed back any number of times with
/// [`reset`](IdleTimer::reset). After [`stop`](IdleTimer::stop) the timer
/// never fires and resets are ignored.
#[derive(Debug)]
pub struct IdleTimer {
    tx: watch::Sender<Deadline>,
}

impl IdleTimer {
    /// Spawn an unarmed timer. Must be called from within a tokio runtime.
    pub fn spawn<F>(on_expire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (tx, mut rx) = watch::channel(Deadline::Unarmed);
        let mut on_expire = Some(on_expire);
        tokio::spawn(async move {
            loop {
                let current = *rx.borrow_and_update();
                match current {
                    Deadline::Stopped => return,
                    Deadline::Unarmed => {
                        if rx.changed().await.is_err() {
                            return;
                        }
                    }
                    Deadline::At(deadline) => {
                        tokio::select! {
                            _ = tokio::time::sleep_until(deadline) => {
                                if let Some(f) = on_expire.take() {
                                    f();
                                }
                                return;
                            }
                            changed = rx.changed() => {
                                if changed.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        });
        Self { tx }
    }

    /// Arm the timer to fire `after` from now, replacing any earlier deadline.
    ///
    /// Returns false once the timer has been stopped.
    pub fn reset(&self, after: Duration) -> bool {
        self.tx.send_if_modified(|deadline| {
            if *deadline == Deadline::Stopped {
                return false;
            }
            *deadline = Deadline::At(Instant::now() + after);
            true
        })
    }

    pub fn stop(&self) {
        self.tx.send_replace(Deadline::Stopped);
    }

    /// When the timer will fire, if armed.
    pub fn deadline(&self) -> Option<Instant> {
        match *self.tx.borrow() {
            Deadline::At(at) => Some(at),
            _ => None,
        }
    }
}
