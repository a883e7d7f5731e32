//! Cooperative backpressure gate
//!
//! A condition-variable-style wait/signal over `tokio::sync::Notify`.
//! The gate carries no payload; callers re-check their own predicate
//! around the wait. The wakeup future is armed before each predicate
//! check, so a signal arriving between check and await is never lost.

use tokio::sync::Notify;

#[derive(Debug, Default)]
pub(crate) struct Gate {
    notify: Notify,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspend the calling task while `blocked` returns true
    ///
    /// `blocked` is re-evaluated after every signal.
    pub async fn wait_while<F: FnMut() -> bool>(&self, mut blocked: F) {
        loop {
            let released = self.notify.notified();
            if !blocked() {
                return;
            }
            released.await;
        }
    }

    /// Release every task currently waiting on the gate
    pub fn signal(&self) {
        self.notify.notify_waiters();
    }
}
