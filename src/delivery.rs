//! Per-subscriber delivery envelope
//!
//! A `Delivery` is the single-subscriber side of one message handoff.
//! It races an optional timeout against acknowledgment: whichever of
//! ack, nack, or timeout happens first wins, and the state machine
//! never leaves a terminal state. The timeout task re-checks the
//! pending state after sleeping, so a delivery that resolved while the
//! timer slept is left untouched.

use crate::error::{BusError, Result};
use crate::message::{Message, SubscriberId};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Resolution callback, invoked with the delivery that resolved
///
/// Runs on the task that called ack or nack (or on the timeout task).
pub(crate) type ResolveFn = Box<dyn Fn(&Arc<Delivery>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Pending,
    Acked,
    Nacked,
}

impl State {
    fn as_str(self) -> &'static str {
        match self {
            State::Pending => "pending",
            State::Acked => "acked",
            State::Nacked => "nacked",
        }
    }
}

struct Lifecycle {
    state: State,
    timed_out: bool,
    timeout_task: Option<JoinHandle<()>>,
    on_ack: Option<ResolveFn>,
    on_nack: Option<ResolveFn>,
}

/// One message handed to one subscriber, awaiting acknowledgment
pub struct Delivery {
    message: Message,
    channel: String,
    subscriber_id: SubscriberId,
    lifecycle: Mutex<Lifecycle>,
}

impl Delivery {
    /// Create a delivery and, if a positive timeout is given, start its
    /// timeout task. The task holds only a weak reference, so dropping
    /// the delivery also retires the timer.
    pub(crate) fn new(
        message: Message,
        channel: impl Into<String>,
        subscriber_id: SubscriberId,
        timeout: Option<Duration>,
        on_ack: Option<ResolveFn>,
        on_nack: Option<ResolveFn>,
    ) -> Arc<Self> {
        let delivery = Arc::new(Self {
            message,
            channel: channel.into(),
            subscriber_id,
            lifecycle: Mutex::new(Lifecycle {
                state: State::Pending,
                timed_out: false,
                timeout_task: None,
                on_ack,
                on_nack,
            }),
        });

        if let Some(timeout) = timeout.filter(|t| !t.is_zero()) {
            let weak = Arc::downgrade(&delivery);
            let task = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(delivery) = weak.upgrade() {
                    delivery.fire_timeout();
                }
            });
            delivery.lock().timeout_task = Some(task);
        }

        delivery
    }

    /// Positively acknowledge this delivery
    ///
    /// Cancels the timeout task and invokes the on-ack callback on the
    /// caller's task. Fails with `AlreadyResolved` if the delivery has
    /// left the pending state.
    pub fn ack(self: &Arc<Self>) -> Result<()> {
        let (task, callback) = {
            let mut lifecycle = self.lock();
            if lifecycle.state != State::Pending {
                return Err(BusError::AlreadyResolved {
                    subscriber_id: self.subscriber_id,
                    state: lifecycle.state.as_str(),
                });
            }
            lifecycle.state = State::Acked;
            lifecycle.on_nack = None;
            (lifecycle.timeout_task.take(), lifecycle.on_ack.take())
        };

        if let Some(task) = task {
            task.abort();
        }
        if let Some(callback) = callback {
            callback(self);
        }
        Ok(())
    }

    /// Negatively acknowledge this delivery
    ///
    /// Same contract as [`ack`](Self::ack), but transitions to nacked
    /// and invokes the on-nack callback.
    pub fn nack(self: &Arc<Self>) -> Result<()> {
        let (task, callback) = {
            let mut lifecycle = self.lock();
            if lifecycle.state != State::Pending {
                return Err(BusError::AlreadyResolved {
                    subscriber_id: self.subscriber_id,
                    state: lifecycle.state.as_str(),
                });
            }
            lifecycle.state = State::Nacked;
            lifecycle.on_ack = None;
            (lifecycle.timeout_task.take(), lifecycle.on_nack.take())
        };

        if let Some(task) = task {
            task.abort();
        }
        if let Some(callback) = callback {
            callback(self);
        }
        Ok(())
    }

    /// Stop the timeout task without changing state. Idempotent.
    pub fn cancel_timeout(&self) {
        let task = self.lock().timeout_task.take();
        if let Some(task) = task {
            task.abort();
        }
    }

    /// The timeout path: only acts if the delivery is still pending.
    fn fire_timeout(self: &Arc<Self>) {
        let callback = {
            let mut lifecycle = self.lock();
            if lifecycle.state != State::Pending {
                return;
            }
            lifecycle.state = State::Nacked;
            lifecycle.timed_out = true;
            lifecycle.timeout_task = None;
            lifecycle.on_ack = None;
            lifecycle.on_nack.take()
        };

        tracing::debug!(
            channel = %self.channel,
            subscriber_id = self.subscriber_id,
            message_id = %self.message.id(),
            "Delivery timed out"
        );

        if let Some(callback) = callback {
            callback(self);
        }
    }

    /// The message being delivered
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Name of the channel that created this delivery
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// The subscriber this delivery targets
    pub fn subscriber_id(&self) -> SubscriberId {
        self.subscriber_id
    }

    /// Whether the delivery is still awaiting resolution
    pub fn is_pending(&self) -> bool {
        self.lock().state == State::Pending
    }

    /// Whether the delivery resolved as acked
    pub fn is_acked(&self) -> bool {
        self.lock().state == State::Acked
    }

    /// Whether the delivery resolved as nacked
    pub fn is_nacked(&self) -> bool {
        self.lock().state == State::Nacked
    }

    /// Whether a timeout caused the nack
    pub fn timed_out(&self) -> bool {
        self.lock().timed_out
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lifecycle = self.lock();
        f.debug_struct("Delivery")
            .field("message_id", &self.message.id())
            .field("channel", &self.channel)
            .field("subscriber_id", &self.subscriber_id)
            .field("state", &lifecycle.state.as_str())
            .field("timed_out", &lifecycle.timed_out)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_callback(counter: Arc<AtomicUsize>) -> ResolveFn {
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn test_delivery(
        timeout: Option<Duration>,
        acks: Arc<AtomicUsize>,
        nacks: Arc<AtomicUsize>,
    ) -> Arc<Delivery> {
        Delivery::new(
            Message::new("payload".to_string()),
            "orders",
            1,
            timeout,
            Some(counting_callback(acks)),
            Some(counting_callback(nacks)),
        )
    }

    #[tokio::test]
    async fn test_ack_resolves() {
        let acks = Arc::new(AtomicUsize::new(0));
        let nacks = Arc::new(AtomicUsize::new(0));
        let delivery = test_delivery(None, acks.clone(), nacks.clone());

        assert!(delivery.is_pending());
        delivery.ack().unwrap();

        assert!(delivery.is_acked());
        assert!(!delivery.is_pending());
        assert!(!delivery.timed_out());
        assert_eq!(acks.load(Ordering::SeqCst), 1);
        assert_eq!(nacks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_nack_resolves() {
        let acks = Arc::new(AtomicUsize::new(0));
        let nacks = Arc::new(AtomicUsize::new(0));
        let delivery = test_delivery(None, acks.clone(), nacks.clone());

        delivery.nack().unwrap();

        assert!(delivery.is_nacked());
        assert!(!delivery.timed_out());
        assert_eq!(acks.load(Ordering::SeqCst), 0);
        assert_eq!(nacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_double_resolution_fails() {
        let acks = Arc::new(AtomicUsize::new(0));
        let nacks = Arc::new(AtomicUsize::new(0));
        let delivery = test_delivery(None, acks.clone(), nacks.clone());

        delivery.ack().unwrap();

        let err = delivery.ack().unwrap_err();
        assert!(matches!(
            err,
            BusError::AlreadyResolved { subscriber_id: 1, state: "acked" }
        ));
        let err = delivery.nack().unwrap_err();
        assert!(matches!(err, BusError::AlreadyResolved { .. }));

        assert_eq!(acks.load(Ordering::SeqCst), 1);
        assert_eq!(nacks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timeout_nacks_pending_delivery() {
        let acks = Arc::new(AtomicUsize::new(0));
        let nacks = Arc::new(AtomicUsize::new(0));
        let delivery = test_delivery(
            Some(Duration::from_millis(20)),
            acks.clone(),
            nacks.clone(),
        );

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(delivery.is_nacked());
        assert!(delivery.timed_out());
        assert_eq!(nacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ack_cancels_timeout() {
        let acks = Arc::new(AtomicUsize::new(0));
        let nacks = Arc::new(AtomicUsize::new(0));
        let delivery = test_delivery(
            Some(Duration::from_millis(20)),
            acks.clone(),
            nacks.clone(),
        );

        delivery.ack().unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(delivery.is_acked());
        assert!(!delivery.timed_out());
        assert_eq!(acks.load(Ordering::SeqCst), 1);
        assert_eq!(nacks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_timeout_is_idempotent() {
        let acks = Arc::new(AtomicUsize::new(0));
        let nacks = Arc::new(AtomicUsize::new(0));
        let delivery = test_delivery(
            Some(Duration::from_millis(20)),
            acks.clone(),
            nacks.clone(),
        );

        delivery.cancel_timeout();
        delivery.cancel_timeout();
        tokio::time::sleep(Duration::from_millis(80)).await;

        // Timer stopped, state untouched
        assert!(delivery.is_pending());
        assert_eq!(nacks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_zero_timeout_never_nacks() {
        let acks = Arc::new(AtomicUsize::new(0));
        let nacks = Arc::new(AtomicUsize::new(0));
        let delivery = test_delivery(Some(Duration::ZERO), acks, nacks.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(delivery.is_pending());
        assert_eq!(nacks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_callback_receives_resolved_delivery() {
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        let delivery = Delivery::new(
            Message::new(7u32),
            "orders",
            42,
            None,
            Some(Box::new(move |d: &Arc<Delivery>| {
                *seen_clone.lock().unwrap() = Some((d.subscriber_id(), d.is_acked()));
            })),
            None,
        );

        delivery.ack().unwrap();
        assert_eq!(*seen.lock().unwrap(), Some((42, true)));
    }
}
