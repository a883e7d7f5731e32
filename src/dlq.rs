//! Dead letter queue — ordered store of failed deliveries
//!
//! Every delivery that resolves as nacked, whether explicitly, by a
//! handler fault, or by timeout, is pushed here together with a
//! textual reason. The queue preserves insertion order; `drain` hands
//! the caller a snapshot for retry policies the bus itself never
//! implements.

use crate::delivery::Delivery;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type OnPush = Arc<dyn Fn(&DeadLetter) + Send + Sync>;

/// A failed delivery with context about why it ended up in the DLQ
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// The failed delivery
    pub delivery: Arc<Delivery>,

    /// Reason the delivery was dead-lettered ("timeout" or "nack")
    pub reason: &'static str,

    /// Unix timestamp in milliseconds when the delivery was dead-lettered
    pub dead_lettered_at: u64,
}

/// Per-channel ordered collection of failed deliveries
#[derive(Default)]
pub struct DeadLetterQueue {
    entries: Mutex<Vec<DeadLetter>>,
    on_push: Mutex<Option<OnPush>>,
}

impl DeadLetterQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a failed delivery, recording the reason from its state
    pub(crate) fn push(&self, delivery: Arc<Delivery>) {
        let entry = DeadLetter {
            reason: if delivery.timed_out() { "timeout" } else { "nack" },
            dead_lettered_at: now_millis(),
            delivery,
        };

        tracing::warn!(
            channel = %entry.delivery.channel(),
            subscriber_id = entry.delivery.subscriber_id(),
            message_id = %entry.delivery.message().id(),
            reason = entry.reason,
            "Delivery dead-lettered"
        );

        self.lock_entries().push(entry.clone());

        let callback = self
            .on_push
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(&entry);
        }
    }

    /// Number of entries in the queue
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    /// Snapshot of the entries in insertion order
    pub fn entries(&self) -> Vec<DeadLetter> {
        self.lock_entries().clone()
    }

    /// Empty the queue, returning the previous contents in insertion order
    pub fn drain(&self) -> Vec<DeadLetter> {
        std::mem::take(&mut *self.lock_entries())
    }

    /// Discard every entry
    pub fn clear(&self) {
        self.lock_entries().clear();
    }

    /// Install the on-push callback, replacing any prior one
    pub fn set_on_push(&self, callback: impl Fn(&DeadLetter) + Send + Sync + 'static) {
        *self.on_push.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    fn lock_entries(&self) -> MutexGuard<'_, Vec<DeadLetter>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Current time in Unix milliseconds
fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn nacked_delivery(subscriber_id: u64) -> Arc<Delivery> {
        let delivery = Delivery::new(
            Message::new("payload".to_string()),
            "orders",
            subscriber_id,
            None,
            None,
            None,
        );
        delivery.nack().unwrap();
        delivery
    }

    #[tokio::test]
    async fn test_push_records_reason_and_order() {
        let dlq = DeadLetterQueue::new();
        assert!(dlq.is_empty());

        dlq.push(nacked_delivery(1));
        dlq.push(nacked_delivery(2));

        assert_eq!(dlq.len(), 2);
        let entries = dlq.entries();
        assert_eq!(entries[0].delivery.subscriber_id(), 1);
        assert_eq!(entries[1].delivery.subscriber_id(), 2);
        assert_eq!(entries[0].reason, "nack");
        assert!(entries[0].dead_lettered_at > 0);
    }

    #[tokio::test]
    async fn test_timeout_reason() {
        let delivery = Delivery::new(
            Message::new(1u8),
            "slow",
            1,
            Some(std::time::Duration::from_millis(10)),
            None,
            None,
        );
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        assert!(delivery.timed_out());

        let dlq = DeadLetterQueue::new();
        dlq.push(delivery);
        assert_eq!(dlq.entries()[0].reason, "timeout");
    }

    #[tokio::test]
    async fn test_drain_returns_snapshot_and_empties() {
        let dlq = DeadLetterQueue::new();
        dlq.push(nacked_delivery(1));
        dlq.push(nacked_delivery(2));
        dlq.push(nacked_delivery(3));

        let drained = dlq.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].delivery.subscriber_id(), 1);
        assert_eq!(drained[2].delivery.subscriber_id(), 3);

        assert_eq!(dlq.len(), 0);
        assert!(dlq.drain().is_empty());
    }

    #[tokio::test]
    async fn test_clear() {
        let dlq = DeadLetterQueue::new();
        dlq.push(nacked_delivery(1));
        dlq.clear();
        assert!(dlq.is_empty());
    }

    #[tokio::test]
    async fn test_on_push_callback_fires_per_entry() {
        let dlq = DeadLetterQueue::new();
        let pushes = Arc::new(AtomicUsize::new(0));

        let counter = pushes.clone();
        dlq.set_on_push(move |entry| {
            assert_eq!(entry.reason, "nack");
            counter.fetch_add(1, Ordering::SeqCst);
        });

        dlq.push(nacked_delivery(1));
        dlq.push(nacked_delivery(2));
        assert_eq!(pushes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_on_push_callback_is_replaced() {
        let dlq = DeadLetterQueue::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = first.clone();
        dlq.set_on_push(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = second.clone();
        dlq.set_on_push(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        dlq.push(nacked_delivery(1));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}
