//! Per-publish delivery aggregation
//!
//! A `DeliveryTracker` collects the outcomes of every subscriber a
//! message was fanned out to and turns them into one resolution event.
//! The subscriber set is fixed at construction — a snapshot of the
//! channel's subscribers at publish time — and each slot resolves
//! exactly once.

use crate::error::{BusError, Result};
use crate::message::{Message, SubscriberId};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Per-subscriber outcome within one publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pending,
    Acked,
    Nacked,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Outcome::Pending => "pending",
            Outcome::Acked => "acked",
            Outcome::Nacked => "nacked",
        }
    }
}

type ResolutionFn = Arc<dyn Fn() + Send + Sync>;
type DeadLetterFn = Arc<dyn Fn(SubscriberId) + Send + Sync>;

struct Aggregate {
    outcomes: BTreeMap<SubscriberId, Outcome>,
    resolved: bool,
    on_complete: Option<ResolutionFn>,
    on_resolved: Option<ResolutionFn>,
    on_dead_letter: Option<DeadLetterFn>,
}

/// Aggregates N subscriber outcomes for a single published message
pub struct DeliveryTracker {
    message: Message,
    channel: String,
    aggregate: Mutex<Aggregate>,
}

impl DeliveryTracker {
    /// Create a tracker over a snapshot of subscriber ids
    pub fn new(
        message: Message,
        channel: impl Into<String>,
        subscriber_ids: impl IntoIterator<Item = SubscriberId>,
    ) -> Self {
        let outcomes = subscriber_ids
            .into_iter()
            .map(|id| (id, Outcome::Pending))
            .collect();
        Self {
            message,
            channel: channel.into(),
            aggregate: Mutex::new(Aggregate {
                outcomes,
                resolved: false,
                on_complete: None,
                on_resolved: None,
                on_dead_letter: None,
            }),
        }
    }

    /// Install the completion callback, replacing any prior one
    ///
    /// Fires exactly once, and only if every subscriber acked.
    pub fn on_complete(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.lock().on_complete = Some(Arc::new(callback));
    }

    /// Install the resolution callback, replacing any prior one
    ///
    /// Fires exactly once, unconditionally, when the last pending
    /// subscriber slot resolves.
    pub fn on_resolved(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.lock().on_resolved = Some(Arc::new(callback));
    }

    /// Install the dead-letter callback, replacing any prior one
    ///
    /// Fires for each nack with the nacking subscriber's id.
    pub fn on_dead_letter(&self, callback: impl Fn(SubscriberId) + Send + Sync + 'static) {
        self.lock().on_dead_letter = Some(Arc::new(callback));
    }

    /// Record a positive acknowledgment for one subscriber slot
    pub fn ack(&self, subscriber_id: SubscriberId) -> Result<()> {
        self.resolve_slot(subscriber_id, Outcome::Acked)
    }

    /// Record a negative acknowledgment for one subscriber slot
    pub fn nack(&self, subscriber_id: SubscriberId) -> Result<()> {
        self.resolve_slot(subscriber_id, Outcome::Nacked)
    }

    fn resolve_slot(&self, subscriber_id: SubscriberId, outcome: Outcome) -> Result<()> {
        let (dead_letter, resolution) = {
            let mut aggregate = self.lock();
            match aggregate.outcomes.get_mut(&subscriber_id) {
                None => return Err(BusError::UnknownSubscriber { subscriber_id }),
                Some(slot) if *slot == Outcome::Pending => *slot = outcome,
                Some(slot) => {
                    return Err(BusError::AlreadyResolved {
                        subscriber_id,
                        state: slot.as_str(),
                    })
                }
            }

            let dead_letter = if outcome == Outcome::Nacked {
                aggregate.on_dead_letter.clone()
            } else {
                None
            };

            let all_resolved = aggregate
                .outcomes
                .values()
                .all(|slot| *slot != Outcome::Pending);
            let resolution = if all_resolved && !aggregate.resolved {
                aggregate.resolved = true;
                let all_acked = aggregate
                    .outcomes
                    .values()
                    .all(|slot| *slot == Outcome::Acked);
                let complete = aggregate.on_complete.take().filter(|_| all_acked);
                Some((complete, aggregate.on_resolved.take()))
            } else {
                None
            };

            (dead_letter, resolution)
        };

        if let Some(callback) = dead_letter {
            callback(subscriber_id);
        }
        if let Some((complete, resolved)) = resolution {
            tracing::debug!(
                channel = %self.channel,
                message_id = %self.message.id(),
                delivered = complete.is_some(),
                "Tracker resolved"
            );
            if let Some(callback) = complete {
                callback();
            }
            if let Some(callback) = resolved {
                callback();
            }
        }
        Ok(())
    }

    /// The message this tracker aggregates outcomes for
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Name of the channel that published the message
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// True iff every subscriber acked
    pub fn is_fully_delivered(&self) -> bool {
        self.lock()
            .outcomes
            .values()
            .all(|slot| *slot == Outcome::Acked)
    }

    /// True iff no subscriber slot is still pending
    pub fn is_fully_resolved(&self) -> bool {
        self.lock()
            .outcomes
            .values()
            .all(|slot| *slot != Outcome::Pending)
    }

    /// Number of subscriber slots still pending
    pub fn pending_count(&self) -> usize {
        self.lock()
            .outcomes
            .values()
            .filter(|slot| **slot == Outcome::Pending)
            .count()
    }

    /// The fixed subscriber snapshot, in ascending id order
    pub fn subscriber_ids(&self) -> Vec<SubscriberId> {
        self.lock().outcomes.keys().copied().collect()
    }

    /// The recorded outcome for one subscriber slot
    pub fn outcome(&self, subscriber_id: SubscriberId) -> Option<Outcome> {
        self.lock().outcomes.get(&subscriber_id).copied()
    }

    fn lock(&self) -> MutexGuard<'_, Aggregate> {
        self.aggregate.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for DeliveryTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let aggregate = self.lock();
        f.debug_struct("DeliveryTracker")
            .field("message_id", &self.message.id())
            .field("channel", &self.channel)
            .field("outcomes", &aggregate.outcomes)
            .field("resolved", &aggregate.resolved)
            .finish()
    }
}
