//! Publish/subscribe channel — fan-out, throttling, backpressure, lifecycle
//!
//! A `Channel` is a named topic that fans every published message out
//! to its current subscribers, tracks each delivery until it is acked,
//! nacked, or timed out, and routes failures to a per-channel dead
//! letter queue. Bounded channels apply backpressure: publishers block
//! once `max_pending` publishes are in flight, and may additionally be
//! throttled with a delay that grows as capacity runs out.
//!
//! Handles are cheap to clone; all clones share the same channel.

use crate::delivery::{Delivery, ResolveFn};
use crate::dlq::DeadLetterQueue;
use crate::error::{BusError, Result};
use crate::gate::Gate;
use crate::message::{Message, SubscriberId, TypeConstraint, NO_SUBSCRIBER};
use crate::stats::{Metric, StatsMap};
use crate::tracker::DeliveryTracker;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Handler invoked with each delivery fanned out to a subscriber
///
/// The handler must ack or nack the delivery exactly once; with a
/// channel timeout configured, a delivery left pending is nacked
/// automatically. Returning an error is a handler fault: the dispatch
/// task logs it and nacks the delivery if it is still pending.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn handle(&self, delivery: Arc<Delivery>) -> Result<()>;
}

/// Adapter turning an async closure into a `Subscriber`
struct FnSubscriber {
    handler: Box<dyn Fn(Arc<Delivery>) -> BoxFuture<'static, Result<()>> + Send + Sync>,
}

#[async_trait]
impl Subscriber for FnSubscriber {
    async fn handle(&self, delivery: Arc<Delivery>) -> Result<()> {
        (self.handler)(delivery).await
    }
}

/// Channel configuration
///
/// `timeout_secs` of zero (or `None`) disables auto-nack. A non-zero
/// `throttle` requires `max_pending` and must lie strictly between 0
/// and 1.
#[derive(Debug, Clone, Default)]
pub struct ChannelOptions {
    /// Per-delivery acknowledgment timeout in seconds
    pub timeout_secs: Option<f64>,

    /// Maximum simultaneously pending publishes (`None` = unbounded)
    pub max_pending: Option<usize>,

    /// Throttle threshold as a fraction of remaining capacity; 0 disables
    pub throttle: f64,

    /// Optional payload type gate
    pub message_type: Option<TypeConstraint>,
}

struct ChannelState {
    subscribers: BTreeMap<SubscriberId, Arc<dyn Subscriber>>,
    next_subscriber_id: SubscriberId,
    pending: Vec<Arc<DeliveryTracker>>,
    active: Vec<Arc<Delivery>>,
    closed: bool,
}

struct ChannelShared {
    name: String,
    timeout: Option<Duration>,
    max_pending: Option<usize>,
    throttle: f64,
    constraint: Option<TypeConstraint>,
    state: Mutex<ChannelState>,
    capacity: Gate,
    dlq: Arc<DeadLetterQueue>,
    stats: StatsMap,
}

impl ChannelShared {
    fn lock_state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A named publish/subscribe topic with per-delivery tracking
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl Channel {
    /// Create a channel, validating its configuration
    pub fn new(name: impl Into<String>, options: ChannelOptions, stats: StatsMap) -> Result<Self> {
        let name = name.into();

        if let Some(max) = options.max_pending {
            if max == 0 {
                return Err(BusError::Config(format!(
                    "Channel '{}': max_pending must be positive",
                    name
                )));
            }
        }
        if options.throttle != 0.0 {
            if options.max_pending.is_none() {
                return Err(BusError::Config(format!(
                    "Channel '{}': throttle requires max_pending",
                    name
                )));
            }
            if !(options.throttle > 0.0 && options.throttle < 1.0) {
                return Err(BusError::Config(format!(
                    "Channel '{}': throttle must lie in (0, 1), got {}",
                    name, options.throttle
                )));
            }
        }

        let timeout = options
            .timeout_secs
            .filter(|t| t.is_finite() && *t > 0.0)
            .map(Duration::from_secs_f64);

        Ok(Self {
            shared: Arc::new(ChannelShared {
                name,
                timeout,
                max_pending: options.max_pending,
                throttle: options.throttle,
                constraint: options.message_type,
                state: Mutex::new(ChannelState {
                    subscribers: BTreeMap::new(),
                    next_subscriber_id: 1,
                    pending: Vec::new(),
                    active: Vec::new(),
                    closed: false,
                }),
                capacity: Gate::new(),
                dlq: Arc::new(DeadLetterQueue::new()),
                stats,
            }),
        })
    }

    /// Register a subscriber, returning its id
    ///
    /// Ids are assigned monotonically from 1 and never reused.
    pub fn subscribe(&self, handler: Arc<dyn Subscriber>) -> Result<SubscriberId> {
        let mut state = self.shared.lock_state();
        if state.closed {
            return Err(BusError::Closed(self.shared.name.clone()));
        }
        let id = state.next_subscriber_id;
        state.next_subscriber_id += 1;
        state.subscribers.insert(id, handler);
        drop(state);

        tracing::debug!(channel = %self.shared.name, subscriber_id = id, "Subscriber added");
        Ok(id)
    }

    /// Register an async closure as a subscriber
    pub fn subscribe_fn<F, Fut>(&self, handler: F) -> Result<SubscriberId>
    where
        F: Fn(Arc<Delivery>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe(Arc::new(FnSubscriber {
            handler: Box::new(move |delivery| Box::pin(handler(delivery))),
        }))
    }

    /// Remove a subscriber by id. No-op if absent.
    ///
    /// Deliveries already in flight for the subscriber are unaffected.
    pub fn unsubscribe(&self, id: SubscriberId) {
        let removed = self.shared.lock_state().subscribers.remove(&id).is_some();
        if removed {
            tracing::debug!(channel = %self.shared.name, subscriber_id = id, "Subscriber removed");
        }
    }

    /// Remove a subscriber by handler reference. No-op if absent.
    pub fn unsubscribe_handler(&self, handler: &Arc<dyn Subscriber>) {
        self.shared
            .lock_state()
            .subscribers
            .retain(|_, registered| !Arc::ptr_eq(registered, handler));
    }

    /// Publish a message to every current subscriber
    ///
    /// Validates the payload type, applies the throttle delay, waits
    /// for capacity on a bounded channel, then fans the message out in
    /// ascending subscriber-id order. Returns the tracker aggregating
    /// the subscribers' outcomes, or `None` when there were no
    /// subscribers (in which case a sentinel delivery goes straight to
    /// the dead letter queue).
    pub async fn publish(&self, message: Message) -> Result<Option<Arc<DeliveryTracker>>> {
        let shared = &self.shared;

        if shared.lock_state().closed {
            return Err(BusError::Closed(shared.name.clone()));
        }
        if let Some(constraint) = &shared.constraint {
            if !constraint.accepts(&message) {
                return Err(BusError::TypeMismatch {
                    channel: shared.name.clone(),
                    expected: constraint.name(),
                    actual: message.payload_type(),
                });
            }
        }

        // Adaptive throttle: delay grows as remaining capacity shrinks.
        // A full channel skips the sleep; the capacity wait below blocks.
        if shared.throttle > 0.0 {
            if let Some(max) = shared.max_pending {
                let pending = shared.lock_state().pending.len();
                let remaining = max.saturating_sub(pending);
                let ratio = remaining as f64 / max as f64;
                if ratio <= shared.throttle {
                    shared.stats.record(&shared.name, Metric::Throttled);
                    if remaining > 0 {
                        let delay = Duration::from_secs_f64(1.0 / (max as f64 * ratio));
                        tracing::debug!(
                            channel = %shared.name,
                            pending,
                            remaining,
                            delay_ms = delay.as_millis() as u64,
                            "Publish throttled"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        // Capacity wait and fan-out share one critical section: the
        // snapshot, the tracker registration, and the dispatch happen
        // atomically with the capacity check that admitted them.
        let mut closed = false;
        let mut no_subscribers = false;
        let mut dispatched: Option<Arc<DeliveryTracker>> = None;
        shared
            .capacity
            .wait_while(|| {
                let mut state = shared.lock_state();
                if state.closed {
                    closed = true;
                    return false;
                }
                if let Some(max) = shared.max_pending {
                    if state.pending.len() >= max {
                        return true;
                    }
                }
                if state.subscribers.is_empty() {
                    no_subscribers = true;
                    return false;
                }
                dispatched = Some(dispatch(shared, &mut state, &message));
                false
            })
            .await;

        if closed {
            return Err(BusError::Closed(shared.name.clone()));
        }
        if no_subscribers {
            let delivery = Delivery::new(
                message,
                shared.name.clone(),
                NO_SUBSCRIBER,
                None,
                None,
                None,
            );
            delivery.nack()?;
            shared.dlq.push(delivery);
            shared.stats.record(&shared.name, Metric::Nacked);
            shared.stats.record(&shared.name, Metric::DeadLettered);
            tracing::warn!(channel = %shared.name, "Publish with no subscribers dead-lettered");
            return Ok(None);
        }
        Ok(dispatched)
    }

    /// Close the channel. Idempotent.
    ///
    /// Every delivery still pending is nacked into the dead letter
    /// queue, and any publisher blocked on capacity is woken to observe
    /// the closure.
    pub fn close(&self) {
        let shared = &self.shared;
        let (was_closed, abandoned) = {
            let mut state = shared.lock_state();
            let was_closed = state.closed;
            state.closed = true;
            (was_closed, std::mem::take(&mut state.active))
        };

        for delivery in &abandoned {
            if delivery.is_pending() {
                if let Err(e) = delivery.nack() {
                    tracing::debug!(error = %e, "Delivery resolved during close");
                }
            }
        }
        shared.capacity.signal();

        if !was_closed {
            tracing::info!(
                channel = %shared.name,
                abandoned = abandoned.len(),
                "Channel closed"
            );
        }
    }

    /// Hard reset: discard all in-flight work and the dead letter queue
    ///
    /// Timeout tasks of active deliveries are cancelled so they cannot
    /// dead-letter after the reset. Does not close the channel.
    pub fn clear(&self) {
        let shared = &self.shared;
        let (active, pending) = {
            let mut state = shared.lock_state();
            (
                std::mem::take(&mut state.active),
                std::mem::take(&mut state.pending),
            )
        };

        for delivery in &active {
            delivery.cancel_timeout();
        }
        drop(pending);
        shared.dlq.clear();
        shared.capacity.signal();

        tracing::debug!(
            channel = %shared.name,
            discarded = active.len(),
            "Channel cleared"
        );
    }

    /// The channel's name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.shared.lock_state().subscribers.len()
    }

    /// Number of publishes whose trackers have not yet resolved
    pub fn pending_count(&self) -> usize {
        self.shared.lock_state().pending.len()
    }

    /// Whether any publish is still unresolved
    pub fn has_pending(&self) -> bool {
        self.pending_count() > 0
    }

    /// Whether the channel has been closed
    pub fn is_closed(&self) -> bool {
        self.shared.lock_state().closed
    }

    /// The channel's dead letter queue
    pub fn dead_letters(&self) -> Arc<DeadLetterQueue> {
        self.shared.dlq.clone()
    }

    /// The counter map this channel records into
    pub fn stats(&self) -> &StatsMap {
        &self.shared.stats
    }
}

/// Fan a message out under the channel state lock: snapshot the
/// subscribers, register the tracker, and schedule one dispatch task
/// per subscriber in ascending id order.
fn dispatch(
    shared: &Arc<ChannelShared>,
    state: &mut ChannelState,
    message: &Message,
) -> Arc<DeliveryTracker> {
    let snapshot: Vec<(SubscriberId, Arc<dyn Subscriber>)> = state
        .subscribers
        .iter()
        .map(|(id, handler)| (*id, handler.clone()))
        .collect();

    let tracker = Arc::new(DeliveryTracker::new(
        message.clone(),
        shared.name.clone(),
        snapshot.iter().map(|(id, _)| *id),
    ));

    {
        let stats = shared.stats.clone();
        let name = shared.name.clone();
        tracker.on_complete(move || {
            stats.record(&name, Metric::Delivered);
        });
    }
    {
        let channel = Arc::downgrade(shared);
        let resolved = Arc::downgrade(&tracker);
        tracker.on_resolved(move || {
            if let (Some(shared), Some(tracker)) = (channel.upgrade(), resolved.upgrade()) {
                shared
                    .lock_state()
                    .pending
                    .retain(|t| !Arc::ptr_eq(t, &tracker));
                shared.capacity.signal();
            }
        });
    }
    state.pending.push(tracker.clone());

    for (id, handler) in snapshot {
        let on_ack: ResolveFn = {
            let channel = Arc::downgrade(shared);
            let tracker = tracker.clone();
            Box::new(move |delivery: &Arc<Delivery>| {
                if let Some(shared) = channel.upgrade() {
                    shared
                        .lock_state()
                        .active
                        .retain(|d| !Arc::ptr_eq(d, delivery));
                }
                if let Err(e) = tracker.ack(delivery.subscriber_id()) {
                    tracing::warn!(error = %e, "Tracker rejected ack");
                }
            })
        };
        let on_nack: ResolveFn = {
            let channel = Arc::downgrade(shared);
            let tracker = tracker.clone();
            Box::new(move |delivery: &Arc<Delivery>| {
                if let Some(shared) = channel.upgrade() {
                    shared
                        .lock_state()
                        .active
                        .retain(|d| !Arc::ptr_eq(d, delivery));
                    shared.dlq.push(delivery.clone());
                    let metric = if delivery.timed_out() {
                        Metric::TimedOut
                    } else {
                        Metric::Nacked
                    };
                    shared.stats.record(&shared.name, metric);
                    shared.stats.record(&shared.name, Metric::DeadLettered);
                }
                if let Err(e) = tracker.nack(delivery.subscriber_id()) {
                    tracing::warn!(error = %e, "Tracker rejected nack");
                }
            })
        };

        let delivery = Delivery::new(
            message.clone(),
            shared.name.clone(),
            id,
            shared.timeout,
            Some(on_ack),
            Some(on_nack),
        );
        state.active.push(delivery.clone());

        let name = shared.name.clone();
        tokio::spawn(async move {
            if let Err(e) = handler.handle(delivery.clone()).await {
                tracing::error!(
                    channel = %name,
                    subscriber_id = id,
                    error = %e,
                    "Subscriber handler failed"
                );
                if delivery.is_pending() {
                    if let Err(e) = delivery.nack() {
                        tracing::debug!(error = %e, "Delivery resolved before fault nack");
                    }
                }
            }
        });
    }

    tracker
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock_state();
        f.debug_struct("Channel")
            .field("name", &self.shared.name)
            .field("subscribers", &state.subscribers.len())
            .field("pending", &state.pending.len())
            .field("closed", &state.closed)
            .finish()
    }
}
