//! # busline
//!
//! In-process publish/subscribe message bus with per-delivery
//! acknowledgment, timeouts, dead-letter routing, and adaptive
//! backpressure.
//!
//! ## Overview
//!
//! `busline` fans each published message out to every subscriber of a
//! named channel and tracks the delivery until the subscriber acks or
//! nacks it — or a per-channel timeout nacks it first. Failed
//! deliveries land in a per-channel dead letter queue. Bounded
//! channels block publishers at `max_pending` in-flight publishes and
//! can throttle them earlier with a delay that grows as capacity runs
//! out.
//!
//! ## Quick Start
//!
//! ```rust
//! use busline::{Bus, ChannelOptions, Message};
//!
//! # async fn example() -> busline::Result<()> {
//! let bus = Bus::new();
//! bus.add_channel(
//!     "greetings",
//!     ChannelOptions {
//!         timeout_secs: Some(5.0),
//!         ..Default::default()
//!     },
//! )
//! .await?;
//!
//! bus.subscribe_fn("greetings", |delivery| async move {
//!     println!("received: {:?}", delivery.message().downcast_ref::<String>());
//!     delivery.ack()
//! })
//! .await?;
//!
//! bus.publish("greetings", Message::new("Hi".to_string())).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **Channel** — named topic owning the fan-out protocol, throttle,
//!   backpressure gate, and close/clear lifecycle
//! - **Delivery** — per-subscriber envelope racing a timeout against
//!   acknowledgment
//! - **DeliveryTracker** — per-publish aggregation of N subscriber
//!   outcomes into one resolution event
//! - **DeadLetterQueue** — ordered per-channel store of failed
//!   deliveries
//! - **Bus** — registry facade mapping names to channels over one
//!   shared counter map

pub mod channel;
pub mod config;
pub mod delivery;
pub mod dlq;
pub mod error;
mod gate;
pub mod message;
pub mod registry;
pub mod stats;
pub mod tracker;

// Re-export core types
pub use channel::{Channel, ChannelOptions, Subscriber};
pub use config::{BusConfig, BusOverrides, ChannelOverrides, GlobalConfig, Override};
pub use delivery::Delivery;
pub use dlq::{DeadLetter, DeadLetterQueue};
pub use error::{BusError, Result};
pub use message::{Message, SubscriberId, TypeConstraint, NO_SUBSCRIBER};
pub use registry::Bus;
pub use stats::{Metric, StatsMap};
pub use tracker::{DeliveryTracker, Outcome};
