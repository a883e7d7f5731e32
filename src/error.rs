//! Error types for busline

use crate::message::SubscriberId;
use thiserror::Error;

/// Errors that can occur in the message bus
#[derive(Debug, Error)]
pub enum BusError {
    /// Operation on a channel whose lifecycle has ended
    #[error("Channel '{0}' is closed")]
    Closed(String),

    /// Published payload is not compatible with the channel's type constraint
    #[error("Type mismatch on channel '{channel}': expected {expected}, got {actual}")]
    TypeMismatch {
        channel: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// Channel name is not registered on the bus
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    /// Channel name is already registered on the bus
    #[error("Channel already exists: {0}")]
    ChannelExists(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A delivery or tracker slot was resolved a second time
    #[error("Delivery for subscriber {subscriber_id} already resolved as {state}")]
    AlreadyResolved {
        subscriber_id: SubscriberId,
        state: &'static str,
    },

    /// Ack or nack for a subscriber id outside the publish-time snapshot
    #[error("Subscriber {subscriber_id} is not part of this delivery")]
    UnknownSubscriber { subscriber_id: SubscriberId },

    /// Subscriber handler failure
    #[error("Handler error: {0}")]
    Handler(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for bus operations
pub type Result<T> = std::result::Result<T, BusError>;
