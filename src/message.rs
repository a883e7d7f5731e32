//! Core message types for the busline system
//!
//! A `Message` wraps an opaque payload shared by reference: cloning a
//! message clones the `Arc`, never the payload itself. Channels may
//! carry a `TypeConstraint` that gates publishes on the payload's
//! top-level type.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// Monotonically assigned subscriber identifier
///
/// Ids start at 1 on every channel, never repeat, and never decrease.
pub type SubscriberId = u64;

/// Sentinel subscriber id for the delivery synthesized when a publish
/// finds no subscribers. Real subscriber ids start at 1.
pub const NO_SUBSCRIBER: SubscriberId = 0;

/// A message published to a channel
///
/// The payload is opaque to the bus. Subscribers recover it with
/// [`Message::downcast_ref`].
#[derive(Clone)]
pub struct Message {
    /// Unique message identifier (msg-<uuid>)
    id: String,

    /// Opaque payload, shared by reference
    payload: Arc<dyn Any + Send + Sync>,

    /// Name of the payload's top-level type
    payload_type: &'static str,

    /// Type id of the payload's top-level type
    payload_type_id: TypeId,

    /// Unix timestamp in milliseconds
    published_at: u64,
}

impl Message {
    /// Create a new message with an auto-generated id and timestamp
    pub fn new<T: Any + Send + Sync>(payload: T) -> Self {
        Self {
            id: format!("msg-{}", uuid::Uuid::new_v4()),
            payload: Arc::new(payload),
            payload_type: std::any::type_name::<T>(),
            payload_type_id: TypeId::of::<T>(),
            published_at: now_millis(),
        }
    }

    /// The message id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name of the payload's top-level type
    pub fn payload_type(&self) -> &'static str {
        self.payload_type
    }

    /// Unix timestamp in milliseconds at which the message was created
    pub fn published_at(&self) -> u64 {
        self.published_at
    }

    /// Borrow the payload as `T`, if that is its top-level type
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.as_ref().downcast_ref::<T>()
    }

    /// Whether the payload's top-level type is `T`
    pub fn is<T: Any>(&self) -> bool {
        self.payload_type_id == TypeId::of::<T>()
    }

    pub(crate) fn payload_type_id(&self) -> TypeId {
        self.payload_type_id
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("payload_type", &self.payload_type)
            .field("published_at", &self.published_at)
            .finish()
    }
}

/// Runtime type gate for a channel
///
/// Compatibility is `TypeId` equality of the payload's top-level type;
/// no subtype or coercion rules apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeConstraint {
    id: TypeId,
    name: &'static str,
}

impl TypeConstraint {
    /// Constrain payloads to type `T`
    pub fn of<T: Any + Send + Sync>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Name of the constrained type
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the message's payload satisfies this constraint
    pub fn accepts(&self, message: &Message) -> bool {
        self.id == message.payload_type_id()
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

    #[test]
    fn test_message_creation() {
        let message = Message::new("hello".to_string());

        assert!(message.id().starts_with("msg-"));
        assert!(message.published_at() > 0);
        assert!(message.payload_type().ends_with("String"));
        assert_eq!(message.downcast_ref::<String>().unwrap(), "hello");
    }

    #[test]
    fn test_downcast_wrong_type() {
        let message = Message::new(42u32);
        assert!(message.downcast_ref::<String>().is_none());
        assert_eq!(*message.downcast_ref::<u32>().unwrap(), 42);
    }

    #[test]
    fn test_is_checks_top_level_type() {
        let message = Message::new(vec![1u8, 2, 3]);
        assert!(message.is::<Vec<u8>>());
        assert!(!message.is::<Vec<u16>>());
    }

    #[test]
    fn test_clone_shares_payload() {
        let message = Message::new("shared".to_string());
        let clone = message.clone();

        let a: *const String = message.downcast_ref::<String>().unwrap();
        let b: *const String = clone.downcast_ref::<String>().unwrap();
        assert_eq!(a, b);
        assert_eq!(clone.id(), message.id());
    }

    #[test]
    fn test_constraint_accepts_matching_type() {
        let constraint = TypeConstraint::of::<String>();
        assert!(constraint.accepts(&Message::new("ok".to_string())));
        assert!(!constraint.accepts(&Message::new(42u32)));
    }

    #[test]
    fn test_constraint_rejects_subtypes_by_identity() {
        // &str and String are distinct top-level types
        let constraint = TypeConstraint::of::<String>();
        assert!(!constraint.accepts(&Message::new("borrowed")));
        assert!(constraint.name().ends_with("String"));
    }
}
