//! Publish/subscribe bus over a stream store.
//!
//! This module contains:
//! - `Publisher` / `Subscriber` traits: the caller-facing contract
//! - `Envelope` / `Delivery`: message unit and its ack handle
//! - `Marshaler`: envelope <-> entry field codec
//! - Implementations: `StreamPublisher`, `StreamSubscriber`

use async_trait::async_trait;

use crate::storage::{EntryId, StoreError};

pub mod envelope;
pub mod marshal;
pub mod publisher;
pub mod subscriber;

// Re-exports
pub use envelope::{Delivery, Envelope, Metadata};
pub use marshal::{DefaultMarshaler, Marshaler};
pub use publisher::{PublisherConfig, StreamPublisher};
pub use subscriber::{
    ClaimPredicate, StreamSubscriber, SubscriberConfig, Subscription, SubscriptionMode,
    SubscriptionState,
};

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Malformed entry: {0}")]
    MalformedEntry(String),

    #[error("Failed to encode envelope: {0}")]
    Encode(String),

    #[error("Publish to '{topic}' failed: {reason}")]
    PublishFailed { topic: String, reason: String },

    #[error("Creating consumer group '{group}' on '{topic}' failed: {reason}")]
    GroupCreateFailed {
        topic: String,
        group: String,
        reason: String,
    },

    #[error("Subscription closed")]
    SubscriptionClosed,

    #[error("Publisher closed")]
    PublisherClosed,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Appends envelopes to topics.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish one envelope. Returns the entry ID the store assigned.
    ///
    /// Never waits for subscribers; durability comes from the store.
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<EntryId>;

    /// Release owned resources. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Opens subscriptions on topics.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Subscribe to a topic.
    ///
    /// Setup failures are returned here; once running, failures surface as
    /// the subscription's delivery queue closing.
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;

    /// Close every subscription opened by this subscriber. Idempotent.
    async fn close(&self) -> Result<()>;
}
