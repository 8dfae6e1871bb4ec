//! Angzarr Redistream - publish/subscribe over stream consumer groups
//!
//! Maps a message bus (publish to a topic, subscribe to an ordered feed with
//! explicit acknowledgment) onto an append-only stream store with consumer
//! groups, Redis Streams in production.
//!
//! - `bus`: publisher, subscriber, envelope codec
//! - `storage`: the `StreamStore` seam with Redis and in-memory stores
//! - `config`: YAML/env configuration
//! - `utils`: retry policy, tracing bootstrap

pub mod bus;
pub mod config;
pub mod storage;
pub mod utils;

pub use bus::{
    BusError, Delivery, Envelope, Publisher, StreamPublisher, StreamSubscriber, Subscriber,
    SubscriberConfig, Subscription,
};
pub use storage::{EntryId, StoreError, StreamStore};
