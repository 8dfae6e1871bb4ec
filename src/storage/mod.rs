//! Stream store abstraction.
//!
//! This module contains:
//! - `StreamStore` trait: the primitive operations the bus is built on
//! - Entry, pending-entry, and consumer types shared by all stores
//! - Implementations: Redis Streams, in-memory

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::InMemoryStreamStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStreamStore;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Flat field set of one stream entry, in insertion order.
pub type Fields = Vec<(String, Vec<u8>)>;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Transient store error: {0}")]
    Transient(String),

    #[error("Store command failed: {0}")]
    Command(String),

    #[error("Unexpected store reply: {0}")]
    Protocol(String),

    #[error("Consumer group '{group}' does not exist on stream '{topic}'")]
    NoGroup { topic: String, group: String },

    #[error("Invalid entry ID: {0}")]
    InvalidEntryId(String),
}

impl StoreError {
    /// Whether retrying the same call may succeed.
    ///
    /// Only network, timeout, and temporary server states are transient.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Store-assigned entry identifier: `<millis>-<seq>`.
///
/// Totally ordered within one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    pub millis: u64,
    pub seq: u64,
}

impl EntryId {
    /// The smallest possible ID (`0-0`), sorting before every real entry.
    pub const MIN: EntryId = EntryId { millis: 0, seq: 0 };

    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// The smallest ID greater than this one.
    pub fn successor(self) -> Self {
        match self.seq.checked_add(1) {
            Some(seq) => Self::new(self.millis, seq),
            None => Self::new(self.millis.saturating_add(1), 0),
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || StoreError::InvalidEntryId(s.to_string());
        let (millis, seq) = match s.split_once('-') {
            Some((millis, seq)) => (millis, seq),
            None => (s, "0"),
        };
        Ok(Self {
            millis: millis.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

/// One persisted record of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: EntryId,
    /// Empty when the entry was trimmed while still pending.
    pub fields: Fields,
}

impl StreamEntry {
    /// Look up a field value by name.
    pub fn field(&self, name: &str) -> Option<&[u8]> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_slice())
    }
}

/// Where a newly created consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartCursor {
    /// Oldest retained entry (`0`): the group sees the whole backlog.
    Beginning,
    /// Current tail (`$`): only entries appended afterwards.
    Tail,
}

/// Which entries a group read returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCursor {
    /// Entries never delivered to any consumer of the group (`>`).
    New,
    /// This consumer's own pending entries with an ID greater than the given one.
    Pending(EntryId),
}

/// Delivered-but-unacknowledged entry of a consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: EntryId,
    pub consumer: String,
    pub idle: Duration,
    pub delivery_count: u64,
}

/// Member of a consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInfo {
    pub name: String,
    pub pending: u64,
    pub idle: Duration,
}

/// Primitive operations of an append-only stream store with consumer groups.
///
/// Every operation is atomic at the store; callers perform no locking of
/// their own for group coordination.
///
/// Implementations:
/// - `RedisStreamStore`: Redis Streams
/// - `InMemoryStreamStore`: in-process store for standalone mode and tests
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Append an entry, optionally trimming the stream to about `maxlen` entries.
    async fn append(&self, topic: &str, fields: &[(String, Vec<u8>)], maxlen: Option<u64>)
        -> Result<EntryId>;

    /// Create a consumer group, creating the stream if missing.
    ///
    /// Returns `false` when the group already existed; its cursor is untouched.
    async fn create_group(&self, topic: &str, group: &str, start: StartCursor) -> Result<bool>;

    /// Read entries for `consumer`, blocking up to `block` when none are available.
    ///
    /// `block` only applies to `ReadCursor::New`. An empty result means the
    /// block period elapsed.
    async fn read_group(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        block: Option<Duration>,
        count: usize,
    ) -> Result<Vec<StreamEntry>>;

    /// Mark entries as processed for the group. Returns how many were pending.
    async fn acknowledge(&self, topic: &str, group: &str, ids: &[EntryId]) -> Result<u64>;

    /// List pending entries with an ID greater than `after` that were idle
    /// for at least `min_idle`, oldest first.
    ///
    /// Pass the last returned ID as `after` to page through the whole list.
    async fn list_pending(
        &self,
        topic: &str,
        group: &str,
        min_idle: Duration,
        after: EntryId,
        count: usize,
    ) -> Result<Vec<PendingEntry>>;

    /// Transfer ownership of pending entries still idle for `min_idle` to `consumer`.
    ///
    /// Returns the entries actually transferred.
    async fn reclaim(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<StreamEntry>>;

    /// List the consumers of a group.
    async fn list_consumers(&self, topic: &str, group: &str) -> Result<Vec<ConsumerInfo>>;

    /// Remove a consumer. Returns the number of pending entries it still held.
    async fn delete_consumer(&self, topic: &str, group: &str, consumer: &str) -> Result<u64>;

    /// Remove a consumer group. Returns `false` if it did not exist.
    async fn destroy_group(&self, topic: &str, group: &str) -> Result<bool>;

    /// Handle whose blocking reads do not stall other users of this store.
    async fn dedicated(&self) -> Result<Arc<dyn StreamStore>>;
}
