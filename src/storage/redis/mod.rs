//! Redis Streams store implementation.
//!
//! Topics map one-to-one onto stream keys. Consumer groups, the pending
//! entry list, and reclaim are the native `XGROUP` / `XREADGROUP` /
//! `XPENDING` / `XCLAIM` machinery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamInfoConsumersReply, StreamMaxlen, StreamPendingCountReply,
    StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, Client, ErrorKind, RedisError};
use tracing::{debug, info};

use super::{
    ConsumerInfo, EntryId, PendingEntry, ReadCursor, Result, StartCursor, StoreError, StreamEntry,
    StreamStore,
};

/// Redis Streams store.
///
/// Holds the client so that `dedicated()` can open additional connections
/// for blocking reads; all other commands share one multiplexed connection.
pub struct RedisStreamStore {
    client: Client,
    conn: ConnectionManager,
}

impl RedisStreamStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., redis://localhost:6379)
    pub async fn new(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let store = Self::from_client(client).await?;
        info!(url = %url, "Connected to Redis");
        Ok(store)
    }

    /// Build a store from an existing client.
    pub async fn from_client(client: Client) -> Result<Self> {
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, conn })
    }

    fn start_id(start: StartCursor) -> &'static str {
        match start {
            StartCursor::Beginning => "0",
            StartCursor::Tail => "$",
        }
    }

    fn read_id(cursor: ReadCursor) -> String {
        match cursor {
            ReadCursor::New => ">".to_string(),
            ReadCursor::Pending(after) => after.to_string(),
        }
    }

    fn to_entry(stream_id: StreamId) -> Result<StreamEntry> {
        let id: EntryId = stream_id.id.parse()?;
        let mut fields = Vec::with_capacity(stream_id.map.len());
        for (name, value) in stream_id.map {
            let bytes: Vec<u8> = redis::from_redis_value(&value).map_err(|e| {
                StoreError::Protocol(format!("field '{}' of entry {}: {}", name, id, e))
            })?;
            fields.push((name, bytes));
        }
        // Replies arrive as hash maps; sort for a stable field order.
        fields.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(StreamEntry { id, fields })
    }

    fn millis(duration: Duration) -> u64 {
        u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Whether a Redis error is worth retrying.
fn is_transient(err: &RedisError) -> bool {
    err.is_timeout()
        || err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || matches!(
            err.kind(),
            ErrorKind::TryAgain
                | ErrorKind::BusyLoadingError
                | ErrorKind::ClusterDown
                | ErrorKind::MasterDown
        )
}

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if is_transient(&err) {
            StoreError::Transient(err.to_string())
        } else if matches!(err.kind(), ErrorKind::TypeError | ErrorKind::ParseError) {
            StoreError::Protocol(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

/// Classify an error from a group-scoped command.
fn group_error(err: RedisError, topic: &str, group: &str) -> StoreError {
    if err.code() == Some("NOGROUP") {
        StoreError::NoGroup {
            topic: topic.to_string(),
            group: group.to_string(),
        }
    } else {
        err.into()
    }
}

#[async_trait]
impl StreamStore for RedisStreamStore {
    async fn append(
        &self,
        topic: &str,
        fields: &[(String, Vec<u8>)],
        maxlen: Option<u64>,
    ) -> Result<EntryId> {
        let mut conn = self.conn.clone();
        let id: String = match maxlen {
            Some(len) => {
                let len = usize::try_from(len).unwrap_or(usize::MAX);
                conn.xadd_maxlen(topic, StreamMaxlen::Approx(len), "*", fields)
                    .await?
            }
            None => conn.xadd(topic, "*", fields).await?,
        };
        id.parse()
    }

    async fn create_group(&self, topic: &str, group: &str, start: StartCursor) -> Result<bool> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(topic, group, Self::start_id(start))
            .await;
        match created {
            Ok(()) => Ok(true),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(topic = %topic, group = %group, "Consumer group already exists");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        block: Option<Duration>,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let mut options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        if let (ReadCursor::New, Some(block)) = (cursor, block) {
            // BLOCK 0 means forever; never ask for that.
            let ms = Self::millis(block).max(1);
            options = options.block(usize::try_from(ms).unwrap_or(usize::MAX));
        }

        let id = Self::read_id(cursor);
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[topic], &[id.as_str()], &options)
            .await
            .map_err(|e| group_error(e, topic, group))?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        reply
            .keys
            .into_iter()
            .flat_map(|key| key.ids)
            .map(Self::to_entry)
            .collect()
    }

    async fn acknowledge(&self, topic: &str, group: &str, ids: &[EntryId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let ids: Vec<String> = ids.iter().map(EntryId::to_string).collect();
        let acked: u64 = conn
            .xack(topic, group, &ids)
            .await
            .map_err(|e| group_error(e, topic, group))?;
        Ok(acked)
    }

    async fn list_pending(
        &self,
        topic: &str,
        group: &str,
        min_idle: Duration,
        after: EntryId,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        let mut conn = self.conn.clone();
        // The IDLE filter needs Redis >= 6.2; the typed helper does not expose it.
        let reply: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(topic)
            .arg(group)
            .arg("IDLE")
            .arg(Self::millis(min_idle))
            .arg(after.successor().to_string())
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| group_error(e, topic, group))?;

        reply
            .ids
            .into_iter()
            .map(|p| {
                Ok(PendingEntry {
                    id: p.id.parse()?,
                    consumer: p.consumer,
                    idle: Duration::from_millis(p.last_delivered_ms as u64),
                    delivery_count: p.times_delivered as u64,
                })
            })
            .collect()
    }

    async fn reclaim(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<StreamEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let ids: Vec<String> = ids.iter().map(EntryId::to_string).collect();
        let reply: StreamClaimReply = conn
            .xclaim(topic, group, consumer, Self::millis(min_idle), &ids)
            .await
            .map_err(|e| group_error(e, topic, group))?;

        reply.ids.into_iter().map(Self::to_entry).collect()
    }

    async fn list_consumers(&self, topic: &str, group: &str) -> Result<Vec<ConsumerInfo>> {
        let mut conn = self.conn.clone();
        let reply: StreamInfoConsumersReply = conn
            .xinfo_consumers(topic, group)
            .await
            .map_err(|e| group_error(e, topic, group))?;

        Ok(reply
            .consumers
            .into_iter()
            .map(|c| ConsumerInfo {
                name: c.name,
                pending: c.pending as u64,
                idle: Duration::from_millis(c.idle as u64),
            })
            .collect())
    }

    async fn delete_consumer(&self, topic: &str, group: &str, consumer: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let dropped: u64 = conn
            .xgroup_delconsumer(topic, group, consumer)
            .await
            .map_err(|e| group_error(e, topic, group))?;
        Ok(dropped)
    }

    async fn destroy_group(&self, topic: &str, group: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let destroyed: bool = conn.xgroup_destroy(topic, group).await?;
        Ok(destroyed)
    }

    async fn dedicated(&self) -> Result<Arc<dyn StreamStore>> {
        let store = Self::from_client(self.client.clone()).await?;
        Ok(Arc::new(store))
    }
}
