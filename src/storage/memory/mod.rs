//! In-memory stream store for standalone mode and testing.
//!
//! Mirrors Redis Streams consumer-group semantics: a delivery cursor per
//! group, a pending entry list with idle clocks and delivery counts, and
//! blocking reads woken by appends.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{
    ConsumerInfo, EntryId, Fields, PendingEntry, ReadCursor, Result, StartCursor, StoreError,
    StreamEntry, StreamStore,
};

struct PendingState {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

struct Group {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingState>,
    /// Consumer name -> last time it read or claimed.
    consumers: HashMap<String, Instant>,
}

impl Group {
    fn new(last_delivered: EntryId) -> Self {
        Self {
            last_delivered,
            pending: BTreeMap::new(),
            consumers: HashMap::new(),
        }
    }

    fn touch(&mut self, consumer: &str, now: Instant) {
        self.consumers.insert(consumer.to_string(), now);
    }
}

#[derive(Default)]
struct Stream {
    entries: BTreeMap<EntryId, Fields>,
    last_id: EntryId,
    groups: HashMap<String, Group>,
}

impl Stream {
    fn next_id(&self) -> EntryId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        if now > self.last_id.millis {
            EntryId::new(now, 0)
        } else {
            EntryId::new(self.last_id.millis, self.last_id.seq + 1)
        }
    }

    fn trim(&mut self, maxlen: u64) {
        let maxlen = usize::try_from(maxlen).unwrap_or(usize::MAX);
        while self.entries.len() > maxlen {
            if self.entries.pop_first().is_none() {
                break;
            }
        }
    }

    fn group_mut(&mut self, topic: &str, group: &str) -> Result<&mut Group> {
        self.groups.get_mut(group).ok_or_else(|| no_group(topic, group))
    }
}

fn no_group(topic: &str, group: &str) -> StoreError {
    StoreError::NoGroup {
        topic: topic.to_string(),
        group: group.to_string(),
    }
}

#[derive(Default)]
struct Inner {
    streams: Mutex<HashMap<String, Stream>>,
    appended: Notify,
    unavailable: AtomicBool,
    injected_failures: AtomicUsize,
}

/// In-process stream store.
///
/// Cloning yields another handle onto the same streams.
#[derive(Clone, Default)]
pub struct InMemoryStreamStore {
    inner: Arc<Inner>,
}

impl InMemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with a transient error until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `count` calls with a transient error.
    pub fn inject_transient_failures(&self, count: usize) {
        self.inner.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Number of entries currently retained in a stream.
    pub async fn len(&self, topic: &str) -> usize {
        self.inner
            .streams
            .lock()
            .await
            .get(topic)
            .map_or(0, |s| s.entries.len())
    }

    fn check_available(&self) -> Result<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Transient("store unavailable".to_string()));
        }
        let injected = self.inner.injected_failures.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |n| n.checked_sub(1),
        );
        if injected.is_ok() {
            return Err(StoreError::Transient("injected failure".to_string()));
        }
        Ok(())
    }

    /// One non-blocking read attempt.
    async fn try_read(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut streams = self.inner.streams.lock().await;
        let stream = streams.get_mut(topic).ok_or_else(|| no_group(topic, group))?;
        let Stream {
            entries, groups, ..
        } = stream;
        let grp = groups.get_mut(group).ok_or_else(|| no_group(topic, group))?;
        let now = Instant::now();
        grp.touch(consumer, now);

        let mut out = Vec::new();
        match cursor {
            ReadCursor::New => {
                let fresh: Vec<(EntryId, Fields)> = entries
                    .range(grp.last_delivered.successor()..)
                    .take(count)
                    .map(|(id, fields)| (*id, fields.clone()))
                    .collect();
                for (id, fields) in fresh {
                    grp.last_delivered = id;
                    grp.pending.insert(
                        id,
                        PendingState {
                            consumer: consumer.to_string(),
                            delivered_at: now,
                            delivery_count: 1,
                        },
                    );
                    out.push(StreamEntry { id, fields });
                }
            }
            ReadCursor::Pending(after) => {
                for (id, state) in grp.pending.range_mut(after.successor()..) {
                    if out.len() >= count {
                        break;
                    }
                    if state.consumer != consumer {
                        continue;
                    }
                    state.delivered_at = now;
                    state.delivery_count += 1;
                    out.push(StreamEntry {
                        id: *id,
                        fields: entries.get(id).cloned().unwrap_or_default(),
                    });
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl StreamStore for InMemoryStreamStore {
    async fn append(
        &self,
        topic: &str,
        fields: &[(String, Vec<u8>)],
        maxlen: Option<u64>,
    ) -> Result<EntryId> {
        self.check_available()?;
        let id = {
            let mut streams = self.inner.streams.lock().await;
            let stream = streams.entry(topic.to_string()).or_default();
            let id = stream.next_id();
            stream.entries.insert(id, fields.to_vec());
            stream.last_id = id;
            if let Some(maxlen) = maxlen {
                stream.trim(maxlen);
            }
            id
        };
        self.inner.appended.notify_waiters();
        Ok(id)
    }

    async fn create_group(&self, topic: &str, group: &str, start: StartCursor) -> Result<bool> {
        self.check_available()?;
        let mut streams = self.inner.streams.lock().await;
        let stream = streams.entry(topic.to_string()).or_default();
        if stream.groups.contains_key(group) {
            return Ok(false);
        }
        let cursor = match start {
            StartCursor::Beginning => EntryId::MIN,
            StartCursor::Tail => stream.last_id,
        };
        stream.groups.insert(group.to_string(), Group::new(cursor));
        Ok(true)
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
        self.check_available()?;
        let deadline = match (cursor, block) {
            (ReadCursor::New, Some(block)) => Some(Instant::now() + block),
            _ => None,
        };

        loop {
            // Register interest before looking so an append in between is not missed.
            let appended = self.inner.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let entries = self.try_read(topic, group, consumer, cursor, count).await?;
            let Some(deadline) = deadline else {
                return Ok(entries);
            };
            if !entries.is_empty() {
                return Ok(entries);
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn acknowledge(&self, topic: &str, group: &str, ids: &[EntryId]) -> Result<u64> {
        self.check_available()?;
        let mut streams = self.inner.streams.lock().await;
        let Some(grp) = streams.get_mut(topic).and_then(|s| s.groups.get_mut(group)) else {
            return Ok(0);
        };
        Ok(ids
            .iter()
            .filter(|id| grp.pending.remove(id).is_some())
            .count() as u64)
    }

    async fn list_pending(
        &self,
        topic: &str,
        group: &str,
        min_idle: Duration,
        after: EntryId,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        self.check_available()?;
        let mut streams = self.inner.streams.lock().await;
        let stream = streams.get_mut(topic).ok_or_else(|| no_group(topic, group))?;
        let grp = stream.group_mut(topic, group)?;
        let now = Instant::now();
        Ok(grp
            .pending
            .range(after.successor()..)
            .map(|(id, state)| PendingEntry {
                id: *id,
                consumer: state.consumer.clone(),
                idle: now.saturating_duration_since(state.delivered_at),
                delivery_count: state.delivery_count,
            })
            .filter(|p| p.idle >= min_idle)
            .take(count)
            .collect())
    }

    async fn reclaim(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<StreamEntry>> {
        self.check_available()?;
        let mut streams = self.inner.streams.lock().await;
        let stream = streams.get_mut(topic).ok_or_else(|| no_group(topic, group))?;
        let Stream {
            entries, groups, ..
        } = stream;
        let grp = groups.get_mut(group).ok_or_else(|| no_group(topic, group))?;
        let now = Instant::now();
        grp.touch(consumer, now);

        let mut claimed = Vec::new();
        for id in ids {
            let Some(state) = grp.pending.get_mut(id) else {
                continue;
            };
            if now.saturating_duration_since(state.delivered_at) < min_idle {
                continue;
            }
            match entries.get(id) {
                Some(fields) => {
                    state.consumer = consumer.to_string();
                    state.delivered_at = now;
                    state.delivery_count += 1;
                    claimed.push(StreamEntry {
                        id: *id,
                        fields: fields.clone(),
                    });
                }
                None => {
                    // Trimmed while pending: nothing left to deliver.
                    grp.pending.remove(id);
                }
            }
        }
        Ok(claimed)
    }

    async fn list_consumers(&self, topic: &str, group: &str) -> Result<Vec<ConsumerInfo>> {
        self.check_available()?;
        let mut streams = self.inner.streams.lock().await;
        let stream = streams.get_mut(topic).ok_or_else(|| no_group(topic, group))?;
        let grp = stream.group_mut(topic, group)?;
        let now = Instant::now();
        let mut consumers: Vec<ConsumerInfo> = grp
            .consumers
            .iter()
            .map(|(name, seen_at)| ConsumerInfo {
                name: name.clone(),
                pending: grp.pending.values().filter(|p| &p.consumer == name).count() as u64,
                idle: now.saturating_duration_since(*seen_at),
            })
            .collect();
        consumers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(consumers)
    }

    async fn delete_consumer(&self, topic: &str, group: &str, consumer: &str) -> Result<u64> {
        self.check_available()?;
        let mut streams = self.inner.streams.lock().await;
        let stream = streams.get_mut(topic).ok_or_else(|| no_group(topic, group))?;
        let grp = stream.group_mut(topic, group)?;
        grp.consumers.remove(consumer);
        let before = grp.pending.len();
        grp.pending.retain(|_, p| p.consumer != consumer);
        Ok((before - grp.pending.len()) as u64)
    }

    async fn destroy_group(&self, topic: &str, group: &str) -> Result<bool> {
        self.check_available()?;
        let mut streams = self.inner.streams.lock().await;
        Ok(streams
            .get_mut(topic)
            .is_some_and(|s| s.groups.remove(group).is_some()))
    }

    async fn dedicated(&self) -> Result<Arc<dyn StreamStore>> {
        self.check_available()?;
        Ok(Arc::new(self.clone()))
    }
}
