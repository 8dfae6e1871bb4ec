//! Stream publisher: encode an envelope and append it to the topic's stream.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{BusError, DefaultMarshaler, Envelope, Marshaler, Publisher, Result};
use crate::storage::{EntryId, StreamStore};
use crate::utils::retry::RetryPolicy;

/// Configuration for a stream publisher.
#[derive(Debug, Clone, Default)]
pub struct PublisherConfig {
    /// Retry policy for append calls.
    pub retry: RetryPolicy,
    /// Approximate length cap per topic (`MAXLEN ~ n`). Unlisted topics grow unbounded.
    pub maxlens: HashMap<String, u64>,
}

impl PublisherConfig {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Trim `topic` to about `maxlen` entries on every append.
    pub fn with_maxlen(mut self, topic: impl Into<String>, maxlen: u64) -> Self {
        self.maxlens.insert(topic.into(), maxlen);
        self
    }
}

/// Publisher appending envelopes to stream store topics.
///
/// Publishing never waits on subscribers: once the append is acknowledged by
/// the store the envelope is durable.
pub struct StreamPublisher {
    store: RwLock<Option<Arc<dyn StreamStore>>>,
    config: PublisherConfig,
    marshaler: Arc<dyn Marshaler>,
}

impl StreamPublisher {
    /// Create a publisher over a shared store handle.
    pub fn new(store: Arc<dyn StreamStore>, config: PublisherConfig) -> Self {
        Self {
            store: RwLock::new(Some(store)),
            config,
            marshaler: Arc::new(DefaultMarshaler),
        }
    }

    /// Connect to Redis and publish over a connection owned by this publisher.
    #[cfg(feature = "redis")]
    pub async fn connect(url: &str, config: PublisherConfig) -> Result<Self> {
        let store = crate::storage::RedisStreamStore::new(url).await?;
        Ok(Self::new(Arc::new(store), config))
    }

    /// Replace the envelope codec.
    pub fn with_marshaler(mut self, marshaler: Arc<dyn Marshaler>) -> Self {
        self.marshaler = marshaler;
        self
    }

    pub async fn is_closed(&self) -> bool {
        self.store.read().await.is_none()
    }

    async fn store(&self) -> Result<Arc<dyn StreamStore>> {
        self.store
            .read()
            .await
            .clone()
            .ok_or(BusError::PublisherClosed)
    }

    /// Publish several envelopes in order. Stops at the first failure.
    pub async fn publish_batch(&self, topic: &str, envelopes: &[Envelope]) -> Result<Vec<EntryId>> {
        let mut ids = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            ids.push(self.publish(topic, envelope).await?);
        }
        Ok(ids)
    }
}

#[async_trait]
impl Publisher for StreamPublisher {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(topic = %topic))]
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<EntryId> {
        let store = self.store().await?;
        let fields = self.marshaler.marshal(topic, envelope)?;
        let maxlen = self.config.maxlens.get(topic).copied();

        let entry_id = self
            .config
            .retry
            .run("append", || store.append(topic, &fields, maxlen))
            .await
            .map_err(|e| {
                warn!(topic = %topic, envelope_id = %envelope.id(), error = %e, "Publish failed");
                BusError::PublishFailed {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                }
            })?;

        debug!(
            topic = %topic,
            envelope_id = %envelope.id(),
            entry_id = %entry_id,
            "Published envelope"
        );
        Ok(entry_id)
    }

    async fn close(&self) -> Result<()> {
        if self.store.write().await.take().is_some() {
            info!("Publisher closed");
        }
        Ok(())
    }
}
