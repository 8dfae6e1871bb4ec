//! Envelope: the message unit exchanged across the bus, and `Delivery`,
//! an envelope handed to a consumer together with its acknowledgment handle.

use std::collections::BTreeMap;

use bytes::Bytes;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::storage::EntryId;

/// Envelope metadata. Key order carries no meaning.
pub type Metadata = BTreeMap<String, String>;

/// Identity, payload, and metadata of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    id: String,
    payload: Bytes,
    metadata: Metadata,
}

impl Envelope {
    /// Create an envelope with a caller-assigned identity.
    pub fn new(id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            metadata: Metadata::new(),
        }
    }

    /// Create an envelope with a random UUID identity.
    pub fn with_random_id(payload: impl Into<Bytes>) -> Self {
        Self::new(Uuid::new_v4().to_string(), payload)
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Replace all metadata.
    pub fn with_metadata_map(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Look up one metadata value.
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// Consumer's verdict on a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckSignal {
    Ack,
    Nack,
}

/// An envelope delivered to a consumer.
///
/// Exactly one of `ack` or `nack` can be called since both consume the
/// delivery. Dropping it unacknowledged counts as a nack.
#[derive(Debug)]
pub struct Delivery {
    envelope: Envelope,
    entry_id: EntryId,
    redelivered: bool,
    signal: oneshot::Sender<AckSignal>,
}

impl Delivery {
    pub(crate) fn new(
        envelope: Envelope,
        entry_id: EntryId,
        redelivered: bool,
    ) -> (Self, oneshot::Receiver<AckSignal>) {
        let (signal, verdict) = oneshot::channel();
        (
            Self {
                envelope,
                entry_id,
                redelivered,
                signal,
            },
            verdict,
        )
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Store-assigned entry ID.
    pub fn entry_id(&self) -> EntryId {
        self.entry_id
    }

    /// Whether the entry was already handed out before (pending re-read or reclaim).
    pub fn is_redelivery(&self) -> bool {
        self.redelivered
    }

    /// Take the envelope, dropping the delivery (which counts as a nack).
    pub fn into_envelope(self) -> Envelope {
        self.envelope
    }

    /// Mark the entry processed.
    ///
    /// Returns `false` if the subscription has already closed; the entry then
    /// stays pending and is redelivered later.
    pub fn ack(self) -> bool {
        self.signal.send(AckSignal::Ack).is_ok()
    }

    /// Refuse the entry. It stays pending and is redelivered later.
    pub fn nack(self) -> bool {
        self.signal.send(AckSignal::Nack).is_ok()
    }
}
