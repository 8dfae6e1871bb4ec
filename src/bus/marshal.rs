//! Envelope codec: maps an envelope onto the flat field set of a stream entry.
//!
//! Wire layout:
//! - `id`: envelope identity (UTF-8)
//! - `payload`: raw bytes
//! - `metadata`: MessagePack map of string to string
//!
//! Unknown fields are ignored on decode.

use serde::{Deserialize, Serialize};

use super::{BusError, Envelope, Metadata, Result};
use crate::storage::Fields;

/// Field holding the envelope identity.
pub const ID_FIELD: &str = "id";
/// Field holding the raw payload.
pub const PAYLOAD_FIELD: &str = "payload";
/// Field holding the encoded metadata map.
pub const METADATA_FIELD: &str = "metadata";

/// Converts envelopes to and from stream entry fields.
pub trait Marshaler: Send + Sync {
    /// Encode an envelope bound for `topic`.
    fn marshal(&self, topic: &str, envelope: &Envelope) -> Result<Fields>;

    /// Decode entry fields. Fails with `BusError::MalformedEntry`.
    fn unmarshal(&self, fields: &[(String, Vec<u8>)]) -> Result<Envelope>;
}

/// Borrowed view used for encoding without cloning the map.
#[derive(Serialize)]
struct MetadataRef<'a>(&'a Metadata);

#[derive(Deserialize)]
struct MetadataOwned(Metadata);

/// Default codec: `id` / `payload` / MessagePack `metadata`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMarshaler;

impl DefaultMarshaler {
    fn field<'a>(fields: &'a [(String, Vec<u8>)], name: &str) -> Option<&'a [u8]> {
        fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_slice())
    }
}

impl Marshaler for DefaultMarshaler {
    fn marshal(&self, _topic: &str, envelope: &Envelope) -> Result<Fields> {
        let metadata = rmp_serde::to_vec(&MetadataRef(envelope.metadata()))
            .map_err(|e| BusError::Encode(format!("metadata: {}", e)))?;

        Ok(vec![
            (ID_FIELD.to_string(), envelope.id().as_bytes().to_vec()),
            (PAYLOAD_FIELD.to_string(), envelope.payload().to_vec()),
            (METADATA_FIELD.to_string(), metadata),
        ])
    }

    fn unmarshal(&self, fields: &[(String, Vec<u8>)]) -> Result<Envelope> {
        let id = Self::field(fields, ID_FIELD)
            .ok_or_else(|| BusError::MalformedEntry(format!("missing '{}' field", ID_FIELD)))?;
        let id = std::str::from_utf8(id)
            .map_err(|e| BusError::MalformedEntry(format!("'{}' is not UTF-8: {}", ID_FIELD, e)))?;

        let payload = Self::field(fields, PAYLOAD_FIELD).ok_or_else(|| {
            BusError::MalformedEntry(format!("missing '{}' field", PAYLOAD_FIELD))
        })?;

        // Entries from producers that never set metadata decode with none.
        let metadata = match Self::field(fields, METADATA_FIELD) {
            Some(blob) => {
                let MetadataOwned(metadata) = rmp_serde::from_slice(blob).map_err(|e| {
                    BusError::MalformedEntry(format!("'{}' blob: {}", METADATA_FIELD, e))
                })?;
                metadata
            }
            None => Metadata::new(),
        };

        Ok(Envelope::new(id, payload.to_vec()).with_metadata_map(metadata))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(envelope: &Envelope) -> Envelope {
        let m = DefaultMarshaler;
        let fields = m.marshal("topic", envelope).unwrap();
        m.unmarshal(&fields).unwrap()
    }

    #[test]
    fn test_marshal_unmarshal() {
        let envelope = Envelope::with_random_id("payload").with_metadata("foo", "bar");
        assert_eq!(roundtrip(&envelope), envelope);
    }

    #[test]
    fn test_roundtrip_edge_values() {
        let cases = vec![
            Envelope::new("empty-payload", Vec::<u8>::new()),
            Envelope::new("binary", vec![0u8, 159, 146, 150, 255]),
            Envelope::new("unicode-ключ", "данные")
                .with_metadata("ключ", "значение")
                .with_metadata("", "empty key")
                .with_metadata("metadata", "collides with field name"),
        ];
        for envelope in &cases {
            assert_eq!(&roundtrip(envelope), envelope);
        }
    }

    #[test]
    fn test_field_layout() {
        let envelope = Envelope::new("m1", "hello");
        let fields = DefaultMarshaler.marshal("topic", &envelope).unwrap();
        let names: Vec<&str> = fields.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec![ID_FIELD, PAYLOAD_FIELD, METADATA_FIELD]);
        assert_eq!(fields[0].1, b"m1");
        assert_eq!(fields[1].1, b"hello");
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let envelope = Envelope::new("m1", "hello").with_metadata("a", "b");
        let mut fields = DefaultMarshaler.marshal("topic", &envelope).unwrap();
        fields.insert(0, ("schema_version".to_string(), b"2".to_vec()));
        fields.push(("trace".to_string(), b"xyz".to_vec()));
        assert_eq!(DefaultMarshaler.unmarshal(&fields).unwrap(), envelope);
    }

    #[test]
    fn test_missing_metadata_decodes_empty() {
        let fields = vec![
            (ID_FIELD.to_string(), b"m1".to_vec()),
            (PAYLOAD_FIELD.to_string(), b"hello".to_vec()),
        ];
        let envelope = DefaultMarshaler.unmarshal(&fields).unwrap();
        assert!(envelope.metadata().is_empty());
    }

    #[test]
    fn test_missing_id_is_malformed() {
        let fields = vec![(PAYLOAD_FIELD.to_string(), b"hello".to_vec())];
        assert!(matches!(
            DefaultMarshaler.unmarshal(&fields),
            Err(BusError::MalformedEntry(_))
        ));
    }

    #[test]
    fn test_missing_payload_is_malformed() {
        let fields = vec![(ID_FIELD.to_string(), b"m1".to_vec())];
        assert!(matches!(
            DefaultMarshaler.unmarshal(&fields),
            Err(BusError::MalformedEntry(_))
        ));
    }

    #[test]
    fn test_corrupt_metadata_is_malformed() {
        let fields = vec![
            (ID_FIELD.to_string(), b"m1".to_vec()),
            (PAYLOAD_FIELD.to_string(), b"hello".to_vec()),
            (METADATA_FIELD.to_string(), vec![0xc1, 0xff, 0x00]),
        ];
        assert!(matches!(
            DefaultMarshaler.unmarshal(&fields),
            Err(BusError::MalformedEntry(_))
        ));
    }

    #[test]
    fn test_non_utf8_id_is_malformed() {
        let fields = vec![
            (ID_FIELD.to_string(), vec![0xff, 0xfe]),
            (PAYLOAD_FIELD.to_string(), b"hello".to_vec()),
        ];
        assert!(matches!(
            DefaultMarshaler.unmarshal(&fields),
            Err(BusError::MalformedEntry(_))
        ));
    }
}
