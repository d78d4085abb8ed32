//! Wire serialization for bus events
//!
//! The reference format is a flat JSON document. Nine fields are required
//! on every document; the domain fields are optional and their presence
//! decides whether deserialization reconstructs a [`DomainEvent`] or a
//! plain [`Event`].

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{EventBusError, Result};
use crate::event::{BusEvent, DomainEvent, Event};

/// Version stamped into every serialized document
pub const SERIALIZATION_VERSION: &str = "1.0";

/// Fields every serialized document must carry
const REQUIRED_FIELDS: [&str; 9] = [
    "event_id",
    "event_type",
    "aggregate_id",
    "aggregate_type",
    "version",
    "event_data",
    "timestamp",
    "serialization_version",
    "serialization_format",
];

/// Fields whose presence marks a document as a domain event
const DOMAIN_FIELDS: [&str; 7] = [
    "issuer_id",
    "issuer_type",
    "causation_id",
    "correlation_id",
    "category",
    "priority",
    "checksum",
];

/// Encoding boundary between the bus and the broker
pub trait EventSerializer: Send + Sync {
    /// Encode an event into its wire representation
    fn serialize(&self, event: &BusEvent) -> Result<Vec<u8>>;
    /// Decode a wire payload back into an event
    fn deserialize(&self, bytes: &[u8]) -> Result<BusEvent>;
    /// Short name of the wire format
    fn format(&self) -> &'static str;
}

/// Reference JSON serializer
#[derive(Debug, Clone, Default)]
pub struct JsonEventSerializer;

impl JsonEventSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl EventSerializer for JsonEventSerializer {
    fn serialize(&self, event: &BusEvent) -> Result<Vec<u8>> {
        let envelope = event.envelope();
        let mut doc = Map::new();

        doc.insert("event_id".into(), json!(envelope.event_id.to_string()));
        doc.insert("event_type".into(), json!(envelope.event_type));
        doc.insert("aggregate_id".into(), json!(envelope.aggregate_id));
        doc.insert("aggregate_type".into(), json!(envelope.aggregate_type));
        doc.insert("version".into(), json!(envelope.version));
        doc.insert("event_data".into(), envelope.payload.clone());
        doc.insert("timestamp".into(), json!(envelope.timestamp.to_rfc3339()));
        doc.insert(
            "serialization_version".into(),
            json!(SERIALIZATION_VERSION),
        );
        doc.insert("serialization_format".into(), json!(self.format()));

        if !envelope.metadata.is_empty() {
            doc.insert("metadata".into(), json!(envelope.metadata));
        }

        if let BusEvent::Domain(domain) = event {
            doc.insert("issuer_id".into(), json!(domain.issuer_id));
            doc.insert(
                "issuer_type".into(),
                serde_json::to_value(domain.issuer_type)
                    .map_err(|e| EventBusError::SerializationFailed(e.to_string()))?,
            );
            if let Some(causation_id) = &domain.causation_id {
                doc.insert("causation_id".into(), json!(causation_id));
            }
            if let Some(correlation_id) = &domain.correlation_id {
                doc.insert("correlation_id".into(), json!(correlation_id));
            }
            doc.insert(
                "category".into(),
                serde_json::to_value(domain.category)
                    .map_err(|e| EventBusError::SerializationFailed(e.to_string()))?,
            );
            doc.insert(
                "priority".into(),
                serde_json::to_value(domain.priority)
                    .map_err(|e| EventBusError::SerializationFailed(e.to_string()))?,
            );
            if let Some(checksum) = &domain.checksum {
                doc.insert("checksum".into(), json!(checksum));
            }
        }

        serde_json::to_vec(&Value::Object(doc))
            .map_err(|e| EventBusError::SerializationFailed(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<BusEvent> {
        let value: Value = serde_json::from_slice(bytes).map_err(|e| {
            EventBusError::DeserializationFailed(format!("invalid JSON document: {}", e))
        })?;
        let doc = value.as_object().ok_or_else(|| {
            EventBusError::DeserializationFailed("document is not a JSON object".to_string())
        })?;

        for field in REQUIRED_FIELDS {
            if !doc.contains_key(field) {
                return Err(EventBusError::DeserializationFailed(format!(
                    "missing required field {}",
                    field
                )));
            }
        }

        let format = required_str(doc, "serialization_format")?;
        if format != self.format() {
            return Err(EventBusError::UnsupportedFormat(format.to_string()));
        }

        let event_id = Uuid::parse_str(required_str(doc, "event_id")?).map_err(|e| {
            EventBusError::DeserializationFailed(format!("invalid event_id: {}", e))
        })?;
        let timestamp = DateTime::parse_from_rfc3339(required_str(doc, "timestamp")?)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| {
                EventBusError::DeserializationFailed(format!("invalid timestamp: {}", e))
            })?;
        let version = doc
            .get("version")
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                EventBusError::DeserializationFailed("version must be an integer".to_string())
            })?;

        let mut metadata = HashMap::new();
        if let Some(entries) = doc.get("metadata").and_then(Value::as_object) {
            for (key, value) in entries {
                let value = value.as_str().ok_or_else(|| {
                    EventBusError::DeserializationFailed(format!(
                        "metadata value for {} must be a string",
                        key
                    ))
                })?;
                metadata.insert(key.clone(), value.to_string());
            }
        }

        let envelope = Event {
            event_id,
            event_type: required_str(doc, "event_type")?.to_string(),
            aggregate_id: required_str(doc, "aggregate_id")?.to_string(),
            aggregate_type: required_str(doc, "aggregate_type")?.to_string(),
            version,
            payload: doc
                .get("event_data")
                .cloned()
                .unwrap_or(Value::Null),
            metadata,
            timestamp,
        };

        let has_domain_fields = DOMAIN_FIELDS.iter().any(|field| doc.contains_key(*field));
        if !has_domain_fields {
            return Ok(BusEvent::Plain(envelope));
        }

        let domain = DomainEvent {
            envelope,
            issuer_id: doc
                .get("issuer_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            issuer_type: optional_enum(doc, "issuer_type")?,
            causation_id: doc
                .get("causation_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            correlation_id: doc
                .get("correlation_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            category: optional_enum(doc, "category")?,
            priority: optional_enum(doc, "priority")?,
            checksum: doc
                .get("checksum")
                .and_then(Value::as_str)
                .map(str::to_string),
        };
        Ok(BusEvent::Domain(domain))
    }

    fn format(&self) -> &'static str {
        "json"
    }
}

fn required_str<'a>(doc: &'a Map<String, Value>, field: &str) -> Result<&'a str> {
    doc.get(field).and_then(Value::as_str).ok_or_else(|| {
        EventBusError::DeserializationFailed(format!("field {} must be a string", field))
    })
}

fn optional_enum<T>(doc: &Map<String, Value>, field: &str) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    match doc.get(field) {
        None => Ok(T::default()),
        Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
            EventBusError::DeserializationFailed(format!("invalid {}: {}", field, e))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventCategory, EventPriority, IssuerType};
    use serde_json::json;

    fn sample_domain_event() -> BusEvent {
        let envelope = Event::new("user.registered", "user-1", "user", json!({"email": "a@b.c"}));
        DomainEvent::new(envelope, "admin-7", IssuerType::Admin)
            .with_category(EventCategory::UserAction)
            .with_priority(EventPriority::High)
            .with_correlation_id("corr-1")
            .with_checksum()
            .into()
    }

    #[test]
    fn test_round_trip_stability() {
        let serializer = JsonEventSerializer::new();
        let event = sample_domain_event();

        let first = serializer.serialize(&event).unwrap();
        let decoded = serializer.deserialize(&first).unwrap();
        let second = serializer.serialize(&decoded).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_domain_fields_survive_round_trip() {
        let serializer = JsonEventSerializer::new();
        let event = sample_domain_event();

        let decoded = serializer
            .deserialize(&serializer.serialize(&event).unwrap())
            .unwrap();
        let domain = match decoded {
            BusEvent::Domain(domain) => domain,
            BusEvent::Plain(_) => panic!("expected domain event"),
        };

        assert_eq!(domain.issuer_id, "admin-7");
        assert_eq!(domain.issuer_type, IssuerType::Admin);
        assert_eq!(domain.category, EventCategory::UserAction);
        assert_eq!(domain.priority, EventPriority::High);
        assert_eq!(domain.correlation_id.as_deref(), Some("corr-1"));
        assert!(domain.checksum.is_some());
    }

    #[test]
    fn test_plain_envelope_stays_plain() {
        let serializer = JsonEventSerializer::new();
        let event: BusEvent = Event::new("ping", "a", "b", json!(1)).into();

        let decoded = serializer
            .deserialize(&serializer.serialize(&event).unwrap())
            .unwrap();
        assert!(matches!(decoded, BusEvent::Plain(_)));
    }

    #[test]
    fn test_missing_required_field_fails() {
        let serializer = JsonEventSerializer::new();
        let doc = json!({
            "event_id": Uuid::new_v4().to_string(),
            "event_type": "user.registered",
            "aggregate_id": "user-1",
            "aggregate_type": "user",
            "version": 1,
            "timestamp": Utc::now().to_rfc3339(),
            "serialization_version": SERIALIZATION_VERSION,
            "serialization_format": "json"
        });

        let result = serializer.deserialize(doc.to_string().as_bytes());
        assert!(matches!(
            result,
            Err(EventBusError::DeserializationFailed(message)) if message.contains("event_data")
        ));
    }

    #[test]
    fn test_unknown_format_rejected() {
        let serializer = JsonEventSerializer::new();
        let event = sample_domain_event();
        let mut doc: Value =
            serde_json::from_slice(&serializer.serialize(&event).unwrap()).unwrap();
        doc["serialization_format"] = json!("msgpack");

        let result = serializer.deserialize(doc.to_string().as_bytes());
        assert!(matches!(result, Err(EventBusError::UnsupportedFormat(f)) if f == "msgpack"));
    }

    #[test]
    fn test_metadata_object_survives() {
        let serializer = JsonEventSerializer::new();
        let event: BusEvent = Event::new("ping", "a", "b", json!(1))
            .with_metadata("retry_count", "2")
            .into();

        let decoded = serializer
            .deserialize(&serializer.serialize(&event).unwrap())
            .unwrap();
        assert_eq!(decoded.metadata_value("retry_count"), Some("2"));
    }
}
