//! Event envelope and domain event types
//!
//! Every message flowing through the bus is either a plain [`Event`]
//! envelope or a [`DomainEvent`] that extends the envelope with issuer,
//! correlation, category and priority information. Envelopes are immutable
//! once published; retry and dead-letter bookkeeping is applied by cloning
//! the envelope and adding metadata entries, never by mutating the
//! original.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use uuid::Uuid;

/// Priority lanes for event routing, ordered lowest to highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    /// Background and housekeeping events
    Low,
    /// Default lane for regular traffic
    Normal,
    /// Latency-sensitive events
    High,
    /// Events that must be drained before everything else
    Critical,
}

impl EventPriority {
    /// Stream-name segment for this priority
    pub fn as_str(&self) -> &'static str {
        match self {
            EventPriority::Low => "low",
            EventPriority::Normal => "normal",
            EventPriority::High => "high",
            EventPriority::Critical => "critical",
        }
    }

    /// All priorities ordered highest first, the order consumers drain in
    pub fn descending() -> [EventPriority; 4] {
        [
            EventPriority::Critical,
            EventPriority::High,
            EventPriority::Normal,
            EventPriority::Low,
        ]
    }
}

impl Default for EventPriority {
    fn default() -> Self {
        EventPriority::Normal
    }
}

/// Event categories used as a routing dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    /// Business-level events
    #[serde(rename = "domain_event")]
    Domain,
    /// Infrastructure and operational events
    #[serde(rename = "system_event")]
    System,
    /// Events triggered directly by a user action
    #[serde(rename = "user_action")]
    UserAction,
    /// Cross-service integration events
    #[serde(rename = "integration")]
    Integration,
}

impl EventCategory {
    /// Stream-name segment for this category
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Domain => "domain_event",
            EventCategory::System => "system_event",
            EventCategory::UserAction => "user_action",
            EventCategory::Integration => "integration",
        }
    }
}

impl Default for EventCategory {
    fn default() -> Self {
        EventCategory::Domain
    }
}

/// Who issued a domain event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssuerType {
    User,
    System,
    Admin,
    Service,
    Scheduler,
}

impl Default for IssuerType {
    fn default() -> Self {
        IssuerType::System
    }
}

/// Immutable event envelope
///
/// `event_id` and `aggregate_id` are assigned at creation and never change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier
    pub event_id: Uuid,
    /// Type discriminator used for handler matching
    pub event_type: String,
    /// Identifier of the aggregate this event belongs to
    pub aggregate_id: String,
    /// Aggregate type, also the default partition key
    pub aggregate_type: String,
    /// Aggregate version at the time the event was produced
    pub version: i64,
    /// Opaque structured event data
    pub payload: serde_json::Value,
    /// String-keyed metadata, extended only through cloning
    pub metadata: HashMap<String, String>,
    /// Creation timestamp
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Create a new envelope with a fresh id and the current timestamp
    pub fn new(
        event_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            version: 1,
            payload,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Set the aggregate version
    pub fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Domain event extending the base envelope with provenance and routing
/// information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// The base envelope
    pub envelope: Event,
    /// Identifier of the issuing principal
    pub issuer_id: String,
    /// Kind of principal that issued the event
    pub issuer_type: IssuerType,
    /// Event id of the direct cause, if any
    pub causation_id: Option<String>,
    /// Correlation id shared across a whole business transaction
    pub correlation_id: Option<String>,
    /// Routing category
    pub category: EventCategory,
    /// Routing priority
    pub priority: EventPriority,
    /// Optional sha256 integrity checksum over the payload
    pub checksum: Option<String>,
}

impl DomainEvent {
    /// Create a domain event around an envelope with default routing
    pub fn new(envelope: Event, issuer_id: impl Into<String>, issuer_type: IssuerType) -> Self {
        Self {
            envelope,
            issuer_id: issuer_id.into(),
            issuer_type,
            causation_id: None,
            correlation_id: None,
            category: EventCategory::default(),
            priority: EventPriority::default(),
            checksum: None,
        }
    }

    /// Set the routing priority
    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the routing category
    pub fn with_category(mut self, category: EventCategory) -> Self {
        self.category = category;
        self
    }

    /// Set the causation id
    pub fn with_causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    /// Set the correlation id
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Compute and attach the payload checksum
    pub fn with_checksum(mut self) -> Self {
        self.checksum = Some(self.compute_checksum());
        self
    }

    /// sha256 of the canonical JSON payload, as lowercase hex
    pub fn compute_checksum(&self) -> String {
        let canonical = self.envelope.payload.to_string();
        let digest = Sha256::digest(canonical.as_bytes());
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Verify the stored checksum against the payload
    ///
    /// Events without a checksum verify trivially.
    pub fn verify_checksum(&self) -> bool {
        match &self.checksum {
            Some(stored) => *stored == self.compute_checksum(),
            None => true,
        }
    }
}

/// The unit of data flowing through the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BusEvent {
    /// A domain event with full provenance
    Domain(DomainEvent),
    /// A plain envelope without domain fields
    Plain(Event),
}

impl BusEvent {
    /// The underlying envelope
    pub fn envelope(&self) -> &Event {
        match self {
            BusEvent::Plain(event) => event,
            BusEvent::Domain(event) => &event.envelope,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.envelope().event_id
    }

    pub fn event_type(&self) -> &str {
        &self.envelope().event_type
    }

    pub fn aggregate_id(&self) -> &str {
        &self.envelope().aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.envelope().aggregate_type
    }

    pub fn version(&self) -> i64 {
        self.envelope().version
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.envelope().payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.envelope().timestamp
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.envelope().metadata
    }

    /// Look up a metadata value
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.envelope().metadata.get(key).map(String::as_str)
    }

    /// Routing priority, present only on domain events
    pub fn priority(&self) -> Option<EventPriority> {
        match self {
            BusEvent::Plain(_) => None,
            BusEvent::Domain(event) => Some(event.priority),
        }
    }

    /// Routing category, present only on domain events
    pub fn category(&self) -> Option<EventCategory> {
        match self {
            BusEvent::Plain(_) => None,
            BusEvent::Domain(event) => Some(event.category),
        }
    }

    /// Clone this event with one additional metadata entry
    ///
    /// The original is left untouched; it may still be referenced by
    /// in-flight deliveries and metrics.
    pub fn with_metadata(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_metadata_entries([(key.into(), value.into())])
    }

    /// Clone this event with a batch of additional metadata entries
    pub fn with_metadata_entries(
        &self,
        entries: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        let mut cloned = self.clone();
        let metadata = match &mut cloned {
            BusEvent::Plain(event) => &mut event.metadata,
            BusEvent::Domain(event) => &mut event.envelope.metadata,
        };
        for (key, value) in entries {
            metadata.insert(key, value);
        }
        cloned
    }
}

impl From<Event> for BusEvent {
    fn from(event: Event) -> Self {
        BusEvent::Plain(event)
    }
}

impl From<DomainEvent> for BusEvent {
    fn from(event: DomainEvent) -> Self {
        BusEvent::Domain(event)
    }
}

/// Failure record produced by a failed handler invocation
///
/// Never persisted on its own; folded into envelope metadata by the retry
/// and dead-letter managers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingError {
    /// Error message from the handler
    pub error: String,
    /// Name of the handler that failed
    pub handler: String,
    /// When the failure happened
    pub timestamp: DateTime<Utc>,
    /// Retry count of the event at the time of failure
    pub retry_count: u32,
    /// Stream the event was consumed from
    pub stream_name: String,
    /// Broker message id of the delivery
    pub message_id: String,
    /// Optional captured stack trace
    pub stack_trace: Option<String>,
}

impl ProcessingError {
    pub fn new(
        error: impl Into<String>,
        handler: impl Into<String>,
        stream_name: impl Into<String>,
        message_id: impl Into<String>,
        retry_count: u32,
    ) -> Self {
        Self {
            error: error.into(),
            handler: handler.into(),
            timestamp: Utc::now(),
            retry_count,
            stream_name: stream_name.into(),
            message_id: message_id.into(),
            stack_trace: None,
        }
    }

    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_ordering() {
        assert!(EventPriority::Low < EventPriority::Normal);
        assert!(EventPriority::Normal < EventPriority::High);
        assert!(EventPriority::High < EventPriority::Critical);
        assert_eq!(
            EventPriority::descending()[0],
            EventPriority::Critical
        );
    }

    #[test]
    fn test_with_metadata_clones() {
        let event: BusEvent = Event::new("user.registered", "user-1", "user", json!({})).into();
        let enriched = event.with_metadata("retry_count", "1");

        assert!(event.metadata().is_empty());
        assert_eq!(enriched.metadata_value("retry_count"), Some("1"));
        assert_eq!(event.event_id(), enriched.event_id());
    }

    #[test]
    fn test_checksum_round_trip() {
        let envelope = Event::new("order.placed", "order-9", "order", json!({"total": 42}));
        let event = DomainEvent::new(envelope, "svc-1", IssuerType::Service).with_checksum();

        assert!(event.verify_checksum());

        let mut tampered = event.clone();
        tampered.envelope.payload = json!({"total": 43});
        assert!(!tampered.verify_checksum());
    }

    #[test]
    fn test_plain_event_has_no_routing_fields() {
        let event: BusEvent = Event::new("ping", "a", "b", json!(null)).into();
        assert_eq!(event.priority(), None);
        assert_eq!(event.category(), None);
    }
}
