use thiserror::Error;

use crate::event::ProcessingError;

/// Error taxonomy for the event bus and its managers
#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("Event bus is already running")]
    AlreadyRunning,

    #[error("Event bus is not running")]
    NotRunning,

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Event publishing failed: {0}")]
    PublishFailed(String),

    #[error("Broker connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Handler {} failed processing message {}: {}", .0.handler, .0.message_id, .0.error)]
    ProcessingFailed(ProcessingError),

    #[error("Handler {handler} failed: {message}")]
    HandlerFailed { handler: String, message: String },

    #[error("Max retries exceeded for event {event_id} after {attempts} attempts")]
    MaxRetriesExceeded { event_id: String, attempts: u32 },

    #[error("Circuit breaker open for service {service}")]
    CircuitBreakerOpen { service: String },

    #[error("Event serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Event deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Unsupported serialization format: {0}")]
    UnsupportedFormat(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Result type alias for event bus operations
pub type Result<T> = std::result::Result<T, EventBusError>;
