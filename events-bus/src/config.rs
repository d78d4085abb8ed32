//! Event bus configuration
//!
//! One serde-deserializable struct composed of the per-manager sections.
//! The configuration is validated once at bus construction and immutable
//! afterwards.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::dlq::DlqConfig;
use crate::error::{EventBusError, Result};
use crate::health::HealthCheckerConfig;
use crate::priority::PriorityStreamConfig;
use crate::retry::RetryPolicy;

/// Full event bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Logical service name, used in consumer-group names
    pub service_name: String,
    /// Unique instance id, used in consumer names
    pub instance_id: String,
    /// Approximate per-stream length cap, unlimited when absent
    pub max_stream_length: Option<u64>,
    /// How long a consumer read blocks waiting for messages
    pub consumer_block: Duration,
    /// Messages fetched per consumer read
    pub consumer_batch_count: usize,
    /// How long `stop` waits for consumption loops to join
    pub shutdown_grace: Duration,
    /// Priority routing section
    pub priority: PriorityStreamConfig,
    /// Default retry policy section
    pub retry: RetryPolicy,
    /// Dead-letter section
    pub dlq: DlqConfig,
    /// Circuit breaker section
    pub circuit_breaker: CircuitBreakerConfig,
    /// Health check section
    pub health: HealthCheckerConfig,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            service_name: "service".to_string(),
            instance_id: Uuid::new_v4().to_string(),
            max_stream_length: Some(100_000),
            consumer_block: Duration::from_secs(2),
            consumer_batch_count: 16,
            shutdown_grace: Duration::from_secs(5),
            priority: PriorityStreamConfig::default(),
            retry: RetryPolicy::default(),
            dlq: DlqConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            health: HealthCheckerConfig::default(),
        }
    }
}

impl EventBusConfig {
    /// Check the configuration for values the bus cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.service_name.is_empty() {
            return Err(EventBusError::InvalidConfiguration(
                "service_name must not be empty".to_string(),
            ));
        }
        if self.instance_id.is_empty() {
            return Err(EventBusError::InvalidConfiguration(
                "instance_id must not be empty".to_string(),
            ));
        }
        if self.priority.stream_prefix.is_empty() {
            return Err(EventBusError::InvalidConfiguration(
                "stream_prefix must not be empty".to_string(),
            ));
        }
        if self.consumer_batch_count == 0 {
            return Err(EventBusError::InvalidConfiguration(
                "consumer_batch_count must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(EventBusError::InvalidConfiguration(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.backoff_factor <= 0.0 {
            return Err(EventBusError::InvalidConfiguration(
                "retry.backoff_factor must be positive".to_string(),
            ));
        }
        if self.dlq.enabled && self.dlq.suffix.is_empty() {
            return Err(EventBusError::InvalidConfiguration(
                "dlq.suffix must not be empty when the DLQ is enabled".to_string(),
            ));
        }
        if self.circuit_breaker.enabled && self.circuit_breaker.failure_threshold == 0 {
            return Err(EventBusError::InvalidConfiguration(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EventBusConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = EventBusConfig::default();
        config.service_name.clear();
        assert!(matches!(
            config.validate(),
            Err(EventBusError::InvalidConfiguration(reason)) if reason.contains("service_name")
        ));

        let mut config = EventBusConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = EventBusConfig::default();
        config.dlq.suffix.clear();
        assert!(config.validate().is_err());

        // a disabled DLQ does not care about its suffix
        let mut config = EventBusConfig::default();
        config.dlq.enabled = false;
        config.dlq.suffix.clear();
        assert!(config.validate().is_ok());
    }
}
