//! Retry policies and the retry decision pipeline
//!
//! Decides whether a failed delivery should be retried, computes the
//! backoff delay, and enriches the event with retry bookkeeping. Policies
//! resolve per call with precedence handler > event type > default; the
//! default policy is fixed at construction time.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::event::{BusEvent, ProcessingError};

/// Metadata key holding the current retry count
pub const RETRY_COUNT_KEY: &str = "retry_count";
/// Metadata key holding the resolved max attempts
pub const MAX_RETRIES_KEY: &str = "max_retries";

/// Error-message fragments that are never worth retrying
const NON_RETRYABLE_PATTERNS: [&str; 8] = [
    "validation",
    "invalid",
    "malformed",
    "unauthorized",
    "forbidden",
    "not found",
    "conflict",
    "duplicate",
];

/// Error-message fragments that mark transient failures
const RETRYABLE_PATTERNS: [&str; 6] = [
    "timeout",
    "connection",
    "network",
    "temporary",
    "unavailable",
    "overloaded",
];

/// How the backoff delay grows with the attempt number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffType {
    /// Same delay on every attempt
    Fixed,
    /// Delay multiplied by the factor each attempt
    Exponential,
    /// Delay grows by a fixed increment each attempt
    Linear,
}

/// Retry tuning for one handler, event type, or the whole bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_type: BackoffType,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_type: BackoffType::Exponential,
            backoff_factor: 2.0,
        }
    }
}

/// Retry volume counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryStatistics {
    pub total_retries: u64,
    /// Events whose retry budget ran out
    pub exhausted_retries: u64,
    pub retries_by_handler: HashMap<String, u64>,
    pub retries_by_event_type: HashMap<String, u64>,
}

/// Retry decisions, backoff math, and retry enrichment
pub struct RetryPolicyManager {
    default_policy: RetryPolicy,
    handler_policies: RwLock<HashMap<String, RetryPolicy>>,
    event_type_policies: RwLock<HashMap<String, RetryPolicy>>,
    statistics: RwLock<RetryStatistics>,
}

impl RetryPolicyManager {
    pub fn new(default_policy: RetryPolicy) -> Self {
        Self {
            default_policy,
            handler_policies: RwLock::new(HashMap::new()),
            event_type_policies: RwLock::new(HashMap::new()),
            statistics: RwLock::new(RetryStatistics::default()),
        }
    }

    /// The process-wide default policy
    pub fn default_policy(&self) -> &RetryPolicy {
        &self.default_policy
    }

    /// Register a policy for a specific handler
    pub async fn set_handler_policy(&self, handler: impl Into<String>, policy: RetryPolicy) {
        self.handler_policies
            .write()
            .await
            .insert(handler.into(), policy);
    }

    /// Register a policy for a specific event type
    pub async fn set_event_type_policy(&self, event_type: impl Into<String>, policy: RetryPolicy) {
        self.event_type_policies
            .write()
            .await
            .insert(event_type.into(), policy);
    }

    /// Resolve the effective policy: handler > event type > default
    ///
    /// A registered policy only wins when it actually differs from the
    /// default.
    pub async fn resolve_policy(&self, event_type: &str, handler: &str) -> RetryPolicy {
        if let Some(policy) = self.handler_policies.read().await.get(handler) {
            if *policy != self.default_policy {
                return policy.clone();
            }
        }
        if let Some(policy) = self.event_type_policies.read().await.get(event_type) {
            if *policy != self.default_policy {
                return policy.clone();
            }
        }
        self.default_policy.clone()
    }

    /// Decide whether a failed delivery should be redelivered
    pub async fn should_retry(&self, event: &BusEvent, error_message: &str, handler: &str) -> bool {
        let lowered = error_message.to_lowercase();
        if NON_RETRYABLE_PATTERNS
            .iter()
            .any(|pattern| lowered.contains(pattern))
        {
            return false;
        }
        let transient = RETRYABLE_PATTERNS
            .iter()
            .any(|pattern| lowered.contains(pattern));
        if !transient {
            // unclassified errors are treated as transient
            tracing::debug!(
                "Unclassified handler error treated as retryable: {}",
                error_message
            );
        }

        let policy = self.resolve_policy(event.event_type(), handler).await;
        current_retry_count(event) < policy.max_attempts
    }

    /// Backoff delay before the given attempt, starting at 1
    pub fn calculate_delay(&self, policy: &RetryPolicy, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match policy.backoff_type {
            BackoffType::Fixed => policy.initial_delay,
            BackoffType::Exponential => policy
                .initial_delay
                .mul_f64(policy.backoff_factor.powi(attempt as i32 - 1)),
            BackoffType::Linear => {
                policy.initial_delay
                    + policy
                        .initial_delay
                        .mul_f64(policy.backoff_factor * (attempt - 1) as f64)
            }
        };
        delay.min(policy.max_delay)
    }

    /// Clone the event with retry bookkeeping for its next delivery
    pub fn enrich_event_for_retry(
        &self,
        event: &BusEvent,
        error: &ProcessingError,
        policy: &RetryPolicy,
    ) -> BusEvent {
        let next_count = current_retry_count(event) + 1;
        let now = Utc::now().to_rfc3339();

        let mut history: Vec<serde_json::Value> = event
            .metadata_value("retry_history")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        history.push(serde_json::json!({
            "attempt": next_count,
            "handler": error.handler,
            "error": error.error,
            "timestamp": now,
        }));

        let mut entries = vec![
            (RETRY_COUNT_KEY.to_string(), next_count.to_string()),
            (MAX_RETRIES_KEY.to_string(), policy.max_attempts.to_string()),
            ("last_error".to_string(), error.error.clone()),
            ("last_retry_timestamp".to_string(), now.clone()),
            ("retry_handler".to_string(), error.handler.clone()),
            (
                "retry_history".to_string(),
                serde_json::to_string(&history).unwrap_or_else(|_| "[]".to_string()),
            ),
        ];
        if next_count == 1 {
            entries.push(("first_failure".to_string(), now));
        }

        event.with_metadata_entries(entries)
    }

    /// Count one redelivery
    pub async fn record_retry(&self, handler: &str, event_type: &str) {
        let mut statistics = self.statistics.write().await;
        statistics.total_retries += 1;
        *statistics
            .retries_by_handler
            .entry(handler.to_string())
            .or_insert(0) += 1;
        *statistics
            .retries_by_event_type
            .entry(event_type.to_string())
            .or_insert(0) += 1;
    }

    /// Count one event whose retry budget ran out
    pub async fn record_exhausted(&self) {
        self.statistics.write().await.exhausted_retries += 1;
    }

    /// Deep copy of the retry statistics
    pub async fn statistics(&self) -> RetryStatistics {
        self.statistics.read().await.clone()
    }
}

/// Current retry count from event metadata, zero when absent
pub fn current_retry_count(event: &BusEvent) -> u32 {
    event
        .metadata_value(RETRY_COUNT_KEY)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use serde_json::json;

    fn sample_event() -> BusEvent {
        Event::new("order.placed", "order-1", "order", json!({})).into()
    }

    fn policy(backoff_type: BackoffType) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_type,
            backoff_factor: 2.0,
        }
    }

    #[test]
    fn test_fixed_delay_is_constant() {
        let manager = RetryPolicyManager::new(RetryPolicy::default());
        let policy = policy(BackoffType::Fixed);
        for attempt in 1..=5 {
            assert_eq!(
                manager.calculate_delay(&policy, attempt),
                Duration::from_millis(100)
            );
        }
    }

    #[test]
    fn test_exponential_delay_doubles() {
        let manager = RetryPolicyManager::new(RetryPolicy::default());
        let policy = policy(BackoffType::Exponential);
        let delays: Vec<u128> = (1..=5)
            .map(|attempt| manager.calculate_delay(&policy, attempt).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600]);
    }

    #[test]
    fn test_exponential_delay_caps_at_max() {
        let manager = RetryPolicyManager::new(RetryPolicy::default());
        let mut policy = policy(BackoffType::Exponential);
        policy.max_delay = Duration::from_millis(500);
        assert_eq!(
            manager.calculate_delay(&policy, 10),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_linear_delay_grows_by_increment() {
        let manager = RetryPolicyManager::new(RetryPolicy::default());
        let policy = policy(BackoffType::Linear);
        let delays: Vec<u128> = (1..=3)
            .map(|attempt| manager.calculate_delay(&policy, attempt).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 300, 500]);
    }

    #[tokio::test]
    async fn test_validation_errors_never_retry() {
        let manager = RetryPolicyManager::new(RetryPolicy::default());
        let event = sample_event();
        assert!(
            !manager
                .should_retry(&event, "validation failed on field email", "h")
                .await
        );

        // even with retry budget left
        let retried = event.with_metadata(RETRY_COUNT_KEY, "0");
        assert!(
            !manager
                .should_retry(&retried, "Validation error", "h")
                .await
        );
    }

    #[tokio::test]
    async fn test_budget_exhaustion_stops_retries() {
        let manager = RetryPolicyManager::new(RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        });
        let event = sample_event();

        assert!(manager.should_retry(&event, "connection timeout", "h").await);
        let exhausted = event.with_metadata(RETRY_COUNT_KEY, "2");
        assert!(
            !manager
                .should_retry(&exhausted, "connection timeout", "h")
                .await
        );
    }

    #[tokio::test]
    async fn test_unclassified_errors_default_to_retry() {
        let manager = RetryPolicyManager::new(RetryPolicy::default());
        assert!(
            manager
                .should_retry(&sample_event(), "something odd happened", "h")
                .await
        );
    }

    #[tokio::test]
    async fn test_policy_precedence() {
        let manager = RetryPolicyManager::new(RetryPolicy::default());
        let handler_policy = RetryPolicy {
            max_attempts: 9,
            ..RetryPolicy::default()
        };
        let type_policy = RetryPolicy {
            max_attempts: 7,
            ..RetryPolicy::default()
        };

        manager
            .set_event_type_policy("order.placed", type_policy.clone())
            .await;
        assert_eq!(
            manager.resolve_policy("order.placed", "handler").await,
            type_policy
        );

        manager
            .set_handler_policy("handler", handler_policy.clone())
            .await;
        assert_eq!(
            manager.resolve_policy("order.placed", "handler").await,
            handler_policy
        );

        // a registered policy equal to the default does not shadow
        manager
            .set_handler_policy("other", RetryPolicy::default())
            .await;
        manager
            .set_event_type_policy("user.created", RetryPolicy::default())
            .await;
        assert_eq!(
            manager.resolve_policy("user.created", "other").await,
            RetryPolicy::default()
        );
    }

    #[tokio::test]
    async fn test_retry_enrichment() {
        let manager = RetryPolicyManager::new(RetryPolicy::default());
        let policy = RetryPolicy::default();
        let event = sample_event();
        let error = ProcessingError::new("connection timeout", "projector", "s", "1-0", 0);

        let first = manager.enrich_event_for_retry(&event, &error, &policy);
        assert_eq!(first.metadata_value(RETRY_COUNT_KEY), Some("1"));
        assert_eq!(first.metadata_value(MAX_RETRIES_KEY), Some("3"));
        assert_eq!(first.metadata_value("last_error"), Some("connection timeout"));
        assert_eq!(first.metadata_value("retry_handler"), Some("projector"));
        assert!(first.metadata_value("first_failure").is_some());
        assert!(event.metadata().is_empty());

        let second = manager.enrich_event_for_retry(&first, &error, &policy);
        assert_eq!(second.metadata_value(RETRY_COUNT_KEY), Some("2"));
        let history: Vec<serde_json::Value> =
            serde_json::from_str(second.metadata_value("retry_history").unwrap()).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1]["attempt"], 2);
    }
}
