//! Dead-letter queue management
//!
//! Decides when an event's retry budget is spent, computes the dead-letter
//! stream name, and enriches events with failure provenance before they
//! are parked. An event is only ever dead-lettered once it carries retry
//! metadata; a first failure never goes straight to the DLQ.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::event::{BusEvent, ProcessingError};
use crate::retry::{MAX_RETRIES_KEY, RETRY_COUNT_KEY};

/// Reason stamped on events parked after their retry budget ran out
pub const REASON_MAX_RETRIES: &str = "max_retries_exceeded";

/// Dead-letter queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqConfig {
    pub enabled: bool,
    /// Suffix appended to the source stream name
    pub suffix: String,
    /// Separator between stream name and suffix
    pub delimiter: String,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            suffix: "dlq".to_string(),
            delimiter: ":".to_string(),
        }
    }
}

/// Dead-letter volume counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct DlqStatistics {
    pub total_dlq_events: u64,
    pub events_by_stream: HashMap<String, u64>,
    pub events_by_handler: HashMap<String, u64>,
    pub events_by_reason: HashMap<String, u64>,
    /// Successfully processed events per stream, for rate computation
    pub processed_by_stream: HashMap<String, u64>,
    pub last_dlq_event_time: Option<DateTime<Utc>>,
}

/// Dead-letter decisions, naming, and enrichment
pub struct DlqManager {
    config: DlqConfig,
    statistics: RwLock<DlqStatistics>,
}

impl DlqManager {
    pub fn new(config: DlqConfig) -> Self {
        Self {
            config,
            statistics: RwLock::new(DlqStatistics::default()),
        }
    }

    /// Whether dead-lettering is enabled
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Dead-letter stream name for a source stream
    ///
    /// Empty when dead-lettering is disabled or the input is empty.
    pub fn dlq_stream_name(&self, stream: &str) -> String {
        if !self.config.enabled || stream.is_empty() {
            return String::new();
        }
        format!("{}{}{}", stream, self.config.delimiter, self.config.suffix)
    }

    /// Whether an event has exhausted its retry budget
    ///
    /// Requires both retry metadata keys; without them the event has not
    /// been through the retry pipeline yet.
    pub fn should_move_to_dlq(&self, event: &BusEvent) -> bool {
        if !self.config.enabled {
            return false;
        }
        let retry_count: Option<u32> = event
            .metadata_value(RETRY_COUNT_KEY)
            .and_then(|raw| raw.parse().ok());
        let max_retries: Option<u32> = event
            .metadata_value(MAX_RETRIES_KEY)
            .and_then(|raw| raw.parse().ok());

        match (retry_count, max_retries) {
            (Some(count), Some(max)) => count >= max,
            _ => false,
        }
    }

    /// Clone the event with dead-letter provenance metadata
    ///
    /// Every pre-existing metadata entry is preserved.
    pub fn enrich_event_for_dlq(&self, event: &BusEvent, error: &ProcessingError) -> BusEvent {
        let mut entries = vec![
            ("dlq_reason".to_string(), REASON_MAX_RETRIES.to_string()),
            ("dlq_timestamp".to_string(), Utc::now().to_rfc3339()),
            (
                "dlq_original_stream".to_string(),
                error.stream_name.clone(),
            ),
            ("dlq_original_handler".to_string(), error.handler.clone()),
            (
                "dlq_retry_count".to_string(),
                error.retry_count.to_string(),
            ),
            ("dlq_original_error".to_string(), error.error.clone()),
            (
                "dlq_original_message_id".to_string(),
                error.message_id.clone(),
            ),
        ];
        if let Some(stack_trace) = &error.stack_trace {
            entries.push(("dlq_stack_trace".to_string(), stack_trace.clone()));
        }
        event.with_metadata_entries(entries)
    }

    /// Count one dead-lettered event
    pub async fn record_dlq_event(&self, stream: &str, handler: &str, reason: &str) {
        let mut statistics = self.statistics.write().await;
        statistics.total_dlq_events += 1;
        *statistics
            .events_by_stream
            .entry(stream.to_string())
            .or_insert(0) += 1;
        *statistics
            .events_by_handler
            .entry(handler.to_string())
            .or_insert(0) += 1;
        *statistics
            .events_by_reason
            .entry(reason.to_string())
            .or_insert(0) += 1;
        statistics.last_dlq_event_time = Some(Utc::now());
    }

    /// Count one successfully processed event on a stream
    pub async fn record_processed_event(&self, stream: &str) {
        let mut statistics = self.statistics.write().await;
        *statistics
            .processed_by_stream
            .entry(stream.to_string())
            .or_insert(0) += 1;
    }

    /// Share of a stream's traffic that ended up dead-lettered
    pub async fn dlq_rate(&self, stream: &str) -> f64 {
        let statistics = self.statistics.read().await;
        let dlq = statistics
            .events_by_stream
            .get(stream)
            .copied()
            .unwrap_or(0);
        let processed = statistics
            .processed_by_stream
            .get(stream)
            .copied()
            .unwrap_or(0);
        let total = dlq + processed;
        if total == 0 {
            0.0
        } else {
            dlq as f64 / total as f64
        }
    }

    /// Dead-letter reasons sorted by descending count
    pub async fn top_error_reasons(&self, limit: usize) -> Vec<(String, u64)> {
        let statistics = self.statistics.read().await;
        let mut reasons: Vec<(String, u64)> = statistics
            .events_by_reason
            .iter()
            .map(|(reason, count)| (reason.clone(), *count))
            .collect();
        reasons.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        reasons.truncate(limit);
        reasons
    }

    /// Deep copy of the dead-letter statistics
    pub async fn statistics(&self) -> DlqStatistics {
        self.statistics.read().await.clone()
    }
}
