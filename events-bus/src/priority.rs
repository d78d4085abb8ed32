//! Priority stream routing
//!
//! Maps an event's (priority, category, partition key) to concrete stream
//! and consumer-group names, and tracks per-priority throughput and
//! latency. Stream names are part of the public contract for operational
//! tooling: `events:domain_event:critical:user` with priority routing
//! enabled, `events:domain_event:user` with it disabled.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::event::{EventCategory, EventPriority};
use crate::handlers::HandlerKind;

/// Partition key used when none is provided
pub const DEFAULT_PARTITION_KEY: &str = "default";

/// Routing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityStreamConfig {
    /// First segment of every stream name
    pub stream_prefix: String,
    /// When false all priorities share one stream per (category, key)
    pub enabled: bool,
}

impl Default for PriorityStreamConfig {
    fn default() -> Self {
        Self {
            stream_prefix: "events".to_string(),
            enabled: true,
        }
    }
}

/// Per-priority throughput and latency counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct PriorityMetrics {
    pub published_events: u64,
    pub processed_events: u64,
    /// Running average handler latency in milliseconds
    pub avg_processing_latency_ms: f64,
    pub last_event_time: Option<DateTime<Utc>>,
}

/// One consumer-group assignment produced for a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfiguration {
    pub stream: String,
    pub consumer_group: String,
    pub priority: EventPriority,
}

/// Stream and consumer-group naming plus per-priority metrics
pub struct PriorityStreamManager {
    config: PriorityStreamConfig,
    metrics: RwLock<HashMap<EventPriority, PriorityMetrics>>,
}

impl PriorityStreamManager {
    pub fn new(config: PriorityStreamConfig) -> Self {
        Self {
            config,
            metrics: RwLock::new(HashMap::new()),
        }
    }

    /// Whether priority routing is enabled
    pub fn priority_routing_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Concrete stream name for a routing triple
    pub fn stream_name(
        &self,
        priority: EventPriority,
        category: EventCategory,
        partition_key: &str,
    ) -> String {
        let key = if partition_key.is_empty() {
            DEFAULT_PARTITION_KEY
        } else {
            partition_key
        };
        if self.config.enabled {
            format!(
                "{}:{}:{}:{}",
                self.config.stream_prefix,
                category.as_str(),
                priority.as_str(),
                key
            )
        } else {
            format!("{}:{}:{}", self.config.stream_prefix, category.as_str(), key)
        }
    }

    /// Consumer-group name for a handler on a priority lane
    ///
    /// The priority segment is only present when priority routing is
    /// enabled, e.g. `billing_projection_high_cg`.
    pub fn consumer_group_name(
        &self,
        priority: EventPriority,
        service_name: &str,
        handler_kind: HandlerKind,
    ) -> String {
        if self.config.enabled {
            format!(
                "{}_{}_{}_cg",
                service_name,
                handler_kind.as_str(),
                priority.as_str()
            )
        } else {
            format!("{}_{}_cg", service_name, handler_kind.as_str())
        }
    }

    /// All streams for a (category, key), highest priority first
    pub fn streams_by_priority(
        &self,
        category: EventCategory,
        partition_key: &str,
    ) -> Vec<String> {
        if !self.config.enabled {
            return vec![self.stream_name(EventPriority::Normal, category, partition_key)];
        }
        EventPriority::descending()
            .iter()
            .map(|priority| self.stream_name(*priority, category, partition_key))
            .collect()
    }

    /// Streams at or above a minimum priority, highest first
    pub fn streams_with_min_priority(
        &self,
        category: EventCategory,
        partition_key: &str,
        min_priority: EventPriority,
    ) -> Vec<String> {
        if !self.config.enabled {
            return vec![self.stream_name(EventPriority::Normal, category, partition_key)];
        }
        EventPriority::descending()
            .iter()
            .filter(|priority| **priority >= min_priority)
            .map(|priority| self.stream_name(*priority, category, partition_key))
            .collect()
    }

    /// One (stream, consumer group) pair per priority level for a handler
    pub fn consumer_configurations(
        &self,
        service_name: &str,
        handler_kind: HandlerKind,
        category: EventCategory,
        partition_key: &str,
    ) -> Vec<ConsumerConfiguration> {
        let priorities = if self.config.enabled {
            EventPriority::descending().to_vec()
        } else {
            vec![EventPriority::Normal]
        };
        priorities
            .iter()
            .map(|priority| ConsumerConfiguration {
                stream: self.stream_name(*priority, category, partition_key),
                consumer_group: self.consumer_group_name(*priority, service_name, handler_kind),
                priority: *priority,
            })
            .collect()
    }

    /// Count one published event on a priority lane
    pub async fn record_published_event(&self, priority: EventPriority) {
        let mut metrics = self.metrics.write().await;
        let entry = metrics.entry(priority).or_default();
        entry.published_events += 1;
        entry.last_event_time = Some(Utc::now());
    }

    /// Count one processed event and fold its latency into the average
    pub async fn record_processed_event(&self, priority: EventPriority, latency_ms: f64) {
        let mut metrics = self.metrics.write().await;
        let entry = metrics.entry(priority).or_default();
        entry.processed_events += 1;
        let n = entry.processed_events as f64;
        entry.avg_processing_latency_ms =
            (entry.avg_processing_latency_ms * (n - 1.0) + latency_ms) / n;
        entry.last_event_time = Some(Utc::now());
    }

    /// Deep copy of the per-priority metrics
    pub async fn metrics(&self) -> HashMap<EventPriority, PriorityMetrics> {
        self.metrics.read().await.clone()
    }

    /// Each priority's share of the total published volume
    ///
    /// All shares are zero before the first event.
    pub async fn priority_ratios(&self) -> HashMap<EventPriority, f64> {
        let metrics = self.metrics.read().await;
        let total: u64 = metrics.values().map(|m| m.published_events).sum();

        let mut ratios = HashMap::new();
        for priority in EventPriority::descending() {
            let published = metrics
                .get(&priority)
                .map(|m| m.published_events)
                .unwrap_or(0);
            let ratio = if total == 0 {
                0.0
            } else {
                published as f64 / total as f64
            };
            ratios.insert(priority, ratio);
        }
        ratios
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(enabled: bool) -> PriorityStreamManager {
        PriorityStreamManager::new(PriorityStreamConfig {
            stream_prefix: "events".to_string(),
            enabled,
        })
    }

    #[test]
    fn test_stream_name_with_priority_routing() {
        let manager = manager(true);
        assert_eq!(
            manager.stream_name(EventPriority::Critical, EventCategory::Domain, "user"),
            "events:domain_event:critical:user"
        );
        assert_eq!(
            manager.stream_name(EventPriority::Low, EventCategory::Integration, ""),
            "events:integration:low:default"
        );
    }

    #[test]
    fn test_stream_name_without_priority_routing_collapses() {
        let manager = manager(false);
        let names: Vec<String> = EventPriority::descending()
            .iter()
            .map(|p| manager.stream_name(*p, EventCategory::Domain, "user"))
            .collect();
        assert!(names.iter().all(|name| name == "events:domain_event:user"));
    }

    #[test]
    fn test_stream_names_distinct_per_priority() {
        let manager = manager(true);
        let mut names: Vec<String> = EventPriority::descending()
            .iter()
            .map(|p| manager.stream_name(*p, EventCategory::Domain, "user"))
            .collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 4);
    }

    #[test]
    fn test_consumer_group_name() {
        let manager = manager(true);
        assert_eq!(
            manager.consumer_group_name(EventPriority::High, "service", HandlerKind::Projection),
            "service_projection_high_cg"
        );

        let flat = PriorityStreamManager::new(PriorityStreamConfig {
            stream_prefix: "events".to_string(),
            enabled: false,
        });
        assert_eq!(
            flat.consumer_group_name(EventPriority::High, "service", HandlerKind::Projection),
            "service_projection_cg"
        );
    }

    #[test]
    fn test_streams_ordered_critical_first() {
        let manager = manager(true);
        let streams = manager.streams_by_priority(EventCategory::Domain, "user");
        assert_eq!(streams[0], "events:domain_event:critical:user");
        assert_eq!(streams[3], "events:domain_event:low:user");

        let filtered =
            manager.streams_with_min_priority(EventCategory::Domain, "user", EventPriority::High);
        assert_eq!(
            filtered,
            vec![
                "events:domain_event:critical:user".to_string(),
                "events:domain_event:high:user".to_string(),
            ]
        );
    }

    #[test]
    fn test_consumer_configurations_fan_out() {
        let manager = manager(true);
        let configs = manager.consumer_configurations(
            "billing",
            HandlerKind::Saga,
            EventCategory::Domain,
            "invoice",
        );
        assert_eq!(configs.len(), 4);
        assert_eq!(configs[0].priority, EventPriority::Critical);
        assert_eq!(configs[0].consumer_group, "billing_saga_critical_cg");
    }

    #[tokio::test]
    async fn test_priority_ratios() {
        let manager = manager(true);
        assert_eq!(
            manager.priority_ratios().await[&EventPriority::Critical],
            0.0
        );

        for _ in 0..3 {
            manager.record_published_event(EventPriority::Normal).await;
        }
        manager.record_published_event(EventPriority::Critical).await;

        let ratios = manager.priority_ratios().await;
        assert!((ratios[&EventPriority::Normal] - 0.75).abs() < f64::EPSILON);
        assert!((ratios[&EventPriority::Critical] - 0.25).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_latency_running_average() {
        let manager = manager(true);
        manager
            .record_processed_event(EventPriority::Normal, 10.0)
            .await;
        manager
            .record_processed_event(EventPriority::Normal, 30.0)
            .await;

        let metrics = manager.metrics().await;
        let normal = &metrics[&EventPriority::Normal];
        assert_eq!(normal.processed_events, 2);
        assert!((normal.avg_processing_latency_ms - 20.0).abs() < f64::EPSILON);
    }
}
