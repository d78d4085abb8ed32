//! Health checks
//!
//! A registry of pluggable checks folded into one summary whose overall
//! status is the worst of all child statuses. Checks run on demand or on
//! a background interval; recent summaries are retained in a bounded
//! history ring.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::brokers::EventBroker;
use crate::circuit_breaker::{CircuitBreakerManager, CircuitState};

/// Health states, ordered best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Outcome of a single named check
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub message: String,
    pub error: Option<String>,
    pub response_time: Duration,
    pub timestamp: DateTime<Utc>,
    pub details: HashMap<String, serde_json::Value>,
}

impl HealthCheckResult {
    pub fn healthy(message: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Healthy, message, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Degraded, message, None)
    }

    pub fn unhealthy(message: impl Into<String>, error: Option<String>) -> Self {
        Self::with_status(HealthStatus::Unhealthy, message, error)
    }

    fn with_status(status: HealthStatus, message: impl Into<String>, error: Option<String>) -> Self {
        Self {
            status,
            message: message.into(),
            error,
            response_time: Duration::ZERO,
            timestamp: Utc::now(),
            details: HashMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    fn with_response_time(mut self, response_time: Duration) -> Self {
        self.response_time = response_time;
        self
    }
}

/// Aggregated outcome of one full check run
#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    /// Worst status among all checks
    pub status: HealthStatus,
    pub checks: HashMap<String, HealthCheckResult>,
    pub timestamp: DateTime<Utc>,
    pub total_duration: Duration,
}

/// A named health probe
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self) -> HealthCheckResult;
}

/// Health checker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckerConfig {
    /// Budget shared by every check in one run
    pub check_timeout: Duration,
    /// Background run interval, disabled when absent
    pub check_interval: Option<Duration>,
    /// Number of summaries retained in history
    pub history_size: usize,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        Self {
            check_timeout: Duration::from_secs(5),
            check_interval: None,
            history_size: 100,
        }
    }
}

/// Registry and runner for health checks
pub struct HealthChecker {
    config: HealthCheckerConfig,
    checks: RwLock<HashMap<String, Arc<dyn HealthCheck>>>,
    history: RwLock<VecDeque<HealthSummary>>,
    task: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl HealthChecker {
    pub fn new(config: HealthCheckerConfig) -> Self {
        Self {
            config,
            checks: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            task: Mutex::new(None),
        }
    }

    /// Register a named check, replacing any previous one of that name
    pub async fn add_check(&self, check: Arc<dyn HealthCheck>) {
        self.checks
            .write()
            .await
            .insert(check.name().to_string(), check);
    }

    /// Remove a check by name
    pub async fn remove_check(&self, name: &str) {
        self.checks.write().await.remove(name);
    }

    /// Run every registered check once and record the summary
    pub async fn run_checks(&self) -> HealthSummary {
        let checks: Vec<Arc<dyn HealthCheck>> =
            self.checks.read().await.values().cloned().collect();
        let started = Instant::now();
        let mut results = HashMap::with_capacity(checks.len());
        let mut worst = HealthStatus::Healthy;

        for check in checks {
            let check_started = Instant::now();
            let result =
                match tokio::time::timeout(self.config.check_timeout, check.check()).await {
                    Ok(result) => result.with_response_time(check_started.elapsed()),
                    Err(_) => HealthCheckResult::unhealthy(
                        "health check timed out",
                        Some(format!(
                            "no result within {:?}",
                            self.config.check_timeout
                        )),
                    )
                    .with_response_time(check_started.elapsed()),
                };
            worst = worst.max(result.status);
            results.insert(check.name().to_string(), result);
        }

        let summary = HealthSummary {
            status: worst,
            checks: results,
            timestamp: Utc::now(),
            total_duration: started.elapsed(),
        };

        let mut history = self.history.write().await;
        history.push_back(summary.clone());
        while history.len() > self.config.history_size {
            history.pop_front();
        }
        summary
    }

    /// Start the background check interval, when one is configured
    pub async fn start(self: &Arc<Self>) {
        let interval = match self.config.check_interval {
            Some(interval) => interval,
            None => return,
        };
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let checker = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let summary = checker.run_checks().await;
                        if summary.status != HealthStatus::Healthy {
                            warn!("Periodic health check degraded: {:?}", summary.status);
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        *task = Some((shutdown_tx, handle));
        info!("Health checker started with interval {:?}", interval);
    }

    /// Stop the background check interval
    pub async fn stop(&self) {
        if let Some((shutdown_tx, handle)) = self.task.lock().await.take() {
            let _ = shutdown_tx.send(true);
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                warn!("Health check task did not stop in time");
            }
        }
    }

    /// Most recent summaries, newest last, capped at `limit`
    pub async fn health_history(&self, limit: usize) -> Vec<HealthSummary> {
        let history = self.history.read().await;
        history
            .iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }

    /// The newest recorded summary
    pub async fn last_health_check(&self) -> Option<HealthSummary> {
        self.history.read().await.back().cloned()
    }
}

/// Broker connectivity and latency probe
pub struct BrokerHealthCheck {
    broker: Arc<dyn EventBroker>,
    /// Latency below this is healthy
    soft_latency: Duration,
    /// Latency above this is unhealthy
    hard_latency: Duration,
}

impl BrokerHealthCheck {
    pub fn new(broker: Arc<dyn EventBroker>) -> Self {
        Self {
            broker,
            soft_latency: Duration::from_millis(50),
            hard_latency: Duration::from_millis(500),
        }
    }

    pub fn with_thresholds(mut self, soft: Duration, hard: Duration) -> Self {
        self.soft_latency = soft;
        self.hard_latency = hard;
        self
    }
}

#[async_trait]
impl HealthCheck for BrokerHealthCheck {
    fn name(&self) -> &str {
        "broker"
    }

    async fn check(&self) -> HealthCheckResult {
        match self.broker.ping().await {
            Ok(latency) => {
                let result = if latency < self.soft_latency {
                    HealthCheckResult::healthy("broker responding")
                } else if latency < self.hard_latency {
                    HealthCheckResult::degraded("broker latency elevated")
                } else {
                    HealthCheckResult::unhealthy("broker latency critical", None)
                };
                result.with_detail(
                    "latency_ms",
                    serde_json::json!(latency.as_secs_f64() * 1000.0),
                )
            }
            Err(error) => {
                HealthCheckResult::unhealthy("broker unreachable", Some(error.to_string()))
            }
        }
    }
}

/// Aggregate circuit-breaker status probe
pub struct CircuitBreakerHealthCheck {
    manager: Arc<CircuitBreakerManager>,
}

impl CircuitBreakerHealthCheck {
    pub fn new(manager: Arc<CircuitBreakerManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl HealthCheck for CircuitBreakerHealthCheck {
    fn name(&self) -> &str {
        "circuit_breakers"
    }

    async fn check(&self) -> HealthCheckResult {
        let metrics = self.manager.all_metrics().await;
        let troubled: Vec<&str> = metrics
            .values()
            .filter(|m| m.state != CircuitState::Closed)
            .map(|m| m.service.as_str())
            .collect();

        let mut result = if troubled.is_empty() {
            HealthCheckResult::healthy("all circuit breakers closed")
        } else {
            HealthCheckResult::degraded(format!(
                "{} circuit breaker(s) open or probing",
                troubled.len()
            ))
        };
        for metric in metrics.values() {
            result = result.with_detail(
                metric.service.clone(),
                serde_json::json!(format!("{:?}", metric.state)),
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::memory::MemoryBroker;

    struct StaticCheck {
        name: &'static str,
        status: HealthStatus,
    }

    #[async_trait]
    impl HealthCheck for StaticCheck {
        fn name(&self) -> &str {
            self.name
        }

        async fn check(&self) -> HealthCheckResult {
            match self.status {
                HealthStatus::Healthy => HealthCheckResult::healthy("fine"),
                HealthStatus::Degraded => HealthCheckResult::degraded("wobbly"),
                HealthStatus::Unhealthy => HealthCheckResult::unhealthy("down", None),
            }
        }
    }

    #[tokio::test]
    async fn test_summary_takes_worst_status() {
        let checker = HealthChecker::new(HealthCheckerConfig::default());
        checker
            .add_check(Arc::new(StaticCheck {
                name: "a",
                status: HealthStatus::Healthy,
            }))
            .await;
        checker
            .add_check(Arc::new(StaticCheck {
                name: "b",
                status: HealthStatus::Degraded,
            }))
            .await;

        let summary = checker.run_checks().await;
        assert_eq!(summary.status, HealthStatus::Degraded);
        assert_eq!(summary.checks.len(), 2);
    }

    #[tokio::test]
    async fn test_slow_check_times_out_as_unhealthy() {
        struct SlowCheck;

        #[async_trait]
        impl HealthCheck for SlowCheck {
            fn name(&self) -> &str {
                "slow"
            }

            async fn check(&self) -> HealthCheckResult {
                tokio::time::sleep(Duration::from_secs(60)).await;
                HealthCheckResult::healthy("never reached")
            }
        }

        let checker = HealthChecker::new(HealthCheckerConfig {
            check_timeout: Duration::from_millis(20),
            ..HealthCheckerConfig::default()
        });
        checker.add_check(Arc::new(SlowCheck)).await;

        let summary = checker.run_checks().await;
        assert_eq!(summary.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_history_ring_is_bounded() {
        let checker = HealthChecker::new(HealthCheckerConfig {
            history_size: 3,
            ..HealthCheckerConfig::default()
        });
        checker
            .add_check(Arc::new(StaticCheck {
                name: "a",
                status: HealthStatus::Healthy,
            }))
            .await;

        for _ in 0..5 {
            checker.run_checks().await;
        }
        assert_eq!(checker.health_history(10).await.len(), 3);
        assert_eq!(checker.health_history(2).await.len(), 2);
        assert!(checker.last_health_check().await.is_some());
    }

    #[tokio::test]
    async fn test_broker_check_reports_unreachable() {
        let broker = Arc::new(MemoryBroker::new());
        let check = BrokerHealthCheck::new(broker.clone());

        // not connected yet
        let result = check.check().await;
        assert_eq!(result.status, HealthStatus::Unhealthy);

        broker.connect().await.unwrap();
        let result = check.check().await;
        assert_eq!(result.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_breaker_check_degrades_on_open_breaker() {
        let manager = Arc::new(CircuitBreakerManager::new(CircuitBreakerConfig {
            enabled: true,
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
        }));
        let check = CircuitBreakerHealthCheck::new(Arc::clone(&manager));

        assert_eq!(check.check().await.status, HealthStatus::Healthy);

        let breaker = manager.breaker("svc").await;
        let _ = breaker.record_failure("boom").await;
        assert_eq!(check.check().await.status, HealthStatus::Degraded);
    }
}
