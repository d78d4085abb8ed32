//! Circuit breaker
//!
//! Per-service state machine protecting handler invocation from cascading
//! failure. Closed passes calls through and counts failures; Open rejects
//! immediately; HalfOpen lets a probe call through once the recovery
//! timeout has elapsed. Panics inside wrapped calls are recovered and
//! converted into ordinary failures.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{EventBusError, Result};
use crate::handlers::HandlerKind;

/// Breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through, failures are counted
    Closed,
    /// Calls are rejected immediately
    Open,
    /// Probe state after the recovery timeout
    HalfOpen,
}

/// Breaker tuning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// When false the breaker counts metrics but never rejects
    pub enabled: bool,
    /// Consecutive failures before the breaker trips
    pub failure_threshold: u32,
    /// How long the breaker stays open before probing
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    last_failure_time: Option<DateTime<Utc>>,
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    rejected_calls: u64,
    state_transitions: u64,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            last_failure_time: None,
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            rejected_calls: 0,
            state_transitions: 0,
        }
    }
}

/// Point-in-time breaker metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub state_transitions: u64,
    /// Time left until the breaker probes again, while Open
    pub remaining_recovery: Option<Duration>,
    pub last_failure_time: Option<DateTime<Utc>>,
}

/// Per-service circuit breaker
pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    state: RwLock<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            state: RwLock::new(BreakerState::default()),
        }
    }

    /// Service name this breaker guards
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Invoke `f` under breaker protection
    ///
    /// A panic inside `f` is recovered and recorded as a failure.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.before_call().await?;

        match AssertUnwindSafe(f()).catch_unwind().await {
            Ok(Ok(value)) => {
                self.record_success().await;
                Ok(value)
            }
            Ok(Err(error)) => {
                let _ = self.record_failure(&error.to_string()).await;
                Err(error)
            }
            Err(panic) => {
                let message = panic_message(&panic);
                warn!(
                    "Handler panic recovered by circuit breaker {}: {}",
                    self.service, message
                );
                let _ = self.record_failure(&message).await;
                Err(EventBusError::HandlerFailed {
                    handler: self.service.clone(),
                    message: format!("handler panicked: {}", message),
                })
            }
        }
    }

    async fn before_call(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.total_calls += 1;

        if !self.config.enabled {
            return Ok(());
        }

        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = state
                    .last_failure_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.recovery_timeout {
                    debug!(
                        "Circuit breaker {} half-open after recovery timeout",
                        self.service
                    );
                    state.state = CircuitState::HalfOpen;
                    state.state_transitions += 1;
                    Ok(())
                } else {
                    state.rejected_calls += 1;
                    Err(EventBusError::CircuitBreakerOpen {
                        service: self.service.clone(),
                    })
                }
            }
        }
    }

    /// Record a successful call, closing the breaker from HalfOpen
    pub async fn record_success(&self) {
        let mut state = self.state.write().await;
        state.successful_calls += 1;
        state.failure_count = 0;
        if state.state == CircuitState::HalfOpen {
            debug!("Circuit breaker {} closed after probe success", self.service);
            state.state = CircuitState::Closed;
            state.state_transitions += 1;
        }
    }

    /// Record a failed call
    ///
    /// Returns `CircuitBreakerOpen` at the moment the failure trips the
    /// breaker.
    pub async fn record_failure(&self, reason: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.failed_calls += 1;
        state.failure_count += 1;
        state.last_failure_at = Some(Instant::now());
        state.last_failure_time = Some(Utc::now());

        if !self.config.enabled {
            return Ok(());
        }

        let tripped = match state.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => state.failure_count >= self.config.failure_threshold,
            CircuitState::Open => false,
        };

        if tripped {
            warn!(
                "Circuit breaker {} opened after {} failures: {}",
                self.service, state.failure_count, reason
            );
            state.state = CircuitState::Open;
            state.state_transitions += 1;
            return Err(EventBusError::CircuitBreakerOpen {
                service: self.service.clone(),
            });
        }
        Ok(())
    }

    /// Current breaker state
    pub async fn state(&self) -> CircuitState {
        self.state.read().await.state
    }

    /// Reset the breaker to its initial state
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        *state = BreakerState::default();
    }

    /// Snapshot of the breaker counters and derived rates
    pub async fn metrics(&self) -> CircuitBreakerMetrics {
        let state = self.state.read().await;
        let completed = state.successful_calls + state.failed_calls;
        let remaining_recovery = match state.state {
            CircuitState::Open => state.last_failure_at.map(|at| {
                self.config
                    .recovery_timeout
                    .saturating_sub(at.elapsed())
            }),
            _ => None,
        };

        CircuitBreakerMetrics {
            service: self.service.clone(),
            state: state.state,
            failure_count: state.failure_count,
            total_calls: state.total_calls,
            successful_calls: state.successful_calls,
            failed_calls: state.failed_calls,
            rejected_calls: state.rejected_calls,
            success_rate: rate(state.successful_calls, completed),
            failure_rate: rate(state.failed_calls, completed),
            state_transitions: state.state_transitions,
            remaining_recovery,
            last_failure_time: state.last_failure_time,
        }
    }
}

fn rate(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Lazily-created registry of one breaker per service name
pub struct CircuitBreakerManager {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerManager {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Default service name for a handler
    pub fn service_name(handler_name: &str, kind: HandlerKind) -> String {
        format!("{}_{}", handler_name, kind.as_str())
    }

    /// Fetch or create the breaker for a service
    pub async fn breaker(&self, service: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().await;
            if let Some(breaker) = breakers.get(service) {
                return Arc::clone(breaker);
            }
        }
        let mut breakers = self.breakers.write().await;
        Arc::clone(breakers.entry(service.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(service, self.config.clone()))
        }))
    }

    /// Reset every registered breaker
    pub async fn reset_all(&self) {
        let breakers = self.breakers.read().await;
        for breaker in breakers.values() {
            breaker.reset().await;
        }
    }

    /// Metrics snapshot for every registered breaker
    pub async fn all_metrics(&self) -> HashMap<String, CircuitBreakerMetrics> {
        let breakers = self.breakers.read().await;
        let mut snapshot = HashMap::with_capacity(breakers.len());
        for (service, breaker) in breakers.iter() {
            snapshot.insert(service.clone(), breaker.metrics().await);
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32, recovery: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            failure_threshold: threshold,
            recovery_timeout: recovery,
        }
    }

    async fn failing_call(breaker: &CircuitBreaker) -> Result<()> {
        breaker
            .call(|| async {
                Err::<(), _>(EventBusError::HandlerFailed {
                    handler: "svc".to_string(),
                    message: "boom".to_string(),
                })
            })
            .await
    }

    #[tokio::test]
    async fn test_trips_open_at_threshold() {
        let breaker = CircuitBreaker::new("svc", config(3, Duration::from_secs(60)));

        for _ in 0..3 {
            assert!(failing_call(&breaker).await.is_err());
        }
        assert_eq!(breaker.state().await, CircuitState::Open);

        // next call is rejected without invoking the wrapped function
        let invoked = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&invoked);
        let result = breaker
            .call(|| async move {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(
            result,
            Err(EventBusError::CircuitBreakerOpen { .. })
        ));
        assert!(!invoked.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_half_open_probe_then_close() {
        let breaker = CircuitBreaker::new("svc", config(1, Duration::from_millis(20)));

        assert!(failing_call(&breaker).await.is_err());
        assert_eq!(breaker.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let result = breaker.call(|| async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("svc", config(1, Duration::from_millis(20)));

        assert!(failing_call(&breaker).await.is_err());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(failing_call(&breaker).await.is_err());
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_panic_converted_to_failure() {
        let breaker = CircuitBreaker::new("svc", config(5, Duration::from_secs(60)));

        let result: Result<()> = breaker.call(|| async { panic!("handler exploded") }).await;
        assert!(matches!(result, Err(EventBusError::HandlerFailed { .. })));

        let metrics = breaker.metrics().await;
        assert_eq!(metrics.failed_calls, 1);
        assert_eq!(metrics.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_disabled_breaker_counts_but_never_rejects() {
        let breaker = CircuitBreaker::new(
            "svc",
            CircuitBreakerConfig {
                enabled: false,
                failure_threshold: 1,
                recovery_timeout: Duration::from_secs(60),
            },
        );

        for _ in 0..5 {
            assert!(failing_call(&breaker).await.is_err());
        }
        assert_eq!(breaker.state().await, CircuitState::Closed);

        let metrics = breaker.metrics().await;
        assert_eq!(metrics.failed_calls, 5);
        assert_eq!(metrics.rejected_calls, 0);
        assert!(breaker.call(|| async { Ok(()) }).await.is_ok());
    }

    #[tokio::test]
    async fn test_manager_caches_by_service() {
        let manager = CircuitBreakerManager::new(CircuitBreakerConfig::default());
        let first = manager.breaker("orders_projection").await;
        let second = manager.breaker("orders_projection").await;
        assert!(Arc::ptr_eq(&first, &second));

        assert_eq!(
            CircuitBreakerManager::service_name("orders", HandlerKind::Projection),
            "orders_projection"
        );
    }
}
