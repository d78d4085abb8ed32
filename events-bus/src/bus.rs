//! Event bus orchestration
//!
//! Owns the lifecycle, the publish and subscribe APIs, and one
//! consumption loop per active subscription. The loops drain
//! priority-ordered streams (critical first), dispatch to handlers, and
//! route failures through the retry and dead-letter pipeline. Handler
//! failures never propagate to publishers; they surface through metrics,
//! statistics, and health checks only.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::brokers::{EventBroker, StreamDelivery};
use crate::circuit_breaker::CircuitBreakerManager;
use crate::config::EventBusConfig;
use crate::dlq::{DlqManager, REASON_MAX_RETRIES};
use crate::error::{EventBusError, Result};
use crate::event::{BusEvent, EventPriority, ProcessingError};
use crate::handlers::{event_type_matches, CircuitProtectedHandler, EventHandler};
use crate::health::{
    BrokerHealthCheck, CircuitBreakerHealthCheck, HealthCheck, HealthCheckResult, HealthChecker,
    HealthSummary,
};
use crate::priority::{ConsumerConfiguration, PriorityStreamManager, DEFAULT_PARTITION_KEY};
use crate::retry::{current_retry_count, RetryPolicyManager};
use crate::serializer::EventSerializer;

/// Error rate above which the bus health check reports Degraded
const DEGRADED_ERROR_RATE: f64 = 0.25;

/// Per-call publish overrides
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Durability hint; stream appends are always durable on the Redis
    /// backend
    pub persistent: bool,
    /// Delivery-urgency hint carried for API compatibility
    pub immediate: bool,
    /// Append on a background task instead of the caller's
    pub async_publish: bool,
    /// Override the event's own priority
    pub priority: Option<EventPriority>,
    /// Override the partition key derived from the aggregate type
    pub partition_key: Option<String>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            persistent: true,
            immediate: false,
            async_publish: false,
            priority: None,
            partition_key: None,
        }
    }
}

/// Routing scope of a subscription
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Category of streams the subscription reads
    pub category: crate::event::EventCategory,
    /// Partition key of streams the subscription reads
    pub partition_key: String,
    /// Circuit-breaker wrap override; falls back to the bus configuration
    pub use_circuit_breaker: Option<bool>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            category: crate::event::EventCategory::Domain,
            partition_key: DEFAULT_PARTITION_KEY.to_string(),
            use_circuit_breaker: None,
        }
    }
}

#[derive(Debug, Default)]
struct MetricsInner {
    published_events: u64,
    processed_events: u64,
    failed_events: u64,
    avg_processing_latency_ms: f64,
    last_event_time: Option<DateTime<Utc>>,
}

/// Point-in-time bus metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct EventBusMetrics {
    pub running: bool,
    pub published_events: u64,
    pub processed_events: u64,
    pub failed_events: u64,
    pub active_subscriptions: usize,
    pub avg_processing_latency_ms: f64,
    pub last_event_time: Option<DateTime<Utc>>,
}

struct SubscriptionEntry {
    event_type: String,
    options: SubscribeOptions,
    handler: Arc<dyn EventHandler>,
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

/// The publish/subscribe event bus
pub struct EventBus {
    config: EventBusConfig,
    broker: Arc<dyn EventBroker>,
    serializer: Arc<dyn EventSerializer>,
    priority: Arc<PriorityStreamManager>,
    retry: Arc<RetryPolicyManager>,
    dlq: Arc<DlqManager>,
    breakers: Arc<CircuitBreakerManager>,
    health: Arc<HealthChecker>,
    subscriptions: Arc<RwLock<HashMap<String, SubscriptionEntry>>>,
    metrics: Arc<RwLock<MetricsInner>>,
    running: Arc<AtomicBool>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl EventBus {
    /// Build a bus around a broker and serializer
    pub fn new(
        config: EventBusConfig,
        broker: Arc<dyn EventBroker>,
        serializer: Arc<dyn EventSerializer>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            priority: Arc::new(PriorityStreamManager::new(config.priority.clone())),
            retry: Arc::new(RetryPolicyManager::new(config.retry.clone())),
            dlq: Arc::new(DlqManager::new(config.dlq.clone())),
            breakers: Arc::new(CircuitBreakerManager::new(config.circuit_breaker.clone())),
            health: Arc::new(HealthChecker::new(config.health.clone())),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            metrics: Arc::new(RwLock::new(MetricsInner::default())),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Mutex::new(None),
            config,
            broker,
            serializer,
        })
    }

    /// Connect the broker and bring every registered subscription online
    pub async fn start(&self) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EventBusError::AlreadyRunning);
        }

        if let Err(error) = self.broker.connect().await {
            self.running.store(false, Ordering::SeqCst);
            return Err(error);
        }

        let (shutdown_tx, _) = watch::channel(false);
        *self.shutdown.lock().await = Some(shutdown_tx);

        self.health
            .add_check(Arc::new(BrokerHealthCheck::new(Arc::clone(&self.broker))))
            .await;
        self.health
            .add_check(Arc::new(CircuitBreakerHealthCheck::new(Arc::clone(
                &self.breakers,
            ))))
            .await;
        self.health
            .add_check(Arc::new(EventBusHealthCheck {
                running: Arc::clone(&self.running),
                metrics: Arc::clone(&self.metrics),
                subscriptions: Arc::clone(&self.subscriptions),
            }))
            .await;
        self.health.start().await;

        let ids: Vec<String> = self.subscriptions.read().await.keys().cloned().collect();
        for id in ids {
            self.spawn_consumption_loop(&id).await?;
        }

        info!("Event bus started for service {}", self.config.service_name);
        Ok(())
    }

    /// Signal every consumption loop, join them, and disconnect
    pub async fn stop(&self) -> Result<()> {
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EventBusError::NotRunning);
        }

        if let Some(shutdown_tx) = self.shutdown.lock().await.take() {
            let _ = shutdown_tx.send(true);
        }
        self.health.stop().await;

        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut subscriptions = self.subscriptions.write().await;
            subscriptions
                .iter_mut()
                .filter_map(|(id, entry)| entry.handle.take().map(|h| (id.clone(), h)))
                .collect()
        };

        let mut stragglers = Vec::new();
        for (id, handle) in handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout(self.config.shutdown_grace, handle)
                .await
                .is_err()
            {
                abort.abort();
                stragglers.push(id);
            }
        }

        self.broker.disconnect().await?;
        info!("Event bus stopped");

        if stragglers.is_empty() {
            Ok(())
        } else {
            Err(EventBusError::Internal(anyhow::anyhow!(
                "consumption loops did not stop within the grace period: {}",
                stragglers.join(", ")
            )))
        }
    }

    /// Publish one event with default options
    pub async fn publish(&self, event: BusEvent) -> Result<()> {
        self.publish_with_options(event, PublishOptions::default())
            .await
    }

    /// Publish one event with per-call overrides
    pub async fn publish_with_options(
        &self,
        event: BusEvent,
        options: PublishOptions,
    ) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(EventBusError::NotRunning);
        }
        if event.event_type().is_empty() {
            return Err(EventBusError::InvalidConfiguration(
                "event_type must not be empty".to_string(),
            ));
        }

        let priority = options
            .priority
            .or_else(|| event.priority())
            .unwrap_or_default();
        let category = event.category().unwrap_or_default();
        let partition_key = options.partition_key.clone().unwrap_or_else(|| {
            let aggregate_type = event.aggregate_type();
            if aggregate_type.is_empty() {
                DEFAULT_PARTITION_KEY.to_string()
            } else {
                aggregate_type.to_string()
            }
        });

        let stream = self.priority.stream_name(priority, category, &partition_key);
        let payload = self.serializer.serialize(&event)?;
        let max_len = self.config.max_stream_length;

        if options.async_publish {
            let broker = Arc::clone(&self.broker);
            let metrics = Arc::clone(&self.metrics);
            let priority_manager = Arc::clone(&self.priority);
            tokio::spawn(async move {
                match broker.append(&stream, &payload, max_len).await {
                    Ok(_) => record_published(&metrics, &priority_manager, priority).await,
                    Err(error) => error!("Background publish to {} failed: {}", stream, error),
                }
            });
            return Ok(());
        }

        self.broker.append(&stream, &payload, max_len).await?;
        record_published(&self.metrics, &self.priority, priority).await;
        debug!(
            "Published event {} of type {} to {}",
            event.event_id(),
            event.event_type(),
            stream
        );
        Ok(())
    }

    /// Publish a batch of events, stopping at the first failure
    pub async fn publish_batch(&self, events: Vec<BusEvent>) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(EventBusError::NotRunning);
        }
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }

    /// Subscribe a handler to one event type within the default scope
    pub async fn subscribe(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<String> {
        self.subscribe_with_options(event_type, handler, SubscribeOptions::default())
            .await
    }

    /// Subscribe a handler to every event type
    pub async fn subscribe_all(&self, handler: Arc<dyn EventHandler>) -> Result<String> {
        self.subscribe("*", handler).await
    }

    /// Subscribe a handler with an explicit routing scope
    pub async fn subscribe_with_options(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();

        let use_breaker = options
            .use_circuit_breaker
            .unwrap_or(self.config.circuit_breaker.enabled);
        let handler: Arc<dyn EventHandler> = if use_breaker {
            let service = CircuitBreakerManager::service_name(handler.name(), handler.kind());
            let breaker = self.breakers.breaker(&service).await;
            Arc::new(CircuitProtectedHandler::new(handler, breaker))
        } else {
            handler
        };

        let (shutdown_tx, _) = watch::channel(false);
        self.subscriptions.write().await.insert(
            id.clone(),
            SubscriptionEntry {
                event_type: event_type.to_string(),
                options,
                handler,
                shutdown: shutdown_tx,
                handle: None,
            },
        );

        if self.running.load(Ordering::SeqCst) {
            self.spawn_consumption_loop(&id).await?;
        }
        info!("Registered subscription {} for {}", id, event_type);
        Ok(id)
    }

    /// Remove a subscription and stop its consumption loop
    pub async fn unsubscribe(&self, id: &str) -> Result<()> {
        let entry = self
            .subscriptions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| EventBusError::SubscriptionNotFound(id.to_string()))?;

        let _ = entry.shutdown.send(true);
        if let Some(handle) = entry.handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(self.config.shutdown_grace, handle)
                .await
                .is_err()
            {
                abort.abort();
                warn!("Consumption loop for subscription {} did not stop in time", id);
            }
        }
        info!("Removed subscription {}", id);
        Ok(())
    }

    /// Point-in-time bus metrics
    pub async fn metrics(&self) -> EventBusMetrics {
        let inner = self.metrics.read().await;
        EventBusMetrics {
            running: self.running.load(Ordering::SeqCst),
            published_events: inner.published_events,
            processed_events: inner.processed_events,
            failed_events: inner.failed_events,
            active_subscriptions: self.subscriptions.read().await.len(),
            avg_processing_latency_ms: inner.avg_processing_latency_ms,
            last_event_time: inner.last_event_time,
        }
    }

    /// Run every registered health check once
    pub async fn check_health(&self) -> HealthSummary {
        self.health.run_checks().await
    }

    pub fn priority_manager(&self) -> &Arc<PriorityStreamManager> {
        &self.priority
    }

    pub fn retry_manager(&self) -> &Arc<RetryPolicyManager> {
        &self.retry
    }

    pub fn dlq_manager(&self) -> &Arc<DlqManager> {
        &self.dlq
    }

    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    pub fn health_checker(&self) -> &Arc<HealthChecker> {
        &self.health
    }

    async fn spawn_consumption_loop(&self, id: &str) -> Result<()> {
        let global_shutdown = {
            let guard = self.shutdown.lock().await;
            match guard.as_ref() {
                Some(shutdown_tx) => shutdown_tx.subscribe(),
                None => return Err(EventBusError::NotRunning),
            }
        };

        let mut subscriptions = self.subscriptions.write().await;
        let entry = subscriptions
            .get_mut(id)
            .ok_or_else(|| EventBusError::SubscriptionNotFound(id.to_string()))?;
        if entry.handle.is_some() {
            return Ok(());
        }

        let configs = self.priority.consumer_configurations(
            &self.config.service_name,
            entry.handler.kind(),
            entry.options.category,
            &entry.options.partition_key,
        );
        // groups must exist before the loop starts so no event published
        // right after start is missed
        for config in &configs {
            self.broker
                .ensure_group(&config.stream, &config.consumer_group)
                .await?;
        }

        let ctx = ConsumeContext {
            subscription_id: id.to_string(),
            event_type: entry.event_type.clone(),
            consumer_name: format!("{}:{}", self.config.instance_id, id),
            handler: Arc::clone(&entry.handler),
            configs,
            broker: Arc::clone(&self.broker),
            serializer: Arc::clone(&self.serializer),
            priority: Arc::clone(&self.priority),
            retry: Arc::clone(&self.retry),
            dlq: Arc::clone(&self.dlq),
            metrics: Arc::clone(&self.metrics),
            consumer_block: self.config.consumer_block,
            batch_count: self.config.consumer_batch_count,
            max_stream_length: self.config.max_stream_length,
        };
        let sub_shutdown = entry.shutdown.subscribe();
        entry.handle = Some(tokio::spawn(run_consumption_loop(
            ctx,
            global_shutdown,
            sub_shutdown,
        )));
        Ok(())
    }
}

/// Everything a consumption loop needs, detached from the bus itself
struct ConsumeContext {
    subscription_id: String,
    event_type: String,
    consumer_name: String,
    handler: Arc<dyn EventHandler>,
    configs: Vec<ConsumerConfiguration>,
    broker: Arc<dyn EventBroker>,
    serializer: Arc<dyn EventSerializer>,
    priority: Arc<PriorityStreamManager>,
    retry: Arc<RetryPolicyManager>,
    dlq: Arc<DlqManager>,
    metrics: Arc<RwLock<MetricsInner>>,
    consumer_block: Duration,
    batch_count: usize,
    max_stream_length: Option<u64>,
}

async fn run_consumption_loop(
    ctx: ConsumeContext,
    mut global_shutdown: watch::Receiver<bool>,
    mut sub_shutdown: watch::Receiver<bool>,
) {
    debug!(
        "Consumption loop for subscription {} started",
        ctx.subscription_id
    );

    loop {
        if *global_shutdown.borrow() || *sub_shutdown.borrow() {
            break;
        }

        // one non-blocking pass over the streams, highest priority first;
        // any delivery restarts the pass so critical traffic is drained
        // with preference
        let mut delivered = 0usize;
        for config in &ctx.configs {
            match ctx
                .broker
                .read_group(
                    &config.stream,
                    &config.consumer_group,
                    &ctx.consumer_name,
                    ctx.batch_count,
                    Duration::ZERO,
                )
                .await
            {
                Ok(deliveries) => {
                    delivered += deliveries.len();
                    for delivery in deliveries {
                        handle_delivery(&ctx, config, delivery).await;
                    }
                    if delivered > 0 {
                        break;
                    }
                }
                Err(error) => {
                    warn!("Read from {} failed: {}", config.stream, error);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }

        if delivered == 0 {
            tokio::select! {
                _ = tokio::time::sleep(ctx.consumer_block) => {}
                _ = global_shutdown.changed() => {}
                _ = sub_shutdown.changed() => {}
            }
        }
    }

    debug!(
        "Consumption loop for subscription {} exited",
        ctx.subscription_id
    );
}

async fn handle_delivery(
    ctx: &ConsumeContext,
    config: &ConsumerConfiguration,
    delivery: StreamDelivery,
) {
    let event = match ctx.serializer.deserialize(&delivery.payload) {
        Ok(event) => event,
        Err(error) => {
            // an undecodable payload can never succeed later
            warn!(
                "Dropping undecodable message {} from {}: {}",
                delivery.message_id, delivery.stream, error
            );
            record_failed(&ctx.metrics).await;
            ack_delivery(ctx, config, &delivery).await;
            return;
        }
    };

    let event_type = event.event_type().to_string();
    if !event_type_matches(&ctx.event_type, &event_type) || !ctx.handler.can_handle(&event_type) {
        ack_delivery(ctx, config, &delivery).await;
        return;
    }

    let started = Instant::now();
    match ctx.handler.handle(&event).await {
        Ok(()) => {
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
            ack_delivery(ctx, config, &delivery).await;
            record_processed(&ctx.metrics, latency_ms).await;
            ctx.priority
                .record_processed_event(config.priority, latency_ms)
                .await;
            ctx.dlq.record_processed_event(&config.stream).await;
        }
        Err(EventBusError::CircuitBreakerOpen { service }) => {
            // the call was never attempted; the delivery stays pending so
            // the broker redelivers it once the breaker recovers
            debug!(
                "Circuit breaker {} rejected event {}, leaving message pending",
                service,
                event.event_id()
            );
        }
        Err(error) => {
            record_failed(&ctx.metrics).await;
            let processing_error = ProcessingError::new(
                error.to_string(),
                ctx.handler.name(),
                delivery.stream.clone(),
                delivery.message_id.clone(),
                current_retry_count(&event),
            );
            warn!("{}", EventBusError::ProcessingFailed(processing_error.clone()));
            dispatch_failure(ctx, config, &delivery, &event, processing_error).await;
        }
    }
}

async fn dispatch_failure(
    ctx: &ConsumeContext,
    config: &ConsumerConfiguration,
    delivery: &StreamDelivery,
    event: &BusEvent,
    processing_error: ProcessingError,
) {
    let policy = ctx
        .retry
        .resolve_policy(event.event_type(), ctx.handler.name())
        .await;

    if ctx
        .retry
        .should_retry(event, &processing_error.error, ctx.handler.name())
        .await
    {
        let enriched = ctx
            .retry
            .enrich_event_for_retry(event, &processing_error, &policy);
        let attempt = current_retry_count(&enriched);
        let delay = ctx.retry.calculate_delay(&policy, attempt);
        ctx.retry
            .record_retry(ctx.handler.name(), event.event_type())
            .await;

        // the original is acknowledged so the broker's own pending-entry
        // mechanism does not redeliver it alongside the enriched copy
        ack_delivery(ctx, config, delivery).await;

        match ctx.serializer.serialize(&enriched) {
            Ok(payload) => {
                debug!(
                    "Scheduling retry {} for event {} in {:?}",
                    attempt,
                    event.event_id(),
                    delay
                );
                let broker = Arc::clone(&ctx.broker);
                let stream = delivery.stream.clone();
                let max_len = ctx.max_stream_length;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(error) = broker.append(&stream, &payload, max_len).await {
                        error!("Redelivery append to {} failed: {}", stream, error);
                    }
                });
            }
            Err(error) => error!(
                "Could not serialize retry copy of event {}: {}",
                event.event_id(),
                error
            ),
        }
        return;
    }

    if ctx.dlq.should_move_to_dlq(event) {
        warn!(
            "{}",
            EventBusError::MaxRetriesExceeded {
                event_id: event.event_id().to_string(),
                attempts: processing_error.retry_count,
            }
        );
        let dlq_stream = ctx.dlq.dlq_stream_name(&delivery.stream);
        if !dlq_stream.is_empty() {
            let enriched = ctx.dlq.enrich_event_for_dlq(event, &processing_error);
            match ctx.serializer.serialize(&enriched) {
                Ok(payload) => match ctx
                    .broker
                    .append(&dlq_stream, &payload, ctx.max_stream_length)
                    .await
                {
                    Ok(_) => {
                        ctx.dlq
                            .record_dlq_event(
                                &delivery.stream,
                                ctx.handler.name(),
                                REASON_MAX_RETRIES,
                            )
                            .await;
                        ctx.retry.record_exhausted().await;
                        info!(
                            "Event {} dead-lettered to {} after {} retries",
                            event.event_id(),
                            dlq_stream,
                            processing_error.retry_count
                        );
                    }
                    Err(error) => {
                        error!("Dead-letter append to {} failed: {}", dlq_stream, error)
                    }
                },
                Err(error) => error!(
                    "Could not serialize dead-letter copy of event {}: {}",
                    event.event_id(),
                    error
                ),
            }
        }
    } else {
        debug!(
            "Dropping event {} after non-retryable failure: {}",
            event.event_id(),
            processing_error.error
        );
    }
    ack_delivery(ctx, config, delivery).await;
}

async fn ack_delivery(ctx: &ConsumeContext, config: &ConsumerConfiguration, delivery: &StreamDelivery) {
    if let Err(error) = ctx
        .broker
        .ack(&delivery.stream, &config.consumer_group, &delivery.message_id)
        .await
    {
        warn!(
            "Ack for {} on {} failed: {}",
            delivery.message_id, delivery.stream, error
        );
    }
}

async fn record_published(
    metrics: &RwLock<MetricsInner>,
    priority_manager: &PriorityStreamManager,
    priority: EventPriority,
) {
    {
        let mut inner = metrics.write().await;
        inner.published_events += 1;
        inner.last_event_time = Some(Utc::now());
    }
    priority_manager.record_published_event(priority).await;
}

async fn record_processed(metrics: &RwLock<MetricsInner>, latency_ms: f64) {
    let mut inner = metrics.write().await;
    inner.processed_events += 1;
    let n = inner.processed_events as f64;
    inner.avg_processing_latency_ms =
        (inner.avg_processing_latency_ms * (n - 1.0) + latency_ms) / n;
    inner.last_event_time = Some(Utc::now());
}

async fn record_failed(metrics: &RwLock<MetricsInner>) {
    metrics.write().await.failed_events += 1;
}

/// Liveness and error-rate probe over the bus itself
struct EventBusHealthCheck {
    running: Arc<AtomicBool>,
    metrics: Arc<RwLock<MetricsInner>>,
    subscriptions: Arc<RwLock<HashMap<String, SubscriptionEntry>>>,
}

#[async_trait::async_trait]
impl HealthCheck for EventBusHealthCheck {
    fn name(&self) -> &str {
        "event_bus"
    }

    async fn check(&self) -> HealthCheckResult {
        if !self.running.load(Ordering::SeqCst) {
            return HealthCheckResult::unhealthy("event bus is not running", None);
        }

        let (processed, failed, published) = {
            let inner = self.metrics.read().await;
            (
                inner.processed_events,
                inner.failed_events,
                inner.published_events,
            )
        };
        let subscribers = self.subscriptions.read().await.len();
        let handled = processed + failed;
        let error_rate = if handled == 0 {
            0.0
        } else {
            failed as f64 / handled as f64
        };

        let result = if error_rate > DEGRADED_ERROR_RATE {
            HealthCheckResult::degraded(format!(
                "handler error rate at {:.0}%",
                error_rate * 100.0
            ))
        } else {
            HealthCheckResult::healthy("event bus is running")
        };
        result
            .with_detail("published_events", serde_json::json!(published))
            .with_detail("processed_events", serde_json::json!(processed))
            .with_detail("failed_events", serde_json::json!(failed))
            .with_detail("active_subscriptions", serde_json::json!(subscribers))
            .with_detail("error_rate", serde_json::json!(error_rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use crate::serializer::JsonEventSerializer;

    fn bus() -> EventBus {
        EventBus::new(
            EventBusConfig {
                consumer_block: Duration::from_millis(20),
                ..EventBusConfig::default()
            },
            Arc::new(MemoryBroker::new()),
            Arc::new(JsonEventSerializer::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_lifecycle_idempotency_errors() {
        let bus = bus();
        assert!(matches!(bus.stop().await, Err(EventBusError::NotRunning)));

        bus.start().await.unwrap();
        assert!(matches!(
            bus.start().await,
            Err(EventBusError::AlreadyRunning)
        ));

        bus.stop().await.unwrap();
        assert!(matches!(bus.stop().await, Err(EventBusError::NotRunning)));
    }

    #[tokio::test]
    async fn test_publish_requires_running_bus() {
        let bus = bus();
        let event: BusEvent =
            crate::event::Event::new("user.registered", "u1", "user", serde_json::json!({}))
                .into();
        assert!(matches!(
            bus.publish(event.clone()).await,
            Err(EventBusError::NotRunning)
        ));
        assert!(matches!(
            bus.publish_batch(vec![event]).await,
            Err(EventBusError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_id_fails() {
        let bus = bus();
        assert!(matches!(
            bus.unsubscribe("no-such-subscription").await,
            Err(EventBusError::SubscriptionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_updates_metrics() {
        let bus = bus();
        bus.start().await.unwrap();

        let event: BusEvent =
            crate::event::Event::new("user.registered", "u1", "user", serde_json::json!({}))
                .into();
        bus.publish(event).await.unwrap();

        let metrics = bus.metrics().await;
        assert_eq!(metrics.published_events, 1);
        assert!(metrics.last_event_time.is_some());
        bus.stop().await.unwrap();
    }
}
