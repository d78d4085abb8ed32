//! Event handler capabilities
//!
//! Handlers are polymorphic over capability: they declare what they can
//! handle, a name, and a kind. Concrete variants (projection, process
//! manager, saga, notification) are tagged values. Circuit protection is
//! composed around any handler with [`CircuitProtectedHandler`] rather
//! than baked into the handler itself.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::circuit_breaker::CircuitBreaker;
use crate::error::Result;
use crate::event::BusEvent;

/// Handler role tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    /// Builds read models from events
    Projection,
    /// Coordinates long-running processes
    ProcessManager,
    /// Drives compensating multi-step transactions
    Saga,
    /// Sends notifications to external systems
    Notification,
}

impl HandlerKind {
    /// Consumer-group-name segment for this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerKind::Projection => "projection",
            HandlerKind::ProcessManager => "process_manager",
            HandlerKind::Saga => "saga",
            HandlerKind::Notification => "notification",
        }
    }
}

/// Capability interface every subscriber implements
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable handler name, used for retry policies and breaker naming
    fn name(&self) -> &str;

    /// Role of this handler
    fn kind(&self) -> HandlerKind;

    /// Whether this handler wants events of the given type
    fn can_handle(&self, event_type: &str) -> bool;

    /// Process one event
    async fn handle(&self, event: &BusEvent) -> Result<()>;
}

/// Match an event type against a subscription pattern
///
/// `*` matches everything, a trailing `.*` matches by prefix, anything
/// else matches exactly.
pub fn event_type_matches(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return event_type
            .strip_prefix(prefix)
            .map(|rest| rest.starts_with('.'))
            .unwrap_or(false);
    }
    pattern == event_type
}

/// Adapter turning a plain function into a handler
pub struct FnHandler {
    name: String,
    kind: HandlerKind,
    pattern: String,
    func: Box<dyn Fn(&BusEvent) -> Result<()> + Send + Sync>,
}

impl FnHandler {
    pub fn new(
        name: impl Into<String>,
        pattern: impl Into<String>,
        func: impl Fn(&BusEvent) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            kind: HandlerKind::Notification,
            pattern: pattern.into(),
            func: Box::new(func),
        }
    }

    pub fn with_kind(mut self, kind: HandlerKind) -> Self {
        self.kind = kind;
        self
    }
}

#[async_trait]
impl EventHandler for FnHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> HandlerKind {
        self.kind
    }

    fn can_handle(&self, event_type: &str) -> bool {
        event_type_matches(&self.pattern, event_type)
    }

    async fn handle(&self, event: &BusEvent) -> Result<()> {
        (self.func)(event)
    }
}

/// Decorator routing every invocation through a circuit breaker
///
/// Wraps by composition so any handler capability can be protected
/// uniformly.
pub struct CircuitProtectedHandler {
    inner: Arc<dyn EventHandler>,
    breaker: Arc<CircuitBreaker>,
}

impl CircuitProtectedHandler {
    pub fn new(inner: Arc<dyn EventHandler>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    /// The breaker guarding this handler
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

#[async_trait]
impl EventHandler for CircuitProtectedHandler {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> HandlerKind {
        self.inner.kind()
    }

    fn can_handle(&self, event_type: &str) -> bool {
        self.inner.can_handle(event_type)
    }

    async fn handle(&self, event: &BusEvent) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.breaker.call(|| async move { inner.handle(event).await }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use serde_json::json;

    #[test]
    fn test_event_type_matching() {
        assert!(event_type_matches("*", "user.registered"));
        assert!(event_type_matches("user.*", "user.registered"));
        assert!(event_type_matches("user.registered", "user.registered"));
        assert!(!event_type_matches("user.*", "users.created"));
        assert!(!event_type_matches("user.*", "user"));
        assert!(!event_type_matches("order.placed", "user.registered"));
    }

    #[tokio::test]
    async fn test_fn_handler_dispatch() {
        let handler = FnHandler::new("counter", "user.*", |_event| Ok(()))
            .with_kind(HandlerKind::Projection);
        let event: BusEvent = Event::new("user.registered", "u1", "user", json!({})).into();

        assert_eq!(handler.kind(), HandlerKind::Projection);
        assert!(handler.can_handle("user.registered"));
        assert!(!handler.can_handle("order.placed"));
        assert!(handler.handle(&event).await.is_ok());
    }
}
