//! Broker abstraction
//!
//! The bus talks to its log-structured broker through this trait: append
//! to a stream, consume through named consumer groups with blocking reads
//! and explicit acknowledgment, plus ping and server introspection for the
//! health subsystem. [`crate::redis_stream::RedisStreamBroker`] is the
//! production implementation; [`crate::memory::MemoryBroker`] backs tests
//! and single-process deployments.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::Result;

/// A single message delivered from a consumer-group read
#[derive(Debug, Clone)]
pub struct StreamDelivery {
    /// Stream the message was read from
    pub stream: String,
    /// Broker-assigned message id, used for acknowledgment
    pub message_id: String,
    /// Serialized event payload
    pub payload: Vec<u8>,
}

/// Broker server introspection data
#[derive(Debug, Clone, Default)]
pub struct BrokerInfo {
    /// Backend name, e.g. `redis` or `memory`
    pub backend: String,
    /// Server version if the backend reports one
    pub version: Option<String>,
    /// Raw key/value details from the server
    pub details: HashMap<String, String>,
}

/// Log-structured stream broker
#[async_trait]
pub trait EventBroker: Send + Sync {
    /// Establish the broker connection
    async fn connect(&self) -> Result<()>;

    /// Tear the broker connection down
    async fn disconnect(&self) -> Result<()>;

    /// Append a payload to a stream, returning the assigned message id
    ///
    /// `max_len` trims the stream to an approximate upper bound.
    async fn append(&self, stream: &str, payload: &[u8], max_len: Option<u64>) -> Result<String>;

    /// Create the consumer group on a stream if it does not exist yet
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()>;

    /// Read new messages for a consumer group
    ///
    /// Blocks for up to `block` when no messages are pending. A zero
    /// `block` returns immediately.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamDelivery>>;

    /// Acknowledge a delivered message
    async fn ack(&self, stream: &str, group: &str, message_id: &str) -> Result<()>;

    /// Round-trip liveness probe, returns the measured latency
    async fn ping(&self) -> Result<Duration>;

    /// Basic server introspection
    async fn server_info(&self) -> Result<BrokerInfo>;
}
