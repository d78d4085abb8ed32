//! Redis Streams broker implementation
//!
//! Events are appended with `XADD` (with approximate `MAXLEN` trimming),
//! consumed through consumer groups with `XREADGROUP`, and acknowledged
//! with `XACK`. Groups are created lazily with `MKSTREAM` so consumers can
//! come up before the first publisher.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::brokers::{BrokerInfo, EventBroker, StreamDelivery};
use crate::error::{EventBusError, Result};

/// Field the serialized event is stored under in each stream entry
const PAYLOAD_FIELD: &str = "payload";

/// Redis broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisBrokerConfig {
    /// Redis server URL
    pub url: String,
    /// Connection timeout in seconds
    pub connection_timeout: u64,
}

impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            connection_timeout: 10,
        }
    }
}

/// Redis Streams broker
pub struct RedisStreamBroker {
    config: RedisBrokerConfig,
    connection: RwLock<Option<ConnectionManager>>,
}

impl RedisStreamBroker {
    pub fn new(config: RedisBrokerConfig) -> Self {
        Self {
            config,
            connection: RwLock::new(None),
        }
    }

    async fn manager(&self) -> Result<ConnectionManager> {
        self.connection.read().await.clone().ok_or_else(|| {
            EventBusError::ConnectionFailed("broker is not connected".to_string())
        })
    }
}

#[async_trait]
impl EventBroker for RedisStreamBroker {
    async fn connect(&self) -> Result<()> {
        info!("Connecting to Redis broker: {}", self.config.url);

        let client = redis::Client::open(self.config.url.as_str())
            .map_err(|e| EventBusError::ConnectionFailed(e.to_string()))?;
        let manager = tokio::time::timeout(
            Duration::from_secs(self.config.connection_timeout),
            client.get_tokio_connection_manager(),
        )
        .await
        .map_err(|_| EventBusError::ConnectionFailed("connection timed out".to_string()))?
        .map_err(|e| EventBusError::ConnectionFailed(e.to_string()))?;

        *self.connection.write().await = Some(manager);
        info!("Connected to Redis broker");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        *self.connection.write().await = None;
        info!("Disconnected from Redis broker");
        Ok(())
    }

    async fn append(&self, stream: &str, payload: &[u8], max_len: Option<u64>) -> Result<String> {
        let mut connection = self.manager().await?;
        let entry = [(PAYLOAD_FIELD, payload)];

        let message_id: String = match max_len {
            Some(limit) => connection
                .xadd_maxlen(stream, StreamMaxlen::Approx(limit as usize), "*", &entry)
                .await
                .map_err(|e| EventBusError::PublishFailed(e.to_string()))?,
            None => connection
                .xadd(stream, "*", &entry)
                .await
                .map_err(|e| EventBusError::PublishFailed(e.to_string()))?,
        };

        debug!("Appended message {} to stream {}", message_id, stream);
        Ok(message_id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut connection = self.manager().await?;
        let created: std::result::Result<String, redis::RedisError> = connection
            .xgroup_create_mkstream(stream, group, "$")
            .await;

        match created {
            Ok(_) => {
                info!("Created consumer group {} on stream {}", group, stream);
                Ok(())
            }
            // BUSYGROUP means the group already exists, which is fine
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(EventBusError::ConnectionFailed(e.to_string())),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamDelivery>> {
        let mut connection = self.manager().await?;

        let mut options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        if !block.is_zero() {
            options = options.block(block.as_millis().max(1) as usize);
        }

        let reply: StreamReadReply = connection
            .xread_options(&[stream], &[">"], &options)
            .await
            .map_err(|e| EventBusError::ConnectionFailed(e.to_string()))?;

        let mut deliveries = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                match entry.map.get(PAYLOAD_FIELD) {
                    Some(value) => {
                        let payload: Vec<u8> = redis::from_redis_value(value)
                            .map_err(|e| EventBusError::ConnectionFailed(e.to_string()))?;
                        deliveries.push(StreamDelivery {
                            stream: key.key.clone(),
                            message_id: entry.id.clone(),
                            payload,
                        });
                    }
                    None => {
                        warn!(
                            "Stream {} entry {} carries no {} field, skipping",
                            key.key, entry.id, PAYLOAD_FIELD
                        );
                    }
                }
            }
        }
        Ok(deliveries)
    }

    async fn ack(&self, stream: &str, group: &str, message_id: &str) -> Result<()> {
        let mut connection = self.manager().await?;
        let _acked: i64 = connection
            .xack(stream, group, &[message_id])
            .await
            .map_err(|e| EventBusError::ConnectionFailed(e.to_string()))?;
        Ok(())
    }

    async fn ping(&self) -> Result<Duration> {
        let mut connection = self.manager().await?;
        let started = Instant::now();
        let _pong: String = redis::cmd("PING")
            .query_async(&mut connection)
            .await
            .map_err(|e| EventBusError::ConnectionFailed(e.to_string()))?;
        Ok(started.elapsed())
    }

    async fn server_info(&self) -> Result<BrokerInfo> {
        let mut connection = self.manager().await?;
        let raw: String = redis::cmd("INFO")
            .arg("server")
            .query_async(&mut connection)
            .await
            .map_err(|e| EventBusError::ConnectionFailed(e.to_string()))?;

        let mut details = HashMap::new();
        for line in raw.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once(':') {
                details.insert(key.trim().to_string(), value.trim().to_string());
            }
        }

        Ok(BrokerInfo {
            backend: "redis".to_string(),
            version: details.get("redis_version").cloned(),
            details,
        })
    }
}
