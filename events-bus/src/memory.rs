//! In-memory broker
//!
//! Keeps the whole log in process memory with the same consumer-group
//! semantics as the Redis backend: groups start at the stream tail, reads
//! move a per-group cursor, and unacknowledged deliveries stay pending.
//! Backs the test suite and single-process deployments.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::brokers::{BrokerInfo, EventBroker, StreamDelivery};
use crate::error::{EventBusError, Result};

#[derive(Debug, Clone)]
struct StreamEntry {
    id: String,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct GroupState {
    cursor: usize,
    pending: HashMap<String, usize>,
}

#[derive(Debug, Default)]
struct MemoryBrokerInner {
    streams: HashMap<String, Vec<StreamEntry>>,
    groups: HashMap<(String, String), GroupState>,
    sequence: u64,
}

/// In-process broker with Redis-Streams-like consumer groups
#[derive(Default)]
pub struct MemoryBroker {
    inner: RwLock<MemoryBrokerInner>,
    connected: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries appended to a stream so far
    pub async fn stream_len(&self, stream: &str) -> usize {
        self.inner
            .read()
            .await
            .streams
            .get(stream)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Raw payloads of every entry in a stream, oldest first
    pub async fn entries(&self, stream: &str) -> Vec<Vec<u8>> {
        self.inner
            .read()
            .await
            .streams
            .get(stream)
            .map(|entries| entries.iter().map(|e| e.payload.clone()).collect())
            .unwrap_or_default()
    }

    /// Deliveries read by a group but not yet acknowledged
    pub async fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.inner
            .read()
            .await
            .groups
            .get(&(stream.to_string(), group.to_string()))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EventBusError::ConnectionFailed(
                "broker is not connected".to_string(),
            ))
        }
    }
}

#[async_trait]
impl EventBroker for MemoryBroker {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn append(&self, stream: &str, payload: &[u8], max_len: Option<u64>) -> Result<String> {
        self.ensure_connected()?;
        let mut inner = self.inner.write().await;
        inner.sequence += 1;
        let id = format!("{}-0", inner.sequence);

        let excess = {
            let entries = inner.streams.entry(stream.to_string()).or_default();
            entries.push(StreamEntry {
                id: id.clone(),
                payload: payload.to_vec(),
            });
            match max_len {
                Some(limit) if entries.len() > limit as usize => {
                    let excess = entries.len() - limit as usize;
                    entries.drain(..excess);
                    excess
                }
                _ => 0,
            }
        };

        // cursors index into the entry vector, shift them with it
        if excess > 0 {
            for ((group_stream, _), group) in inner.groups.iter_mut() {
                if group_stream == stream {
                    group.cursor = group.cursor.saturating_sub(excess);
                }
            }
        }
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        self.ensure_connected()?;
        let mut inner = self.inner.write().await;
        let tail = inner.streams.get(stream).map(Vec::len).unwrap_or(0);
        inner
            .groups
            .entry((stream.to_string(), group.to_string()))
            .or_insert_with(|| GroupState {
                cursor: tail,
                pending: HashMap::new(),
            });
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        _consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamDelivery>> {
        self.ensure_connected()?;
        let deadline = Instant::now() + block;
        let key = (stream.to_string(), group.to_string());

        loop {
            {
                let mut inner = self.inner.write().await;
                let available = inner.streams.get(stream).cloned().unwrap_or_default();
                let state = inner.groups.entry(key.clone()).or_default();

                if state.cursor < available.len() {
                    let upper = (state.cursor + count).min(available.len());
                    let mut deliveries = Vec::with_capacity(upper - state.cursor);
                    for index in state.cursor..upper {
                        let entry = &available[index];
                        state.pending.insert(entry.id.clone(), index);
                        deliveries.push(StreamDelivery {
                            stream: stream.to_string(),
                            message_id: entry.id.clone(),
                            payload: entry.payload.clone(),
                        });
                    }
                    state.cursor = upper;
                    return Ok(deliveries);
                }
            }

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, message_id: &str) -> Result<()> {
        self.ensure_connected()?;
        let mut inner = self.inner.write().await;
        if let Some(state) = inner
            .groups
            .get_mut(&(stream.to_string(), group.to_string()))
        {
            state.pending.remove(message_id);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<Duration> {
        self.ensure_connected()?;
        let started = Instant::now();
        let _ = self.inner.read().await;
        Ok(started.elapsed())
    }

    async fn server_info(&self) -> Result<BrokerInfo> {
        self.ensure_connected()?;
        let inner = self.inner.read().await;
        let mut details = HashMap::new();
        details.insert("streams".to_string(), inner.streams.len().to_string());
        details.insert(
            "total_entries".to_string(),
            inner
                .streams
                .values()
                .map(Vec::len)
                .sum::<usize>()
                .to_string(),
        );
        Ok(BrokerInfo {
            backend: "memory".to_string(),
            version: None,
            details,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_group_starts_at_tail() {
        let broker = MemoryBroker::new();
        broker.connect().await.unwrap();
        broker.append("s", b"before", None).await.unwrap();
        broker.ensure_group("s", "g").await.unwrap();
        broker.append("s", b"after", None).await.unwrap();

        let read = broker
            .read_group("s", "g", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].payload, b"after");
    }

    #[tokio::test]
    async fn test_ack_clears_pending() {
        let broker = MemoryBroker::new();
        broker.connect().await.unwrap();
        broker.ensure_group("s", "g").await.unwrap();
        broker.append("s", b"one", None).await.unwrap();

        let read = broker
            .read_group("s", "g", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(broker.pending_count("s", "g").await, 1);

        broker.ack("s", "g", &read[0].message_id).await.unwrap();
        assert_eq!(broker.pending_count("s", "g").await, 0);
    }

    #[tokio::test]
    async fn test_read_respects_count() {
        let broker = MemoryBroker::new();
        broker.connect().await.unwrap();
        broker.ensure_group("s", "g").await.unwrap();
        for payload in [b"a", b"b", b"c"] {
            broker.append("s", payload, None).await.unwrap();
        }

        let first = broker
            .read_group("s", "g", "c1", 2, Duration::ZERO)
            .await
            .unwrap();
        let second = broker
            .read_group("s", "g", "c1", 2, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    async fn test_disconnected_broker_rejects_calls() {
        let broker = MemoryBroker::new();
        let result = broker.append("s", b"x", None).await;
        assert!(matches!(result, Err(EventBusError::ConnectionFailed(_))));
    }
}
