//! Event-driven messaging bus for Relay Engine
//!
//! A distributed, persistent publish/subscribe event bus on top of a
//! log-structured stream broker, supporting:
//! - Publish/Subscribe with independently-scaling consumer groups
//! - At-least-once delivery with per-partition ordering
//! - Priority stream lanes (critical traffic drained first)
//! - Automatic retry with fixed, linear, or exponential backoff
//! - Dead-letter isolation of poison messages
//! - Circuit breaking around failing handlers
//! - Pluggable health checks with bounded history
//!
//! # Event Types
//!
//! - **Domain Events**: Business-level events with issuer, correlation,
//!   category, and priority
//! - **System Events**: Infrastructure and operational events
//! - **User Action Events**: Events triggered directly by a user
//! - **Integration Events**: Cross-service communication events
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use events_bus::{
//!     Event, EventBus, EventBusConfig, FnHandler, JsonEventSerializer, MemoryBroker,
//! };
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bus = EventBus::new(
//!         EventBusConfig::default(),
//!         Arc::new(MemoryBroker::new()),
//!         Arc::new(JsonEventSerializer::new()),
//!     )?;
//!
//!     // Subscribe to events
//!     bus.subscribe(
//!         "user.*",
//!         Arc::new(FnHandler::new("auditor", "user.*", |event| {
//!             println!("received {}", event.event_type());
//!             Ok(())
//!         })),
//!     )
//!     .await?;
//!
//!     bus.start().await?;
//!
//!     // Publish an event
//!     bus.publish(
//!         Event::new(
//!             "user.registered",
//!             "user-1",
//!             "user",
//!             json!({"email": "user@example.com"}),
//!         )
//!         .into(),
//!     )
//!     .await?;
//!
//!     bus.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod brokers;
pub mod bus;
pub mod circuit_breaker;
pub mod config;
pub mod dlq;
pub mod error;
pub mod event;
pub mod handlers;
pub mod health;
pub mod memory;
pub mod priority;
pub mod redis_stream;
pub mod retry;
pub mod serializer;

pub use brokers::*;
pub use bus::*;
pub use circuit_breaker::*;
pub use config::*;
pub use dlq::*;
pub use error::*;
pub use event::*;
pub use handlers::*;
pub use health::*;
pub use memory::*;
pub use priority::*;
pub use redis_stream::*;
pub use retry::*;
pub use serializer::*;
