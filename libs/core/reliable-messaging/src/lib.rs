//! Reliable Messaging
//!
//! At-least-once delivery on top of a partitioned log broker, shared by every
//! service of the platform.
//!
//! ## Features
//!
//! - **Bounded concurrency**: one worker pool caps handler executions across
//!   every loop of a client
//! - **Retry topic**: failed envelopes are republished with exponential
//!   backoff and held until due
//! - **Dead Letter Queue**: exhausted envelopes are quarantined with the
//!   failure reason; critical types are mirrored to local disk
//! - **Allow-lists**: each service only sees the message types it declared
//! - **Prometheus metrics** and **health endpoints**
//!
//! ## Example
//!
//! ```ignore
//! use reliable_messaging::{Envelope, HandlerError, MessageType, MessagingClient, MessagingConfig};
//!
//! let config = MessagingConfig::new("payments")
//!     .allow("payments", [MessageType::OrderCreated])
//!     .with_critical_types([MessageType::PaymentFailed]);
//! let client = MessagingClient::connect_redis(config).await?;
//!
//! client.publish(Envelope::json(MessageType::OrderCreated, &order)?).await?;
//!
//! client
//!     .consume_with_retries(shutdown_rx, |envelope: Envelope| async move {
//!         charge(&envelope).await.map_err(HandlerError::from)
//!     })
//!     .await?;
//!
//! client.close().await?;
//! ```

pub mod broker;
mod client;
pub mod codec;
mod config;
mod consumer;
mod dlq;
mod envelope;
mod error;
mod filter;
mod handler;
mod health;
pub mod metrics;
mod pool;
mod producer;
mod provisioner;
mod retry;
mod scheduler;
mod signal;
mod store;
mod worker;

// Re-export main types
pub use broker::{Broker, InMemoryBroker, RedisBroker};
pub use client::{ClientStats, MessagingClient};
pub use config::MessagingConfig;
pub use dlq::{HEADER_ERROR_REASON, HEADER_FAILED_AT, HEADER_FAILED_SERVICE, HEADER_ORIGINAL_TOPIC};
pub use envelope::{Envelope, MessageType};
pub use error::{HandlerError, MessagingError};
pub use filter::{MessageFilter, Rejection};
pub use handler::Handler;
pub use health::{health_router, HealthState};
pub use metrics::{init_metrics, render_metrics, MessagingMetrics};
pub use pool::{WorkerPool, WorkerSlot};
pub use provisioner::{ProvisionReport, TopicProvisioner};
pub use retry::{backoff, FailureRoute};
pub use store::CriticalStore;
