//! Envelope producer
//!
//! Stamps outgoing envelopes with id, publish time and origin, then writes
//! them with all-replica acknowledgement. The same producer writes retry and
//! DLQ records; those are already stamped and go through `send` directly.

use crate::broker::Broker;
use crate::codec;
use crate::envelope::{Envelope, MessageType};
use crate::error::MessagingError;
use crate::metrics::MessagingMetrics;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct Producer {
    broker: Arc<dyn Broker>,
    service: String,
    main_topic: String,
    critical_types: Arc<HashSet<MessageType>>,
    timeout: Duration,
    metrics: MessagingMetrics,
}

impl Producer {
    pub fn new(
        broker: Arc<dyn Broker>,
        service: impl Into<String>,
        main_topic: impl Into<String>,
        critical_types: HashSet<MessageType>,
        timeout: Duration,
        metrics: MessagingMetrics,
    ) -> Self {
        Self {
            broker,
            service: service.into(),
            main_topic: main_topic.into(),
            critical_types: Arc::new(critical_types),
            timeout,
            metrics,
        }
    }

    /// Service stamped into `from_service`
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Fill producer-owned fields. `id` and `created` are only set when
    /// absent so a republished envelope keeps its identity.
    pub fn stamp(&self, envelope: &mut Envelope) {
        if envelope.id.is_empty() {
            envelope.id = Uuid::new_v4().to_string();
        }
        if envelope.created.is_none() {
            envelope.created = Some(Utc::now());
        }
        envelope.from_service = self.service.clone();
        envelope.critical = self.critical_types.contains(&envelope.message_type);
    }

    /// Stamp and publish to the main topic. Returns the envelope id.
    pub async fn publish(&self, envelope: Envelope) -> Result<String, MessagingError> {
        let topic = self.main_topic.clone();
        self.publish_to(&topic, envelope).await
    }

    /// Stamp and publish to an explicit topic. Returns the envelope id.
    pub async fn publish_to(&self, topic: &str, mut envelope: Envelope) -> Result<String, MessagingError> {
        self.stamp(&mut envelope);
        self.send(topic, &envelope, Vec::new()).await?;
        Ok(envelope.id)
    }

    /// Write an already stamped envelope, bounded by the connection timeout.
    ///
    /// Returns the broker's record id.
    pub async fn send(
        &self,
        topic: &str,
        envelope: &Envelope,
        extra_headers: Vec<(String, String)>,
    ) -> Result<String, MessagingError> {
        let record = codec::to_record(envelope, extra_headers);

        let result = match tokio::time::timeout(self.timeout, self.broker.publish(topic, record)).await {
            Ok(result) => result,
            Err(_) => Err(MessagingError::timeout("publish", self.timeout)),
        };

        match result {
            Ok(record_id) => {
                debug!(
                    topic = %topic,
                    message_id = %envelope.id,
                    message_type = %envelope.message_type,
                    record_id = %record_id,
                    "Published envelope"
                );
                self.metrics.published(topic, envelope.message_type.as_ref());
                Ok(record_id)
            }
            Err(e) => {
                warn!(
                    topic = %topic,
                    message_id = %envelope.id,
                    error = %e,
                    "Failed to publish envelope"
                );
                self.metrics.publish_failed(topic);
                Err(e)
            }
        }
    }
}
