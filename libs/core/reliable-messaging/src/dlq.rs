//! Dead-letter routing
//!
//! Exhausted envelopes are published to the DLQ topic with the failure
//! reason, the topic they failed on, the failure time and the service whose
//! handler failed as headers.
//! Critical types are first mirrored to the local critical store.

use crate::envelope::Envelope;
use crate::error::MessagingError;
use crate::metrics::MessagingMetrics;
use crate::producer::Producer;
use crate::retry::FailureRoute;
use crate::store::CriticalStore;
use chrono::Utc;
use tracing::{error, info, warn};

pub const HEADER_ERROR_REASON: &str = "ErrorReason";
pub const HEADER_ORIGINAL_TOPIC: &str = "OriginalTopic";
pub const HEADER_FAILED_AT: &str = "FailedAt";
/// Set on retry and DLQ records; only this service's loops process them
pub const HEADER_FAILED_SERVICE: &str = "FailedService";

#[derive(Clone)]
pub struct DlqPublisher {
    producer: Producer,
    store: CriticalStore,
    dlq_topic: String,
    enabled: bool,
    metrics: MessagingMetrics,
}

impl DlqPublisher {
    pub fn new(
        producer: Producer,
        store: CriticalStore,
        dlq_topic: impl Into<String>,
        enabled: bool,
        metrics: MessagingMetrics,
    ) -> Self {
        Self {
            producer,
            store,
            dlq_topic: dlq_topic.into(),
            enabled,
            metrics,
        }
    }

    /// Mirror a critical envelope to disk. Failures are logged, never returned.
    pub async fn persist_critical(&self, envelope: &Envelope, reason: &str, origin_topic: &str) {
        match self.store.persist(envelope, reason, origin_topic).await {
            Ok(path) => {
                info!(
                    message_id = %envelope.id,
                    message_type = %envelope.message_type,
                    path = %path.display(),
                    "Persisted critical envelope"
                );
                self.metrics.critical_persisted(envelope.message_type.as_ref());
            }
            Err(e) => {
                error!(
                    message_id = %envelope.id,
                    message_type = %envelope.message_type,
                    error = %e,
                    "Failed to persist critical envelope"
                );
            }
        }
    }

    /// Quarantine an envelope.
    ///
    /// Returns `Dropped` when the DLQ is disabled; a failed DLQ write is an
    /// error so the caller can leave the record uncommitted.
    pub async fn to_dlq(
        &self,
        envelope: &Envelope,
        reason: &str,
        origin_topic: &str,
    ) -> Result<FailureRoute, MessagingError> {
        if envelope.is_critical() {
            self.persist_critical(envelope, reason, origin_topic).await;
        }

        if !self.enabled {
            error!(
                message_id = %envelope.id,
                message_type = %envelope.message_type,
                retry_count = envelope.retry_count(),
                reason = %reason,
                "DLQ disabled, dropping exhausted envelope"
            );
            return Ok(FailureRoute::Dropped {
                reason: reason.to_string(),
            });
        }

        let headers = vec![
            (HEADER_ERROR_REASON.to_string(), reason.to_string()),
            (HEADER_ORIGINAL_TOPIC.to_string(), origin_topic.to_string()),
            (HEADER_FAILED_AT.to_string(), Utc::now().to_rfc3339()),
            (HEADER_FAILED_SERVICE.to_string(), self.producer.service().to_string()),
        ];
        self.producer.send(&self.dlq_topic, envelope, headers).await?;

        warn!(
            message_id = %envelope.id,
            message_type = %envelope.message_type,
            retry_count = envelope.retry_count(),
            origin_topic = %origin_topic,
            reason = %reason,
            "Moved envelope to DLQ"
        );
        self.metrics.dead_lettered(envelope.message_type.as_ref());

        Ok(FailureRoute::DeadLettered {
            reason: reason.to_string(),
        })
    }
}
