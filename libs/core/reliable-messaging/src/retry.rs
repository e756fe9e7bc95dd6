//! Retry state machine for failed handler attempts
//!
//! Every failure increments the attempt counter. Until the counter reaches
//! `max_retries` the envelope is republished to the retry topic with a "not
//! before" time; the failure that reaches it quarantines the envelope on the
//! DLQ. Retry copies are tagged with the failing service so no other
//! service's retry loop picks them up.

use crate::dlq::{DlqPublisher, HEADER_FAILED_SERVICE};
use crate::envelope::Envelope;
use crate::error::{HandlerError, MessagingError};
use crate::metrics::MessagingMetrics;
use crate::producer::Producer;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{info, warn};

/// Where a failed envelope ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureRoute {
    /// Republished to the retry topic
    Retried {
        attempt: u32,
        retry_after: DateTime<Utc>,
    },
    /// Published to the DLQ topic
    DeadLettered { reason: String },
    /// Budget exhausted with the DLQ disabled; only logged
    Dropped { reason: String },
}

/// Delay before attempt `attempt` (1-based): `min(base * 2^(attempt-1), max)`.
pub fn backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .map_or(max, |delay| delay.min(max))
}

#[derive(Clone)]
pub struct RetryDispatcher {
    producer: Producer,
    dlq: DlqPublisher,
    retry_topic: String,
    enabled: bool,
    max_retries: u32,
    backoff_base: Duration,
    backoff_max: Duration,
    metrics: MessagingMetrics,
}

impl RetryDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        producer: Producer,
        dlq: DlqPublisher,
        retry_topic: impl Into<String>,
        enabled: bool,
        max_retries: u32,
        backoff_base: Duration,
        backoff_max: Duration,
        metrics: MessagingMetrics,
    ) -> Self {
        Self {
            producer,
            dlq,
            retry_topic: retry_topic.into(),
            enabled,
            max_retries,
            backoff_base,
            backoff_max,
            metrics,
        }
    }

    /// Route a failed envelope to the retry topic or the DLQ.
    ///
    /// An error means neither write succeeded and the source record must
    /// stay uncommitted.
    pub async fn on_failure(
        &self,
        mut envelope: Envelope,
        error: &HandlerError,
        source_topic: &str,
    ) -> Result<FailureRoute, MessagingError> {
        envelope.last_error = Some(error.message().to_string());
        envelope.retry_count = envelope.retry_count.saturating_add(1);
        let attempt = envelope.retry_count;

        if !self.enabled || attempt >= self.max_retries {
            return self.dlq.to_dlq(&envelope, error.message(), source_topic).await;
        }

        let delay = backoff(attempt, self.backoff_base, self.backoff_max);
        let now = Utc::now();
        let retry_after = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        envelope.retry_after = Some(retry_after);

        let owner = vec![(HEADER_FAILED_SERVICE.to_string(), self.producer.service().to_string())];
        match self.producer.send(&self.retry_topic, &envelope, owner).await {
            Ok(_) => {
                info!(
                    message_id = %envelope.id,
                    message_type = %envelope.message_type,
                    attempt,
                    max_retries = self.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Scheduled retry"
                );
                self.metrics.retried(envelope.message_type.as_ref());
                Ok(FailureRoute::Retried {
                    attempt,
                    retry_after,
                })
            }
            Err(e) => {
                warn!(
                    message_id = %envelope.id,
                    retry_topic = %self.retry_topic,
                    error = %e,
                    "Retry topic unavailable, falling back to DLQ"
                );
                envelope.retry_after = None;
                let reason = format!("retry producer unavailable: {}", e);
                self.dlq.to_dlq(&envelope, &reason, source_topic).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::codec;
    use crate::dlq::HEADER_ERROR_REASON;
    use crate::envelope::MessageType;
    use crate::store::CriticalStore;
    use std::sync::Arc;

    #[test]
    fn test_backoff_schedule() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(300);

        let delays: Vec<u64> = (1..=8).map(|n| backoff(n, base, max).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 300, 300]);
        assert_eq!(backoff(u32::MAX, base, max), max);
    }

    fn dispatcher(broker: Arc<InMemoryBroker>, dir: &std::path::Path, enabled: bool, max_retries: u32) -> RetryDispatcher {
        let metrics = MessagingMetrics::new("orders");
        let producer = Producer::new(
            broker,
            "orders",
            "events",
            Default::default(),
            Duration::from_millis(200),
            metrics.clone(),
        );
        let dlq = DlqPublisher::new(
            producer.clone(),
            CriticalStore::new(dir),
            "events.dlq",
            true,
            metrics.clone(),
        );
        RetryDispatcher::new(
            producer,
            dlq,
            "events.retry",
            enabled,
            max_retries,
            Duration::from_secs(5),
            Duration::from_secs(300),
            metrics,
        )
    }

    fn envelope(retry_count: u32) -> Envelope {
        let mut envelope = Envelope::new(MessageType::OrderCreated, b"{}".to_vec()).with_id("o-1");
        envelope.from_service = "orders".to_string();
        envelope.retry_count = retry_count;
        envelope
    }

    #[tokio::test]
    async fn test_failure_is_republished_with_backoff() {
        let broker = Arc::new(InMemoryBroker::new());
        let dir = tempfile::tempdir().unwrap();
        let retry = dispatcher(broker.clone(), dir.path(), true, 10);

        let before = Utc::now();
        let route = retry
            .on_failure(envelope(1), &HandlerError::new("db down"), "events")
            .await
            .unwrap();

        let FailureRoute::Retried { attempt, retry_after } = route else {
            panic!("expected a retry");
        };
        assert_eq!(attempt, 2);
        assert!(retry_after >= before + chrono::Duration::seconds(10));

        let records = broker.records("events.retry");
        assert_eq!(records.len(), 1);
        let republished = codec::decode(&records[0].payload).unwrap();
        assert_eq!(republished.id, "o-1");
        assert_eq!(republished.retry_count(), 2);
        assert_eq!(republished.last_error(), Some("db down"));
        assert_eq!(
            republished.retry_after().map(|t| t.timestamp_millis()),
            Some(retry_after.timestamp_millis())
        );
        assert_eq!(records[0].key, "o-1");
    }

    #[tokio::test]
    async fn test_retry_copy_is_tagged_with_failing_service() {
        let broker = Arc::new(InMemoryBroker::new());
        let dir = tempfile::tempdir().unwrap();
        let retry = dispatcher(broker.clone(), dir.path(), true, 10);

        retry
            .on_failure(envelope(0), &HandlerError::new("db down"), "events")
            .await
            .unwrap();

        let records = broker.records("events.retry");
        assert_eq!(records[0].header(HEADER_FAILED_SERVICE), Some("orders"));
    }

    #[tokio::test]
    async fn test_last_retry_before_budget_runs_out() {
        let broker = Arc::new(InMemoryBroker::new());
        let dir = tempfile::tempdir().unwrap();
        let retry = dispatcher(broker.clone(), dir.path(), true, 10);

        // Ninth failure: one attempt left
        let route = retry
            .on_failure(envelope(8), &HandlerError::new("still down"), "events.retry")
            .await
            .unwrap();

        assert!(matches!(route, FailureRoute::Retried { attempt: 9, .. }));
        assert!(broker.records("events.dlq").is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_budget_goes_to_dlq() {
        let broker = Arc::new(InMemoryBroker::new());
        let dir = tempfile::tempdir().unwrap();
        let retry = dispatcher(broker.clone(), dir.path(), true, 10);

        // Tenth failure
        let route = retry
            .on_failure(envelope(9), &HandlerError::new("still down"), "events.retry")
            .await
            .unwrap();

        assert_eq!(route, FailureRoute::DeadLettered { reason: "still down".to_string() });
        assert!(broker.records("events.retry").is_empty());
        let dead = &broker.records("events.dlq")[0];
        assert_eq!(dead.header(HEADER_ERROR_REASON), Some("still down"));
        assert_eq!(codec::decode(&dead.payload).unwrap().retry_count(), 10);
    }

    #[tokio::test]
    async fn test_retry_disabled_goes_straight_to_dlq() {
        let broker = Arc::new(InMemoryBroker::new());
        let dir = tempfile::tempdir().unwrap();
        let retry = dispatcher(broker.clone(), dir.path(), false, 10);

        let route = retry
            .on_failure(envelope(0), &HandlerError::new("nope"), "events")
            .await
            .unwrap();

        assert!(matches!(route, FailureRoute::DeadLettered { .. }));
        assert_eq!(codec::decode(&broker.records("events.dlq")[0].payload).unwrap().retry_count(), 1);
    }

    #[tokio::test]
    async fn test_zero_budget_dead_letters_first_failure() {
        let broker = Arc::new(InMemoryBroker::new());
        let dir = tempfile::tempdir().unwrap();
        let retry = dispatcher(broker.clone(), dir.path(), true, 0);

        let route = retry
            .on_failure(envelope(0), &HandlerError::new("nope"), "events")
            .await
            .unwrap();

        assert!(matches!(route, FailureRoute::DeadLettered { .. }));
        assert!(broker.records("events.retry").is_empty());
    }

    #[tokio::test]
    async fn test_retry_topic_failure_falls_back_to_dlq() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.fail_topic("events.retry");
        let dir = tempfile::tempdir().unwrap();
        let retry = dispatcher(broker.clone(), dir.path(), true, 10);

        let route = retry
            .on_failure(envelope(0), &HandlerError::new("boom"), "events")
            .await
            .unwrap();

        let FailureRoute::DeadLettered { reason } = route else {
            panic!("expected DLQ fallback");
        };
        assert!(reason.starts_with("retry producer unavailable: "));

        let dead = &broker.records("events.dlq")[0];
        assert!(dead.header(HEADER_ERROR_REASON).unwrap().starts_with("retry producer unavailable"));
        let decoded = codec::decode(&dead.payload).unwrap();
        assert_eq!(decoded.retry_count(), 1);
        assert!(decoded.retry_after().is_none());
        assert_eq!(decoded.last_error(), Some("boom"));
    }

    #[tokio::test]
    async fn test_both_topics_down_is_an_error() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.fail_topic("events.retry");
        broker.fail_topic("events.dlq");
        let dir = tempfile::tempdir().unwrap();
        let retry = dispatcher(broker, dir.path(), true, 10);

        let result = retry
            .on_failure(envelope(0), &HandlerError::new("boom"), "events")
            .await;
        assert!(result.is_err());
    }
}
