//! Handler execution with failure routing

use crate::envelope::Envelope;
use crate::handler::Handler;
use crate::metrics::MessagingMetrics;
use crate::retry::{FailureRoute, RetryDispatcher};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Result of one handler execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Handled,
    /// The handler failed and the envelope was routed onwards
    Rerouted(FailureRoute),
    /// The handler failed and neither retry nor DLQ accepted the envelope
    Unrouted,
}

impl Outcome {
    /// Whether the source record may be committed
    pub fn should_commit(&self) -> bool {
        !matches!(self, Outcome::Unrouted)
    }
}

/// Runs a handler and routes its failures.
#[derive(Clone)]
pub struct Dispatcher {
    handler: Arc<dyn Handler>,
    retry: RetryDispatcher,
    metrics: MessagingMetrics,
}

impl Dispatcher {
    pub fn new(handler: Arc<dyn Handler>, retry: RetryDispatcher, metrics: MessagingMetrics) -> Self {
        Self {
            handler,
            retry,
            metrics,
        }
    }

    /// Invoke the handler; on failure hand the envelope to the retry dispatcher.
    pub async fn execute(&self, envelope: Envelope, source_topic: &str) -> Outcome {
        let message_type = envelope.message_type;
        let started = Instant::now();

        match self.handler.handle(envelope.clone()).await {
            Ok(()) => {
                self.metrics
                    .handled(source_topic, message_type.as_ref(), started.elapsed());
                debug!(
                    handler = self.handler.name(),
                    topic = %source_topic,
                    message_id = %envelope.id,
                    message_type = %message_type,
                    retry_count = envelope.retry_count(),
                    "Handled envelope"
                );
                Outcome::Handled
            }
            Err(e) => {
                self.metrics
                    .handler_failed(source_topic, message_type.as_ref(), started.elapsed());
                warn!(
                    handler = self.handler.name(),
                    topic = %source_topic,
                    message_id = %envelope.id,
                    message_type = %message_type,
                    retry_count = envelope.retry_count(),
                    error = %e,
                    "Handler failed"
                );

                let message_id = envelope.id.clone();
                match self.retry.on_failure(envelope, &e, source_topic).await {
                    Ok(route) => Outcome::Rerouted(route),
                    Err(route_err) => {
                        error!(
                            topic = %source_topic,
                            message_id = %message_id,
                            error = %route_err,
                            "Failed to route failed envelope, leaving it uncommitted"
                        );
                        Outcome::Unrouted
                    }
                }
            }
        }
    }

    /// Invoke the handler without routing failures. Returns whether it succeeded.
    pub async fn recover(&self, envelope: Envelope, source_topic: &str) -> bool {
        let started = Instant::now();
        let message_type = envelope.message_type;
        let message_id = envelope.id.clone();

        match self.handler.handle(envelope).await {
            Ok(()) => {
                self.metrics
                    .handled(source_topic, message_type.as_ref(), started.elapsed());
                debug!(message_id = %message_id, message_type = %message_type, "Recovered dead-lettered envelope");
                true
            }
            Err(e) => {
                self.metrics
                    .handler_failed(source_topic, message_type.as_ref(), started.elapsed());
                warn!(
                    message_id = %message_id,
                    message_type = %message_type,
                    error = %e,
                    "DLQ recovery attempt failed"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::codec;
    use crate::dlq::DlqPublisher;
    use crate::envelope::MessageType;
    use crate::error::HandlerError;
    use crate::producer::Producer;
    use crate::store::CriticalStore;
    use std::time::Duration;

    fn dispatcher(broker: Arc<InMemoryBroker>, dir: &std::path::Path, handler: Arc<dyn Handler>) -> Dispatcher {
        let metrics = MessagingMetrics::new("orders");
        let producer = Producer::new(
            broker,
            "orders",
            "events",
            Default::default(),
            Duration::from_millis(200),
            metrics.clone(),
        );
        let dlq = DlqPublisher::new(producer.clone(), CriticalStore::new(dir), "events.dlq", true, metrics.clone());
        let retry = RetryDispatcher::new(
            producer,
            dlq,
            "events.retry",
            true,
            3,
            Duration::from_millis(10),
            Duration::from_millis(40),
            metrics.clone(),
        );
        Dispatcher::new(handler, retry, metrics)
    }

    fn envelope() -> Envelope {
        Envelope::new(MessageType::OrderCreated, b"{}".to_vec()).with_id("o-1")
    }

    #[tokio::test]
    async fn test_success_is_handled() {
        let broker = Arc::new(InMemoryBroker::new());
        let dir = tempfile::tempdir().unwrap();
        let ok = |_e: Envelope| async { Ok::<(), HandlerError>(()) };
        let dispatcher = dispatcher(broker.clone(), dir.path(), Arc::new(ok));

        let outcome = dispatcher.execute(envelope(), "events").await;
        assert_eq!(outcome, Outcome::Handled);
        assert!(outcome.should_commit());
        assert!(broker.records("events.retry").is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_rerouted() {
        let broker = Arc::new(InMemoryBroker::new());
        let dir = tempfile::tempdir().unwrap();
        let failing = |_e: Envelope| async { Err::<(), _>(HandlerError::new("nope")) };
        let dispatcher = dispatcher(broker.clone(), dir.path(), Arc::new(failing));

        let outcome = dispatcher.execute(envelope(), "events").await;
        assert!(matches!(outcome, Outcome::Rerouted(FailureRoute::Retried { attempt: 1, .. })));
        assert!(outcome.should_commit());

        let retried = codec::decode(&broker.records("events.retry")[0].payload).unwrap();
        assert_eq!(retried.last_error(), Some("nope"));
    }

    #[tokio::test]
    async fn test_unroutable_failure_is_not_committed() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.fail_topic("events.retry");
        broker.fail_topic("events.dlq");
        let dir = tempfile::tempdir().unwrap();
        let failing = |_e: Envelope| async { Err::<(), _>(HandlerError::new("nope")) };
        let dispatcher = dispatcher(broker, dir.path(), Arc::new(failing));

        let outcome = dispatcher.execute(envelope(), "events").await;
        assert_eq!(outcome, Outcome::Unrouted);
        assert!(!outcome.should_commit());
    }

    #[tokio::test]
    async fn test_recover_does_not_reroute() {
        let broker = Arc::new(InMemoryBroker::new());
        let dir = tempfile::tempdir().unwrap();
        let failing = |_e: Envelope| async { Err::<(), _>(HandlerError::new("nope")) };
        let dispatcher = dispatcher(broker.clone(), dir.path(), Arc::new(failing));

        assert!(!dispatcher.recover(envelope(), "events.dlq").await);
        assert!(broker.records("events.retry").is_empty());
        assert!(broker.records("events.dlq").is_empty());
    }
}
