//! In-memory holding area for envelopes whose `retry_after` lies ahead
//!
//! Held envelopes were already committed off the log. They live only in
//! this process: a crash before the timer fires loses the attempt, and a
//! shutdown drops them with a warning per envelope.

use crate::envelope::Envelope;
use crate::pool::WorkerPool;
use crate::signal::ShutdownSignal;
use crate::worker::{Dispatcher, Outcome};
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

#[derive(Clone)]
pub struct DelayScheduler {
    dispatcher: Dispatcher,
    pool: WorkerPool,
    waiting: Arc<AtomicUsize>,
}

struct WaitingGuard(Arc<AtomicUsize>);

impl Drop for WaitingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl DelayScheduler {
    pub fn new(dispatcher: Dispatcher, pool: WorkerPool) -> Self {
        Self {
            dispatcher,
            pool,
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Envelopes currently held, including those waiting for a slot
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Hold `envelope` until due, then run it through the dispatcher.
    pub fn schedule(&self, envelope: Envelope, topic: String, shutdown: ShutdownSignal) -> JoinHandle<()> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let guard = WaitingGuard(self.waiting.clone());
        let dispatcher = self.dispatcher.clone();
        let pool = self.pool.clone();

        debug!(
            topic = %topic,
            message_id = %envelope.id,
            retry_after = ?envelope.retry_after(),
            "Holding delayed envelope"
        );

        tokio::spawn(async move {
            let _guard = guard;

            while let Some(delay) = envelope.remaining_delay(Utc::now()) {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        drop_on_shutdown(&envelope, &topic);
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let slot = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                slot = pool.acquire() => slot,
            };
            let Some(slot) = slot else {
                drop_on_shutdown(&envelope, &topic);
                return;
            };

            let message_id = envelope.id.clone();
            if dispatcher.execute(envelope, &topic).await == Outcome::Unrouted {
                error!(
                    topic = %topic,
                    message_id = %message_id,
                    "Delayed envelope failed and could not be routed; it is lost"
                );
            }
            drop(slot);
        })
    }
}

fn drop_on_shutdown(envelope: &Envelope, topic: &str) {
    warn!(
        topic = %topic,
        message_id = %envelope.id,
        message_type = %envelope.message_type,
        retry_count = envelope.retry_count(),
        retry_after = ?envelope.retry_after(),
        "Dropping delayed envelope on shutdown"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::dlq::DlqPublisher;
    use crate::envelope::MessageType;
    use crate::error::HandlerError;
    use crate::metrics::MessagingMetrics;
    use crate::producer::Producer;
    use crate::retry::RetryDispatcher;
    use crate::store::CriticalStore;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};
    use tokio::sync::watch;

    struct Fixture {
        scheduler: DelayScheduler,
        calls: Arc<Mutex<Vec<Instant>>>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let broker = Arc::new(InMemoryBroker::new());
        let dir = tempfile::tempdir().unwrap();
        let metrics = MessagingMetrics::new("orders");
        let producer = Producer::new(
            broker,
            "orders",
            "events",
            Default::default(),
            Duration::from_millis(200),
            metrics.clone(),
        );
        let dlq = DlqPublisher::new(producer.clone(), CriticalStore::new(dir.path()), "events.dlq", true, metrics.clone());
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

        let calls = Arc::new(Mutex::new(Vec::new()));
        let recorded = calls.clone();
        let handler = move |_e: Envelope| {
            let recorded = recorded.clone();
            async move {
                recorded.lock().unwrap().push(Instant::now());
                Ok::<(), HandlerError>(())
            }
        };

        let dispatcher = Dispatcher::new(Arc::new(handler), retry, metrics.clone());
        let scheduler = DelayScheduler::new(dispatcher, WorkerPool::new(2, metrics));
        Fixture {
            scheduler,
            calls,
            _dir: dir,
        }
    }

    fn signal() -> (watch::Sender<bool>, watch::Sender<bool>, ShutdownSignal) {
        let (external_tx, external_rx) = watch::channel(false);
        let (closing_tx, closing_rx) = watch::channel(false);
        (external_tx, closing_tx, ShutdownSignal::new(external_rx, closing_rx))
    }

    #[tokio::test]
    async fn test_handler_not_invoked_before_retry_after() {
        let f = fixture();
        let (_ext, _closing, shutdown) = signal();
        let due = Utc::now() + chrono::Duration::milliseconds(150);
        let scheduled_at = Instant::now();

        let task = f.scheduler.schedule(
            Envelope::new(MessageType::OrderCreated, vec![]).with_id("d-1").not_before(due),
            "events".to_string(),
            shutdown,
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.calls.lock().unwrap().is_empty());
        assert_eq!(f.scheduler.waiting(), 1);

        task.await.unwrap();
        let calls = f.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].duration_since(scheduled_at) >= Duration::from_millis(140));
        assert_eq!(f.scheduler.waiting(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_drops_waiting_envelopes() {
        let f = fixture();
        let (ext, _closing, shutdown) = signal();

        let task = f.scheduler.schedule(
            Envelope::new(MessageType::OrderCreated, vec![])
                .with_id("d-2")
                .not_before(Utc::now() + chrono::Duration::seconds(60)),
            "events".to_string(),
            shutdown,
        );

        ext.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(f.calls.lock().unwrap().is_empty());
        assert_eq!(f.scheduler.waiting(), 0);
    }
}
