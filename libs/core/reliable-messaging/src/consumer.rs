//! Consumer loop: fetch, filter, dispatch, commit
//!
//! One loop runs per (topic, group). On start it creates the group if
//! needed and drains records this consumer received before a restart but
//! never committed, then follows new records. Each record is committed only
//! once its fate is settled: handled, rerouted, filtered, malformed, or held
//! by the delay scheduler. Retry and DLQ copies of another service's
//! failures count as filtered.

use crate::broker::{Broker, Cursor, Record, StartOffset, Subscription};
use crate::codec;
use crate::dlq::{DlqPublisher, HEADER_ERROR_REASON, HEADER_FAILED_SERVICE, HEADER_ORIGINAL_TOPIC};
use crate::error::MessagingError;
use crate::filter::MessageFilter;
use crate::metrics::MessagingMetrics;
use crate::pool::WorkerPool;
use crate::scheduler::DelayScheduler;
use crate::signal::ShutdownSignal;
use crate::worker::{Dispatcher, Outcome};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const FETCH_RETRY_BASE: Duration = Duration::from_secs(1);
const FETCH_RETRY_MAX: Duration = Duration::from_secs(30);

/// How fetched envelopes are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    /// Main or retry topic: delays honoured, failures routed to retry/DLQ
    Main,
    /// DLQ topic: every record re-attempted, failures left uncommitted
    DlqRecovery,
}

pub struct ConsumerLoop {
    subscription: Subscription,
    mode: LoopMode,
    broker: Arc<dyn Broker>,
    dispatcher: Dispatcher,
    scheduler: DelayScheduler,
    dlq: DlqPublisher,
    pool: WorkerPool,
    filter: MessageFilter,
    metrics: MessagingMetrics,
    fetch_timeout: Duration,
    shutdown: ShutdownSignal,
}

impl ConsumerLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        subscription: Subscription,
        mode: LoopMode,
        broker: Arc<dyn Broker>,
        dispatcher: Dispatcher,
        dlq: DlqPublisher,
        pool: WorkerPool,
        filter: MessageFilter,
        metrics: MessagingMetrics,
        fetch_timeout: Duration,
        shutdown: ShutdownSignal,
    ) -> Self {
        let scheduler = DelayScheduler::new(dispatcher.clone(), pool.clone());
        Self {
            subscription,
            mode,
            broker,
            dispatcher,
            scheduler,
            dlq,
            pool,
            filter,
            metrics,
            fetch_timeout,
            shutdown,
        }
    }

    /// Run until cancelled. Only a failure to create the group is returned.
    pub async fn run(self) -> Result<(), MessagingError> {
        let topic = self.subscription.topic.clone();
        let group = self.subscription.group.clone();

        self.broker
            .ensure_group(&topic, &group, StartOffset::Earliest)
            .await?;

        info!(
            topic = %topic,
            group = %group,
            consumer = %self.subscription.consumer,
            mode = ?self.mode,
            "Consumer loop started"
        );

        let mut cursor = Cursor::Pending(None);
        let mut fetch_failures: u32 = 0;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let fetched = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                result = self.broker.fetch(&self.subscription, &cursor, self.fetch_timeout) => result,
            };

            match fetched {
                Ok(Some(record)) => {
                    fetch_failures = 0;
                    let record_id = record.id.clone();
                    if !self.route(record).await {
                        break;
                    }
                    if let Cursor::Pending(_) = cursor {
                        cursor = Cursor::Pending(Some(record_id));
                    }
                }
                Ok(None) => {
                    if let Cursor::Pending(_) = cursor {
                        debug!(topic = %topic, group = %group, "Pending records drained");
                        cursor = Cursor::New;
                    }
                }
                Err(e) => {
                    fetch_failures = fetch_failures.saturating_add(1);
                    let pause = crate::retry::backoff(fetch_failures, FETCH_RETRY_BASE, FETCH_RETRY_MAX);
                    warn!(
                        topic = %topic,
                        group = %group,
                        error = %e,
                        pause_ms = pause.as_millis() as u64,
                        "Fetch failed"
                    );
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
            }
        }

        let held = self.scheduler.waiting();
        info!(
            topic = %topic,
            group = %group,
            delayed_in_memory = held,
            "Consumer loop stopped"
        );
        Ok(())
    }

    /// Decide the fate of one record. Returns `false` when shutdown
    /// interrupted the wait for a worker slot; the record stays uncommitted.
    async fn route(&self, record: Record) -> bool {
        let topic = &self.subscription.topic;
        self.metrics.received(topic);

        let envelope = match codec::decode(&record.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    topic = %topic,
                    record_id = %record.id,
                    key = %record.key,
                    error = %e,
                    "Dropping malformed record"
                );
                self.metrics.malformed(topic);
                commit(self.broker.as_ref(), &self.subscription, &record.id).await;
                return true;
            }
        };

        let verdict = self
            .filter
            .check_owner(record.header(HEADER_FAILED_SERVICE))
            .and_then(|()| self.filter.check(&envelope));
        if let Err(rejection) = verdict {
            debug!(
                topic = %topic,
                message_id = %envelope.id,
                message_type = %envelope.message_type,
                reason = rejection.as_str(),
                "Skipping envelope"
            );
            self.metrics.filtered(topic, rejection.as_str());
            commit(self.broker.as_ref(), &self.subscription, &record.id).await;
            return true;
        }

        match self.mode {
            LoopMode::Main => {
                if envelope.remaining_delay(Utc::now()).is_some() {
                    self.metrics.delayed(topic);
                    self.scheduler
                        .schedule(envelope, topic.clone(), self.shutdown.clone());
                    commit(self.broker.as_ref(), &self.subscription, &record.id).await;
                    return true;
                }
            }
            LoopMode::DlqRecovery => {
                if envelope.is_critical() {
                    let reason = record
                        .header(HEADER_ERROR_REASON)
                        .or(envelope.last_error())
                        .unwrap_or("unknown");
                    let origin = record.header(HEADER_ORIGINAL_TOPIC).unwrap_or(topic.as_str());
                    self.dlq.persist_critical(&envelope, reason, origin).await;
                }
            }
        }

        let slot = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            slot = self.pool.acquire() => slot,
        };
        let Some(slot) = slot else {
            debug!(
                topic = %topic,
                message_id = %envelope.id,
                "Shutdown while waiting for a worker slot, leaving record uncommitted"
            );
            return false;
        };

        let broker = self.broker.clone();
        let subscription = self.subscription.clone();
        let dispatcher = self.dispatcher.clone();
        let mode = self.mode;
        let record_id = record.id;

        tokio::spawn(async move {
            let outcome = match mode {
                LoopMode::Main => dispatcher.execute(envelope, &subscription.topic).await,
                LoopMode::DlqRecovery => {
                    if dispatcher.recover(envelope, &subscription.topic).await {
                        Outcome::Handled
                    } else {
                        Outcome::Unrouted
                    }
                }
            };

            if outcome.should_commit() {
                commit(broker.as_ref(), &subscription, &record_id).await;
            }
            drop(slot);
        });

        true
    }
}

async fn commit(broker: &dyn Broker, subscription: &Subscription, record_id: &str) {
    if let Err(e) = broker.commit(subscription, record_id).await {
        warn!(
            topic = %subscription.topic,
            group = %subscription.group,
            record_id = %record_id,
            error = %e,
            "Commit failed, record will be redelivered"
        );
    }
}
