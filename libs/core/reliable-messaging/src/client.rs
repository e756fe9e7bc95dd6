//! Messaging client
//!
//! Assembles provisioner, producer, retry dispatcher, DLQ publisher and
//! worker pool around one broker handle. Every consume call shares the same
//! pool, so the handler concurrency cap holds across all loops of a client.

use crate::broker::{Broker, RedisBroker, Subscription};
use crate::config::MessagingConfig;
use crate::consumer::{ConsumerLoop, LoopMode};
use crate::dlq::DlqPublisher;
use crate::envelope::Envelope;
use crate::error::MessagingError;
use crate::filter::MessageFilter;
use crate::handler::Handler;
use crate::metrics::MessagingMetrics;
use crate::pool::WorkerPool;
use crate::producer::Producer;
use crate::provisioner::{ProvisionReport, TopicProvisioner};
use crate::retry::RetryDispatcher;
use crate::signal::ShutdownSignal;
use crate::store::CriticalStore;
use crate::worker::Dispatcher;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Point-in-time view of a client, served by `/stats`
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub service: String,
    pub consumer_id: String,
    pub in_flight: usize,
    pub capacity: usize,
    pub closed: bool,
    pub main_topic: String,
    pub retry_topic: Option<String>,
    pub dlq_topic: Option<String>,
}

struct ClientInner {
    config: MessagingConfig,
    broker: Arc<dyn Broker>,
    producer: Producer,
    retry: RetryDispatcher,
    dlq: DlqPublisher,
    pool: WorkerPool,
    filter: MessageFilter,
    metrics: MessagingMetrics,
    closing: watch::Sender<bool>,
    provisioned: ProvisionReport,
}

/// Reliable-delivery client. Cheap to clone; clones share one pool.
#[derive(Clone)]
pub struct MessagingClient {
    inner: Arc<ClientInner>,
}

impl MessagingClient {
    /// Validate the configuration, provision topics and assemble the client.
    pub async fn connect(config: MessagingConfig, broker: Arc<dyn Broker>) -> Result<Self, MessagingError> {
        config.validate()?;

        let metrics = MessagingMetrics::new(config.service_name.clone());
        let filter = MessageFilter::from_config(&config);
        if !filter.is_restricted() {
            warn!(
                service = %config.service_name,
                "No allow-list declared for this service, every message type will be accepted"
            );
        }

        let provisioned = TopicProvisioner::new(broker.clone())
            .provision(&config)
            .await?;

        let producer = Producer::new(
            broker.clone(),
            config.service_name.clone(),
            config.main_topic.clone(),
            config.critical_types.clone(),
            config.connection_timeout,
            metrics.clone(),
        );
        let dlq = DlqPublisher::new(
            producer.clone(),
            CriticalStore::new(&config.critical_messages_dir),
            config.dlq_topic.clone(),
            config.enable_dlq,
            metrics.clone(),
        );
        let retry = RetryDispatcher::new(
            producer.clone(),
            dlq.clone(),
            config.retry_topic.clone(),
            config.enable_retry,
            config.max_retries,
            config.retry_backoff_base,
            config.retry_backoff_max,
            metrics.clone(),
        );
        let pool = WorkerPool::new(config.max_concurrent_handlers, metrics.clone());
        let (closing, _) = watch::channel(false);

        info!(
            service = %config.service_name,
            consumer_id = %config.consumer_id,
            main_topic = %config.main_topic,
            enable_retry = config.enable_retry,
            enable_dlq = config.enable_dlq,
            max_concurrent_handlers = config.max_concurrent_handlers,
            created_topics = ?provisioned.created,
            "Messaging client ready"
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                broker,
                producer,
                retry,
                dlq,
                pool,
                filter,
                metrics,
                closing,
                provisioned,
            }),
        })
    }

    /// Connect to the first configured broker over Redis Streams.
    pub async fn connect_redis(config: MessagingConfig) -> Result<Self, MessagingError> {
        let url = config
            .brokers
            .first()
            .ok_or_else(|| MessagingError::Config("no broker configured".to_string()))?;

        let broker = RedisBroker::connect(url, config.connection_timeout)
            .await?
            .with_max_length(config.max_topic_length)
            .with_min_replicas(
                usize::from(config.replication_factor.saturating_sub(1)),
                config.connection_timeout,
            );

        Self::connect(config, Arc::new(broker)).await
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.inner.config
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        self.inner.broker.clone()
    }

    /// Topics touched during startup provisioning
    pub fn provisioned(&self) -> &ProvisionReport {
        &self.inner.provisioned
    }

    pub fn in_flight(&self) -> usize {
        self.inner.pool.in_flight()
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closing.borrow()
    }

    pub fn stats(&self) -> ClientStats {
        let config = &self.inner.config;
        ClientStats {
            service: config.service_name.clone(),
            consumer_id: config.consumer_id.clone(),
            in_flight: self.in_flight(),
            capacity: self.inner.pool.capacity(),
            closed: self.is_closed(),
            main_topic: config.main_topic.clone(),
            retry_topic: config.enable_retry.then(|| config.retry_topic.clone()),
            dlq_topic: config.enable_dlq.then(|| config.dlq_topic.clone()),
        }
    }

    /// Publish to the main topic. Returns the envelope id.
    pub async fn publish(&self, envelope: Envelope) -> Result<String, MessagingError> {
        self.ensure_open()?;
        self.inner.producer.publish(envelope).await
    }

    /// Publish to an explicit topic. Returns the envelope id.
    pub async fn publish_to(&self, topic: &str, envelope: Envelope) -> Result<String, MessagingError> {
        self.ensure_open()?;
        self.inner.producer.publish_to(topic, envelope).await
    }

    /// Consume `topic` (default: the main topic) as `group` (default:
    /// `{service}-main-group`) until `shutdown` flips or the client closes.
    pub async fn consume<H: Handler>(
        &self,
        shutdown: watch::Receiver<bool>,
        topic: Option<&str>,
        group: Option<&str>,
        handler: H,
    ) -> Result<(), MessagingError> {
        self.ensure_open()?;
        let config = &self.inner.config;
        let topic = topic.unwrap_or(&config.main_topic).to_string();
        let group = group.map(String::from).unwrap_or_else(|| config.default_group());

        self.consumer_loop(topic, group, LoopMode::Main, Arc::new(handler), shutdown)
            .run()
            .await
    }

    /// Consume the main topic and, when retry is enabled, the retry topic,
    /// both with the default group and the same handler.
    pub async fn consume_with_retries<H: Handler>(
        &self,
        shutdown: watch::Receiver<bool>,
        handler: H,
    ) -> Result<(), MessagingError> {
        self.ensure_open()?;
        let config = &self.inner.config;
        let handler: Arc<dyn Handler> = Arc::new(handler);

        let main = self.consumer_loop(
            config.main_topic.clone(),
            config.default_group(),
            LoopMode::Main,
            handler.clone(),
            shutdown.clone(),
        );

        if !config.enable_retry {
            return main.run().await;
        }

        let retry = self.consumer_loop(
            config.retry_topic.clone(),
            config.default_group(),
            LoopMode::Main,
            handler,
            shutdown,
        );

        tokio::try_join!(main.run(), retry.run())?;
        Ok(())
    }

    /// Re-attempt every dead-lettered envelope from the start of the DLQ.
    ///
    /// Successful records are committed; failed ones stay uncommitted and are
    /// retried after a restart.
    pub async fn consume_dlq_with_recovery<H: Handler>(
        &self,
        shutdown: watch::Receiver<bool>,
        handler: H,
    ) -> Result<(), MessagingError> {
        self.ensure_open()?;
        let config = &self.inner.config;
        if !config.enable_dlq {
            return Err(MessagingError::Config(
                "DLQ recovery requires enable_dlq".to_string(),
            ));
        }

        self.consumer_loop(
            config.dlq_topic.clone(),
            config.dlq_recovery_group(),
            LoopMode::DlqRecovery,
            Arc::new(handler),
            shutdown,
        )
        .run()
        .await
    }

    /// Stop every loop, wait for in-flight handlers, then release the broker.
    ///
    /// Calling it again is a no-op.
    pub async fn close(&self) -> Result<(), MessagingError> {
        if self.inner.closing.send_replace(true) {
            return Ok(());
        }

        info!(
            service = %self.inner.config.service_name,
            in_flight = self.in_flight(),
            "Closing messaging client"
        );
        self.inner.pool.close().await;
        self.inner.broker.close().await?;
        info!(service = %self.inner.config.service_name, "Messaging client closed");
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), MessagingError> {
        if self.is_closed() {
            return Err(MessagingError::Closed);
        }
        Ok(())
    }

    fn consumer_loop(
        &self,
        topic: String,
        group: String,
        mode: LoopMode,
        handler: Arc<dyn Handler>,
        shutdown: watch::Receiver<bool>,
    ) -> ConsumerLoop {
        let inner = &self.inner;
        let dispatcher = Dispatcher::new(handler, inner.retry.clone(), inner.metrics.clone());

        ConsumerLoop::new(
            Subscription::new(topic, group, inner.config.consumer_id.clone()),
            mode,
            inner.broker.clone(),
            dispatcher,
            inner.dlq.clone(),
            inner.pool.clone(),
            inner.filter.clone(),
            inner.metrics.clone(),
            inner.config.fetch_timeout,
            ShutdownSignal::new(shutdown, inner.closing.subscribe()),
        )
    }
}
