//! Topic provisioning at client startup

use crate::broker::{Broker, TopicSpec};
use crate::config::MessagingConfig;
use crate::error::MessagingError;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one provisioning pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProvisionReport {
    pub created: Vec<String>,
    pub existing: Vec<String>,
    /// Topics whose creation failed for a reason other than existing
    pub failed: Vec<String>,
}

pub struct TopicProvisioner {
    broker: Arc<dyn Broker>,
}

impl TopicProvisioner {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Topics the configuration requires, in creation order
    pub fn required_topics(config: &MessagingConfig) -> Vec<TopicSpec> {
        let spec = |name: &str| TopicSpec::new(name, config.partitions, config.replication_factor);

        let mut topics = vec![spec(&config.main_topic)];
        if config.enable_retry {
            topics.push(spec(&config.retry_topic));
        }
        if config.enable_dlq {
            topics.push(spec(&config.dlq_topic));
        }
        topics
    }

    /// Probe the broker, then create every required topic.
    ///
    /// Only an unreachable broker is an error; creation failures are logged.
    pub async fn provision(&self, config: &MessagingConfig) -> Result<ProvisionReport, MessagingError> {
        match tokio::time::timeout(config.connection_timeout, self.broker.ping()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(MessagingError::timeout("broker ping", config.connection_timeout)),
        }

        let mut report = ProvisionReport::default();
        for spec in Self::required_topics(config) {
            let created = tokio::time::timeout(config.connection_timeout, self.broker.create_topic(&spec))
                .await
                .unwrap_or_else(|_| Err(MessagingError::timeout("create topic", config.connection_timeout)));

            match created {
                Ok(()) => {
                    info!(
                        topic = %spec.name,
                        partitions = spec.partitions,
                        replication_factor = spec.replication_factor,
                        "Created topic"
                    );
                    report.created.push(spec.name);
                }
                Err(e) if e.is_topic_exists() => {
                    debug!(topic = %spec.name, "Topic already exists");
                    report.existing.push(spec.name);
                }
                Err(e) => {
                    warn!(topic = %spec.name, error = %e, "Failed to create topic");
                    report.failed.push(spec.name);
                }
            }
        }

        Ok(report)
    }
}
