//! Client configuration
//!
//! `MessagingConfig` is built either programmatically (`new` + `with_*`) or
//! from `MESSAGING_*` environment variables through `core_config::FromEnv`.

use crate::envelope::MessageType;
use core_config::{env_bool, env_list, env_or_default, env_parse, env_required, ConfigError, FromEnv};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_BROKER: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_MAIN_TOPIC: &str = "events";
pub const DEFAULT_RETRY_TOPIC: &str = "events.retry";
pub const DEFAULT_DLQ_TOPIC: &str = "events.dlq";
pub const DEFAULT_CRITICAL_DIR: &str = "critical_messages";

/// Configuration for a messaging client
#[derive(Debug, Clone)]
pub struct MessagingConfig {
    /// Broker addresses; the first one is used by `connect_redis`
    pub brokers: Vec<String>,

    /// Identity stamped into `from_service` and used for filtering
    pub service_name: String,

    pub main_topic: String,
    pub retry_topic: String,
    pub dlq_topic: String,

    pub enable_retry: bool,
    pub enable_dlq: bool,

    /// Failed attempts allowed before an envelope is dead-lettered
    pub max_retries: u32,

    /// Worker pool size shared by every loop of the client
    pub max_concurrent_handlers: usize,

    /// Bound for broker pings, topic creation and publishes
    pub connection_timeout: Duration,

    /// How long a fetch blocks waiting for a new record
    pub fetch_timeout: Duration,

    /// Message types each service consumes
    pub allowed_types: HashMap<String, HashSet<MessageType>>,

    /// Types mirrored to local disk when dead-lettered
    pub critical_types: HashSet<MessageType>,

    pub partitions: u32,
    pub replication_factor: u16,

    pub retry_backoff_base: Duration,
    pub retry_backoff_max: Duration,

    pub critical_messages_dir: String,

    /// Consumer name within each group. Keep it stable across restarts so
    /// records left uncommitted by a crash are redelivered to the same
    /// consumer.
    pub consumer_id: String,

    /// Approximate cap on stream length (Redis backend)
    pub max_topic_length: usize,
}

impl MessagingConfig {
    /// Create a configuration with defaults for `service_name`
    pub fn new(service_name: impl Into<String>) -> Self {
        let service_name = service_name.into();
        Self {
            brokers: vec![DEFAULT_BROKER.to_string()],
            consumer_id: format!("{}-{}", service_name, Uuid::new_v4()),
            service_name,
            main_topic: DEFAULT_MAIN_TOPIC.to_string(),
            retry_topic: DEFAULT_RETRY_TOPIC.to_string(),
            dlq_topic: DEFAULT_DLQ_TOPIC.to_string(),
            enable_retry: true,
            enable_dlq: true,
            max_retries: 10,
            max_concurrent_handlers: 10,
            connection_timeout: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(1),
            allowed_types: HashMap::new(),
            critical_types: HashSet::new(),
            partitions: 3,
            replication_factor: 1,
            retry_backoff_base: Duration::from_secs(5),
            retry_backoff_max: Duration::from_secs(300),
            critical_messages_dir: DEFAULT_CRITICAL_DIR.to_string(),
            max_topic_length: 100_000,
        }
    }

    pub fn with_brokers<I, S>(mut self, brokers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.brokers = brokers.into_iter().map(Into::into).collect();
        self
    }

    /// Set main, retry and DLQ topic names
    pub fn with_topics(
        mut self,
        main: impl Into<String>,
        retry: impl Into<String>,
        dlq: impl Into<String>,
    ) -> Self {
        self.main_topic = main.into();
        self.retry_topic = retry.into();
        self.dlq_topic = dlq.into();
        self
    }

    pub fn with_retry(mut self, enable: bool) -> Self {
        self.enable_retry = enable;
        self
    }

    pub fn with_dlq(mut self, enable: bool) -> Self {
        self.enable_dlq = enable;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_max_concurrent_handlers(mut self, count: usize) -> Self {
        self.max_concurrent_handlers = count;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Declare the types `service` consumes (replaces any previous set)
    pub fn allow<I>(mut self, service: impl Into<String>, types: I) -> Self
    where
        I: IntoIterator<Item = MessageType>,
    {
        self.allowed_types
            .insert(service.into(), types.into_iter().collect());
        self
    }

    pub fn with_critical_types<I>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = MessageType>,
    {
        self.critical_types = types.into_iter().collect();
        self
    }

    pub fn with_partitions(mut self, partitions: u32, replication_factor: u16) -> Self {
        self.partitions = partitions;
        self.replication_factor = replication_factor;
        self
    }

    pub fn with_retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_backoff_base = base;
        self.retry_backoff_max = max;
        self
    }

    pub fn with_critical_messages_dir(mut self, dir: impl Into<String>) -> Self {
        self.critical_messages_dir = dir.into();
        self
    }

    pub fn with_consumer_id(mut self, id: impl Into<String>) -> Self {
        self.consumer_id = id.into();
        self
    }

    pub fn with_max_topic_length(mut self, length: usize) -> Self {
        self.max_topic_length = length;
        self
    }

    /// Default consumer group for the main and retry loops
    pub fn default_group(&self) -> String {
        format!("{}-main-group", self.service_name)
    }

    /// Consumer group of the DLQ recovery loop
    pub fn dlq_recovery_group(&self) -> String {
        format!("{}-dlq-recovery-group", self.service_name)
    }

    /// Types this client's own service consumes, if declared
    pub fn own_allowed_types(&self) -> Option<&HashSet<MessageType>> {
        self.allowed_types.get(&self.service_name)
    }

    /// Check the configuration for values the client cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::invalid("service_name", "must not be empty"));
        }
        if self.brokers.is_empty() {
            return Err(ConfigError::invalid("brokers", "at least one broker is required"));
        }
        if self.max_concurrent_handlers == 0 {
            return Err(ConfigError::invalid(
                "max_concurrent_handlers",
                "must be greater than zero",
            ));
        }
        if self.consumer_id.trim().is_empty() {
            return Err(ConfigError::invalid("consumer_id", "must not be empty"));
        }

        let topics = [
            ("main_topic", &self.main_topic),
            ("retry_topic", &self.retry_topic),
            ("dlq_topic", &self.dlq_topic),
        ];
        let mut seen = HashSet::new();
        for (key, topic) in topics {
            if topic.trim().is_empty() {
                return Err(ConfigError::invalid(key, "must not be empty"));
            }
            if !seen.insert(topic.as_str()) {
                return Err(ConfigError::invalid(
                    key,
                    format!("topic '{}' is used more than once", topic),
                ));
            }
        }

        if self.retry_backoff_base > self.retry_backoff_max {
            return Err(ConfigError::invalid(
                "retry_backoff_base",
                format!(
                    "{:?} exceeds retry_backoff_max {:?}",
                    self.retry_backoff_base, self.retry_backoff_max
                ),
            ));
        }

        Ok(())
    }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_millis() as u64).map(Duration::from_millis)
}

fn env_types(key: &str) -> Result<HashSet<MessageType>, ConfigError> {
    env_list(key)
        .into_iter()
        .map(|name| {
            name.parse::<MessageType>().map_err(|_| ConfigError::ParseError {
                key: key.to_string(),
                details: format!("unknown message type '{}'", name),
            })
        })
        .collect()
}

impl FromEnv for MessagingConfig {
    /// Reads `MESSAGING_*` variables; only `MESSAGING_SERVICE_NAME` is required.
    fn from_env() -> Result<Self, ConfigError> {
        let service_name = env_required("MESSAGING_SERVICE_NAME")?;
        let defaults = Self::new(service_name.clone());

        let brokers = match env_list("MESSAGING_BROKERS") {
            list if list.is_empty() => defaults.brokers.clone(),
            list => list,
        };

        let mut allowed_types = HashMap::new();
        let own_types = env_types("MESSAGING_ALLOWED_TYPES")?;
        if !own_types.is_empty() {
            allowed_types.insert(service_name.clone(), own_types);
        }

        let config = Self {
            brokers,
            main_topic: env_or_default("MESSAGING_MAIN_TOPIC", DEFAULT_MAIN_TOPIC),
            retry_topic: env_or_default("MESSAGING_RETRY_TOPIC", DEFAULT_RETRY_TOPIC),
            dlq_topic: env_or_default("MESSAGING_DLQ_TOPIC", DEFAULT_DLQ_TOPIC),
            enable_retry: env_bool("MESSAGING_ENABLE_RETRY", defaults.enable_retry)?,
            enable_dlq: env_bool("MESSAGING_ENABLE_DLQ", defaults.enable_dlq)?,
            max_retries: env_parse("MESSAGING_MAX_RETRIES", defaults.max_retries)?,
            max_concurrent_handlers: env_parse(
                "MESSAGING_MAX_CONCURRENT_HANDLERS",
                defaults.max_concurrent_handlers,
            )?,
            connection_timeout: env_millis(
                "MESSAGING_CONNECTION_TIMEOUT_MS",
                defaults.connection_timeout,
            )?,
            fetch_timeout: env_millis("MESSAGING_FETCH_TIMEOUT_MS", defaults.fetch_timeout)?,
            allowed_types,
            critical_types: env_types("MESSAGING_CRITICAL_TYPES")?,
            partitions: env_parse("MESSAGING_PARTITIONS", defaults.partitions)?,
            replication_factor: env_parse(
                "MESSAGING_REPLICATION_FACTOR",
                defaults.replication_factor,
            )?,
            retry_backoff_base: env_millis(
                "MESSAGING_RETRY_BACKOFF_BASE_MS",
                defaults.retry_backoff_base,
            )?,
            retry_backoff_max: env_millis(
                "MESSAGING_RETRY_BACKOFF_MAX_MS",
                defaults.retry_backoff_max,
            )?,
            critical_messages_dir: env_or_default("MESSAGING_CRITICAL_DIR", DEFAULT_CRITICAL_DIR),
            consumer_id: env_or_default("MESSAGING_CONSUMER_ID", &defaults.consumer_id),
            max_topic_length: env_parse("MESSAGING_MAX_TOPIC_LENGTH", defaults.max_topic_length)?,
            service_name,
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_VARS: [&str; 20] = [
        "MESSAGING_BROKERS",
        "MESSAGING_SERVICE_NAME",
        "MESSAGING_MAIN_TOPIC",
        "MESSAGING_RETRY_TOPIC",
        "MESSAGING_DLQ_TOPIC",
        "MESSAGING_ENABLE_RETRY",
        "MESSAGING_ENABLE_DLQ",
        "MESSAGING_MAX_RETRIES",
        "MESSAGING_MAX_CONCURRENT_HANDLERS",
        "MESSAGING_CONNECTION_TIMEOUT_MS",
        "MESSAGING_FETCH_TIMEOUT_MS",
        "MESSAGING_ALLOWED_TYPES",
        "MESSAGING_CRITICAL_TYPES",
        "MESSAGING_PARTITIONS",
        "MESSAGING_REPLICATION_FACTOR",
        "MESSAGING_RETRY_BACKOFF_BASE_MS",
        "MESSAGING_RETRY_BACKOFF_MAX_MS",
        "MESSAGING_CRITICAL_DIR",
        "MESSAGING_CONSUMER_ID",
        "MESSAGING_MAX_TOPIC_LENGTH",
    ];

    fn with_env<F: FnOnce()>(vars: &[(&str, &str)], f: F) {
        let all: Vec<(&str, Option<&str>)> = ALL_VARS
            .iter()
            .map(|key| {
                let value = vars.iter().find(|(k, _)| k == key).map(|(_, v)| *v);
                (*key, value)
            })
            .collect();
        temp_env::with_vars(all, f);
    }

    #[test]
    fn test_defaults() {
        let config = MessagingConfig::new("orders");

        assert_eq!(config.brokers, vec![DEFAULT_BROKER]);
        assert_eq!(config.main_topic, "events");
        assert_eq!(config.retry_topic, "events.retry");
        assert_eq!(config.dlq_topic, "events.dlq");
        assert!(config.enable_retry);
        assert!(config.enable_dlq);
        assert_eq!(config.max_retries, 10);
        assert_eq!(config.max_concurrent_handlers, 10);
        assert_eq!(config.connection_timeout, Duration::from_secs(10));
        assert_eq!(config.retry_backoff_base, Duration::from_secs(5));
        assert_eq!(config.retry_backoff_max, Duration::from_secs(300));
        assert_eq!(config.partitions, 3);
        assert_eq!(config.replication_factor, 1);
        assert!(config.consumer_id.starts_with("orders-"));
        assert_eq!(config.default_group(), "orders-main-group");
        assert_eq!(config.dlq_recovery_group(), "orders-dlq-recovery-group");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = MessagingConfig::new("payments")
            .with_topics("pay", "pay.retry", "pay.dlq")
            .allow("payments", [MessageType::OrderCreated])
            .with_critical_types([MessageType::PaymentFailed])
            .with_max_concurrent_handlers(2)
            .with_consumer_id("payments-0");

        assert_eq!(config.main_topic, "pay");
        assert!(config.own_allowed_types().unwrap().contains(&MessageType::OrderCreated));
        assert!(config.critical_types.contains(&MessageType::PaymentFailed));
        assert!(!config.critical_types.contains(&MessageType::OrderCreated));
        assert_eq!(config.max_concurrent_handlers, 2);
        assert_eq!(config.consumer_id, "payments-0");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(MessagingConfig::new(" ").validate().is_err());
        assert!(MessagingConfig::new("a").with_brokers(Vec::<String>::new()).validate().is_err());
        assert!(MessagingConfig::new("a").with_max_concurrent_handlers(0).validate().is_err());
        assert!(MessagingConfig::new("a").with_topics("x", "x", "y").validate().is_err());
        assert!(MessagingConfig::new("a").with_topics("x", "", "y").validate().is_err());

        let err = MessagingConfig::new("a")
            .with_retry_backoff(Duration::from_secs(10), Duration::from_secs(1))
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("retry_backoff_base"));
    }

    #[test]
    fn test_from_env_requires_service_name() {
        with_env(&[], || {
            let err = MessagingConfig::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::MissingEnvVar(_)));
        });
    }

    #[test]
    fn test_from_env_defaults() {
        with_env(&[("MESSAGING_SERVICE_NAME", "orders")], || {
            let config = MessagingConfig::from_env().unwrap();
            assert_eq!(config.service_name, "orders");
            assert_eq!(config.brokers, vec![DEFAULT_BROKER]);
            assert_eq!(config.main_topic, "events");
            assert!(config.allowed_types.is_empty());
            assert!(config.critical_types.is_empty());
            assert_eq!(config.critical_messages_dir, "critical_messages");
        });
    }

    #[test]
    fn test_from_env_overrides() {
        with_env(
            &[
                ("MESSAGING_SERVICE_NAME", "payments"),
                ("MESSAGING_BROKERS", "redis://a:6379, redis://b:6379"),
                ("MESSAGING_ENABLE_RETRY", "false"),
                ("MESSAGING_MAX_RETRIES", "3"),
                ("MESSAGING_FETCH_TIMEOUT_MS", "250"),
                ("MESSAGING_ALLOWED_TYPES", "ORDER_CREATED,PAYMENT_FAILED"),
                ("MESSAGING_CRITICAL_TYPES", "PAYMENT_FAILED"),
                ("MESSAGING_RETRY_BACKOFF_BASE_MS", "10"),
                ("MESSAGING_RETRY_BACKOFF_MAX_MS", "40"),
                ("MESSAGING_CONSUMER_ID", "payments-0"),
            ],
            || {
                let config = MessagingConfig::from_env().unwrap();
                assert_eq!(config.brokers, vec!["redis://a:6379", "redis://b:6379"]);
                assert!(!config.enable_retry);
                assert_eq!(config.max_retries, 3);
                assert_eq!(config.fetch_timeout, Duration::from_millis(250));
                assert_eq!(config.own_allowed_types().unwrap().len(), 2);
                assert!(config.critical_types.contains(&MessageType::PaymentFailed));
                assert_eq!(config.retry_backoff_base, Duration::from_millis(10));
                assert_eq!(config.retry_backoff_max, Duration::from_millis(40));
                assert_eq!(config.consumer_id, "payments-0");
            },
        );
    }

    #[test]
    fn test_from_env_rejects_unknown_type() {
        with_env(
            &[
                ("MESSAGING_SERVICE_NAME", "payments"),
                ("MESSAGING_CRITICAL_TYPES", "PAYMENT_EXPLODED"),
            ],
            || {
                let err = MessagingConfig::from_env().unwrap_err();
                assert!(err.to_string().contains("PAYMENT_EXPLODED"));
            },
        );
    }
}
