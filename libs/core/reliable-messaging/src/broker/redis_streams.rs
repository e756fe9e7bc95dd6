//! Redis Streams broker
//!
//! Topics are streams, consumer groups are Redis consumer groups:
//! - publish: `XADD topic MAXLEN ~ n * key .. payload .. h:<name> ..`
//! - fetch: `XREADGROUP GROUP g c COUNT 1 [BLOCK ms] STREAMS topic <id|>>`
//! - commit: `XACK`
//! - topic creation: `{topic}:meta` hash plus `XGROUP CREATE .. MKSTREAM`

use super::{Broker, Cursor, OutboundRecord, Record, StartOffset, Subscription, TopicSpec};
use crate::error::MessagingError;
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::RedisResult;
use std::time::Duration;
use tracing::{debug, info};

const FIELD_KEY: &str = "key";
const FIELD_PAYLOAD: &str = "payload";
const HEADER_PREFIX: &str = "h:";

// XREADGROUP reply: [(stream, [(id, [(field, value)])])]
type StreamEntries = Vec<(String, Vec<(String, Vec<u8>)>)>;
type ReadReply = Vec<(String, StreamEntries)>;

/// Redis Streams implementation of [`Broker`].
#[derive(Clone)]
pub struct RedisBroker {
    redis: ConnectionManager,
    max_length: usize,
    min_replicas: usize,
    replica_timeout: Duration,
}

impl RedisBroker {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            max_length: 100_000,
            min_replicas: 0,
            replica_timeout: Duration::from_secs(5),
        }
    }

    /// Open a connection manager for `url`, bounded by `timeout`.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, MessagingError> {
        let client = redis::Client::open(url)?;
        let manager = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| MessagingError::timeout("connect", timeout))??;

        info!(url = %url, "Connected to Redis broker");
        Ok(Self::new(manager))
    }

    /// Set the approximate maximum stream length (MAXLEN ~).
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    /// Require `replicas` replica acknowledgements (WAIT) for every write.
    pub fn with_min_replicas(mut self, replicas: usize, timeout: Duration) -> Self {
        self.min_replicas = replicas;
        self.replica_timeout = timeout;
        self
    }

    fn conn(&self) -> ConnectionManager {
        self.redis.clone()
    }

    fn parse_entry(topic: &str, id: String, fields: Vec<(String, Vec<u8>)>) -> Record {
        let mut key = String::new();
        let mut payload = Vec::new();
        let mut headers = Vec::new();

        for (field, value) in fields {
            if field == FIELD_KEY {
                key = String::from_utf8_lossy(&value).into_owned();
            } else if field == FIELD_PAYLOAD {
                payload = value;
            } else if let Some(name) = field.strip_prefix(HEADER_PREFIX) {
                headers.push((name.to_string(), String::from_utf8_lossy(&value).into_owned()));
            }
        }

        Record {
            id,
            topic: topic.to_string(),
            key,
            headers,
            payload,
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn ping(&self) -> Result<(), MessagingError> {
        let mut conn = self.conn();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(MessagingError::broker(format!("unexpected PING reply: {}", pong)));
        }
        Ok(())
    }

    async fn create_topic(&self, spec: &TopicSpec) -> Result<(), MessagingError> {
        let mut conn = self.conn();
        let meta = format!("{}:meta", spec.name);

        let created: bool = redis::cmd("HSETNX")
            .arg(&meta)
            .arg("partitions")
            .arg(spec.partitions)
            .query_async(&mut conn)
            .await?;
        if !created {
            return Err(MessagingError::TopicExists(spec.name.clone()));
        }

        redis::cmd("HSET")
            .arg(&meta)
            .arg("replication_factor")
            .arg(spec.replication_factor)
            .arg("created_at")
            .arg(Utc::now().to_rfc3339())
            .query_async::<()>(&mut conn)
            .await?;

        // Materialize the stream without leaving a group behind
        let provisioner = format!("{}:provisioner", spec.name);
        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&spec.name)
            .arg(&provisioner)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(()) => {}
            Err(e) if e.to_string().contains("BUSYGROUP") => {}
            Err(e) => return Err(MessagingError::Redis(e)),
        }
        redis::cmd("XGROUP")
            .arg("DESTROY")
            .arg(&spec.name)
            .arg(&provisioner)
            .query_async::<i64>(&mut conn)
            .await?;

        info!(
            topic = %spec.name,
            partitions = spec.partitions,
            replication_factor = spec.replication_factor,
            "Created topic"
        );
        Ok(())
    }

    async fn publish(&self, topic: &str, record: OutboundRecord) -> Result<String, MessagingError> {
        let mut conn = self.conn();

        let mut cmd = redis::cmd("XADD");
        cmd.arg(topic)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_length)
            .arg("*")
            .arg(FIELD_KEY)
            .arg(&record.key)
            .arg(FIELD_PAYLOAD)
            .arg(&record.payload);
        for (name, value) in &record.headers {
            cmd.arg(format!("{}{}", HEADER_PREFIX, name)).arg(value);
        }

        let id: String = cmd.query_async(&mut conn).await?;

        if self.min_replicas > 0 {
            let acked: usize = redis::cmd("WAIT")
                .arg(self.min_replicas)
                .arg(self.replica_timeout.as_millis() as u64)
                .query_async(&mut conn)
                .await?;
            if acked < self.min_replicas {
                return Err(MessagingError::broker(format!(
                    "write {} acknowledged by {} of {} replicas",
                    id, acked, self.min_replicas
                )));
            }
        }

        debug!(topic = %topic, record_id = %id, key = %record.key, "Appended record");
        Ok(id)
    }

    async fn ensure_group(
        &self,
        topic: &str,
        group: &str,
        start: StartOffset,
    ) -> Result<(), MessagingError> {
        let mut conn = self.conn();
        let start_id = match start {
            StartOffset::Earliest => "0",
            StartOffset::Latest => "$",
        };

        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(topic)
            .arg(group)
            .arg(start_id)
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                info!(topic = %topic, group = %group, start = ?start, "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(topic = %topic, group = %group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(MessagingError::Redis(e)),
        }
    }

    async fn fetch(
        &self,
        subscription: &Subscription,
        cursor: &Cursor,
        block: Duration,
    ) -> Result<Option<Record>, MessagingError> {
        let mut conn = self.conn();

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&subscription.group)
            .arg(&subscription.consumer)
            .arg("COUNT")
            .arg(1);

        let start_id = match cursor {
            Cursor::Pending(after) => after.clone().unwrap_or_else(|| "0".to_string()),
            Cursor::New => {
                cmd.arg("BLOCK").arg(block.as_millis() as u64);
                ">".to_string()
            }
        };
        cmd.arg("STREAMS").arg(&subscription.topic).arg(start_id);

        let reply: Option<ReadReply> = cmd.query_async(&mut conn).await?;

        let record = reply
            .into_iter()
            .flatten()
            .flat_map(|(_stream, entries)| entries)
            .next()
            .map(|(id, fields)| Self::parse_entry(&subscription.topic, id, fields));

        Ok(record)
    }

    async fn commit(&self, subscription: &Subscription, record_id: &str) -> Result<(), MessagingError> {
        let mut conn = self.conn();

        let _: i64 = redis::cmd("XACK")
            .arg(&subscription.topic)
            .arg(&subscription.group)
            .arg(record_id)
            .query_async(&mut conn)
            .await?;

        debug!(topic = %subscription.topic, group = %subscription.group, record_id = %record_id, "Committed record");
        Ok(())
    }
}
