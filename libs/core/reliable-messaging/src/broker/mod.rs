//! Broker seam
//!
//! The messaging layer needs only a handful of log primitives from the
//! broker: publish, fetch, commit, and topic creation. `Broker` captures
//! exactly those so the client runs unchanged on Redis Streams in production
//! and on the in-memory log in tests.

mod memory;
mod redis_streams;

pub use self::memory::InMemoryBroker;
pub use self::redis_streams::RedisBroker;

use crate::error::MessagingError;
use async_trait::async_trait;
use std::time::Duration;

/// Topic creation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: u32,
    pub replication_factor: u16,
}

impl TopicSpec {
    pub fn new(name: impl Into<String>, partitions: u32, replication_factor: u16) -> Self {
        Self {
            name: name.into(),
            partitions,
            replication_factor,
        }
    }
}

/// A record about to be appended to a topic
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRecord {
    /// Partition key
    pub key: String,
    pub headers: Vec<(String, String)>,
    pub payload: Vec<u8>,
}

/// A record read from a topic
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Log position, used for commits
    pub id: String,
    pub topic: String,
    pub key: String,
    pub headers: Vec<(String, String)>,
    pub payload: Vec<u8>,
}

impl Record {
    /// Look up a header value by name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Where a newly created consumer group starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    Earliest,
    Latest,
}

/// Which records a fetch returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    /// Records already delivered to this consumer but never committed,
    /// strictly after the given position (`None` = from the start)
    Pending(Option<String>),
    /// Records never delivered to the group
    New,
}

/// A (topic, group, consumer) binding
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub topic: String,
    pub group: String,
    pub consumer: String,
}

impl Subscription {
    pub fn new(
        topic: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
            consumer: consumer.into(),
        }
    }
}

/// Log broker primitives used by the messaging layer.
///
/// Implementations must be safe to share between every consumer loop and
/// handler task of a client.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Connectivity check.
    async fn ping(&self) -> Result<(), MessagingError>;

    /// Create a topic. Returns `MessagingError::TopicExists` when present.
    async fn create_topic(&self, spec: &TopicSpec) -> Result<(), MessagingError>;

    /// Append a record, returning its log position.
    ///
    /// Returns only once every in-sync replica acknowledged the write.
    async fn publish(&self, topic: &str, record: OutboundRecord) -> Result<String, MessagingError>;

    /// Create the consumer group if it does not exist yet.
    async fn ensure_group(
        &self,
        topic: &str,
        group: &str,
        start: StartOffset,
    ) -> Result<(), MessagingError>;

    /// Fetch at most one record, waiting up to `block` for a new one.
    async fn fetch(
        &self,
        subscription: &Subscription,
        cursor: &Cursor,
        block: Duration,
    ) -> Result<Option<Record>, MessagingError>;

    /// Commit a log position for the subscription's group.
    async fn commit(&self, subscription: &Subscription, record_id: &str) -> Result<(), MessagingError>;

    /// Release writer resources.
    async fn close(&self) -> Result<(), MessagingError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_header_lookup() {
        let record = Record {
            id: "1-0".to_string(),
            topic: "events".to_string(),
            key: "abc".to_string(),
            headers: vec![
                ("event_type".to_string(), "ORDER_CREATED".to_string()),
                ("from_service".to_string(), "orders".to_string()),
            ],
            payload: vec![],
        };

        assert_eq!(record.header("event_type"), Some("ORDER_CREATED"));
        assert_eq!(record.header("from_service"), Some("orders"));
        assert_eq!(record.header("missing"), None);
    }
}
