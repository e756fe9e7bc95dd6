//! In-process log broker
//!
//! Mirrors the consumer-group semantics of the Redis backend: each group has
//! its own cursor, delivered-but-uncommitted records stay pending for the
//! consumer that received them, and fetches block until a record arrives or
//! the block timeout elapses. Used by tests and local development.

use super::{Broker, Cursor, OutboundRecord, Record, StartOffset, Subscription, TopicSpec};
use crate::error::MessagingError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct GroupState {
    next: usize,
    /// Record index -> consumer that holds it
    pending: BTreeMap<usize, String>,
}

struct TopicLog {
    spec: TopicSpec,
    records: Vec<Record>,
    groups: HashMap<String, GroupState>,
}

impl TopicLog {
    fn new(spec: TopicSpec) -> Self {
        Self {
            spec,
            records: Vec::new(),
            groups: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct State {
    topics: HashMap<String, TopicLog>,
    failing_topics: HashSet<String>,
    unreachable: bool,
}

impl State {
    fn topic_mut(&mut self, name: &str) -> &mut TopicLog {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| TopicLog::new(TopicSpec::new(name, 1, 1)))
    }

    fn check_reachable(&self) -> Result<(), MessagingError> {
        if self.unreachable {
            return Err(MessagingError::broker("broker unreachable"));
        }
        Ok(())
    }
}

/// In-memory implementation of [`Broker`].
#[derive(Default)]
pub struct InMemoryBroker {
    state: Mutex<State>,
    appended: Notify,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every publish to `topic` fail until [`restore_topic`](Self::restore_topic).
    pub fn fail_topic(&self, topic: &str) {
        self.lock().failing_topics.insert(topic.to_string());
    }

    pub fn restore_topic(&self, topic: &str) {
        self.lock().failing_topics.remove(topic);
    }

    /// Simulate losing the connection to the broker.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Every record ever appended to `topic`, in log order.
    pub fn records(&self, topic: &str) -> Vec<Record> {
        self.lock()
            .topics
            .get(topic)
            .map(|log| log.records.clone())
            .unwrap_or_default()
    }

    /// Creation settings of `topic`, if it exists.
    pub fn topic_spec(&self, topic: &str) -> Option<TopicSpec> {
        self.lock().topics.get(topic).map(|log| log.spec.clone())
    }

    /// Number of delivered-but-uncommitted records for a group.
    pub fn pending_count(&self, topic: &str, group: &str) -> usize {
        self.lock()
            .topics
            .get(topic)
            .and_then(|log| log.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    fn record_index(record_id: &str) -> Result<usize, MessagingError> {
        record_id
            .split('-')
            .next()
            .and_then(|seq| seq.parse::<usize>().ok())
            .and_then(|seq| seq.checked_sub(1))
            .ok_or_else(|| MessagingError::broker(format!("invalid record id: {}", record_id)))
    }

    fn try_fetch(
        &self,
        subscription: &Subscription,
        cursor: &Cursor,
    ) -> Result<Option<Record>, MessagingError> {
        let mut state = self.lock();
        state.check_reachable()?;

        let log = state
            .topics
            .get_mut(&subscription.topic)
            .ok_or_else(|| MessagingError::broker(format!("NOGROUP no such topic: {}", subscription.topic)))?;
        let group = log.groups.get_mut(&subscription.group).ok_or_else(|| {
            MessagingError::broker(format!("NOGROUP no such group: {}", subscription.group))
        })?;

        match cursor {
            Cursor::Pending(after) => {
                let floor = match after {
                    Some(id) => Self::record_index(id)? + 1,
                    None => 0,
                };
                let index = group
                    .pending
                    .range(floor..)
                    .find(|(_, consumer)| **consumer == subscription.consumer)
                    .map(|(index, _)| *index);
                Ok(index.map(|i| log.records[i].clone()))
            }
            Cursor::New => {
                if group.next >= log.records.len() {
                    return Ok(None);
                }
                let index = group.next;
                group.next += 1;
                group.pending.insert(index, subscription.consumer.clone());
                Ok(Some(log.records[index].clone()))
            }
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn ping(&self) -> Result<(), MessagingError> {
        self.lock().check_reachable()
    }

    async fn create_topic(&self, spec: &TopicSpec) -> Result<(), MessagingError> {
        let mut state = self.lock();
        state.check_reachable()?;

        if state.topics.contains_key(&spec.name) {
            return Err(MessagingError::TopicExists(spec.name.clone()));
        }
        state
            .topics
            .insert(spec.name.clone(), TopicLog::new(spec.clone()));
        Ok(())
    }

    async fn publish(&self, topic: &str, record: OutboundRecord) -> Result<String, MessagingError> {
        let id = {
            let mut state = self.lock();
            state.check_reachable()?;
            if state.failing_topics.contains(topic) {
                return Err(MessagingError::broker(format!("write to {} rejected", topic)));
            }

            let log = state.topic_mut(topic);
            let id = format!("{}-0", log.records.len() + 1);
            log.records.push(Record {
                id: id.clone(),
                topic: topic.to_string(),
                key: record.key,
                headers: record.headers,
                payload: record.payload,
            });
            id
        };

        self.appended.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(
        &self,
        topic: &str,
        group: &str,
        start: StartOffset,
    ) -> Result<(), MessagingError> {
        let mut state = self.lock();
        state.check_reachable()?;

        let log = state.topic_mut(topic);
        let next = match start {
            StartOffset::Earliest => 0,
            StartOffset::Latest => log.records.len(),
        };
        log.groups.entry(group.to_string()).or_insert_with(|| GroupState {
            next,
            pending: BTreeMap::new(),
        });
        Ok(())
    }

    async fn fetch(
        &self,
        subscription: &Subscription,
        cursor: &Cursor,
        block: Duration,
    ) -> Result<Option<Record>, MessagingError> {
        let deadline = tokio::time::Instant::now() + block;

        loop {
            // Register interest before looking so an append in between is not missed.
            let appended = self.appended.notified();

            if let Some(record) = self.try_fetch(subscription, cursor)? {
                return Ok(Some(record));
            }
            if matches!(cursor, Cursor::Pending(_)) {
                return Ok(None);
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&self, subscription: &Subscription, record_id: &str) -> Result<(), MessagingError> {
        let index = Self::record_index(record_id)?;
        let mut state = self.lock();
        state.check_reachable()?;

        if let Some(group) = state
            .topics
            .get_mut(&subscription.topic)
            .and_then(|log| log.groups.get_mut(&subscription.group))
        {
            group.pending.remove(&index);
        }
        Ok(())
    }
}
