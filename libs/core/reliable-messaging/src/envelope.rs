//! Envelope: the unit of work flowing through the messaging layer
//!
//! Business data (`message_type`, `payload`, destinations, headers) is set by
//! the producing service. Delivery metadata (`critical`, `retry_count`,
//! `last_error`, `retry_after`) is owned by this crate and only readable
//! from outside.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

/// Message kinds exchanged between platform services.
///
/// Display and parse use the wire name, e.g. `ORDER_CREATED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[derive(Serialize, Deserialize, Display, AsRefStr, EnumString, EnumIter)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i32)]
pub enum MessageType {
    Unspecified = 0,
    AccountCreated = 1,
    AccountUpdated = 2,
    BasketCheckedOut = 3,
    OrderCreated = 4,
    OrderCancelled = 5,
    OrderCompleted = 6,
    PaymentCompleted = 7,
    PaymentFailed = 8,
    SellerRegistered = 9,
    ProductCreated = 10,
    ProductUpdated = 11,
    ProductDeleted = 12,
    NotificationRequested = 13,
}

impl MessageType {
    /// All message types.
    pub fn all() -> impl Iterator<Item = Self> {
        Self::iter()
    }
}

/// A message plus its delivery metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Unique id, stable across every redelivery. Generated on publish if empty.
    pub id: String,
    pub message_type: MessageType,
    /// Origin service; overwritten with the publisher's identity.
    pub from_service: String,
    /// Destination services. Empty means any subscriber allow-listing the type.
    pub to_services: BTreeSet<String>,
    /// Publish time, set once.
    pub created: Option<DateTime<Utc>>,
    pub priority: i32,
    pub headers: HashMap<String, String>,
    pub payload: Vec<u8>,
    pub(crate) critical: bool,
    pub(crate) retry_count: u32,
    pub(crate) last_error: Option<String>,
    pub(crate) retry_after: Option<DateTime<Utc>>,
}

impl Envelope {
    /// Create an envelope with a raw payload.
    pub fn new(message_type: MessageType, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: String::new(),
            message_type,
            from_service: String::new(),
            to_services: BTreeSet::new(),
            created: None,
            priority: 0,
            headers: HashMap::new(),
            payload: payload.into(),
            critical: false,
            retry_count: 0,
            last_error: None,
            retry_after: None,
        }
    }

    /// Create an envelope with a JSON payload.
    pub fn json<T: Serialize>(message_type: MessageType, body: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(message_type, serde_json::to_vec(body)?))
    }

    /// Decode the payload as JSON.
    pub fn payload_json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn to_service(mut self, service: impl Into<String>) -> Self {
        self.to_services.insert(service.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Hold the envelope until `at`; no handler sees it earlier.
    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.retry_after = Some(at);
        self
    }

    /// Whether the type was in the critical set when published.
    pub fn is_critical(&self) -> bool {
        self.critical
    }

    /// Number of failed handler attempts so far.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Most recent handler failure.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Earliest time a handler may see this envelope.
    pub fn retry_after(&self) -> Option<DateTime<Utc>> {
        self.retry_after
    }

    /// Time left until `retry_after`, or `None` when the envelope is due.
    pub fn remaining_delay(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.retry_after
            .and_then(|at| (at - now).to_std().ok())
            .filter(|d| !d.is_zero())
    }

    /// Whether the destination set is empty or names `service`.
    pub fn is_addressed_to(&self, service: &str) -> bool {
        self.to_services.is_empty() || self.to_services.contains(service)
    }

    /// File stem used by the critical message store: `{TYPE}_{id}`.
    ///
    /// Bytes outside `[A-Za-z0-9_-]` are percent-encoded, so distinct ids
    /// never share a file.
    pub fn storage_key(&self) -> String {
        let mut key = format!("{}_", self.message_type);
        for byte in self.id.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
                key.push(char::from(byte));
            } else {
                key.push_str(&format!("%{:02X}", byte));
            }
        }
        key
    }
}
