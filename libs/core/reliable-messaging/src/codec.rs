//! Wire codec
//!
//! Envelopes travel as protobuf-encoded `WireEnvelope` payloads. Event type,
//! origin service and message id are copied into record headers so the log
//! can be inspected without decoding payloads.

use crate::broker::OutboundRecord;
use crate::envelope::{Envelope, MessageType};
use crate::error::MessagingError;
use chrono::{DateTime, Utc};
use prost::Message;
use std::collections::HashMap;

pub const HEADER_EVENT_TYPE: &str = "event_type";
pub const HEADER_FROM_SERVICE: &str = "from_service";
pub const HEADER_MESSAGE_ID: &str = "message_id";

#[derive(Clone, PartialEq, Message)]
struct WireEnvelope {
    #[prost(string, tag = "1")]
    id: String,
    #[prost(enumeration = "MessageType", tag = "2")]
    message_type: i32,
    #[prost(string, tag = "3")]
    from_service: String,
    #[prost(string, repeated, tag = "4")]
    to_services: Vec<String>,
    #[prost(int64, optional, tag = "5")]
    created_ms: Option<i64>,
    #[prost(int32, tag = "6")]
    priority: i32,
    #[prost(map = "string, string", tag = "7")]
    headers: HashMap<String, String>,
    #[prost(bool, tag = "8")]
    critical: bool,
    #[prost(uint32, tag = "9")]
    retry_count: u32,
    #[prost(string, optional, tag = "10")]
    last_error: Option<String>,
    #[prost(int64, optional, tag = "11")]
    retry_after_ms: Option<i64>,
    #[prost(bytes = "vec", tag = "12")]
    payload: Vec<u8>,
}

/// Serialize an envelope to its binary wire form.
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    WireEnvelope {
        id: envelope.id.clone(),
        message_type: envelope.message_type.into(),
        from_service: envelope.from_service.clone(),
        to_services: envelope.to_services.iter().cloned().collect(),
        created_ms: envelope.created.map(|t| t.timestamp_millis()),
        priority: envelope.priority,
        headers: envelope.headers.clone(),
        critical: envelope.critical,
        retry_count: envelope.retry_count,
        last_error: envelope.last_error.clone(),
        retry_after_ms: envelope.retry_after.map(|t| t.timestamp_millis()),
        payload: envelope.payload.clone(),
    }
    .encode_to_vec()
}

/// Deserialize an envelope from its binary wire form.
pub fn decode(bytes: &[u8]) -> Result<Envelope, MessagingError> {
    let wire = WireEnvelope::decode(bytes)?;

    let message_type = MessageType::try_from(wire.message_type)
        .map_err(|e| MessagingError::Decode(e.to_string()))?;

    Ok(Envelope {
        id: wire.id,
        message_type,
        from_service: wire.from_service,
        to_services: wire.to_services.into_iter().collect(),
        created: wire.created_ms.map(millis_to_datetime).transpose()?,
        priority: wire.priority,
        headers: wire.headers,
        payload: wire.payload,
        critical: wire.critical,
        retry_count: wire.retry_count,
        last_error: wire.last_error,
        retry_after: wire.retry_after_ms.map(millis_to_datetime).transpose()?,
    })
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>, MessagingError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| MessagingError::Decode(format!("timestamp out of range: {}", ms)))
}

/// Build the broker record for an envelope.
///
/// The envelope id is the partition key so every redelivery of the same
/// message lands on the same partition.
pub fn to_record(envelope: &Envelope, extra_headers: Vec<(String, String)>) -> OutboundRecord {
    let mut headers = vec![
        (HEADER_EVENT_TYPE.to_string(), envelope.message_type.to_string()),
        (HEADER_FROM_SERVICE.to_string(), envelope.from_service.clone()),
        (HEADER_MESSAGE_ID.to_string(), envelope.id.clone()),
    ];
    headers.extend(extra_headers);

    OutboundRecord {
        key: envelope.id.clone(),
        headers,
        payload: encode(envelope),
    }
}
