//! Messaging error types and error classification
//!
//! Only two kinds of failure ever reach a caller:
//! - **Transport**: the broker could not be reached or a write timed out
//! - **Startup**: the client could not be assembled (bad config, broker down)
//!
//! Everything else (handler failures, malformed payloads, exhausted retry
//! budgets) is routed locally by the retry dispatcher and the DLQ.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the messaging layer
#[derive(Error, Debug)]
pub enum MessagingError {
    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Broker rejected or failed an operation
    #[error("Broker error: {0}")]
    Broker(String),

    /// Topic creation hit an existing topic
    #[error("Topic already exists: {0}")]
    TopicExists(String),

    /// A broker operation did not complete in time
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Payload could not be decoded into an envelope
    #[error("Decode error: {0}")]
    Decode(String),

    /// Envelope could not be encoded
    #[error("Encode error: {0}")]
    Encode(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The client has been closed
    #[error("Messaging client is closed")]
    Closed,

    /// Local filesystem error (critical message store)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MessagingError {
    /// Create a broker error
    pub fn broker(message: impl Into<String>) -> Self {
        MessagingError::Broker(message.into())
    }

    /// Create a timeout error for the named operation
    pub fn timeout(operation: &'static str, after: Duration) -> Self {
        MessagingError::Timeout { operation, after }
    }

    /// Check if this error reports an already existing topic
    pub fn is_topic_exists(&self) -> bool {
        matches!(self, MessagingError::TopicExists(_))
    }

    /// Check if this is a timeout
    pub fn is_timeout(&self) -> bool {
        match self {
            MessagingError::Timeout { .. } => true,
            MessagingError::Redis(e) => e.is_timeout(),
            _ => false,
        }
    }

    /// Check if this is a transport failure (broker unreachable or slow)
    pub fn is_transport(&self) -> bool {
        match self {
            MessagingError::Redis(e) => {
                e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
            }
            MessagingError::Broker(_) | MessagingError::Timeout { .. } => true,
            _ => false,
        }
    }
}

impl From<prost::DecodeError> for MessagingError {
    fn from(err: prost::DecodeError) -> Self {
        MessagingError::Decode(err.to_string())
    }
}

impl From<prost::EncodeError> for MessagingError {
    fn from(err: prost::EncodeError) -> Self {
        MessagingError::Encode(err.to_string())
    }
}

impl From<core_config::ConfigError> for MessagingError {
    fn from(err: core_config::ConfigError) -> Self {
        MessagingError::Config(err.to_string())
    }
}

/// Failure returned by a message handler.
///
/// Any handler failure drives the retry state machine; the message is kept
/// verbatim in the envelope's `last_error`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<eyre::Report> for HandlerError {
    fn from(report: eyre::Report) -> Self {
        Self::new(format!("{:#}", report))
    }
}
