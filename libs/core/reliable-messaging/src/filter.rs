//! Allow-list filter applied before any handler runs

use crate::config::MessagingConfig;
use crate::envelope::{Envelope, MessageType};
use std::collections::HashSet;

/// Why an envelope was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The type is not in the service's allow-list
    TypeNotAllowed,
    /// `to_services` is set and does not name this service
    NotAddressed,
    /// A retry or DLQ copy of another service's failure
    OwnedElsewhere,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::TypeNotAllowed => "type_not_allowed",
            Rejection::NotAddressed => "not_addressed",
            Rejection::OwnedElsewhere => "owned_elsewhere",
        }
    }
}

/// Accepts envelopes the consuming service declared interest in.
///
/// A service without a declared allow-list accepts every type.
#[derive(Debug, Clone)]
pub struct MessageFilter {
    service: String,
    allowed: Option<HashSet<MessageType>>,
}

impl MessageFilter {
    pub fn new(service: impl Into<String>, allowed: Option<HashSet<MessageType>>) -> Self {
        Self {
            service: service.into(),
            allowed,
        }
    }

    pub fn from_config(config: &MessagingConfig) -> Self {
        Self::new(
            config.service_name.clone(),
            config.own_allowed_types().cloned(),
        )
    }

    /// Whether an allow-list was declared
    pub fn is_restricted(&self) -> bool {
        self.allowed.is_some()
    }

    pub fn check(&self, envelope: &Envelope) -> Result<(), Rejection> {
        if let Some(allowed) = &self.allowed {
            if !allowed.contains(&envelope.message_type) {
                return Err(Rejection::TypeNotAllowed);
            }
        }

        if !envelope.is_addressed_to(&self.service) {
            return Err(Rejection::NotAddressed);
        }

        Ok(())
    }

    /// Check the failing-service tag of a retry or DLQ record.
    /// Untagged records belong to everyone.
    pub fn check_owner(&self, owner: Option<&str>) -> Result<(), Rejection> {
        match owner {
            Some(owner) if owner != self.service => Err(Rejection::OwnedElsewhere),
            _ => Ok(()),
        }
    }

    pub fn accepts(&self, envelope: &Envelope) -> bool {
        self.check(envelope).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> MessageFilter {
        MessageFilter::new(
            "payments",
            Some([MessageType::OrderCreated, MessageType::OrderCancelled].into()),
        )
    }

    #[test]
    fn test_allow_list() {
        let f = filter();
        assert!(f.accepts(&Envelope::new(MessageType::OrderCreated, vec![])));
        assert_eq!(
            f.check(&Envelope::new(MessageType::ProductCreated, vec![])),
            Err(Rejection::TypeNotAllowed)
        );
    }

    #[test]
    fn test_destination_services() {
        let f = filter();
        let to_us = Envelope::new(MessageType::OrderCreated, vec![]).to_service("payments");
        let to_other = Envelope::new(MessageType::OrderCreated, vec![]).to_service("baskets");

        assert!(f.accepts(&to_us));
        assert_eq!(f.check(&to_other), Err(Rejection::NotAddressed));
    }

    #[test]
    fn test_failure_copies_stay_with_their_service() {
        let f = filter();
        assert_eq!(f.check_owner(None), Ok(()));
        assert_eq!(f.check_owner(Some("payments")), Ok(()));
        assert_eq!(f.check_owner(Some("notifications")), Err(Rejection::OwnedElsewhere));
    }

    #[test]
    fn test_unrestricted_service_accepts_all_types() {
        let f = MessageFilter::new("audit", None);
        assert!(!f.is_restricted());
        for message_type in MessageType::all() {
            assert!(f.accepts(&Envelope::new(message_type, vec![])));
        }
    }

    #[test]
    fn test_from_config() {
        let config = MessagingConfig::new("payments").allow("payments", [MessageType::OrderCreated]);
        let f = MessageFilter::from_config(&config);
        assert!(f.is_restricted());
        assert!(f.accepts(&Envelope::new(MessageType::OrderCreated, vec![])));
        assert!(!f.accepts(&Envelope::new(MessageType::OrderCancelled, vec![])));
    }
}
