//! # Destination Naming
//!
//! Broker channel names are `<prefix><endpointId>` for queues and topics
//! alike; only the messaging model distinguishes them. The prefix is
//! factory-configured (default `mats.`) so several environments can share
//! one broker.

use mats_trace::{Channel, MessagingModel};

use crate::error::MatsError;

/// Resolves endpoint/stage ids to broker channels.
#[derive(Debug, Clone)]
pub struct DestinationResolver {
    prefix: String,
}

impl DestinationResolver {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The broker channel for a stage or endpoint id.
    pub fn channel(&self, id: &str, model: MessagingModel) -> Channel {
        Channel {
            id: format!("{}{}", self.prefix, id),
            model,
        }
    }

    /// Endpoint ids become broker destination names; reject ids that would
    /// produce unusable ones. Fail-fast at registration.
    pub fn validate_endpoint_id(id: &str) -> Result<(), MatsError> {
        if id.is_empty() {
            return Err(MatsError::config("endpointId must not be empty"));
        }
        if id.chars().any(char::is_whitespace) {
            return Err(MatsError::config(format!(
                "endpointId {id:?} must not contain whitespace"
            )));
        }
        if !id.chars().all(|c| c.is_ascii_graphic()) {
            return Err(MatsError::config(format!(
                "endpointId {id:?} must be printable ASCII"
            )));
        }
        Ok(())
    }
}

impl Default for DestinationResolver {
    fn default() -> Self {
        Self::new("mats.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_channel_names() {
        let resolver = DestinationResolver::new("mats.test.");
        let channel = resolver.channel("Order.place", MessagingModel::Queue);
        assert_eq!(channel.id, "mats.test.Order.place");
        assert_eq!(channel.model, MessagingModel::Queue);
    }

    #[test]
    fn empty_prefix_passes_ids_through() {
        let resolver = DestinationResolver::new("");
        assert_eq!(
            resolver.channel("Topic.broadcast", MessagingModel::Topic).id,
            "Topic.broadcast"
        );
    }

    #[test]
    fn validation_rejects_bad_ids() {
        assert!(DestinationResolver::validate_endpoint_id("Order.place").is_ok());
        assert!(DestinationResolver::validate_endpoint_id("").is_err());
        assert!(DestinationResolver::validate_endpoint_id("has space").is_err());
        assert!(DestinationResolver::validate_endpoint_id("tab\tchar").is_err());
        assert!(DestinationResolver::validate_endpoint_id("ønske").is_err());
    }
}
