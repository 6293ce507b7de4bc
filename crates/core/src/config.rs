//! Event bus configuration.

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Which broker family the bus should be built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    Amqp,
    ServiceBus,
}

impl BrokerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Amqp => "amqp",
            Self::ServiceBus => "service_bus",
        }
    }
}

/// Configuration shared by the bus core and every adapter built from it.
///
/// Immutable once validated; adapters hold it behind an `Arc`. Disposal of
/// a bus never touches configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Broker family an adapter factory should select.
    pub broker: BrokerKind,

    /// Opaque broker connection descriptor (URI, connection string);
    /// interpreted by the transport, never by the bus.
    pub connection: Option<String>,

    /// Maximum connect/send attempts before a transient failure surfaces.
    pub connection_retry_count: u32,

    /// Shared topic/exchange all events of this bus flow through.
    pub default_topic_name: String,

    /// Name of the subscribing application; queue/subscription names are
    /// derived as `"{subscriber_app_name}.{event_name}"`.
    pub subscriber_app_name: String,

    /// Characters stripped from the front of raw event type names.
    pub event_name_prefix: String,

    /// Characters stripped from the end of raw event type names.
    pub event_name_suffix: String,

    pub delete_event_prefix: bool,
    pub delete_event_suffix: bool,

    /// Upper bound on concurrently running handler invocations per
    /// consumed destination (admission control, not a throughput target).
    pub max_concurrent_deliveries: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            broker: BrokerKind::Amqp,
            connection: None,
            connection_retry_count: 5,
            default_topic_name: "omnibus.events".to_string(),
            subscriber_app_name: String::new(),
            event_name_prefix: String::new(),
            event_name_suffix: "IntegrationEvent".to_string(),
            delete_event_prefix: false,
            delete_event_suffix: false,
            max_concurrent_deliveries: 10,
        }
    }
}

impl EventBusConfig {
    pub fn new(subscriber_app_name: impl Into<String>) -> Self {
        Self {
            subscriber_app_name: subscriber_app_name.into(),
            ..Default::default()
        }
    }

    pub fn with_broker(mut self, broker: BrokerKind) -> Self {
        self.broker = broker;
        self
    }

    pub fn with_connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = Some(connection.into());
        self
    }

    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.connection_retry_count = count;
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.default_topic_name = topic.into();
        self
    }

    /// Strip the given character set from the front of event type names.
    pub fn strip_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.event_name_prefix = prefix.into();
        self.delete_event_prefix = true;
        self
    }

    /// Strip the given character set from the end of event type names.
    pub fn strip_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.event_name_suffix = suffix.into();
        self.delete_event_suffix = true;
        self
    }

    pub fn with_max_concurrent_deliveries(mut self, max: usize) -> Self {
        self.max_concurrent_deliveries = max;
        self
    }

    /// Validate the configuration. Called once at bus construction; any
    /// failure is fatal there.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.subscriber_app_name.trim().is_empty() {
            return Err(ConfigurationError::MissingSubscriberAppName);
        }
        if self.default_topic_name.trim().is_empty() {
            return Err(ConfigurationError::MissingTopicName);
        }
        if self.connection_retry_count == 0 {
            return Err(ConfigurationError::ZeroRetryCount);
        }
        if self.max_concurrent_deliveries == 0 {
            return Err(ConfigurationError::ZeroConcurrency);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_with_app_name_is_valid() {
        assert!(EventBusConfig::new("orders").validate().is_ok());
    }

    #[test]
    fn empty_app_name_is_rejected() {
        let err = EventBusConfig::new("  ").validate().unwrap_err();
        assert_eq!(err, ConfigurationError::MissingSubscriberAppName);
    }

    #[test]
    fn empty_topic_is_rejected() {
        let err = EventBusConfig::new("orders")
            .with_topic("")
            .validate()
            .unwrap_err();
        assert_eq!(err, ConfigurationError::MissingTopicName);
    }

    #[test]
    fn zero_retry_count_is_rejected() {
        let err = EventBusConfig::new("orders")
            .with_retry_count(0)
            .validate()
            .unwrap_err();
        assert_eq!(err, ConfigurationError::ZeroRetryCount);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = EventBusConfig::new("orders")
            .with_max_concurrent_deliveries(0)
            .validate()
            .unwrap_err();
        assert_eq!(err, ConfigurationError::ZeroConcurrency);
    }
}
