//! Narrow Service-Bus transport contract.
//!
//! The adapter consumes the broker exclusively through this session trait:
//! management operations (topics, subscriptions, rules), raw send, raw
//! receive, and lock-token settlement. REST/AMQP plumbing, token refresh
//! and client retries live behind the implementation.

use std::sync::mpsc;
use std::sync::Arc;

use omnibus_core::{BrokerError, ManagedConnection, WireMessage};

/// Name of the catch-all rule every new subscription starts with. The
/// adapter removes it so only explicit label rules route messages.
pub const DEFAULT_RULE_NAME: &str = "$Default";

/// One raw message received from a subscription.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub message_id: String,
    /// Routing label; carries the normalized event name.
    pub label: String,
    pub body: Vec<u8>,
    /// Settlement token for `complete`/`abandon`.
    pub lock_token: String,
    /// How many times the broker has delivered this message.
    pub delivery_count: u32,
}

/// Session factory for a Service-Bus namespace.
pub trait ServiceBusTransport: Send + Sync + 'static {
    fn connect(&self) -> Result<Arc<dyn ServiceBusSession>, BrokerError>;
}

/// A live Service-Bus session: liveness/fault/teardown semantics come from
/// [`ManagedConnection`], plus the management and data operations the
/// adapter needs.
///
/// Management operations must be idempotent from the adapter's point of
/// view; `remove_rule` reports a missing rule as
/// [`BrokerError::MissingEntity`].
pub trait ServiceBusSession: ManagedConnection {
    fn topic_exists(&self, topic: &str) -> Result<bool, BrokerError>;

    fn create_topic(&self, topic: &str) -> Result<(), BrokerError>;

    fn subscription_exists(&self, topic: &str, subscription: &str) -> Result<bool, BrokerError>;

    /// Create a subscription entity. New subscriptions carry the catch-all
    /// [`DEFAULT_RULE_NAME`] rule until it is removed.
    fn create_subscription(&self, topic: &str, subscription: &str) -> Result<(), BrokerError>;

    fn rule_exists(
        &self,
        topic: &str,
        subscription: &str,
        rule: &str,
    ) -> Result<bool, BrokerError>;

    /// Add a correlation rule matching messages whose label equals `label`.
    fn add_label_rule(
        &self,
        topic: &str,
        subscription: &str,
        rule: &str,
        label: &str,
    ) -> Result<(), BrokerError>;

    fn remove_rule(
        &self,
        topic: &str,
        subscription: &str,
        rule: &str,
    ) -> Result<(), BrokerError>;

    fn send(&self, topic: &str, message: WireMessage) -> Result<(), BrokerError>;

    /// Start receiving from a subscription. Messages arrive on the returned
    /// channel until the session closes; settlement is manual via
    /// `complete`/`abandon`.
    fn receive(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<mpsc::Receiver<InboundMessage>, BrokerError>;

    /// Settle a message as processed.
    fn complete(&self, lock_token: &str) -> Result<(), BrokerError>;

    /// Return a message to the subscription for redelivery; the broker
    /// dead-letters it once its delivery count is exhausted.
    fn abandon(&self, lock_token: &str) -> Result<(), BrokerError>;
}
