//! Narrow AMQP transport contract.
//!
//! The adapter consumes the broker client exclusively through these traits:
//! connect, open channel, declare/bind topology, publish raw bytes, consume
//! raw bytes, ack/nack. Wire-protocol concerns (framing, heartbeats,
//! channel multiplexing) belong to the implementation behind them.

use std::sync::mpsc;
use std::sync::Arc;

use omnibus_core::{BrokerError, ManagedConnection, WireMessage};

/// One raw message handed to a consumer.
#[derive(Debug, Clone)]
pub struct AmqpDelivery {
    /// Broker-assigned tag used to ack/nack this delivery.
    pub delivery_tag: u64,
    /// Routing key the message was published with; carries the normalized
    /// event name.
    pub routing_key: String,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

/// Connection factory for an AMQP broker.
pub trait AmqpTransport: Send + Sync + 'static {
    fn connect(&self) -> Result<Arc<dyn AmqpConnection>, BrokerError>;
}

/// A live AMQP connection. Liveness/fault/teardown semantics come from
/// [`ManagedConnection`]; the adapter only adds channel creation.
pub trait AmqpConnection: ManagedConnection {
    fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, BrokerError>;
}

/// A broker channel: topology declarations plus raw send/receive.
///
/// Declarations are idempotent on a real broker and must be idempotent in
/// any implementation of this trait.
pub trait AmqpChannel: Send + Sync + 'static {
    /// Declare the shared direct exchange.
    fn declare_exchange(&self, exchange: &str) -> Result<(), BrokerError>;

    /// Declare a durable, non-exclusive queue.
    fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
        -> Result<(), BrokerError>;

    fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Publish a persistent message routed by `routing_key`.
    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: WireMessage,
    ) -> Result<(), BrokerError>;

    /// Start consuming a queue. Deliveries arrive on the returned channel
    /// until the broker channel closes; acknowledgement is manual.
    fn consume(&self, queue: &str) -> Result<mpsc::Receiver<AmqpDelivery>, BrokerError>;

    fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Negative-acknowledge. `requeue` returns the message to the queue for
    /// redelivery; otherwise the broker drops or dead-letters it.
    fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;

    fn close(&self) -> Result<(), BrokerError>;
}
