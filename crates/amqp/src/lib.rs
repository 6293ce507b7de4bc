//! `omnibus-amqp` — AMQP-style broker adapter.
//!
//! Implements the [`omnibus_core::EventBus`] contract over a direct-exchange
//! topology: one shared exchange, one durable queue per subscriber and
//! event, bindings keyed by the normalized event name. The AMQP client
//! itself stays behind the narrow [`transport`] contract; an in-memory
//! broker ships for tests and development.

pub mod bus;
pub mod memory;
pub mod transport;

pub use bus::AmqpEventBus;
pub use memory::InMemoryAmqp;
pub use transport::{AmqpChannel, AmqpConnection, AmqpDelivery, AmqpTransport};
