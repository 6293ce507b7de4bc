//! `omnibus-servicebus` — Service-Bus-style broker adapter.
//!
//! Implements the [`omnibus_core::EventBus`] contract over a
//! topic/subscription topology: one shared topic, one subscription entity
//! per subscriber application and event (`"{app}.{EventName}"`), label
//! correlation rules keyed by the normalized event name. The broker client
//! stays behind the narrow [`transport`] contract; an in-memory broker
//! ships for tests and development.

pub mod bus;
pub mod memory;
pub mod transport;

pub use bus::ServiceBusEventBus;
pub use memory::InMemoryServiceBus;
pub use transport::{InboundMessage, ServiceBusSession, ServiceBusTransport, DEFAULT_RULE_NAME};
