//! `omnibus-core` — broker-agnostic event bus building blocks.
//!
//! This crate contains everything that does **not** depend on a concrete
//! broker: the typed event/handler contracts, the subscription registry,
//! event-name normalization, the dispatch pipeline, the connection
//! resilience manager, and the `EventBus` contract adapters implement.
//!
//! Broker adapters (`omnibus-amqp`, `omnibus-servicebus`) build on top and
//! only add topology provisioning plus raw send/receive.

pub mod bus;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod naming;
pub mod registry;
pub mod resolver;
pub mod retry;

pub use bus::{BusCore, EventBus, EventBusExt, WireMessage};
pub use config::{BrokerKind, EventBusConfig};
pub use connection::{
    ConnectionFault, ConnectionState, FaultListener, ManagedConnection, ResilientConnection,
};
pub use dispatch::Dispatcher;
pub use error::{
    BrokerError, ConfigurationError, ConnectivityError, DispatchError, EventBusError,
    HandlerInvocationError, PublishError, SubscribeError, SubscriptionError,
};
pub use event::{EventMetadata, HandlerIdentity, IntegrationEvent, IntegrationEventHandler};
pub use registry::{SubscriptionDescriptor, SubscriptionInfo, SubscriptionRegistry};
pub use resolver::{HandlerRegistry, HandlerResolver};
pub use retry::RetryPolicy;
