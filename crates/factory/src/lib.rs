//! `omnibus-factory` — adapter selection and the crate's public surface.
//!
//! Builds the concrete broker adapter from configuration so callers depend
//! only on the common [`EventBus`] contract, never on adapter types.

use std::sync::Arc;

use omnibus_amqp::{AmqpEventBus, AmqpTransport};
use omnibus_core::{
    BrokerKind, ConfigurationError, EventBus, EventBusConfig, EventBusError, HandlerResolver,
};
use omnibus_servicebus::{ServiceBusEventBus, ServiceBusTransport};

pub mod telemetry;


pub use omnibus_amqp as amqp;
pub use omnibus_core::*;
pub use omnibus_servicebus as servicebus;

/// The transport handed to the factory; one variant per broker family.
#[derive(Clone)]
pub enum BrokerTransports {
    Amqp(Arc<dyn AmqpTransport>),
    ServiceBus(Arc<dyn ServiceBusTransport>),
}

impl BrokerTransports {
    fn kind(&self) -> BrokerKind {
        match self {
            Self::Amqp(_) => BrokerKind::Amqp,
            Self::ServiceBus(_) => BrokerKind::ServiceBus,
        }
    }
}

/// Build the event bus selected by `config.broker`.
///
/// The configured broker must match the supplied transport; a mismatch is a
/// configuration error, fatal at construction like any other.
pub fn create(
    config: EventBusConfig,
    resolver: Arc<dyn HandlerResolver>,
    transport: BrokerTransports,
) -> Result<Arc<dyn EventBus>, EventBusError> {
    match (config.broker, transport) {
        (BrokerKind::Amqp, BrokerTransports::Amqp(transport)) => {
            Ok(Arc::new(AmqpEventBus::new(config, resolver, transport)?))
        }
        (BrokerKind::ServiceBus, BrokerTransports::ServiceBus(transport)) => Ok(Arc::new(
            ServiceBusEventBus::new(config, resolver, transport)?,
        )),
        (configured, supplied) => Err(ConfigurationError::BrokerMismatch {
            configured: configured.as_str(),
            supplied: supplied.kind().as_str(),
        }
        .into()),
    }
}
