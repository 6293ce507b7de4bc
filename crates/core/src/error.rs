//! Error taxonomy for the event bus.
//!
//! Keep the split deliberate: configuration problems are fatal at
//! construction, registry problems surface to the caller and are never
//! retried, transient broker unreachability is retried and only surfaces
//! once the retry budget is exhausted, and handler failures are isolated
//! per handler.

use thiserror::Error;

/// Invalid configuration detected while building a bus. Fatal; never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("subscriber application name must not be empty")]
    MissingSubscriberAppName,

    #[error("default topic name must not be empty")]
    MissingTopicName,

    #[error("connection retry count must be at least 1")]
    ZeroRetryCount,

    #[error("max concurrent deliveries must be at least 1")]
    ZeroConcurrency,

    /// The configured broker does not match the transport handed to the factory.
    #[error("configured broker `{configured}` does not match the supplied `{supplied}` transport")]
    BrokerMismatch {
        configured: &'static str,
        supplied: &'static str,
    },
}

/// Subscription registry errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    /// The same handler type was registered twice for one event.
    #[error("handler `{handler}` is already registered for event `{event}`")]
    Duplicate {
        event: String,
        handler: &'static str,
    },

    /// `handlers_for` was called for an event with no live subscriptions.
    /// Callers are expected to check `has_subscriptions` first.
    #[error("no subscriptions registered for event `{0}`")]
    UnknownEvent(String),
}

/// Failure reported by a broker transport.
///
/// The variant decides the recovery policy: `Unreachable` is retried with
/// backoff, `MissingEntity` is swallowed with a warning on teardown paths,
/// everything else surfaces immediately.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Transient connectivity failure (connection refused, socket dropped).
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// A broker-side object (queue, subscription, rule) does not exist.
    #[error("messaging entity `{0}` not found")]
    MissingEntity(String),

    /// Anything else the broker rejected; not a connectivity problem.
    #[error("broker operation failed: {0}")]
    Other(String),
}

impl BrokerError {
    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::Unreachable(msg.into())
    }

    pub fn missing_entity(entity: impl Into<String>) -> Self {
        Self::MissingEntity(entity.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

/// Connectivity failure surfaced after the retry policy gave up, or a
/// non-transient failure that was never eligible for retry.
#[derive(Debug, Error)]
pub enum ConnectivityError {
    #[error("broker unreachable after {attempts} attempts: {reason}")]
    Exhausted { attempts: u32, reason: String },

    /// The operation failed with something retrying cannot fix.
    #[error(transparent)]
    Fatal(BrokerError),
}

/// One handler raised while processing a message.
#[derive(Debug, Error)]
#[error("handler `{handler}` failed for event `{event}`: {source}")]
pub struct HandlerInvocationError {
    pub event: String,
    pub handler: &'static str,
    #[source]
    pub source: anyhow::Error,
}

/// Failure inside the dispatch pipeline.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to deserialize payload for event `{event}`: {source}")]
    Deserialization {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    /// Subscriptions exist for the event but no decoder is registered.
    /// Indicates registry corruption; the invariant says both maps move together.
    #[error("subscriptions exist for `{0}` but no event type is registered")]
    InconsistentRegistry(String),

    /// One or more handlers raised. Handlers that did not raise still ran.
    #[error("{} handler(s) failed for event `{event}`", .failures.len())]
    Handlers {
        event: String,
        failures: Vec<HandlerInvocationError>,
    },
}

/// Errors surfaced by `EventBus::publish`.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),

    #[error("failed to serialize event payload: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Application-level send failure; not retried.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("event bus has been disposed")]
    Disposed,
}

/// Errors surfaced by `EventBus::subscribe`/`unsubscribe`.
#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("event bus has been disposed")]
    Disposed,
}

/// Umbrella error for bus construction and the adapter factory.
#[derive(Debug, Error)]
pub enum EventBusError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}
