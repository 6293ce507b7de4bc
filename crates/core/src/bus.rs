//! The broker-agnostic event bus contract and shared adapter bookkeeping.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::config::EventBusConfig;
use crate::dispatch::Dispatcher;
use crate::error::{ConfigurationError, DispatchError, PublishError, SubscribeError};
use crate::event::{HandlerIdentity, IntegrationEvent, IntegrationEventHandler};
use crate::naming;
use crate::registry::{SubscriptionDescriptor, SubscriptionRegistry};
use crate::resolver::HandlerResolver;

/// The wire envelope: an opaque unique id, the serialized payload, and the
/// normalized event name used for routing without inspecting the body.
#[derive(Debug, Clone)]
pub struct WireMessage {
    pub message_id: Uuid,
    pub label: String,
    pub body: Vec<u8>,
}

impl WireMessage {
    pub fn new(label: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            message_id: Uuid::now_v7(),
            label: label.into(),
            body,
        }
    }
}

/// The common, object-safe contract every broker adapter implements.
///
/// Applications usually call the typed sugar in [`EventBusExt`]; the erased
/// methods exist so `dyn EventBus` stays usable behind the adapter factory.
pub trait EventBus: Send + Sync {
    /// Publish an already-serialized event tagged with its raw type name.
    fn publish_raw(&self, event_name: &str, payload: Vec<u8>) -> Result<(), PublishError>;

    /// Register a subscription and provision broker-side routing for it.
    fn subscribe_with(&self, subscription: SubscriptionDescriptor) -> Result<(), SubscribeError>;

    /// Remove a subscription; broker-side routing teardown happens through
    /// the registry's removal notification when the last handler goes.
    fn unsubscribe_from(
        &self,
        event_name: &str,
        handler: HandlerIdentity,
    ) -> Result<(), SubscribeError>;

    /// Release broker resources. Idempotent; subsequent publish/subscribe
    /// calls fail with a disposed error.
    fn dispose(&self);
}

/// Typed convenience layer over [`EventBus`].
pub trait EventBusExt: EventBus {
    fn publish<E: IntegrationEvent>(&self, event: &E) -> Result<(), PublishError> {
        let payload = serialize_event(event)?;
        self.publish_raw(E::NAME, payload)
    }

    fn subscribe<E, H>(&self) -> Result<(), SubscribeError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.subscribe_with(SubscriptionDescriptor::of::<E, H>())
    }

    fn unsubscribe<E, H>(&self) -> Result<(), SubscribeError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.unsubscribe_from(E::NAME, HandlerIdentity::of::<H>())
    }
}

impl<T: EventBus + ?Sized> EventBusExt for T {}

fn serialize_event<E: Serialize>(event: &E) -> Result<Vec<u8>, PublishError> {
    Ok(serde_json::to_vec(event)?)
}

/// Shared bookkeeping every adapter is built around: validated config, the
/// subscription registry keyed by this bus's naming rules, and the dispatch
/// pipeline fed by inbound deliveries.
#[derive(Debug)]
pub struct BusCore {
    config: Arc<EventBusConfig>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Dispatcher,
}

impl BusCore {
    /// Validates the configuration; misconfiguration is fatal here, before
    /// any broker work happens.
    pub fn new(
        config: EventBusConfig,
        resolver: Arc<dyn HandlerResolver>,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let config = Arc::new(config);

        let naming_config = config.clone();
        let registry = Arc::new(SubscriptionRegistry::new(move |raw| {
            naming::normalize(raw, &naming_config)
        }));
        let dispatcher = Dispatcher::new(registry.clone(), resolver);

        Ok(Self {
            config,
            registry,
            dispatcher,
        })
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Shared topic/exchange this bus publishes through.
    pub fn topic(&self) -> &str {
        &self.config.default_topic_name
    }

    /// Normalized wire name for a raw event type name.
    pub fn event_key(&self, raw_name: &str) -> String {
        self.registry.event_key(raw_name)
    }

    /// This subscriber's destination name for an event.
    pub fn subscription_name(&self, event_name: &str) -> String {
        naming::subscription_name(event_name, &self.config)
    }

    /// Run one inbound message through the dispatch pipeline.
    pub fn process(&self, raw_name: &str, body: &[u8]) -> Result<bool, DispatchError> {
        self.dispatcher.process(raw_name, body)
    }
}
