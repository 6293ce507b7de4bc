//! In-memory subscription registry.
//!
//! Maps normalized event names to the handler types registered for them,
//! plus the decoder that turns inbound payload bytes back into the concrete
//! event type. Both maps move together: an event name is present in the
//! decoder map iff it has at least one live subscription.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::collections::HashMap;

use tracing::warn;

use crate::error::SubscriptionError;
use crate::event::{HandlerIdentity, IntegrationEvent, IntegrationEventHandler};
use crate::resolver::HandlerResolver;

/// A deserialized event payload, shared across the handlers of one message.
pub type DecodedEvent = Arc<dyn Any + Send + Sync>;

/// Deserializes inbound payload bytes into the concrete event type.
pub type EventDecoder =
    Arc<dyn Fn(&[u8]) -> Result<DecodedEvent, serde_json::Error> + Send + Sync>;

/// Resolves a handler instance and invokes it with a decoded event.
///
/// `Ok(true)`: the handler ran. `Ok(false)`: the resolver yielded nothing,
/// the handler was skipped. `Err`: the handler raised.
type HandlerInvoker =
    Arc<dyn Fn(&dyn HandlerResolver, &DecodedEvent) -> Result<bool, anyhow::Error> + Send + Sync>;

/// One registered (event, handler type) pair.
#[derive(Clone)]
pub struct SubscriptionInfo {
    handler: HandlerIdentity,
    invoker: HandlerInvoker,
}

impl SubscriptionInfo {
    pub fn handler(&self) -> &HandlerIdentity {
        &self.handler
    }

    pub(crate) fn invoke(
        &self,
        resolver: &dyn HandlerResolver,
        event: &DecodedEvent,
    ) -> Result<bool, anyhow::Error> {
        (self.invoker)(resolver, event)
    }
}

impl std::fmt::Debug for SubscriptionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionInfo")
            .field("handler", &self.handler)
            .finish()
    }
}

/// Type-erased subscription request: everything the registry and dispatch
/// pipeline need to route, decode and invoke, without compile-time knowledge
/// of the event or handler types.
#[derive(Clone)]
pub struct SubscriptionDescriptor {
    event_name: &'static str,
    decoder: EventDecoder,
    subscription: SubscriptionInfo,
}

impl SubscriptionDescriptor {
    /// Erase an (event, handler) type pair into a descriptor.
    pub fn of<E, H>() -> Self
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let decoder: EventDecoder = Arc::new(|bytes: &[u8]| {
            serde_json::from_slice::<E>(bytes).map(|event| Arc::new(event) as DecodedEvent)
        });

        let handler = HandlerIdentity::of::<H>();
        let invoker: HandlerInvoker = Arc::new(move |resolver, event| {
            let Some(instance) = resolver.resolve(handler.type_id()) else {
                return Ok(false);
            };
            let Ok(instance) = instance.downcast::<H>() else {
                warn!(
                    handler = handler.name(),
                    "resolver returned an instance of the wrong type; skipping handler"
                );
                return Ok(false);
            };
            let event = event
                .downcast_ref::<E>()
                .ok_or_else(|| anyhow::anyhow!("decoded payload is not `{}`", E::NAME))?;
            instance.handle(event)?;
            Ok(true)
        });

        Self {
            event_name: E::NAME,
            decoder,
            subscription: SubscriptionInfo { handler, invoker },
        }
    }

    /// Raw event type name (not yet normalized).
    pub fn event_name(&self) -> &'static str {
        self.event_name
    }

    pub fn handler(&self) -> &HandlerIdentity {
        self.subscription.handler()
    }
}

impl std::fmt::Debug for SubscriptionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionDescriptor")
            .field("event_name", &self.event_name)
            .field("handler", self.subscription.handler())
            .finish()
    }
}

type NameFn = Box<dyn Fn(&str) -> String + Send + Sync>;
type RemovalListener = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct RegistryState {
    handlers: HashMap<String, Vec<SubscriptionInfo>>,
    decoders: HashMap<String, EventDecoder>,
}

/// Thread-safe subscription registry.
///
/// A single lock covers every read-modify-write sequence; cardinality is
/// expected to stay small (one entry per event type). The removal listener
/// is fired **after** the lock is released so it may re-enter the registry.
pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
    name_of: NameFn,
    removal_listener: Mutex<Option<RemovalListener>>,
}

impl SubscriptionRegistry {
    /// `name_of` derives the normalized key from a raw event type name;
    /// it must be idempotent.
    pub fn new(name_of: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            name_of: Box::new(name_of),
            removal_listener: Mutex::new(None),
        }
    }

    /// Register the observer notified when an event's **last** handler is
    /// removed. Adapters use this to tear down broker-side routing. At most
    /// one listener; a second registration replaces the first.
    pub fn set_removal_listener(&self, listener: impl Fn(&str) + Send + Sync + 'static) {
        *self.removal_listener.lock().unwrap() = Some(Box::new(listener));
    }

    /// Normalized registry key for a raw event type name.
    pub fn event_key(&self, raw_name: &str) -> String {
        (self.name_of)(raw_name)
    }

    /// Normalized registry key for an event type.
    pub fn event_key_of<E: IntegrationEvent>(&self) -> String {
        self.event_key(E::NAME)
    }

    /// Add a subscription. The first subscription for an event also records
    /// its decoder. Fails when the handler type is already registered for
    /// the event, leaving the registry unchanged.
    pub fn add(&self, descriptor: SubscriptionDescriptor) -> Result<(), SubscriptionError> {
        let key = self.event_key(descriptor.event_name);
        let mut state = self.state.lock().unwrap();

        let subscriptions = state.handlers.entry(key.clone()).or_default();
        if subscriptions
            .iter()
            .any(|s| s.handler.type_id() == descriptor.handler().type_id())
        {
            return Err(SubscriptionError::Duplicate {
                event: key,
                handler: descriptor.handler().name(),
            });
        }

        subscriptions.push(descriptor.subscription);
        state.decoders.entry(key).or_insert(descriptor.decoder);
        Ok(())
    }

    /// Remove a subscription. No-op when the event or handler is unknown.
    /// Removing the last handler for an event drops the decoder entry too
    /// and fires the removal listener exactly once.
    pub fn remove(&self, raw_name: &str, handler: &HandlerIdentity) {
        let key = self.event_key(raw_name);
        let removed_last = {
            let mut state = self.state.lock().unwrap();
            let Some(subscriptions) = state.handlers.get_mut(&key) else {
                return;
            };
            subscriptions.retain(|s| s.handler.type_id() != handler.type_id());
            if subscriptions.is_empty() {
                state.handlers.remove(&key);
                state.decoders.remove(&key);
                true
            } else {
                false
            }
        };

        if removed_last {
            if let Some(listener) = self.removal_listener.lock().unwrap().as_ref() {
                listener(&key);
            }
        }
    }

    pub fn has_subscriptions(&self, name: &str) -> bool {
        let key = self.event_key(name);
        self.state.lock().unwrap().handlers.contains_key(&key)
    }

    /// Snapshot of the handlers registered for an event. Callers are
    /// expected to check `has_subscriptions` first.
    pub fn handlers_for(&self, name: &str) -> Result<Vec<SubscriptionInfo>, SubscriptionError> {
        let key = self.event_key(name);
        self.state
            .lock()
            .unwrap()
            .handlers
            .get(&key)
            .cloned()
            .ok_or(SubscriptionError::UnknownEvent(key))
    }

    /// Decoder for an event's payload, if the event has live subscriptions.
    pub fn decoder_for(&self, name: &str) -> Option<EventDecoder> {
        let key = self.event_key(name);
        self.state.lock().unwrap().decoders.get(&key).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().handlers.is_empty()
    }

    /// Drop all subscriptions. Bulk teardown: no removal notifications.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.handlers.clear();
        state.decoders.clear();
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("SubscriptionRegistry")
            .field("events", &state.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
