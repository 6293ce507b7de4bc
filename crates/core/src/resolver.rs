//! Handler resolution capability.
//!
//! The bus never constructs handlers. It asks a resolver for an instance by
//! type identity on every delivery; a resolver that returns `None` simply
//! causes that handler to be skipped for the message.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use crate::event::{HandlerIdentity, IntegrationEvent, IntegrationEventHandler};

/// Resolve a handler instance by type identity.
///
/// This is the seam a DI container plugs into. The returned value must be
/// the handler type the `TypeId` names; dispatch downcasts it and skips the
/// handler (with a warning) if the types do not line up.
pub trait HandlerResolver: Send + Sync + 'static {
    fn resolve(&self, handler: TypeId) -> Option<std::sync::Arc<dyn Any + Send + Sync>>;
}

/// Map-backed resolver for applications without a DI container, and for tests.
///
/// Instances are registered up front and shared (`Arc`) across deliveries.
#[derive(Default)]
pub struct HandlerRegistry {
    instances: HashMap<TypeId, std::sync::Arc<dyn Any + Send + Sync>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler instance for resolution by its concrete type.
    ///
    /// Re-registering the same type replaces the previous instance.
    pub fn register<E, H>(&mut self, handler: H) -> &mut Self
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.instances
            .insert(TypeId::of::<H>(), std::sync::Arc::new(handler));
        self
    }

    pub fn contains(&self, handler: &HandlerIdentity) -> bool {
        self.instances.contains_key(&handler.type_id())
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl HandlerResolver for HandlerRegistry {
    fn resolve(&self, handler: TypeId) -> Option<std::sync::Arc<dyn Any + Send + Sync>> {
        self.instances.get(&handler).cloned()
    }
}
