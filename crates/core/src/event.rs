//! Integration event and handler contracts.

use std::any::{type_name, TypeId};

use anyhow::Result as HandlerResult;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An integration event: a named, serializable fact published onto the bus.
///
/// Events are immutable once constructed. `NAME` is the raw type identity
/// the wire name is derived from (prefix/suffix stripping happens at the
/// bus boundary, see [`crate::naming`]); it must be stable across releases
/// because the receiving side routes on it.
pub trait IntegrationEvent:
    Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Stable raw event type name, e.g. `"OrderCreatedIntegrationEvent"`.
    const NAME: &'static str;
}

/// Common metadata events may embed (`#[serde(flatten)]` works well).
///
/// Mirrors the usual "event id + business time" pair; the bus itself never
/// inspects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub id: Uuid,
    pub occurred_at: DateTime<Utc>,
}

impl EventMetadata {
    pub fn new() -> Self {
        Self {
            id: Uuid::now_v7(),
            occurred_at: Utc::now(),
        }
    }
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// Application logic reacting to one event type.
///
/// Handlers are registered by **type**, not by instance: dispatch resolves
/// an instance through the [`crate::resolver::HandlerResolver`] capability
/// on every delivery, so handler lifetime stays with the application (or
/// its DI container), not with the bus.
pub trait IntegrationEventHandler<E: IntegrationEvent>: Send + Sync + 'static {
    fn handle(&self, event: &E) -> HandlerResult<()>;
}

/// Type identity of a handler, usable as a registry key and in log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerIdentity {
    type_id: TypeId,
    name: &'static str,
}

impl HandlerIdentity {
    pub fn of<H: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<H>(),
            name: type_name::<H>(),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Fully qualified type name; for diagnostics only.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PingHandler;
    struct PongHandler;

    #[test]
    fn handler_identity_distinguishes_types() {
        assert_eq!(HandlerIdentity::of::<PingHandler>(), HandlerIdentity::of::<PingHandler>());
        assert_ne!(HandlerIdentity::of::<PingHandler>(), HandlerIdentity::of::<PongHandler>());
    }

    #[test]
    fn metadata_ids_are_unique() {
        assert_ne!(EventMetadata::new().id, EventMetadata::new().id);
    }
}
