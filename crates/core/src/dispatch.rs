//! Inbound dispatch pipeline.
//!
//! Turns a raw `(name, bytes)` pair from a broker into handler invocations:
//! normalize the name, look up subscriptions, deserialize the payload once,
//! invoke every registered handler sequentially, and report whether at
//! least one handler consumed the message. Adapters ack/nack based on the
//! outcome.

use std::sync::Arc;

use tracing::{debug, error};

use crate::error::{DispatchError, HandlerInvocationError};
use crate::registry::SubscriptionRegistry;
use crate::resolver::HandlerResolver;

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<SubscriptionRegistry>,
    resolver: Arc<dyn HandlerResolver>,
}

impl Dispatcher {
    pub fn new(registry: Arc<SubscriptionRegistry>, resolver: Arc<dyn HandlerResolver>) -> Self {
        Self { registry, resolver }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Process one inbound message.
    ///
    /// Returns `Ok(false)` when no handler consumed the message, including
    /// the common case of a name with no local subscriptions, which is
    /// normal when several logical buses share a physical topic. Handler
    /// failures are isolated: every handler runs even if an earlier one
    /// raised, and the failures surface together afterwards.
    pub fn process(&self, raw_name: &str, body: &[u8]) -> Result<bool, DispatchError> {
        let name = self.registry.event_key(raw_name);

        if !self.registry.has_subscriptions(&name) {
            debug!(event = %name, "no subscriptions for event; message not processed");
            return Ok(false);
        }

        // Subscriptions imply a registered decoder; a miss here means the
        // registry invariant broke, not a routine lookup failure.
        let decoder = self
            .registry
            .decoder_for(&name)
            .ok_or_else(|| DispatchError::InconsistentRegistry(name.clone()))?;

        let event = decoder(body).map_err(|source| DispatchError::Deserialization {
            event: name.clone(),
            source,
        })?;

        let subscriptions = self
            .registry
            .handlers_for(&name)
            .map_err(|_| DispatchError::InconsistentRegistry(name.clone()))?;

        let mut any_handled = false;
        let mut failures = Vec::new();

        for subscription in subscriptions {
            match subscription.invoke(self.resolver.as_ref(), &event) {
                Ok(true) => any_handled = true,
                Ok(false) => {
                    debug!(
                        event = %name,
                        handler = subscription.handler().name(),
                        "handler not resolved; skipping"
                    );
                }
                Err(source) => {
                    error!(
                        event = %name,
                        handler = subscription.handler().name(),
                        error = %source,
                        "handler failed while processing event"
                    );
                    failures.push(HandlerInvocationError {
                        event: name.clone(),
                        handler: subscription.handler().name(),
                        source,
                    });
                }
            }
        }

        if !failures.is_empty() {
            return Err(DispatchError::Handlers {
                event: name,
                failures,
            });
        }

        Ok(any_handled)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde::{Deserialize, Serialize};

    use crate::event::{IntegrationEvent, IntegrationEventHandler};
    use crate::registry::SubscriptionDescriptor;
    use crate::resolver::HandlerRegistry;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct StockReplenishedIntegrationEvent {
        sku: String,
        quantity: u32,
    }

    impl IntegrationEvent for StockReplenishedIntegrationEvent {
        const NAME: &'static str = "StockReplenishedIntegrationEvent";
    }

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicUsize,
    }

    impl IntegrationEventHandler<StockReplenishedIntegrationEvent> for Arc<CountingHandler> {
        fn handle(&self, event: &StockReplenishedIntegrationEvent) -> anyhow::Result<()> {
            assert_eq!(event.sku, "SKU-1");
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FailingHandler {
        calls: AtomicUsize,
    }

    impl IntegrationEventHandler<StockReplenishedIntegrationEvent> for Arc<FailingHandler> {
        fn handle(&self, _event: &StockReplenishedIntegrationEvent) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("projection store unavailable")
        }
    }

    struct UnresolvedHandler;

    impl IntegrationEventHandler<StockReplenishedIntegrationEvent> for UnresolvedHandler {
        fn handle(&self, _event: &StockReplenishedIntegrationEvent) -> anyhow::Result<()> {
            panic!("never resolved, never invoked");
        }
    }

    fn registry() -> Arc<SubscriptionRegistry> {
        Arc::new(SubscriptionRegistry::new(|raw| {
            raw.trim_end_matches(|c: char| "IntegrationEvent".contains(c))
                .to_string()
        }))
    }

    fn payload() -> Vec<u8> {
        serde_json::to_vec(&StockReplenishedIntegrationEvent {
            sku: "SKU-1".to_string(),
            quantity: 7,
        })
        .unwrap()
    }

    #[test]
    fn unmatched_event_is_not_processed_and_not_an_error() {
        let dispatcher = Dispatcher::new(registry(), Arc::new(HandlerRegistry::new()));
        let processed = dispatcher.process("NobodyListens", b"not even json").unwrap();
        assert!(!processed);
    }

    #[test]
    fn invokes_every_registered_handler_once() {
        let registry = registry();
        let handler = Arc::new(CountingHandler::default());
        let mut resolver = HandlerRegistry::new();
        resolver.register::<StockReplenishedIntegrationEvent, Arc<CountingHandler>>(handler.clone());

        registry
            .add(SubscriptionDescriptor::of::<StockReplenishedIntegrationEvent, Arc<CountingHandler>>())
            .unwrap();
        // A handler the resolver knows nothing about is skipped, not fatal.
        registry
            .add(SubscriptionDescriptor::of::<StockReplenishedIntegrationEvent, UnresolvedHandler>())
            .unwrap();

        let dispatcher = Dispatcher::new(registry, Arc::new(resolver));
        let processed = dispatcher
            .process(StockReplenishedIntegrationEvent::NAME, &payload())
            .unwrap();

        assert!(processed);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn raw_and_normalized_names_dispatch_to_the_same_handlers() {
        let registry = registry();
        let handler = Arc::new(CountingHandler::default());
        let mut resolver = HandlerRegistry::new();
        resolver.register::<StockReplenishedIntegrationEvent, Arc<CountingHandler>>(handler.clone());

        registry
            .add(SubscriptionDescriptor::of::<StockReplenishedIntegrationEvent, Arc<CountingHandler>>())
            .unwrap();

        let dispatcher = Dispatcher::new(registry, Arc::new(resolver));
        assert!(dispatcher.process("StockReplenished", &payload()).unwrap());
        assert!(dispatcher
            .process(StockReplenishedIntegrationEvent::NAME, &payload())
            .unwrap());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn handler_failure_does_not_stop_the_others() {
        let registry = registry();
        let ok_handler = Arc::new(CountingHandler::default());
        let bad_handler = Arc::new(FailingHandler::default());
        let mut resolver = HandlerRegistry::new();
        resolver.register::<StockReplenishedIntegrationEvent, Arc<FailingHandler>>(bad_handler.clone());
        resolver.register::<StockReplenishedIntegrationEvent, Arc<CountingHandler>>(ok_handler.clone());

        // Failing handler first: the second must still run.
        registry
            .add(SubscriptionDescriptor::of::<StockReplenishedIntegrationEvent, Arc<FailingHandler>>())
            .unwrap();
        registry
            .add(SubscriptionDescriptor::of::<StockReplenishedIntegrationEvent, Arc<CountingHandler>>())
            .unwrap();

        let dispatcher = Dispatcher::new(registry, Arc::new(resolver));
        let err = dispatcher
            .process(StockReplenishedIntegrationEvent::NAME, &payload())
            .unwrap_err();

        assert_eq!(ok_handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(bad_handler.calls.load(Ordering::SeqCst), 1);
        match err {
            DispatchError::Handlers { failures, .. } => assert_eq!(failures.len(), 1),
            other => panic!("expected handler failure, got {other:?}"),
        }
    }

    #[test]
    fn undecodable_payload_is_a_deserialization_error() {
        let registry = registry();
        let mut resolver = HandlerRegistry::new();
        resolver.register::<StockReplenishedIntegrationEvent, Arc<CountingHandler>>(Arc::new(
            CountingHandler::default(),
        ));
        registry
            .add(SubscriptionDescriptor::of::<StockReplenishedIntegrationEvent, Arc<CountingHandler>>())
            .unwrap();

        let dispatcher = Dispatcher::new(registry, Arc::new(resolver));
        let err = dispatcher
            .process(StockReplenishedIntegrationEvent::NAME, b"{broken")
            .unwrap_err();
        assert!(matches!(err, DispatchError::Deserialization { .. }));
    }

    #[test]
    fn all_handlers_unresolved_reports_not_processed() {
        let registry = registry();
        registry
            .add(SubscriptionDescriptor::of::<StockReplenishedIntegrationEvent, UnresolvedHandler>())
            .unwrap();

        let dispatcher = Dispatcher::new(registry, Arc::new(HandlerRegistry::new()));
        let processed = dispatcher
            .process(StockReplenishedIntegrationEvent::NAME, &payload())
            .unwrap();
        assert!(!processed);
    }
}
