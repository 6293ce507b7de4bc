//! AMQP-style event bus adapter.
//!
//! Topology: one shared direct exchange (the configured topic name), one
//! durable queue per subscriber application and event
//! (`"{app}.{EventName}"`), bound with the normalized event name as routing
//! key. One consume-loop thread runs per consumed queue.
//!
//! Acknowledgement policy (at-least-once): a delivery is acked only when
//! the dispatch pipeline reports it processed. Handler failures nack with
//! requeue so the broker redelivers; deliveries with no local handlers nack
//! without requeue so shared-topic strays dead-letter instead of spinning.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use omnibus_core::{
    BrokerError, BusCore, ConnectivityError, EventBus, EventBusConfig, EventBusError,
    HandlerIdentity, HandlerResolver, PublishError, ResilientConnection, RetryPolicy,
    SubscribeError, SubscriptionDescriptor, WireMessage,
};

use crate::transport::{AmqpChannel, AmqpConnection, AmqpDelivery, AmqpTransport};

const CONSUME_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct ConsumerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<JoinHandle<()>>,
}

struct AmqpBusInner {
    core: BusCore,
    retry: RetryPolicy,
    connection: Arc<ResilientConnection<Arc<dyn AmqpConnection>>>,
    /// Shared consumer channel, reopened lazily after faults.
    channel: Mutex<Option<Arc<dyn AmqpChannel>>>,
    consumers: Mutex<HashMap<String, ConsumerHandle>>,
    disposed: AtomicBool,
}

/// AMQP-style implementation of the [`EventBus`] contract.
pub struct AmqpEventBus {
    inner: Arc<AmqpBusInner>,
}

impl AmqpEventBus {
    /// Build the bus and eagerly establish the connection, consumer channel
    /// and exchange. Misconfiguration and exhausted connect retries are
    /// fatal here.
    pub fn new(
        config: EventBusConfig,
        resolver: Arc<dyn HandlerResolver>,
        transport: Arc<dyn AmqpTransport>,
    ) -> Result<Self, EventBusError> {
        let retry = RetryPolicy::exponential(config.connection_retry_count);
        Self::with_retry_policy(config, resolver, transport, retry)
    }

    /// Like [`new`](Self::new) with an explicit retry policy (tests swap the
    /// sleeper out).
    pub fn with_retry_policy(
        config: EventBusConfig,
        resolver: Arc<dyn HandlerResolver>,
        transport: Arc<dyn AmqpTransport>,
        retry: RetryPolicy,
    ) -> Result<Self, EventBusError> {
        let core = BusCore::new(config, resolver)?;

        let connection =
            ResilientConnection::new(retry.clone(), move || transport.connect());
        connection.try_connect()?;

        let inner = Arc::new(AmqpBusInner {
            core,
            retry,
            connection,
            channel: Mutex::new(None),
            consumers: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        });
        inner.ensure_channel()?;

        let weak = Arc::downgrade(&inner);
        inner.core.registry().set_removal_listener(move |event_name| {
            if let Some(inner) = weak.upgrade() {
                inner.on_event_removed(event_name);
            }
        });

        Ok(Self { inner })
    }
}

impl EventBus for AmqpEventBus {
    fn publish_raw(&self, event_name: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::SeqCst) {
            return Err(PublishError::Disposed);
        }

        inner.ensure_connected()?;

        let name = inner.core.event_key(event_name);
        let queue = inner.core.subscription_name(&name);
        let topic = inner.core.topic().to_string();
        let channel = inner.ensure_channel().map_err(connectivity_to_publish)?;

        debug!(event = %name, exchange = %topic, "publishing event");

        let message = WireMessage::new(name.clone(), payload);
        inner
            .retry
            .run(|| {
                channel.declare_queue(&queue)?;
                channel.publish(&topic, &name, message.clone())
            })
            .map_err(connectivity_to_publish)
    }

    fn subscribe_with(&self, subscription: SubscriptionDescriptor) -> Result<(), SubscribeError> {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::SeqCst) {
            return Err(SubscribeError::Disposed);
        }

        let name = inner.core.event_key(subscription.event_name());
        let queue = inner.core.subscription_name(&name);

        if !inner.core.registry().has_subscriptions(&name) {
            inner.ensure_connected()?;
            let channel = inner.ensure_channel().map_err(connectivity_to_subscribe)?;
            channel.declare_queue(&queue)?;
            channel.bind_queue(&queue, inner.core.topic(), &name)?;
        }

        inner.core.registry().add(subscription)?;
        info!(event = %name, queue = %queue, "subscribed");

        AmqpBusInner::ensure_consumer(inner, &queue).map_err(connectivity_to_subscribe)?;
        Ok(())
    }

    fn unsubscribe_from(
        &self,
        event_name: &str,
        handler: HandlerIdentity,
    ) -> Result<(), SubscribeError> {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::SeqCst) {
            return Err(SubscribeError::Disposed);
        }

        let name = inner.core.event_key(event_name);
        info!(event = %name, handler = handler.name(), "unsubscribing");
        // Broker-side teardown happens through the registry's removal
        // notification once the last handler goes.
        inner.core.registry().remove(&name, &handler);
        Ok(())
    }

    fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("disposing amqp event bus");
        inner.stop_consumers(true);
        inner.core.registry().clear();
        if let Some(channel) = inner.channel.lock().unwrap().take() {
            if let Err(err) = channel.close() {
                warn!(%err, "failed to close consumer channel");
            }
        }
        inner.connection.dispose();
    }
}

impl Drop for AmqpEventBus {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl AmqpBusInner {
    fn ensure_connected(&self) -> Result<(), ConnectivityError> {
        if !self.connection.is_connected() {
            self.connection.try_connect()?;
        }
        Ok(())
    }

    /// Return the live consumer channel, reopening it (and redeclaring the
    /// exchange) if the previous one died with a faulted connection.
    fn ensure_channel(&self) -> Result<Arc<dyn AmqpChannel>, ConnectivityError> {
        let mut guard = self.channel.lock().unwrap();
        if let Some(channel) = guard.as_ref() {
            if channel.is_open() {
                return Ok(channel.clone());
            }
        }

        let connection = self
            .connection
            .connection()
            .ok_or_else(|| ConnectivityError::Fatal(BrokerError::unreachable("not connected")))?;
        let channel = connection
            .open_channel()
            .map_err(ConnectivityError::Fatal)?;
        channel
            .declare_exchange(self.core.topic())
            .map_err(ConnectivityError::Fatal)?;

        *guard = Some(channel.clone());
        Ok(channel)
    }

    /// Start the consume loop for a queue unless one is already running.
    fn ensure_consumer(this: &Arc<Self>, queue: &str) -> Result<(), ConnectivityError> {
        let mut consumers = this.consumers.lock().unwrap();
        if consumers.contains_key(queue) {
            return Ok(());
        }

        let channel = this.ensure_channel()?;
        let deliveries = channel.consume(queue).map_err(ConnectivityError::Fatal)?;

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let weak = Arc::downgrade(this);
        let queue_name = queue.to_string();
        let join = thread::Builder::new()
            .name(format!("omnibus-amqp-{queue}"))
            .spawn(move || consume_loop(weak, queue_name, deliveries, shutdown_rx))
            .expect("failed to spawn consume loop thread");

        consumers.insert(
            queue.to_string(),
            ConsumerHandle {
                shutdown: shutdown_tx,
                join: Some(join),
            },
        );
        Ok(())
    }

    fn handle_delivery(&self, delivery: AmqpDelivery) {
        let outcome = self.core.process(&delivery.routing_key, &delivery.body);

        let channel = match self.ensure_channel() {
            Ok(channel) => channel,
            Err(err) => {
                warn!(%err, delivery_tag = delivery.delivery_tag, "cannot settle delivery; channel unavailable");
                return;
            }
        };

        let settle = match outcome {
            Ok(true) => channel.ack(delivery.delivery_tag),
            Ok(false) => {
                debug!(
                    event = %delivery.routing_key,
                    "no local handlers consumed the message; dropping without requeue"
                );
                channel.nack(delivery.delivery_tag, false)
            }
            Err(err) => {
                error!(
                    event = %delivery.routing_key,
                    %err,
                    "dispatch failed; returning message for redelivery"
                );
                channel.nack(delivery.delivery_tag, true)
            }
        };

        if let Err(err) = settle {
            warn!(%err, delivery_tag = delivery.delivery_tag, "failed to settle delivery");
        }
    }

    /// Removal-notification observer: the event's last handler is gone, so
    /// stop routing its messages here. The consume loop keeps running; other
    /// events may still be served by the shared channel.
    fn on_event_removed(&self, event_name: &str) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }

        if let Err(err) = self.ensure_connected() {
            warn!(%err, event = %event_name, "cannot tear down routing; broker unreachable");
            return;
        }
        let channel = match self.ensure_channel() {
            Ok(channel) => channel,
            Err(err) => {
                warn!(%err, event = %event_name, "cannot tear down routing; channel unavailable");
                return;
            }
        };

        let queue = self.core.subscription_name(event_name);
        match channel.unbind_queue(&queue, self.core.topic(), event_name) {
            Ok(()) => info!(event = %event_name, queue = %queue, "queue binding removed"),
            Err(BrokerError::MissingEntity(entity)) => {
                warn!(%entity, "messaging entity not found during unbind")
            }
            Err(err) => warn!(%err, queue = %queue, "failed to unbind queue"),
        }

        if self.core.registry().is_empty() {
            debug!("no subscriptions remain; closing consumer channel");
            self.stop_consumers(false);
            if let Err(err) = channel.close() {
                warn!(%err, "failed to close consumer channel");
            }
            *self.channel.lock().unwrap() = None;
        }
    }

    /// Signal every consume loop to stop; optionally wait for them. Joining
    /// is skipped on the removal-notification path, which may run on a
    /// consume-loop thread itself.
    fn stop_consumers(&self, join: bool) {
        let handles: Vec<ConsumerHandle> = {
            let mut consumers = self.consumers.lock().unwrap();
            consumers.drain().map(|(_, handle)| handle).collect()
        };

        for mut handle in handles {
            let _ = handle.shutdown.send(());
            if join {
                if let Some(join_handle) = handle.join.take() {
                    let _ = join_handle.join();
                }
            }
        }
    }
}

fn consume_loop(
    bus: std::sync::Weak<AmqpBusInner>,
    queue: String,
    deliveries: mpsc::Receiver<AmqpDelivery>,
    shutdown: mpsc::Receiver<()>,
) {
    debug!(%queue, "consume loop started");
    loop {
        if shutdown.try_recv().is_ok() {
            break;
        }
        match deliveries.recv_timeout(CONSUME_POLL_INTERVAL) {
            Ok(delivery) => {
                let Some(inner) = bus.upgrade() else { break };
                inner.handle_delivery(delivery);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(%queue, "consume loop stopped");
}

fn connectivity_to_publish(err: ConnectivityError) -> PublishError {
    match err {
        ConnectivityError::Fatal(broker) => PublishError::Broker(broker),
        other => PublishError::Connectivity(other),
    }
}

fn connectivity_to_subscribe(err: ConnectivityError) -> SubscribeError {
    match err {
        ConnectivityError::Fatal(broker) => SubscribeError::Broker(broker),
        other => SubscribeError::Connectivity(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use serde::{Deserialize, Serialize};

    use omnibus_core::{
        EventBusExt, HandlerRegistry, IntegrationEvent, IntegrationEventHandler,
    };

    use crate::memory::InMemoryAmqp;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderCreatedIntegrationEvent {
        order_id: u64,
        total_cents: i64,
    }

    impl IntegrationEvent for OrderCreatedIntegrationEvent {
        const NAME: &'static str = "OrderCreatedIntegrationEvent";
    }

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<OrderCreatedIntegrationEvent>>,
    }

    impl IntegrationEventHandler<OrderCreatedIntegrationEvent> for Arc<RecordingHandler> {
        fn handle(&self, event: &OrderCreatedIntegrationEvent) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FlakyHandler {
        calls: AtomicUsize,
    }

    impl IntegrationEventHandler<OrderCreatedIntegrationEvent> for Arc<FlakyHandler> {
        fn handle(&self, _event: &OrderCreatedIntegrationEvent) -> anyhow::Result<()> {
            // Fails on the first delivery only; redelivery succeeds.
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("transient projection failure");
            }
            Ok(())
        }
    }

    fn test_config() -> EventBusConfig {
        EventBusConfig::new("orders").strip_suffix("IntegrationEvent")
    }

    fn quiet_retry() -> RetryPolicy {
        RetryPolicy::exponential(5).with_sleeper(|_| {})
    }

    fn bus_with(
        transport: &Arc<InMemoryAmqp>,
        resolver: HandlerRegistry,
    ) -> AmqpEventBus {
        AmqpEventBus::with_retry_policy(
            test_config(),
            Arc::new(resolver),
            transport.clone(),
            quiet_retry(),
        )
        .unwrap()
    }

    fn wait_until(deadline: Duration, cond: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn invalid_config_is_fatal_at_construction() {
        let transport: Arc<InMemoryAmqp> = Arc::new(InMemoryAmqp::new());
        let result = AmqpEventBus::new(
            EventBusConfig::new(""),
            Arc::new(HandlerRegistry::new()),
            transport,
        );
        assert!(matches!(result, Err(EventBusError::Configuration(_))));
    }

    #[test]
    fn construction_retries_transient_connect_failures() {
        let transport = Arc::new(InMemoryAmqp::new());
        transport.fail_next_connects(2);

        let bus = bus_with(&transport, HandlerRegistry::new());
        drop(bus);
        assert_eq!(transport.connect_attempts(), 3);
    }

    #[test]
    fn subscribe_provisions_queue_binding_and_consumer() {
        let transport = Arc::new(InMemoryAmqp::new());
        let mut resolver = HandlerRegistry::new();
        resolver.register::<OrderCreatedIntegrationEvent, Arc<RecordingHandler>>(Arc::new(
            RecordingHandler::default(),
        ));
        let bus = bus_with(&transport, resolver);

        bus.subscribe::<OrderCreatedIntegrationEvent, Arc<RecordingHandler>>()
            .unwrap();

        assert!(transport.queue_declared("orders.OrderCreated"));
        assert!(transport.has_binding("omnibus.events", "orders.OrderCreated", "OrderCreated"));
        assert!(transport.has_consumers("orders.OrderCreated"));
    }

    #[test]
    fn published_event_reaches_the_handler_and_is_acked() {
        let transport = Arc::new(InMemoryAmqp::new());
        let handler = Arc::new(RecordingHandler::default());
        let mut resolver = HandlerRegistry::new();
        resolver.register::<OrderCreatedIntegrationEvent, Arc<RecordingHandler>>(handler.clone());
        let bus = bus_with(&transport, resolver);

        bus.subscribe::<OrderCreatedIntegrationEvent, Arc<RecordingHandler>>()
            .unwrap();

        let event = OrderCreatedIntegrationEvent {
            order_id: 7,
            total_cents: 1299,
        };
        bus.publish(&event).unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            transport.acked_count() == 1
        }));
        assert_eq!(handler.seen.lock().unwrap().as_slice(), &[event]);
    }

    #[test]
    fn duplicate_subscription_is_rejected() {
        let transport = Arc::new(InMemoryAmqp::new());
        let bus = bus_with(&transport, HandlerRegistry::new());

        bus.subscribe::<OrderCreatedIntegrationEvent, Arc<RecordingHandler>>()
            .unwrap();
        let err = bus
            .subscribe::<OrderCreatedIntegrationEvent, Arc<RecordingHandler>>()
            .unwrap_err();
        assert!(matches!(err, SubscribeError::Subscription(_)));
    }

    #[test]
    fn handler_failure_nacks_for_redelivery_and_recovers() {
        let transport = Arc::new(InMemoryAmqp::new());
        let handler = Arc::new(FlakyHandler::default());
        let mut resolver = HandlerRegistry::new();
        resolver.register::<OrderCreatedIntegrationEvent, Arc<FlakyHandler>>(handler.clone());
        let bus = bus_with(&transport, resolver);

        bus.subscribe::<OrderCreatedIntegrationEvent, Arc<FlakyHandler>>()
            .unwrap();
        bus.publish(&OrderCreatedIntegrationEvent {
            order_id: 1,
            total_cents: 100,
        })
        .unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            transport.acked_count() == 1
        }));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(transport.redelivery_count(), 1);
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct InvoicePaidIntegrationEvent {
        invoice_id: u64,
    }

    impl IntegrationEvent for InvoicePaidIntegrationEvent {
        const NAME: &'static str = "InvoicePaidIntegrationEvent";
    }

    struct InvoiceHandler;

    impl IntegrationEventHandler<InvoicePaidIntegrationEvent> for InvoiceHandler {
        fn handle(&self, _event: &InvoicePaidIntegrationEvent) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn unmatched_delivery_is_dropped_without_requeue() {
        let transport = Arc::new(InMemoryAmqp::new());
        let bus = bus_with(&transport, HandlerRegistry::new());

        // A second live subscription keeps the shared channel and its
        // consume loops running after OrderCreated's handler is removed.
        bus.subscribe::<InvoicePaidIntegrationEvent, InvoiceHandler>()
            .unwrap();
        bus.subscribe::<OrderCreatedIntegrationEvent, Arc<RecordingHandler>>()
            .unwrap();
        bus.unsubscribe::<OrderCreatedIntegrationEvent, Arc<RecordingHandler>>()
            .unwrap();

        // Rebind manually: the message still lands in the consumed queue,
        // but dispatch finds no subscriptions for it.
        let connection = transport.connect().unwrap();
        let channel = connection.open_channel().unwrap();
        channel
            .bind_queue("orders.OrderCreated", "omnibus.events", "OrderCreated")
            .unwrap();

        bus.publish(&OrderCreatedIntegrationEvent {
            order_id: 2,
            total_cents: 50,
        })
        .unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            transport.dead_lettered_count() == 1
        }));
        assert_eq!(transport.acked_count(), 0);
    }

    #[test]
    fn publish_retries_transient_send_failures() {
        let transport = Arc::new(InMemoryAmqp::new());
        let handler = Arc::new(RecordingHandler::default());
        let mut resolver = HandlerRegistry::new();
        resolver.register::<OrderCreatedIntegrationEvent, Arc<RecordingHandler>>(handler.clone());
        let bus = bus_with(&transport, resolver);

        bus.subscribe::<OrderCreatedIntegrationEvent, Arc<RecordingHandler>>()
            .unwrap();

        transport.fail_next_publishes(2);
        bus.publish(&OrderCreatedIntegrationEvent {
            order_id: 3,
            total_cents: 10,
        })
        .unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            transport.acked_count() == 1
        }));
    }

    #[test]
    fn unsubscribing_one_of_two_handlers_keeps_the_binding() {
        let transport = Arc::new(InMemoryAmqp::new());
        let recording = Arc::new(RecordingHandler::default());
        let mut resolver = HandlerRegistry::new();
        resolver.register::<OrderCreatedIntegrationEvent, Arc<RecordingHandler>>(recording.clone());
        resolver.register::<OrderCreatedIntegrationEvent, Arc<FlakyHandler>>(Arc::new(
            FlakyHandler::default(),
        ));
        let bus = bus_with(&transport, resolver);

        bus.subscribe::<OrderCreatedIntegrationEvent, Arc<RecordingHandler>>()
            .unwrap();
        bus.subscribe::<OrderCreatedIntegrationEvent, Arc<FlakyHandler>>()
            .unwrap();

        bus.unsubscribe::<OrderCreatedIntegrationEvent, Arc<FlakyHandler>>()
            .unwrap();

        assert!(transport.has_binding("omnibus.events", "orders.OrderCreated", "OrderCreated"));
    }

    #[test]
    fn removing_the_last_handler_unbinds_the_queue() {
        let transport = Arc::new(InMemoryAmqp::new());
        let bus = bus_with(&transport, HandlerRegistry::new());

        bus.subscribe::<OrderCreatedIntegrationEvent, Arc<RecordingHandler>>()
            .unwrap();
        assert!(transport.has_binding("omnibus.events", "orders.OrderCreated", "OrderCreated"));

        bus.unsubscribe::<OrderCreatedIntegrationEvent, Arc<RecordingHandler>>()
            .unwrap();
        assert!(!transport.has_binding("omnibus.events", "orders.OrderCreated", "OrderCreated"));
    }

    #[test]
    fn dispose_is_idempotent_and_blocks_further_use() {
        let transport = Arc::new(InMemoryAmqp::new());
        let bus = bus_with(&transport, HandlerRegistry::new());
        bus.subscribe::<OrderCreatedIntegrationEvent, Arc<RecordingHandler>>()
            .unwrap();

        bus.dispose();
        bus.dispose();

        assert!(matches!(
            bus.publish(&OrderCreatedIntegrationEvent {
                order_id: 4,
                total_cents: 1,
            }),
            Err(PublishError::Disposed)
        ));
        assert!(matches!(
            bus.subscribe::<OrderCreatedIntegrationEvent, Arc<RecordingHandler>>(),
            Err(SubscribeError::Disposed)
        ));
    }
}
