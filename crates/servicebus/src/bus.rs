//! Service-Bus-style event bus adapter.
//!
//! Topology: one shared topic (the configured topic name), one subscription
//! entity per subscriber application and event (`"{app}.{EventName}"`),
//! with a correlation rule matching the normalized event name as label.
//! The catch-all default rule is removed on creation so only explicit
//! labels route.
//!
//! Settlement policy: a message is completed only when the dispatch
//! pipeline reports it processed; handler failures and unmatched messages
//! are abandoned, leaving redelivery bounding (delivery count,
//! dead-lettering) to the broker.

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

use crate::transport::{InboundMessage, ServiceBusSession, ServiceBusTransport, DEFAULT_RULE_NAME};

const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct ReceiverPool {
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

struct ServiceBusInner {
    core: BusCore,
    retry: RetryPolicy,
    connection: Arc<ResilientConnection<Arc<dyn ServiceBusSession>>>,
    receivers: Mutex<HashMap<String, ReceiverPool>>,
    disposed: AtomicBool,
}

/// Service-Bus-style implementation of the [`EventBus`] contract.
pub struct ServiceBusEventBus {
    inner: Arc<ServiceBusInner>,
}

impl ServiceBusEventBus {
    /// Build the bus, establish the session and make sure the shared topic
    /// exists. Misconfiguration and exhausted connect retries are fatal here.
    pub fn new(
        config: EventBusConfig,
        resolver: Arc<dyn HandlerResolver>,
        transport: Arc<dyn ServiceBusTransport>,
    ) -> Result<Self, EventBusError> {
        let retry = RetryPolicy::exponential(config.connection_retry_count);
        Self::with_retry_policy(config, resolver, transport, retry)
    }

    /// Like [`new`](Self::new) with an explicit retry policy (tests swap the
    /// sleeper out).
    pub fn with_retry_policy(
        config: EventBusConfig,
        resolver: Arc<dyn HandlerResolver>,
        transport: Arc<dyn ServiceBusTransport>,
        retry: RetryPolicy,
    ) -> Result<Self, EventBusError> {
        let core = BusCore::new(config, resolver)?;

        let connection =
            ResilientConnection::new(retry.clone(), move || transport.connect());
        connection.try_connect()?;

        let inner = Arc::new(ServiceBusInner {
            core,
            retry,
            connection,
            receivers: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        });

        let session = inner.session().map_err(EventBusError::Connectivity)?;
        if !session.topic_exists(inner.core.topic())? {
            info!(topic = %inner.core.topic(), "creating topic");
            session.create_topic(inner.core.topic())?;
        }

        let weak = Arc::downgrade(&inner);
        inner.core.registry().set_removal_listener(move |event_name| {
            if let Some(inner) = weak.upgrade() {
                inner.on_event_removed(event_name);
            }
        });

        Ok(Self { inner })
    }
}

impl EventBus for ServiceBusEventBus {
    fn publish_raw(&self, event_name: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::SeqCst) {
            return Err(PublishError::Disposed);
        }

        inner.ensure_connected()?;
        let session = inner.session().map_err(connectivity_to_publish)?;

        let name = inner.core.event_key(event_name);
        let topic = inner.core.topic().to_string();
        debug!(event = %name, %topic, "publishing event");

        let message = WireMessage::new(name, payload);
        inner
            .retry
            .run(|| session.send(&topic, message.clone()))
            .map_err(connectivity_to_publish)
    }

    fn subscribe_with(&self, subscription: SubscriptionDescriptor) -> Result<(), SubscribeError> {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::SeqCst) {
            return Err(SubscribeError::Disposed);
        }

        let name = inner.core.event_key(subscription.event_name());
        let sub_name = inner.core.subscription_name(&name);

        if !inner.core.registry().has_subscriptions(&name) {
            inner.ensure_connected()?;
            let session = inner.session().map_err(connectivity_to_subscribe)?;
            inner.provision_subscription(&session, &name, &sub_name)?;
        }

        inner.core.registry().add(subscription)?;
        info!(event = %name, subscription = %sub_name, "subscribed");

        ServiceBusInner::ensure_receiver(inner, &sub_name).map_err(connectivity_to_subscribe)?;
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
        // Rule teardown happens through the registry's removal notification
        // once the last handler goes; other handlers keep the rule alive.
        inner.core.registry().remove(&name, &handler);
        Ok(())
    }

    fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("disposing service bus event bus");
        inner.stop_receivers(true);
        inner.core.registry().clear();
        inner.connection.dispose();
    }
}

impl Drop for ServiceBusEventBus {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl ServiceBusInner {
    fn ensure_connected(&self) -> Result<(), ConnectivityError> {
        if !self.connection.is_connected() {
            self.connection.try_connect()?;
        }
        Ok(())
    }

    fn session(&self) -> Result<Arc<dyn ServiceBusSession>, ConnectivityError> {
        self.connection
            .connection()
            .ok_or_else(|| ConnectivityError::Fatal(BrokerError::unreachable("not connected")))
    }

    /// First subscription for an event: make sure the subscription entity
    /// exists (dropping its catch-all default rule) and that a label rule
    /// for the event is in place.
    fn provision_subscription(
        &self,
        session: &Arc<dyn ServiceBusSession>,
        event_name: &str,
        sub_name: &str,
    ) -> Result<(), SubscribeError> {
        let topic = self.core.topic();

        if !session.subscription_exists(topic, sub_name)? {
            info!(subscription = %sub_name, "creating subscription");
            session.create_subscription(topic, sub_name)?;
            match session.remove_rule(topic, sub_name, DEFAULT_RULE_NAME) {
                Ok(()) => {}
                Err(BrokerError::MissingEntity(entity)) => {
                    warn!(%entity, "messaging entity could not be found")
                }
                Err(err) => return Err(err.into()),
            }
        }

        let rule_exists = match session.rule_exists(topic, sub_name, event_name) {
            Ok(exists) => exists,
            // The broker reports a missing container as a missing entity;
            // either way the rule needs creating.
            Err(BrokerError::MissingEntity(_)) => false,
            Err(err) => return Err(err.into()),
        };
        if !rule_exists {
            session.add_label_rule(topic, sub_name, event_name, event_name)?;
        }

        Ok(())
    }

    /// Start the receive worker pool for a subscription unless one is
    /// already running. Pool size is the configured max concurrent
    /// deliveries; workers pull from one shared receiver.
    fn ensure_receiver(this: &Arc<Self>, sub_name: &str) -> Result<(), ConnectivityError> {
        let mut receivers = this.receivers.lock().unwrap();
        if receivers.contains_key(sub_name) {
            return Ok(());
        }

        let session = this.session()?;
        let messages = session
            .receive(this.core.topic(), sub_name)
            .map_err(ConnectivityError::Fatal)?;
        let messages = Arc::new(Mutex::new(messages));

        let stop = Arc::new(AtomicBool::new(false));
        let workers = (0..this.core.config().max_concurrent_deliveries)
            .map(|worker| {
                let weak = Arc::downgrade(this);
                let messages = messages.clone();
                let stop = stop.clone();
                let name = format!("omnibus-sb-{sub_name}-{worker}");
                thread::Builder::new()
                    .name(name)
                    .spawn(move || receive_loop(weak, messages, stop))
                    .expect("failed to spawn receive worker thread")
            })
            .collect();

        receivers.insert(sub_name.to_string(), ReceiverPool { stop, workers });
        Ok(())
    }

    fn handle_message(&self, message: InboundMessage) {
        let outcome = self.core.process(&message.label, &message.body);

        let session = match self.session() {
            Ok(session) => session,
            Err(err) => {
                warn!(%err, message_id = %message.message_id, "cannot settle message; session unavailable");
                return;
            }
        };

        let settle = match outcome {
            Ok(true) => session.complete(&message.lock_token),
            Ok(false) => {
                debug!(
                    event = %message.label,
                    "no local handlers consumed the message; abandoning"
                );
                session.abandon(&message.lock_token)
            }
            Err(err) => {
                error!(
                    event = %message.label,
                    %err,
                    "dispatch failed; abandoning message for redelivery"
                );
                session.abandon(&message.lock_token)
            }
        };

        if let Err(err) = settle {
            warn!(%err, message_id = %message.message_id, "failed to settle message");
        }
    }

    /// Removal-notification observer: drop the event's label rule so the
    /// broker stops routing it here. The receive pool keeps running; other
    /// events may still be served by the same subscription topology.
    fn on_event_removed(&self, event_name: &str) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }

        let session = match self.session() {
            Ok(session) => session,
            Err(err) => {
                warn!(%err, event = %event_name, "cannot tear down rule; session unavailable");
                return;
            }
        };

        let sub_name = self.core.subscription_name(event_name);
        match session.remove_rule(self.core.topic(), &sub_name, event_name) {
            Ok(()) => info!(event = %event_name, subscription = %sub_name, "label rule removed"),
            Err(BrokerError::MissingEntity(entity)) => {
                warn!(%entity, "messaging entity could not be found")
            }
            Err(err) => warn!(%err, subscription = %sub_name, "failed to remove rule"),
        }
    }

    fn stop_receivers(&self, join: bool) {
        let pools: Vec<ReceiverPool> = {
            let mut receivers = self.receivers.lock().unwrap();
            receivers.drain().map(|(_, pool)| pool).collect()
        };

        for pool in pools {
            pool.stop.store(true, Ordering::SeqCst);
            if join {
                for worker in pool.workers {
                    let _ = worker.join();
                }
            }
        }
    }
}

fn receive_loop(
    bus: std::sync::Weak<ServiceBusInner>,
    messages: Arc<Mutex<mpsc::Receiver<InboundMessage>>>,
    stop: Arc<AtomicBool>,
) {
    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let received = {
            let receiver = messages.lock().unwrap();
            receiver.recv_timeout(RECEIVE_POLL_INTERVAL)
        };
        match received {
            Ok(message) => {
                let Some(inner) = bus.upgrade() else { break };
                inner.handle_message(message);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
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
