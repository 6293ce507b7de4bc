//! In-memory Service-Bus broker for tests and development.
//!
//! Models topics, subscription entities with label rules (including the
//! catch-all default rule new subscriptions start with), lock-token
//! settlement, abandon-redelivery with a delivery-count cap, and
//! connect/send fault injection.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use uuid::Uuid;

use omnibus_core::{BrokerError, ConnectionFault, FaultListener, ManagedConnection, WireMessage};

use crate::transport::{InboundMessage, ServiceBusSession, ServiceBusTransport, DEFAULT_RULE_NAME};

const DEFAULT_MAX_DELIVERY_COUNT: u32 = 10;

#[derive(Default)]
struct SubscriptionState {
    /// rule name -> label filter; the default rule matches every label.
    rules: HashMap<String, String>,
    consumers: Vec<mpsc::Sender<InboundMessage>>,
    backlog: VecDeque<InboundMessage>,
    locked: HashMap<String, InboundMessage>,
}

impl SubscriptionState {
    fn matches(&self, label: &str) -> bool {
        self.rules
            .iter()
            .any(|(name, filter)| name == DEFAULT_RULE_NAME || filter == label)
    }
}

#[derive(Default)]
struct TopicState {
    subscriptions: HashMap<String, SubscriptionState>,
}

struct NamespaceState {
    topics: Mutex<HashMap<String, TopicState>>,
    /// lock token -> (topic, subscription), for settlement lookups.
    locks: Mutex<HashMap<String, (String, String)>>,
    completed: Mutex<Vec<InboundMessage>>,
    dead_lettered: Mutex<Vec<InboundMessage>>,
    abandoned: AtomicU64,
    fail_next_sends: AtomicU32,
    max_delivery_count: u32,
}

impl NamespaceState {
    fn new(max_delivery_count: u32) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            completed: Mutex::new(Vec::new()),
            dead_lettered: Mutex::new(Vec::new()),
            abandoned: AtomicU64::new(0),
            fail_next_sends: AtomicU32::new(0),
            max_delivery_count,
        }
    }

    fn deliver(subscription: &mut SubscriptionState, message: InboundMessage) {
        let mut message = Some(message);
        subscription.consumers.retain(|tx| match message.take() {
            Some(m) => match tx.send(m) {
                Ok(()) => true,
                Err(mpsc::SendError(m)) => {
                    message = Some(m);
                    false
                }
            },
            None => true,
        });
        if let Some(m) = message {
            subscription.backlog.push_back(m);
        }
    }

    fn send(&self, topic: &str, message: WireMessage) -> Result<(), BrokerError> {
        let pending_failures = self.fail_next_sends.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.fail_next_sends.store(pending_failures - 1, Ordering::SeqCst);
            return Err(BrokerError::unreachable("injected send failure"));
        }

        let mut topics = self.topics.lock().unwrap();
        let Some(topic_state) = topics.get_mut(topic) else {
            return Err(BrokerError::missing_entity(topic));
        };

        let mut locks = self.locks.lock().unwrap();
        for (sub_name, subscription) in topic_state.subscriptions.iter_mut() {
            if !subscription.matches(&message.label) {
                continue;
            }
            let lock_token = Uuid::now_v7().to_string();
            let inbound = InboundMessage {
                message_id: message.message_id.to_string(),
                label: message.label.clone(),
                body: message.body.clone(),
                lock_token: lock_token.clone(),
                delivery_count: 1,
            };
            subscription.locked.insert(lock_token.clone(), inbound.clone());
            locks.insert(lock_token, (topic.to_string(), sub_name.clone()));
            Self::deliver(subscription, inbound);
        }
        Ok(())
    }

    fn complete(&self, lock_token: &str) -> Result<(), BrokerError> {
        let Some((topic, sub_name)) = self.locks.lock().unwrap().remove(lock_token) else {
            return Err(BrokerError::missing_entity(lock_token));
        };
        let mut topics = self.topics.lock().unwrap();
        if let Some(subscription) = topics
            .get_mut(&topic)
            .and_then(|t| t.subscriptions.get_mut(&sub_name))
        {
            if let Some(message) = subscription.locked.remove(lock_token) {
                self.completed.lock().unwrap().push(message);
            }
        }
        Ok(())
    }

    fn abandon(&self, lock_token: &str) -> Result<(), BrokerError> {
        let location = self.locks.lock().unwrap().get(lock_token).cloned();
        let Some((topic, sub_name)) = location else {
            return Err(BrokerError::missing_entity(lock_token));
        };

        self.abandoned.fetch_add(1, Ordering::SeqCst);

        let mut topics = self.topics.lock().unwrap();
        let Some(subscription) = topics
            .get_mut(&topic)
            .and_then(|t| t.subscriptions.get_mut(&sub_name))
        else {
            return Ok(());
        };
        let Some(mut message) = subscription.locked.remove(lock_token) else {
            return Ok(());
        };

        message.delivery_count += 1;
        if message.delivery_count > self.max_delivery_count {
            self.locks.lock().unwrap().remove(lock_token);
            self.dead_lettered.lock().unwrap().push(message);
            return Ok(());
        }

        subscription.locked.insert(lock_token.to_string(), message.clone());
        Self::deliver(subscription, message);
        Ok(())
    }
}

pub struct InMemoryServiceBusSession {
    namespace: Arc<NamespaceState>,
    open: AtomicBool,
    listeners: Mutex<Vec<FaultListener>>,
}

impl InMemoryServiceBusSession {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::unreachable("session is closed"))
        }
    }

    /// Simulate a broker-side fault: the session drops and every registered
    /// fault listener fires.
    pub fn fault(&self, fault: ConnectionFault) {
        self.open.store(false, Ordering::SeqCst);
        for listener in self.listeners.lock().unwrap().iter() {
            listener(fault);
        }
    }
}

impl ManagedConnection for InMemoryServiceBusSession {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn on_fault(&self, listener: FaultListener) {
        self.listeners.lock().unwrap().push(listener);
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

impl ServiceBusSession for InMemoryServiceBusSession {
    fn topic_exists(&self, topic: &str) -> Result<bool, BrokerError> {
        self.ensure_open()?;
        Ok(self.namespace.topics.lock().unwrap().contains_key(topic))
    }

    fn create_topic(&self, topic: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.namespace
            .topics
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_default();
        Ok(())
    }

    fn subscription_exists(&self, topic: &str, subscription: &str) -> Result<bool, BrokerError> {
        self.ensure_open()?;
        let topics = self.namespace.topics.lock().unwrap();
        match topics.get(topic) {
            Some(t) => Ok(t.subscriptions.contains_key(subscription)),
            None => Err(BrokerError::missing_entity(topic)),
        }
    }

    fn create_subscription(&self, topic: &str, subscription: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut topics = self.namespace.topics.lock().unwrap();
        let Some(topic_state) = topics.get_mut(topic) else {
            return Err(BrokerError::missing_entity(topic));
        };
        let state = topic_state
            .subscriptions
            .entry(subscription.to_string())
            .or_default();
        // New subscriptions start with the catch-all default rule.
        state
            .rules
            .entry(DEFAULT_RULE_NAME.to_string())
            .or_insert_with(|| "*".to_string());
        Ok(())
    }

    fn rule_exists(
        &self,
        topic: &str,
        subscription: &str,
        rule: &str,
    ) -> Result<bool, BrokerError> {
        self.ensure_open()?;
        let topics = self.namespace.topics.lock().unwrap();
        let sub = topics
            .get(topic)
            .and_then(|t| t.subscriptions.get(subscription))
            .ok_or_else(|| BrokerError::missing_entity(format!("{topic}/{subscription}")))?;
        Ok(sub.rules.contains_key(rule))
    }

    fn add_label_rule(
        &self,
        topic: &str,
        subscription: &str,
        rule: &str,
        label: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut topics = self.namespace.topics.lock().unwrap();
        let sub = topics
            .get_mut(topic)
            .and_then(|t| t.subscriptions.get_mut(subscription))
            .ok_or_else(|| BrokerError::missing_entity(format!("{topic}/{subscription}")))?;
        sub.rules.insert(rule.to_string(), label.to_string());
        Ok(())
    }

    fn remove_rule(
        &self,
        topic: &str,
        subscription: &str,
        rule: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut topics = self.namespace.topics.lock().unwrap();
        let sub = topics
            .get_mut(topic)
            .and_then(|t| t.subscriptions.get_mut(subscription))
            .ok_or_else(|| BrokerError::missing_entity(format!("{topic}/{subscription}")))?;
        if sub.rules.remove(rule).is_none() {
            return Err(BrokerError::missing_entity(rule));
        }
        Ok(())
    }

    fn send(&self, topic: &str, message: WireMessage) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.namespace.send(topic, message)
    }

    fn receive(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<mpsc::Receiver<InboundMessage>, BrokerError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::channel();
        let mut topics = self.namespace.topics.lock().unwrap();
        let sub = topics
            .get_mut(topic)
            .and_then(|t| t.subscriptions.get_mut(subscription))
            .ok_or_else(|| BrokerError::missing_entity(format!("{topic}/{subscription}")))?;
        for message in sub.backlog.drain(..) {
            // Unbounded channel; send cannot block.
            let _ = tx.send(message);
        }
        sub.consumers.push(tx);
        Ok(rx)
    }

    fn complete(&self, lock_token: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.namespace.complete(lock_token)
    }

    fn abandon(&self, lock_token: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.namespace.abandon(lock_token)
    }
}

/// The in-memory namespace itself; acts as the adapter's transport.
pub struct InMemoryServiceBus {
    namespace: Arc<NamespaceState>,
    sessions: Mutex<Vec<Arc<InMemoryServiceBusSession>>>,
    fail_next_connects: AtomicU32,
    connect_attempts: AtomicU32,
}

impl InMemoryServiceBus {
    pub fn new() -> Self {
        Self::with_max_delivery_count(DEFAULT_MAX_DELIVERY_COUNT)
    }

    /// Cap on deliveries per message before the broker dead-letters it.
    pub fn with_max_delivery_count(max_delivery_count: u32) -> Self {
        Self {
            namespace: Arc::new(NamespaceState::new(max_delivery_count)),
            sessions: Mutex::new(Vec::new()),
            fail_next_connects: AtomicU32::new(0),
            connect_attempts: AtomicU32::new(0),
        }
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.fail_next_connects.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_sends(&self, count: u32) {
        self.namespace.fail_next_sends.store(count, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Fault the most recent session, as if the broker dropped it.
    pub fn fault_current_session(&self, fault: ConnectionFault) {
        let session = self.sessions.lock().unwrap().last().cloned();
        if let Some(session) = session {
            session.fault(fault);
        }
    }

    pub fn topic_created(&self, topic: &str) -> bool {
        self.namespace.topics.lock().unwrap().contains_key(topic)
    }

    pub fn subscription_created(&self, topic: &str, subscription: &str) -> bool {
        self.namespace
            .topics
            .lock()
            .unwrap()
            .get(topic)
            .map(|t| t.subscriptions.contains_key(subscription))
            .unwrap_or(false)
    }

    pub fn rule_names(&self, topic: &str, subscription: &str) -> Vec<String> {
        self.namespace
            .topics
            .lock()
            .unwrap()
            .get(topic)
            .and_then(|t| t.subscriptions.get(subscription))
            .map(|s| {
                let mut names: Vec<String> = s.rules.keys().cloned().collect();
                names.sort();
                names
            })
            .unwrap_or_default()
    }

    /// Messages settled as processed, in completion order.
    pub fn completed(&self) -> Vec<InboundMessage> {
        self.namespace.completed.lock().unwrap().clone()
    }

    pub fn completed_count(&self) -> usize {
        self.namespace.completed.lock().unwrap().len()
    }

    pub fn abandoned_count(&self) -> u64 {
        self.namespace.abandoned.load(Ordering::SeqCst)
    }

    pub fn dead_lettered_count(&self) -> usize {
        self.namespace.dead_lettered.lock().unwrap().len()
    }
}

impl Default for InMemoryServiceBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceBusTransport for InMemoryServiceBus {
    fn connect(&self) -> Result<Arc<dyn ServiceBusSession>, BrokerError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let pending_failures = self.fail_next_connects.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.fail_next_connects.store(pending_failures - 1, Ordering::SeqCst);
            return Err(BrokerError::unreachable("injected connect failure"));
        }

        let session = Arc::new(InMemoryServiceBusSession {
            namespace: self.namespace.clone(),
            open: AtomicBool::new(true),
            listeners: Mutex::new(Vec::new()),
        });
        self.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(broker: &InMemoryServiceBus) -> Arc<dyn ServiceBusSession> {
        broker.connect().unwrap()
    }

    fn provisioned(broker: &InMemoryServiceBus) -> Arc<dyn ServiceBusSession> {
        let s = session(broker);
        s.create_topic("events").unwrap();
        s.create_subscription("events", "app.OrderCreated").unwrap();
        s.remove_rule("events", "app.OrderCreated", DEFAULT_RULE_NAME).unwrap();
        s.add_label_rule("events", "app.OrderCreated", "OrderCreated", "OrderCreated")
            .unwrap();
        s
    }

    fn message(label: &str, body: &[u8]) -> WireMessage {
        WireMessage::new(label, body.to_vec())
    }

    #[test]
    fn new_subscriptions_start_with_the_default_rule() {
        let broker = InMemoryServiceBus::new();
        let s = session(&broker);
        s.create_topic("events").unwrap();
        s.create_subscription("events", "app.X").unwrap();
        assert_eq!(broker.rule_names("events", "app.X"), vec![DEFAULT_RULE_NAME]);
    }

    #[test]
    fn label_rules_route_matching_messages_only() {
        let broker = InMemoryServiceBus::new();
        let s = provisioned(&broker);
        let rx = s.receive("events", "app.OrderCreated").unwrap();

        s.send("events", message("OrderCreated", b"yes")).unwrap();
        s.send("events", message("SomethingElse", b"no")).unwrap();

        let received = rx.recv().unwrap();
        assert_eq!(received.label, "OrderCreated");
        assert_eq!(received.body, b"yes");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn default_rule_matches_every_label() {
        let broker = InMemoryServiceBus::new();
        let s = session(&broker);
        s.create_topic("events").unwrap();
        s.create_subscription("events", "app.All").unwrap();
        let rx = s.receive("events", "app.All").unwrap();

        s.send("events", message("Whatever", b"x")).unwrap();
        assert!(rx.recv().is_ok());
    }

    #[test]
    fn complete_settles_the_message() {
        let broker = InMemoryServiceBus::new();
        let s = provisioned(&broker);
        let rx = s.receive("events", "app.OrderCreated").unwrap();
        s.send("events", message("OrderCreated", b"m")).unwrap();

        let received = rx.recv().unwrap();
        s.complete(&received.lock_token).unwrap();

        assert_eq!(broker.completed_count(), 1);
        assert_eq!(broker.completed()[0].label, "OrderCreated");
    }

    #[test]
    fn abandon_redelivers_until_the_delivery_count_cap() {
        let broker = InMemoryServiceBus::with_max_delivery_count(2);
        let s = provisioned(&broker);
        let rx = s.receive("events", "app.OrderCreated").unwrap();
        s.send("events", message("OrderCreated", b"poison")).unwrap();

        let first = rx.recv().unwrap();
        assert_eq!(first.delivery_count, 1);
        s.abandon(&first.lock_token).unwrap();

        let second = rx.recv().unwrap();
        assert_eq!(second.delivery_count, 2);
        s.abandon(&second.lock_token).unwrap();

        assert_eq!(broker.dead_lettered_count(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn removing_a_missing_rule_reports_missing_entity() {
        let broker = InMemoryServiceBus::new();
        let s = session(&broker);
        s.create_topic("events").unwrap();
        s.create_subscription("events", "app.X").unwrap();
        let err = s.remove_rule("events", "app.X", "Nope").unwrap_err();
        assert!(matches!(err, BrokerError::MissingEntity(_)));
    }
}
