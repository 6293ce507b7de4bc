//! In-memory AMQP broker for tests and development.
//!
//! Models the slice of broker behavior the adapter depends on: a direct
//! exchange routing by exact key, durable queues with backlogs, manual
//! ack/nack with requeue, a redelivery cap that dead-letters poison
//! messages, and connect/publish fault injection for resilience tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use omnibus_core::{BrokerError, ConnectionFault, FaultListener, ManagedConnection, WireMessage};

use crate::transport::{AmqpChannel, AmqpConnection, AmqpDelivery, AmqpTransport};

const DEFAULT_MAX_REDELIVERIES: u32 = 5;

#[derive(Default)]
struct QueueState {
    consumers: Vec<(u64, mpsc::Sender<AmqpDelivery>)>,
    backlog: VecDeque<AmqpDelivery>,
}

struct PendingDelivery {
    queue: String,
    delivery: AmqpDelivery,
    attempts: u32,
}

struct BrokerState {
    exchanges: Mutex<HashSet<String>>,
    bindings: Mutex<HashMap<String, HashSet<(String, String)>>>,
    queues: Mutex<HashMap<String, QueueState>>,
    unacked: Mutex<HashMap<u64, PendingDelivery>>,
    acked: Mutex<Vec<u64>>,
    dead_lettered: Mutex<Vec<AmqpDelivery>>,
    next_delivery_tag: AtomicU64,
    next_channel_id: AtomicU64,
    redeliveries: AtomicU64,
    fail_next_publishes: AtomicU32,
    max_redeliveries: u32,
}

impl BrokerState {
    fn new(max_redeliveries: u32) -> Self {
        Self {
            exchanges: Mutex::new(HashSet::new()),
            bindings: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            unacked: Mutex::new(HashMap::new()),
            acked: Mutex::new(Vec::new()),
            dead_lettered: Mutex::new(Vec::new()),
            next_delivery_tag: AtomicU64::new(0),
            next_channel_id: AtomicU64::new(0),
            redeliveries: AtomicU64::new(0),
            fail_next_publishes: AtomicU32::new(0),
            max_redeliveries,
        }
    }

    fn deliver(&self, queue_name: &str, delivery: AmqpDelivery) {
        let mut queues = self.queues.lock().unwrap();
        let queue = queues.entry(queue_name.to_string()).or_default();

        let mut delivery = Some(delivery);
        queue.consumers.retain(|(_, tx)| {
            match delivery.take() {
                Some(d) => match tx.send(d) {
                    Ok(()) => true,
                    Err(mpsc::SendError(d)) => {
                        // Consumer is gone; try the next one.
                        delivery = Some(d);
                        false
                    }
                },
                // Already handed off; keep remaining consumers untouched.
                None => true,
            }
        });

        if let Some(d) = delivery {
            queue.backlog.push_back(d);
        }
    }

    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: WireMessage,
    ) -> Result<(), BrokerError> {
        let pending_failures = self.fail_next_publishes.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.fail_next_publishes.store(pending_failures - 1, Ordering::SeqCst);
            return Err(BrokerError::unreachable("injected publish failure"));
        }

        let targets: Vec<String> = self
            .bindings
            .lock()
            .unwrap()
            .get(exchange)
            .map(|set| {
                set.iter()
                    .filter(|(_, key)| key == routing_key)
                    .map(|(queue, _)| queue.clone())
                    .collect()
            })
            .unwrap_or_default();

        for queue in targets {
            let tag = self.next_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1;
            let delivery = AmqpDelivery {
                delivery_tag: tag,
                routing_key: routing_key.to_string(),
                body: message.body.clone(),
                redelivered: false,
            };
            self.unacked.lock().unwrap().insert(
                tag,
                PendingDelivery {
                    queue: queue.clone(),
                    delivery: delivery.clone(),
                    attempts: 0,
                },
            );
            self.deliver(&queue, delivery);
        }

        Ok(())
    }

    fn ack(&self, delivery_tag: u64) {
        if self.unacked.lock().unwrap().remove(&delivery_tag).is_some() {
            self.acked.lock().unwrap().push(delivery_tag);
        }
    }

    fn nack(&self, delivery_tag: u64, requeue: bool) {
        let Some(mut pending) = self.unacked.lock().unwrap().remove(&delivery_tag) else {
            return;
        };

        if !requeue {
            self.dead_lettered.lock().unwrap().push(pending.delivery);
            return;
        }

        pending.attempts += 1;
        if pending.attempts >= self.max_redeliveries {
            self.dead_lettered.lock().unwrap().push(pending.delivery);
            return;
        }

        self.redeliveries.fetch_add(1, Ordering::SeqCst);
        pending.delivery.redelivered = true;
        let queue = pending.queue.clone();
        let delivery = pending.delivery.clone();
        self.unacked.lock().unwrap().insert(delivery_tag, pending);
        self.deliver(&queue, delivery);
    }

    fn close_channel(&self, channel_id: u64) {
        let mut queues = self.queues.lock().unwrap();
        for queue in queues.values_mut() {
            queue.consumers.retain(|(id, _)| *id != channel_id);
        }
    }
}

struct InMemoryChannel {
    id: u64,
    broker: Arc<BrokerState>,
    open: AtomicBool,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::other("channel closed"))
        }
    }
}

impl AmqpChannel for InMemoryChannel {
    fn declare_exchange(&self, exchange: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.exchanges.lock().unwrap().insert(exchange.to_string());
        self.broker
            .bindings
            .lock()
            .unwrap()
            .entry(exchange.to_string())
            .or_default();
        Ok(())
    }

    fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker
            .queues
            .lock()
            .unwrap()
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker
            .bindings
            .lock()
            .unwrap()
            .entry(exchange.to_string())
            .or_default()
            .insert((queue.to_string(), routing_key.to_string()));
        Ok(())
    }

    fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut bindings = self.broker.bindings.lock().unwrap();
        let Some(set) = bindings.get_mut(exchange) else {
            return Err(BrokerError::missing_entity(exchange));
        };
        if !set.remove(&(queue.to_string(), routing_key.to_string())) {
            return Err(BrokerError::missing_entity(format!("{queue} -> {routing_key}")));
        }
        Ok(())
    }

    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: WireMessage,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.publish(exchange, routing_key, message)
    }

    fn consume(&self, queue: &str) -> Result<mpsc::Receiver<AmqpDelivery>, BrokerError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::channel();
        let mut queues = self.broker.queues.lock().unwrap();
        let state = queues.entry(queue.to_string()).or_default();
        for delivery in state.backlog.drain(..) {
            // Unbounded channel; send cannot block.
            let _ = tx.send(delivery);
        }
        state.consumers.push((self.id, tx));
        Ok(rx)
    }

    fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.ack(delivery_tag);
        Ok(())
    }

    fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.nack(delivery_tag, requeue);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) -> Result<(), BrokerError> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.broker.close_channel(self.id);
        }
        Ok(())
    }
}

pub struct InMemoryAmqpConnection {
    broker: Arc<BrokerState>,
    open: AtomicBool,
    listeners: Mutex<Vec<FaultListener>>,
    channels: Mutex<Vec<Arc<InMemoryChannel>>>,
}

impl InMemoryAmqpConnection {
    /// Simulate a broker-side fault: the session drops and every registered
    /// fault listener fires, as a real client would do from its I/O thread.
    pub fn fault(&self, fault: ConnectionFault) {
        self.open.store(false, Ordering::SeqCst);
        for channel in self.channels.lock().unwrap().iter() {
            let _ = channel.close();
        }
        for listener in self.listeners.lock().unwrap().iter() {
            listener(fault);
        }
    }
}

impl ManagedConnection for InMemoryAmqpConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn on_fault(&self, listener: FaultListener) {
        self.listeners.lock().unwrap().push(listener);
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        for channel in self.channels.lock().unwrap().iter() {
            let _ = channel.close();
        }
    }
}

impl AmqpConnection for InMemoryAmqpConnection {
    fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::unreachable("connection is closed"));
        }
        let channel = Arc::new(InMemoryChannel {
            id: self.broker.next_channel_id.fetch_add(1, Ordering::SeqCst) + 1,
            broker: self.broker.clone(),
            open: AtomicBool::new(true),
        });
        self.channels.lock().unwrap().push(channel.clone());
        Ok(channel)
    }
}

/// The in-memory broker itself; acts as the adapter's transport.
pub struct InMemoryAmqp {
    broker: Arc<BrokerState>,
    connections: Mutex<Vec<Arc<InMemoryAmqpConnection>>>,
    fail_next_connects: AtomicU32,
    connect_attempts: AtomicU32,
}

impl InMemoryAmqp {
    pub fn new() -> Self {
        Self::with_max_redeliveries(DEFAULT_MAX_REDELIVERIES)
    }

    /// Cap on requeue-redeliveries per message before it is dead-lettered.
    pub fn with_max_redeliveries(max_redeliveries: u32) -> Self {
        Self {
            broker: Arc::new(BrokerState::new(max_redeliveries)),
            connections: Mutex::new(Vec::new()),
            fail_next_connects: AtomicU32::new(0),
            connect_attempts: AtomicU32::new(0),
        }
    }

    /// Make the next `count` connect attempts fail as unreachable.
    pub fn fail_next_connects(&self, count: u32) {
        self.fail_next_connects.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` publishes fail as unreachable.
    pub fn fail_next_publishes(&self, count: u32) {
        self.broker.fail_next_publishes.store(count, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Fault the most recent connection, as if the broker dropped it.
    pub fn fault_current_connection(&self, fault: ConnectionFault) {
        let connection = self.connections.lock().unwrap().last().cloned();
        if let Some(connection) = connection {
            connection.fault(fault);
        }
    }

    pub fn acked_count(&self) -> usize {
        self.broker.acked.lock().unwrap().len()
    }

    pub fn unacked_count(&self) -> usize {
        self.broker.unacked.lock().unwrap().len()
    }

    pub fn dead_lettered_count(&self) -> usize {
        self.broker.dead_lettered.lock().unwrap().len()
    }

    pub fn redelivery_count(&self) -> u64 {
        self.broker.redeliveries.load(Ordering::SeqCst)
    }

    pub fn queue_declared(&self, queue: &str) -> bool {
        self.broker.queues.lock().unwrap().contains_key(queue)
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.broker
            .queues
            .lock()
            .unwrap()
            .get(queue)
            .map(|q| q.backlog.len())
            .unwrap_or(0)
    }

    pub fn has_binding(&self, exchange: &str, queue: &str, routing_key: &str) -> bool {
        self.broker
            .bindings
            .lock()
            .unwrap()
            .get(exchange)
            .map(|set| set.contains(&(queue.to_string(), routing_key.to_string())))
            .unwrap_or(false)
    }

    pub fn has_consumers(&self, queue: &str) -> bool {
        self.broker
            .queues
            .lock()
            .unwrap()
            .get(queue)
            .map(|q| !q.consumers.is_empty())
            .unwrap_or(false)
    }
}

impl Default for InMemoryAmqp {
    fn default() -> Self {
        Self::new()
    }
}

impl AmqpTransport for InMemoryAmqp {
    fn connect(&self) -> Result<Arc<dyn AmqpConnection>, BrokerError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let pending_failures = self.fail_next_connects.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.fail_next_connects.store(pending_failures - 1, Ordering::SeqCst);
            return Err(BrokerError::unreachable("injected connect failure"));
        }

        let connection = Arc::new(InMemoryAmqpConnection {
            broker: self.broker.clone(),
            open: AtomicBool::new(true),
            listeners: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
        });
        self.connections.lock().unwrap().push(connection.clone());
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(broker: &InMemoryAmqp) -> Arc<dyn AmqpChannel> {
        let connection = broker.connect().unwrap();
        connection.open_channel().unwrap()
    }

    fn message(body: &[u8]) -> WireMessage {
        WireMessage::new("OrderCreated", body.to_vec())
    }

    #[test]
    fn routes_by_exact_key_only() {
        let broker = InMemoryAmqp::new();
        let ch = channel(&broker);
        ch.declare_exchange("events").unwrap();
        ch.declare_queue("app.OrderCreated").unwrap();
        ch.bind_queue("app.OrderCreated", "events", "OrderCreated").unwrap();

        ch.publish("events", "OrderCreated", message(b"1")).unwrap();
        ch.publish("events", "SomethingElse", message(b"2")).unwrap();

        assert_eq!(broker.queue_depth("app.OrderCreated"), 1);
    }

    #[test]
    fn consumer_receives_backlog_then_live_messages() {
        let broker = InMemoryAmqp::new();
        let ch = channel(&broker);
        ch.declare_exchange("events").unwrap();
        ch.declare_queue("q").unwrap();
        ch.bind_queue("q", "events", "k").unwrap();

        ch.publish("events", "k", message(b"backlog")).unwrap();
        let rx = ch.consume("q").unwrap();
        ch.publish("events", "k", message(b"live")).unwrap();

        assert_eq!(rx.recv().unwrap().body, b"backlog");
        assert_eq!(rx.recv().unwrap().body, b"live");
    }

    #[test]
    fn nack_with_requeue_redelivers_until_the_cap() {
        let broker = InMemoryAmqp::with_max_redeliveries(2);
        let ch = channel(&broker);
        ch.declare_exchange("events").unwrap();
        ch.declare_queue("q").unwrap();
        ch.bind_queue("q", "events", "k").unwrap();
        let rx = ch.consume("q").unwrap();

        ch.publish("events", "k", message(b"poison")).unwrap();

        let first = rx.recv().unwrap();
        assert!(!first.redelivered);
        ch.nack(first.delivery_tag, true).unwrap();

        let second = rx.recv().unwrap();
        assert!(second.redelivered);
        ch.nack(second.delivery_tag, true).unwrap();

        // Cap reached: dead-lettered instead of a third delivery.
        assert_eq!(broker.dead_lettered_count(), 1);
        assert_eq!(broker.redelivery_count(), 1);
        assert_eq!(broker.unacked_count(), 0);
    }

    #[test]
    fn unbinding_a_missing_binding_reports_missing_entity() {
        let broker = InMemoryAmqp::new();
        let ch = channel(&broker);
        ch.declare_exchange("events").unwrap();
        let err = ch.unbind_queue("q", "events", "k").unwrap_err();
        assert!(matches!(err, BrokerError::MissingEntity(_)));
    }

    #[test]
    fn injected_connect_failures_are_transient() {
        let broker = InMemoryAmqp::new();
        broker.fail_next_connects(1);
        let Err(err) = broker.connect() else {
            panic!("expected an unreachable error");
        };
        assert!(matches!(err, BrokerError::Unreachable(_)));
        assert!(broker.connect().is_ok());
        assert_eq!(broker.connect_attempts(), 2);
    }
}
