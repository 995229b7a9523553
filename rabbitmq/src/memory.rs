//! In-process broker speaking the same [`Transport`] contract as the AMQP one.
//!
//! It keeps the broker-side rules the layer relies on: idempotent declarations that
//! fail (and close the offending channel) on conflicting parameters, topic/direct/
//! fanout routing, manual acknowledgement with requeue to the back of the queue,
//! the redelivered flag, and requeue of unacked deliveries when a connection drops.
//! Durability flags are recorded but there is no restart to survive.

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    ConsumeOptions, Delivery, ExchangeKind, ExchangeOptions, MessageProperties, QueueOptions,
    RabbitMQError,
    routing::topic_matches,
    transport::{Connector, DeliveryStream, Transport},
};

/// Shared handle to one in-process broker; clones talk to the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeOptions>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    unacked: HashMap<u64, Unacked>,
    connections: HashMap<u64, CancellationToken>,
    next_tag: u64,
    next_connection: u64,
    next_consumer: u64,
    connect_attempts: u64,
    refused_connects: u32,
    unavailable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

struct QueueState {
    options: QueueOptions,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
}

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    body: Vec<u8>,
    redelivered: bool,
}

struct ConsumerSlot {
    connection: u64,
    tag: String,
    no_ack: bool,
    prefetch: Option<u16>,
    in_flight: usize,
    sender: UnboundedSender<Delivery>,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        match self.prefetch {
            Some(limit) if !self.no_ack => self.in_flight < usize::from(limit),
            _ => true,
        }
    }
}

struct Unacked {
    connection: u64,
    consumer_tag: String,
    queue: String,
    message: StoredMessage,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` connection attempts fail
    pub fn refuse_connections(&self, count: u32) {
        self.state.lock().refused_connects = count;
    }

    /// Simulates a broker outage: while unavailable every connect fails and live
    /// connections are dropped.
    pub fn set_available(&self, available: bool) {
        let mut state = self.state.lock();
        state.unavailable = !available;
        if !available {
            let ids: Vec<u64> = state.connections.keys().copied().collect();
            for id in ids {
                state.close_connection(id);
            }
        }
    }

    /// Forcibly closes every live connection, as a broker restart or network cut would
    pub fn drop_connections(&self) {
        let mut state = self.state.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.close_connection(id);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn connect_attempts(&self) -> u64 {
        self.state.lock().connect_attempts
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeOptions> {
        self.state.lock().exchanges.get(name).cloned()
    }

    pub fn exchange_count(&self) -> usize {
        self.state.lock().exchanges.len()
    }

    pub fn queue(&self, name: &str) -> Option<QueueOptions> {
        self.state.lock().queues.get(name).map(|q| q.options.clone())
    }

    pub fn binding_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .count()
    }

    /// Messages waiting in `queue` that are not out for delivery
    pub fn ready_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Messages delivered from `queue` and not yet settled
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unacked
            .values()
            .filter(|u| u.queue == queue)
            .count()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Transport>, RabbitMQError> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;

        if state.unavailable {
            return Err(RabbitMQError::ConnectionError(format!(
                "broker at {} is unavailable",
                url
            )));
        }
        if state.refused_connects > 0 {
            state.refused_connects -= 1;
            return Err(RabbitMQError::ConnectionError(format!(
                "connection to {} refused",
                url
            )));
        }

        state.next_connection += 1;
        let connection = state.next_connection;
        let lost = CancellationToken::new();
        state.connections.insert(connection, lost.clone());
        debug!("in-memory connection {} opened", connection);

        Ok(Arc::new(MemoryTransport {
            broker: self.clone(),
            connection,
            lost,
        }))
    }
}

impl BrokerState {
    fn close_connection(&mut self, connection: u64) {
        let Some(token) = self.connections.remove(&connection) else {
            return;
        };
        token.cancel();

        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.connection != connection);
        }

        let mut orphaned: Vec<(u64, Unacked)> = Vec::new();
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.connection == connection)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                orphaned.push((tag, unacked));
            }
        }

        // Newest first so that pushing to the front restores delivery order.
        orphaned.sort_by(|a, b| b.0.cmp(&a.0));
        let mut touched = BTreeSet::new();
        for (_, unacked) in orphaned {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                let mut message = unacked.message;
                message.redelivered = true;
                queue.ready.push_front(message);
                touched.insert(unacked.queue);
            }
        }
        for queue in touched {
            self.pump(&queue);
        }

        debug!("in-memory connection {} closed", connection);
    }

    /// Channel level error: the broker closes the offending channel.
    fn fail(&mut self, connection: u64, err: RabbitMQError) -> RabbitMQError {
        warn!("closing in-memory channel {}: {}", connection, err);
        self.close_connection(connection);
        err
    }

    fn declare_exchange(
        &mut self,
        connection: u64,
        name: &str,
        options: &ExchangeOptions,
    ) -> Result<(), RabbitMQError> {
        match self.exchanges.get(name) {
            Some(existing) if existing != options => {
                let err = RabbitMQError::ExchangeDeclarationError(format!(
                    "PRECONDITION_FAILED - inequivalent arg for exchange '{}': declared {} (durable: {}), requested {} (durable: {})",
                    name,
                    existing.kind.as_str(),
                    existing.durable,
                    options.kind.as_str(),
                    options.durable
                ));
                Err(self.fail(connection, err))
            }
            Some(_) => Ok(()),
            None => {
                self.exchanges.insert(name.to_owned(), options.clone());
                Ok(())
            }
        }
    }

    fn declare_queue(
        &mut self,
        connection: u64,
        name: &str,
        options: &QueueOptions,
    ) -> Result<(), RabbitMQError> {
        match self.queues.get(name) {
            Some(existing) if existing.options != *options => {
                let err = RabbitMQError::QueueDeclarationError(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{}'",
                    name
                ));
                Err(self.fail(connection, err))
            }
            Some(_) => Ok(()),
            None => {
                self.queues.insert(
                    name.to_owned(),
                    QueueState {
                        options: options.clone(),
                        ready: VecDeque::new(),
                        consumers: Vec::new(),
                        cursor: 0,
                    },
                );
                Ok(())
            }
        }
    }

    fn bind_queue(
        &mut self,
        connection: u64,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), RabbitMQError> {
        if !self.queues.contains_key(queue) {
            let err = RabbitMQError::QueueBindingError(format!("NOT_FOUND - no queue '{}'", queue));
            return Err(self.fail(connection, err));
        }
        if !self.exchanges.contains_key(exchange) {
            let err = RabbitMQError::QueueBindingError(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            ));
            return Err(self.fail(connection, err));
        }

        let binding = Binding {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        };
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
        Ok(())
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Option<BTreeSet<String>> {
        if exchange.is_empty() {
            return Some(
                self.queues
                    .contains_key(routing_key)
                    .then(|| routing_key.to_owned())
                    .into_iter()
                    .collect(),
            );
        }

        let options = self.exchanges.get(exchange)?;
        Some(
            self.bindings
                .iter()
                .filter(|b| b.exchange == exchange)
                .filter(|b| match options.kind {
                    ExchangeKind::Topic => topic_matches(&b.routing_key, routing_key),
                    ExchangeKind::Direct => b.routing_key == routing_key,
                    ExchangeKind::Fanout => true,
                })
                .map(|b| b.queue.clone())
                .collect(),
        )
    }

    fn publish(
        &mut self,
        connection: u64,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), RabbitMQError> {
        let Some(targets) = self.route(exchange, routing_key) else {
            let err =
                RabbitMQError::PublishError(format!("NOT_FOUND - no exchange '{}'", exchange));
            return Err(self.fail(connection, err));
        };

        if targets.is_empty() {
            debug!(
                "message to {}/{} matched no queue and was dropped",
                exchange, routing_key
            );
        }

        for queue_name in targets {
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                queue.ready.push_back(StoredMessage {
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    properties: properties.clone(),
                    body: body.clone(),
                    redelivered: false,
                });
            }
            self.pump(&queue_name);
        }
        Ok(())
    }

    fn consume(
        &mut self,
        connection: u64,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, RabbitMQError> {
        if !self.queues.contains_key(queue) {
            let err = RabbitMQError::SubscriptionError(format!("NOT_FOUND - no queue '{}'", queue));
            return Err(self.fail(connection, err));
        }

        self.next_consumer += 1;
        let consumer_tag = format!("ctag-{}", self.next_consumer);
        let (sender, receiver) = mpsc::unbounded_channel();

        if let Some(state) = self.queues.get_mut(queue) {
            state.consumers.push(ConsumerSlot {
                connection,
                tag: consumer_tag.clone(),
                no_ack: options.no_ack,
                prefetch: options.prefetch,
                in_flight: 0,
                sender,
            });
        }
        self.pump(queue);

        Ok(DeliveryStream {
            consumer_tag,
            receiver,
        })
    }

    fn cancel(&mut self, connection: u64, consumer_tag: &str) -> Result<(), RabbitMQError> {
        let mut found = false;
        for queue in self.queues.values_mut() {
            let before = queue.consumers.len();
            queue
                .consumers
                .retain(|c| !(c.connection == connection && c.tag == consumer_tag));
            found |= queue.consumers.len() != before;
        }

        if !found {
            debug!("cancel for unknown consumer {}", consumer_tag);
        }
        Ok(())
    }

    fn settle(
        &mut self,
        connection: u64,
        delivery_tag: u64,
        requeue: Option<bool>,
    ) -> Result<(), RabbitMQError> {
        let owned = self
            .unacked
            .get(&delivery_tag)
            .is_some_and(|u| u.connection == connection);
        if !owned {
            let err = RabbitMQError::AckMessageError(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery_tag
            ));
            return Err(self.fail(connection, err));
        }

        let Some(unacked) = self.unacked.remove(&delivery_tag) else {
            return Ok(());
        };
        let Some(queue) = self.queues.get_mut(&unacked.queue) else {
            return Ok(());
        };

        if let Some(slot) = queue
            .consumers
            .iter_mut()
            .find(|c| c.tag == unacked.consumer_tag)
        {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }

        if requeue == Some(true) {
            let mut message = unacked.message;
            message.redelivered = true;
            queue.ready.push_back(message);
        }

        self.pump(&unacked.queue);
        Ok(())
    }

    /// Pushes ready messages to consumers round robin, honouring prefetch.
    fn pump(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let Some(index) = (0..count)
                .map(|offset| (queue.cursor + offset) % count)
                .find(|&i| queue.consumers[i].has_capacity())
            else {
                return;
            };
            queue.cursor = index + 1;

            let Some(message) = queue.ready.pop_front() else {
                return;
            };
            self.next_tag += 1;
            let delivery_tag = self.next_tag;

            let slot = &mut queue.consumers[index];
            let delivery = Delivery {
                delivery_tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                properties: message.properties.clone(),
                body: message.body.clone(),
            };

            if slot.sender.send(delivery).is_err() {
                // Receiver went away without cancelling; forget the consumer.
                queue.consumers.remove(index);
                queue.ready.push_front(message);
                continue;
            }

            if !slot.no_ack {
                slot.in_flight += 1;
                self.unacked.insert(
                    delivery_tag,
                    Unacked {
                        connection: slot.connection,
                        consumer_tag: slot.tag.clone(),
                        queue: queue_name.to_owned(),
                        message,
                    },
                );
            }
        }
    }
}

struct MemoryTransport {
    broker: InMemoryBroker,
    connection: u64,
    lost: CancellationToken,
}

impl MemoryTransport {
    fn with_state<T>(
        &self,
        op: impl FnOnce(&mut BrokerState, u64) -> Result<T, RabbitMQError>,
    ) -> Result<T, RabbitMQError> {
        if self.lost.is_cancelled() {
            return Err(RabbitMQError::ChannelClosed);
        }
        let mut state = self.broker.state.lock();
        op(&mut state, self.connection)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn is_open(&self) -> bool {
        !self.lost.is_cancelled()
    }

    fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    async fn declare_exchange(
        &self,
        name: &str,
        options: &ExchangeOptions,
    ) -> Result<(), RabbitMQError> {
        self.with_state(|state, conn| state.declare_exchange(conn, name, options))
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<(), RabbitMQError> {
        self.with_state(|state, conn| state.declare_queue(conn, name, options))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), RabbitMQError> {
        self.with_state(|state, conn| state.bind_queue(conn, queue, exchange, routing_key))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), RabbitMQError> {
        self.with_state(|state, conn| state.publish(conn, exchange, routing_key, body, properties))
    }

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, RabbitMQError> {
        self.with_state(|state, conn| state.consume(conn, queue, options))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), RabbitMQError> {
        self.with_state(|state, conn| state.cancel(conn, consumer_tag))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), RabbitMQError> {
        self.with_state(|state, conn| state.settle(conn, delivery_tag, None))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), RabbitMQError> {
        self.with_state(|state, conn| state.settle(conn, delivery_tag, Some(requeue)))
    }

    async fn close(&self) -> Result<(), RabbitMQError> {
        self.broker.state.lock().close_connection(self.connection);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(id: &str) -> MessageProperties {
        MessageProperties {
            message_id: Some(id.to_owned()),
            persistent: true,
            ..Default::default()
        }
    }

    async fn setup(broker: &InMemoryBroker) -> Arc<dyn Transport> {
        let transport = broker.connect("memory://test").await.unwrap();
        transport
            .declare_exchange("ex1", &ExchangeOptions::topic())
            .await
            .unwrap();
        transport
            .declare_queue("q1", &QueueOptions::default())
            .await
            .unwrap();
        transport.bind_queue("q1", "ex1", "k1").await.unwrap();
        transport
    }

    #[tokio::test]
    async fn redeclaring_with_same_parameters_is_a_no_op() {
        let broker = InMemoryBroker::new();
        let transport = setup(&broker).await;

        transport
            .declare_exchange("ex1", &ExchangeOptions::topic())
            .await
            .unwrap();
        transport
            .declare_queue("q1", &QueueOptions::default())
            .await
            .unwrap();
        transport.bind_queue("q1", "ex1", "k1").await.unwrap();

        assert_eq!(broker.exchange_count(), 1);
        assert_eq!(broker.binding_count("q1"), 1);
        assert!(transport.is_open());
    }

    #[tokio::test]
    async fn conflicting_exchange_declaration_closes_the_channel() {
        let broker = InMemoryBroker::new();
        let transport = setup(&broker).await;

        let err = transport
            .declare_exchange("ex1", &ExchangeOptions::topic().kind(ExchangeKind::Fanout))
            .await
            .unwrap_err();

        assert!(matches!(err, RabbitMQError::ExchangeDeclarationError(_)));
        assert!(!transport.is_open());
        assert!(transport.lost().is_cancelled());
        assert_eq!(broker.exchange("ex1").unwrap().kind, ExchangeKind::Topic);
    }

    #[tokio::test]
    async fn nack_with_requeue_redelivers_with_flag() {
        let broker = InMemoryBroker::new();
        let transport = setup(&broker).await;
        let mut stream = transport
            .consume("q1", &ConsumeOptions::default())
            .await
            .unwrap();

        transport
            .publish("ex1", "k1", b"{}".to_vec(), props("m1"))
            .await
            .unwrap();

        let first = stream.receiver.recv().await.unwrap();
        assert!(!first.redelivered);
        transport.nack(first.delivery_tag, true).await.unwrap();

        let second = stream.receiver.recv().await.unwrap();
        assert!(second.redelivered);
        assert_eq!(second.properties.message_id.as_deref(), Some("m1"));
        assert_ne!(first.delivery_tag, second.delivery_tag);

        transport.ack(second.delivery_tag).await.unwrap();
        assert_eq!(broker.unacked_count("q1"), 0);
        assert_eq!(broker.ready_count("q1"), 0);
    }

    #[tokio::test]
    async fn prefetch_limits_in_flight_deliveries() {
        let broker = InMemoryBroker::new();
        let transport = setup(&broker).await;
        let mut stream = transport
            .consume("q1", &ConsumeOptions::default().prefetch(1))
            .await
            .unwrap();

        for id in ["m1", "m2"] {
            transport
                .publish("ex1", "k1", b"{}".to_vec(), props(id))
                .await
                .unwrap();
        }

        let first = stream.receiver.recv().await.unwrap();
        assert_eq!(broker.unacked_count("q1"), 1);
        assert_eq!(broker.ready_count("q1"), 1);

        transport.ack(first.delivery_tag).await.unwrap();
        let second = stream.receiver.recv().await.unwrap();
        assert_eq!(second.properties.message_id.as_deref(), Some("m2"));
    }

    #[tokio::test]
    async fn dropped_connection_requeues_unacked_messages() {
        let broker = InMemoryBroker::new();
        let transport = setup(&broker).await;
        let mut stream = transport
            .consume("q1", &ConsumeOptions::default())
            .await
            .unwrap();

        transport
            .publish("ex1", "k1", b"{}".to_vec(), props("m1"))
            .await
            .unwrap();
        let _delivery = stream.receiver.recv().await.unwrap();

        broker.drop_connections();

        assert!(stream.receiver.recv().await.is_none());
        assert!(!transport.is_open());
        assert_eq!(broker.ready_count("q1"), 1);
        assert_eq!(broker.consumer_count("q1"), 0);
        assert!(matches!(
            transport.ack(1).await,
            Err(RabbitMQError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn cancelled_consumer_stops_receiving() {
        let broker = InMemoryBroker::new();
        let transport = setup(&broker).await;
        let mut stream = transport
            .consume("q1", &ConsumeOptions::default())
            .await
            .unwrap();

        transport.cancel(&stream.consumer_tag).await.unwrap();
        transport
            .publish("ex1", "k1", b"{}".to_vec(), props("m1"))
            .await
            .unwrap();

        assert!(stream.receiver.recv().await.is_none());
        assert_eq!(broker.consumer_count("q1"), 0);
        assert_eq!(broker.ready_count("q1"), 1);
    }

    #[tokio::test]
    async fn default_exchange_routes_by_queue_name() {
        let broker = InMemoryBroker::new();
        let transport = setup(&broker).await;

        transport
            .publish("", "q1", b"{}".to_vec(), props("direct"))
            .await
            .unwrap();
        transport
            .publish("", "missing", b"{}".to_vec(), props("lost"))
            .await
            .unwrap();

        assert_eq!(broker.ready_count("q1"), 1);
        assert!(transport.is_open());
    }

    #[tokio::test]
    async fn publishing_to_unknown_exchange_fails() {
        let broker = InMemoryBroker::new();
        let transport = broker.connect("memory://test").await.unwrap();

        let err = transport
            .publish("nowhere", "k", Vec::new(), MessageProperties::default())
            .await
            .unwrap_err();

        assert!(matches!(err, RabbitMQError::PublishError(_)));
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn refused_and_unavailable_connects_fail() {
        let broker = InMemoryBroker::new();
        broker.refuse_connections(1);
        assert!(broker.connect("memory://test").await.is_err());
        assert!(broker.connect("memory://test").await.is_ok());

        broker.set_available(false);
        assert_eq!(broker.connection_count(), 0);
        assert!(broker.connect("memory://test").await.is_err());
        assert_eq!(broker.connect_attempts(), 3);
    }
}
