//! Consumer dispatcher: one task per subscription pulling deliveries and settling them.
//!
//! ## Message Flow
//!
//! For each delivery, in the order the broker sent them:
//! 1. The JSON body is decoded into the handler's message type
//! 2. The handler runs to completion; only then is the next delivery taken
//! 3. The outcome maps to a [`Settlement`]: success acks, failure requeues, and a
//!    message that keeps failing past the [`RedeliveryPolicy`] is moved to the
//!    dead-letter queue
//!
//! A decode error or a panic in the handler counts as a handler failure. Nothing that
//! happens to one message stops the loop.
//!
//! When the connection drops the broker requeues whatever was unacked; the loop
//! waits the reconnect delay and subscribes again on the new connection.

use std::{
    collections::HashMap, future::Future, marker::PhantomData, panic::AssertUnwindSafe,
    sync::Arc,
};

use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::{select, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    ConsumeOptions, Delivery, QueueOptions, RabbitMQError,
    connection::ConnectionManager,
    publisher::Publisher,
    topology::Topology,
    transport::{DeliveryStream, Transport},
};

/// Suffix appended to a queue name to get its dead-letter queue
pub const DEAD_LETTER_SUFFIX: &str = ".dead-letter";

/// Failure reported by a message handler; the delivery is not acknowledged
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("failed to decode message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("broker error: {0}")]
    Broker(#[from] RabbitMQError),

    #[error("handler panicked")]
    Panicked,

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Domain logic run for every delivery of a subscription
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Payload the JSON body is decoded into before `handle` is called
    type Message: DeserializeOwned + Send + 'static;

    async fn handle(&self, message: Self::Message, delivery: &Delivery)
    -> Result<(), HandlerError>;
}

#[async_trait]
impl<H: MessageHandler> MessageHandler for Arc<H> {
    type Message = H::Message;

    async fn handle(
        &self,
        message: Self::Message,
        delivery: &Delivery,
    ) -> Result<(), HandlerError> {
        self.as_ref().handle(message, delivery).await
    }
}

/// Handler backed by an async closure, see [`handler_fn`]
pub struct HandlerFn<F, T> {
    f: F,
    _message: PhantomData<fn() -> T>,
}

/// Wraps an async closure taking the decoded message and its delivery as a handler.
pub fn handler_fn<T, F, Fut>(f: F) -> HandlerFn<F, T>
where
    F: Fn(T, Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    T: DeserializeOwned + Send + 'static,
{
    HandlerFn {
        f,
        _message: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, T> MessageHandler for HandlerFn<F, T>
where
    F: Fn(T, Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    T: DeserializeOwned + Send + 'static,
{
    type Message = T;

    async fn handle(&self, message: T, delivery: &Delivery) -> Result<(), HandlerError> {
        (self.f)(message, delivery.clone()).await
    }
}

/// How many failed deliveries a message gets before it is dead-lettered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    /// `None` requeues forever
    pub max_failures: Option<u32>,
    pub dead_letter_suffix: String,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl RedeliveryPolicy {
    /// Every failure requeues, with no limit
    pub fn unbounded() -> Self {
        Self {
            max_failures: None,
            dead_letter_suffix: DEAD_LETTER_SUFFIX.to_owned(),
        }
    }

    /// Dead-letters a message on its `max_failures`-th failure. Zero means unbounded.
    pub fn dead_letter_after(max_failures: u32) -> Self {
        Self {
            max_failures: (max_failures > 0).then_some(max_failures),
            ..Self::unbounded()
        }
    }

    pub fn dead_letter_queue(&self, queue: &str) -> String {
        format!("{}{}", queue, self.dead_letter_suffix)
    }
}

/// What the dispatcher tells the broker about a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Requeue,
    DeadLetter,
}

/// Messages remembered per subscription, failing or dead-lettered, before the
/// least recently touched entry is evicted
pub const MAX_TRACKED_MESSAGES: usize = 1024;

/// Per-subscription failure counts keyed by [`Delivery::redelivery_key`]
///
/// Also remembers messages already copied to the dead-letter queue whose ack did not
/// go through, so their redelivery is acked without being copied again. Both tables
/// are capped; a message that failed here and then succeeded on another consumer
/// eventually falls out.
#[derive(Debug)]
struct FailureTracker {
    max_failures: Option<u32>,
    capacity: usize,
    /// Bumped on every touch; orders entries for eviction
    clock: u64,
    failures: HashMap<String, (u32, u64)>,
    dead_lettered: HashMap<String, u64>,
}

impl FailureTracker {
    fn new(policy: &RedeliveryPolicy) -> Self {
        Self::with_capacity(policy, MAX_TRACKED_MESSAGES)
    }

    fn with_capacity(policy: &RedeliveryPolicy, capacity: usize) -> Self {
        Self {
            max_failures: policy.max_failures,
            capacity: capacity.max(1),
            clock: 0,
            failures: HashMap::new(),
            dead_lettered: HashMap::new(),
        }
    }

    fn record_failure(&mut self, key: &str) -> Settlement {
        let Some(max) = self.max_failures else {
            return Settlement::Requeue;
        };

        if !self.failures.contains_key(key) {
            evict_oldest(&mut self.failures, self.capacity, |(_, seen)| *seen);
        }
        let now = self.tick();
        let (count, seen) = self.failures.entry(key.to_owned()).or_insert((0, now));
        *count += 1;
        *seen = now;

        if *count >= max {
            Settlement::DeadLetter
        } else {
            Settlement::Requeue
        }
    }

    fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).map_or(0, |(count, _)| *count)
    }

    /// The message now sits in the dead-letter queue; its original is not acked yet.
    fn mark_dead_lettered(&mut self, key: &str) {
        self.failures.remove(key);
        if !self.dead_lettered.contains_key(key) {
            evict_oldest(&mut self.dead_lettered, self.capacity, |seen| *seen);
        }
        let now = self.tick();
        self.dead_lettered.insert(key.to_owned(), now);
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn is_dead_lettered(&self, key: &str) -> bool {
        self.dead_lettered.contains_key(key)
    }

    fn clear(&mut self, key: &str) {
        self.failures.remove(key);
        self.dead_lettered.remove(key);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.failures.len() + self.dead_lettered.len()
    }
}

/// Makes room for one more entry by dropping the least recently seen ones.
fn evict_oldest<V>(map: &mut HashMap<String, V>, capacity: usize, seen: impl Fn(&V) -> u64) {
    while map.len() >= capacity {
        let Some(oldest) = map
            .iter()
            .min_by_key(|(_, value)| seen(value))
            .map(|(key, _)| key.clone())
        else {
            return;
        };
        debug!(key = %oldest, "forgetting failure history");
        map.remove(&oldest);
    }
}

/// Subscribes handlers to queues
#[derive(Clone)]
pub struct Consumer {
    connection: ConnectionManager,
    topology: Topology,
    publisher: Publisher,
    policy: RedeliveryPolicy,
}

impl Consumer {
    pub fn new(
        connection: ConnectionManager,
        topology: Topology,
        publisher: Publisher,
        policy: RedeliveryPolicy,
    ) -> Self {
        Self {
            connection,
            topology,
            publisher,
            policy,
        }
    }

    pub fn policy(&self) -> &RedeliveryPolicy {
        &self.policy
    }

    /// Asserts `queue`, subscribes to it and spawns the dispatch loop.
    ///
    /// Fails only if the first subscription cannot be made; once running, the loop
    /// resubscribes by itself after a connection loss.
    pub async fn consume<H: MessageHandler>(
        &self,
        queue: &str,
        handler: H,
        options: ConsumeOptions,
    ) -> Result<Subscription, RabbitMQError> {
        let (transport, stream) = self.subscribe(queue, &options).await?;
        info!(
            queue = %queue,
            consumer_tag = %stream.consumer_tag,
            "consuming (no_ack: {})", options.no_ack
        );

        let cancel = CancellationToken::new();
        let dispatch = DispatchLoop {
            queue: queue.to_owned(),
            options,
            handler,
            tracker: FailureTracker::new(&self.policy),
            consumer: self.clone(),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(dispatch.run(transport, stream));

        Ok(Subscription {
            queue: queue.to_owned(),
            cancel,
            handle,
        })
    }

    async fn subscribe(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<(Arc<dyn Transport>, DeliveryStream), RabbitMQError> {
        self.topology.assert_queue(queue, &options.queue).await?;
        let transport = self.connection.connect().await?;
        let stream = transport.consume(queue, options).await?;
        Ok((transport, stream))
    }
}

struct DispatchLoop<H> {
    queue: String,
    options: ConsumeOptions,
    handler: H,
    tracker: FailureTracker,
    consumer: Consumer,
    cancel: CancellationToken,
}

impl<H: MessageHandler> DispatchLoop<H> {
    async fn run(mut self, mut transport: Arc<dyn Transport>, mut stream: DeliveryStream) {
        loop {
            let next = select! {
                _ = self.cancel.cancelled() => break,
                next = stream.receiver.recv() => next,
            };

            match next {
                Some(delivery) => self.dispatch(transport.as_ref(), delivery).await,
                None => match self.resubscribe().await {
                    Some((new_transport, new_stream)) => {
                        transport = new_transport;
                        stream = new_stream;
                    }
                    None => {
                        debug!(queue = %self.queue, "dispatch loop stopped");
                        return;
                    }
                },
            }
        }

        self.stop(transport.as_ref(), stream).await;
    }

    async fn resubscribe(&self) -> Option<(Arc<dyn Transport>, DeliveryStream)> {
        let delay = self.consumer.connection.reconnect_delay();

        loop {
            if self.cancel.is_cancelled() || self.consumer.connection.is_closed() {
                return None;
            }
            warn!(
                queue = %self.queue,
                "delivery stream ended, resubscribing in {:?}", delay
            );

            select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.consumer.subscribe(&self.queue, &self.options).await {
                Ok(subscribed) => {
                    info!(queue = %self.queue, "resubscribed");
                    return Some(subscribed);
                }
                Err(RabbitMQError::ClientClosed) => return None,
                Err(err) => error!(queue = %self.queue, "failed to resubscribe: {}", err),
            }
        }
    }

    async fn dispatch(&mut self, transport: &dyn Transport, delivery: Delivery) {
        debug!(
            queue = %self.queue,
            delivery_tag = delivery.delivery_tag,
            routing_key = %delivery.routing_key,
            redelivered = delivery.redelivered,
            "delivery received"
        );

        let key = delivery.redelivery_key();
        if !self.options.no_ack && delivery.redelivered && self.tracker.is_dead_lettered(&key) {
            info!(
                queue = %self.queue,
                delivery_tag = delivery.delivery_tag,
                "already dead-lettered, acking redelivery"
            );
            self.settle(transport, &delivery, &key, Settlement::Ack).await;
            return;
        }

        let outcome = self.invoke(&delivery).await;

        if self.options.no_ack {
            if let Err(err) = outcome {
                warn!(
                    queue = %self.queue,
                    delivery_tag = delivery.delivery_tag,
                    "handler failed on an auto-acked delivery, message dropped: {}", err
                );
            }
            return;
        }

        let settlement = match outcome {
            Ok(()) => Settlement::Ack,
            Err(err) => {
                let settlement = self.tracker.record_failure(&key);
                error!(
                    queue = %self.queue,
                    delivery_tag = delivery.delivery_tag,
                    failures = self.tracker.failures(&key),
                    "handler failed ({:?}): {}", settlement, err
                );
                settlement
            }
        };

        self.settle(transport, &delivery, &key, settlement).await;
    }

    async fn invoke(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let message: H::Message = delivery.decode()?;

        match AssertUnwindSafe(self.handler.handle(message, delivery))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(HandlerError::Panicked),
        }
    }

    async fn settle(
        &mut self,
        transport: &dyn Transport,
        delivery: &Delivery,
        key: &str,
        settlement: Settlement,
    ) {
        let tag = delivery.delivery_tag;
        let result = match settlement {
            Settlement::Ack => transport.ack(tag).await,
            Settlement::Requeue => transport.nack(tag, true).await,
            Settlement::DeadLetter => match self.dead_letter(delivery).await {
                Ok(dead_letter_queue) => {
                    warn!(
                        queue = %self.queue,
                        delivery_tag = tag,
                        "message moved to {}", dead_letter_queue
                    );
                    self.tracker.mark_dead_lettered(key);
                    transport.ack(tag).await
                }
                Err(err) => {
                    error!(
                        queue = %self.queue,
                        delivery_tag = tag,
                        "dead-lettering failed, requeueing instead: {}", err
                    );
                    transport.nack(tag, true).await
                }
            },
        };

        match result {
            Ok(()) if settlement != Settlement::Requeue => self.tracker.clear(key),
            Ok(()) => {}
            // A lost channel requeues the delivery on the broker side; the tracker
            // keeps its history so the redelivery is counted or recognised.
            Err(err) => warn!(
                queue = %self.queue,
                delivery_tag = tag,
                "could not settle delivery ({:?}): {}", settlement, err
            ),
        }
    }

    async fn dead_letter(&self, delivery: &Delivery) -> Result<String, RabbitMQError> {
        let queue = self.consumer.policy.dead_letter_queue(&self.queue);
        self.consumer
            .topology
            .assert_queue(&queue, &QueueOptions::default())
            .await?;
        self.consumer
            .publisher
            .forward_to_queue(&queue, delivery.body.clone(), delivery.properties.clone())
            .await?;
        Ok(queue)
    }

    /// Cancels the broker consumer and hands back deliveries that were never dispatched.
    async fn stop(&self, transport: &dyn Transport, mut stream: DeliveryStream) {
        if let Err(err) = transport.cancel(&stream.consumer_tag).await {
            warn!(queue = %self.queue, "failed to cancel consumer: {}", err);
        }

        while let Ok(delivery) = stream.receiver.try_recv() {
            if self.options.no_ack {
                continue;
            }
            if let Err(err) = transport.nack(delivery.delivery_tag, true).await {
                warn!(
                    queue = %self.queue,
                    delivery_tag = delivery.delivery_tag,
                    "failed to return undispatched delivery: {}", err
                );
            }
        }
        stream.receiver.close();

        info!(queue = %self.queue, "subscription cancelled");
    }
}

/// Handle to a running dispatch loop
///
/// Dropping the handle leaves the loop running for the life of the connection; call
/// [`cancel`](Self::cancel) to stop consuming.
pub struct Subscription {
    queue: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stops the loop after the in-flight handler, if any, has been settled.
    pub async fn cancel(self) {
        self.cancel.cancel();
        if let Err(err) = self.handle.await {
            error!(queue = %self.queue, "dispatch loop ended abnormally: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use serde_json::{Value, json};

    use super::*;
    use crate::{PublishOptions, memory::InMemoryBroker};

    const DELAY: Duration = Duration::from_millis(20);

    fn consumer(broker: &InMemoryBroker, policy: RedeliveryPolicy) -> (Consumer, Publisher) {
        let connection = ConnectionManager::new("memory://", Arc::new(broker.clone()), DELAY);
        let topology = Topology::new(connection.clone());
        let publisher = Publisher::new(connection.clone(), topology.clone(), "test");
        (
            Consumer::new(connection, topology, publisher.clone(), policy),
            publisher,
        )
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn unbounded_tracker_always_requeues() {
        let mut tracker = FailureTracker::new(&RedeliveryPolicy::unbounded());
        for _ in 0..10 {
            assert_eq!(tracker.record_failure("m1"), Settlement::Requeue);
        }
        assert_eq!(tracker.failures("m1"), 0);
    }

    #[test]
    fn bounded_tracker_dead_letters_on_last_failure() {
        let mut tracker = FailureTracker::new(&RedeliveryPolicy::dead_letter_after(3));
        assert_eq!(tracker.record_failure("m1"), Settlement::Requeue);
        assert_eq!(tracker.record_failure("m1"), Settlement::Requeue);
        assert_eq!(tracker.record_failure("m2"), Settlement::Requeue);
        assert_eq!(tracker.record_failure("m1"), Settlement::DeadLetter);

        tracker.clear("m1");
        assert_eq!(tracker.failures("m1"), 0);
        assert_eq!(tracker.failures("m2"), 1);
    }

    #[test]
    fn dead_lettered_messages_are_remembered_until_cleared() {
        let mut tracker = FailureTracker::new(&RedeliveryPolicy::dead_letter_after(1));
        assert_eq!(tracker.record_failure("m1"), Settlement::DeadLetter);

        tracker.mark_dead_lettered("m1");
        assert!(tracker.is_dead_lettered("m1"));
        assert_eq!(tracker.failures("m1"), 0);

        tracker.clear("m1");
        assert!(!tracker.is_dead_lettered("m1"));
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn tracker_forgets_the_stalest_message_when_full() {
        let mut tracker =
            FailureTracker::with_capacity(&RedeliveryPolicy::dead_letter_after(5), 3);
        for key in ["m1", "m2", "m3"] {
            tracker.record_failure(key);
        }
        tracker.record_failure("m1");

        tracker.record_failure("m4");
        assert_eq!(tracker.len(), 3);
        assert_eq!(tracker.failures("m1"), 2);
        assert_eq!(tracker.failures("m2"), 0);
        assert_eq!(tracker.failures("m4"), 1);

        for n in 0..100 {
            tracker.record_failure(&format!("other-{}", n));
        }
        assert_eq!(tracker.len(), 3);
    }

    #[test]
    fn zero_failures_means_unbounded() {
        assert_eq!(RedeliveryPolicy::dead_letter_after(0).max_failures, None);
        assert_eq!(
            RedeliveryPolicy::default().dead_letter_queue("patient.created"),
            "patient.created.dead-letter"
        );
    }

    #[tokio::test]
    async fn successful_handler_acks() {
        let broker = InMemoryBroker::new();
        let (consumer, publisher) = consumer(&broker, RedeliveryPolicy::unbounded());
        let calls = Arc::new(AtomicUsize::new(0));

        let seen = calls.clone();
        let subscription = consumer
            .consume(
                "q",
                handler_fn(move |_: Value, _| {
                    let seen = seen.clone();
                    async move {
                        seen.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
                ConsumeOptions::default(),
            )
            .await
            .unwrap();

        assert!(
            publisher
                .send_to_queue("q", &json!({"n": 1}), PublishOptions::default())
                .await
        );

        eventually(|| calls.load(Ordering::SeqCst) == 1).await;
        eventually(|| broker.unacked_count("q") == 0).await;
        assert_eq!(broker.ready_count("q"), 0);
        assert!(subscription.is_active());
        subscription.cancel().await;
    }

    #[tokio::test]
    async fn panicking_handler_is_requeued_and_loop_survives() {
        let broker = InMemoryBroker::new();
        let (consumer, publisher) = consumer(&broker, RedeliveryPolicy::unbounded());
        let calls = Arc::new(AtomicUsize::new(0));

        let seen = calls.clone();
        let subscription = consumer
            .consume(
                "q",
                handler_fn(move |_: Value, delivery: Delivery| {
                    let seen = seen.clone();
                    async move {
                        seen.fetch_add(1, Ordering::SeqCst);
                        if !delivery.redelivered {
                            panic!("boom");
                        }
                        Ok(())
                    }
                }),
                ConsumeOptions::default(),
            )
            .await
            .unwrap();

        publisher
            .send_to_queue("q", &json!({}), PublishOptions::default())
            .await;

        eventually(|| calls.load(Ordering::SeqCst) == 2).await;
        eventually(|| broker.unacked_count("q") == 0).await;
        assert!(subscription.is_active());
        subscription.cancel().await;
    }

    #[tokio::test]
    async fn undecodable_message_goes_to_dead_letter_queue() {
        #[derive(serde::Deserialize)]
        struct Strict {
            #[allow(dead_code)]
            id: u32,
        }

        let broker = InMemoryBroker::new();
        let (consumer, publisher) = consumer(&broker, RedeliveryPolicy::dead_letter_after(2));
        let subscription = consumer
            .consume(
                "q",
                handler_fn(|_: Strict, _| async { Ok(()) }),
                ConsumeOptions::default(),
            )
            .await
            .unwrap();

        publisher
            .send_to_queue("q", &json!({"id": "not a number"}), PublishOptions::default())
            .await;

        eventually(|| broker.ready_count("q.dead-letter") == 1).await;
        eventually(|| broker.unacked_count("q") == 0).await;
        assert_eq!(broker.ready_count("q"), 0);
        subscription.cancel().await;
    }

    #[tokio::test]
    async fn handler_that_kills_the_connection_is_dead_lettered_once() {
        let broker = InMemoryBroker::new();
        let (consumer, publisher) = consumer(&broker, RedeliveryPolicy::dead_letter_after(2));
        let calls = Arc::new(AtomicUsize::new(0));

        let seen = calls.clone();
        let link = broker.clone();
        let subscription = consumer
            .consume(
                "q",
                handler_fn(move |_: Value, _| {
                    let seen = seen.clone();
                    let link = link.clone();
                    async move {
                        seen.fetch_add(1, Ordering::SeqCst);
                        link.drop_connections();
                        Err(HandlerError::new("took the channel down"))
                    }
                }),
                ConsumeOptions::default(),
            )
            .await
            .unwrap();

        assert!(
            publisher
                .send_to_queue("q", &json!({"n": 1}), PublishOptions::default())
                .await
        );

        eventually(|| broker.ready_count("q.dead-letter") == 1).await;
        eventually(|| broker.ready_count("q") == 0 && broker.unacked_count("q") == 0).await;
        tokio::time::sleep(DELAY * 10).await;

        assert_eq!(broker.ready_count("q.dead-letter"), 1);
        assert_eq!(broker.ready_count("q"), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        subscription.cancel().await;
    }

    #[tokio::test]
    async fn cancel_stops_consuming() {
        let broker = InMemoryBroker::new();
        let (consumer, publisher) = consumer(&broker, RedeliveryPolicy::unbounded());
        let subscription = consumer
            .consume(
                "q",
                handler_fn(|_: Value, _| async { Ok(()) }),
                ConsumeOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(subscription.queue_name(), "q");

        subscription.cancel().await;
        assert_eq!(broker.consumer_count("q"), 0);

        publisher
            .send_to_queue("q", &json!({}), PublishOptions::default())
            .await;
        tokio::time::sleep(DELAY).await;
        assert_eq!(broker.ready_count("q"), 1);
    }

    #[tokio::test]
    async fn subscription_survives_connection_loss() {
        let broker = InMemoryBroker::new();
        let (consumer, publisher) = consumer(&broker, RedeliveryPolicy::unbounded());
        let calls = Arc::new(AtomicUsize::new(0));

        let seen = calls.clone();
        let subscription = consumer
            .consume(
                "q",
                handler_fn(move |_: Value, _| {
                    let seen = seen.clone();
                    async move {
                        seen.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
                ConsumeOptions::default(),
            )
            .await
            .unwrap();

        broker.drop_connections();
        eventually(|| broker.consumer_count("q") == 1).await;

        assert!(
            publisher
                .send_to_queue("q", &json!({"after": "reconnect"}), PublishOptions::default())
                .await
        );
        eventually(|| calls.load(Ordering::SeqCst) == 1).await;
        subscription.cancel().await;
    }
}
