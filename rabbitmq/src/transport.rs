//! Seam between the messaging layer and a concrete broker link.
//!
//! A [`Connector`] opens one connection plus channel and hands it back as a
//! [`Transport`]. Everything above this module (connection manager, topology,
//! publisher, consumer) is written against these traits only.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use crate::{
    ConsumeOptions, Delivery, ExchangeOptions, MessageProperties, QueueOptions, RabbitMQError,
};

/// Deliveries pushed by the broker for one `basic.consume`.
///
/// The receiver yields `None` once the subscription's channel is gone.
pub struct DeliveryStream {
    pub consumer_tag: String,
    pub receiver: UnboundedReceiver<Delivery>,
}

/// Opens broker links
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Transport>, RabbitMQError>;
}

/// One open connection/channel pair
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether the link is still usable
    fn is_open(&self) -> bool;

    /// Token cancelled as soon as the broker or the network tears the link down
    fn lost(&self) -> CancellationToken;

    async fn declare_exchange(
        &self,
        name: &str,
        options: &ExchangeOptions,
    ) -> Result<(), RabbitMQError>;

    async fn declare_queue(&self, name: &str, options: &QueueOptions)
    -> Result<(), RabbitMQError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), RabbitMQError>;

    /// Hands a message to the broker. An empty `exchange` is the default exchange,
    /// which routes to the queue named by `routing_key`.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), RabbitMQError>;

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, RabbitMQError>;

    /// Stops the broker pushing to `consumer_tag`. Deliveries already received stay
    /// unsettled until acked or nacked.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), RabbitMQError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), RabbitMQError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), RabbitMQError>;

    /// Closes channel then connection
    async fn close(&self) -> Result<(), RabbitMQError>;
}
