use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error};
use uuid::Uuid;

use crate::{
    JSON_CONTENT_TYPE, MessageProperties, PublishOptions, RabbitMQError,
    connection::ConnectionManager, routing::validate_routing_key, topology::Topology,
};

/// Publisher for sending JSON messages to an exchange or straight to a queue
///
/// ## Message Flow
///
/// When `publish()` is called:
/// 1. The payload is serialized to JSON
/// 2. The target exchange (or queue) is asserted, so a publish before any consumer
///    exists still leaves the message with the broker
/// 3. Properties are stamped: persistent delivery mode, timestamp, app id, message id
/// 4. The message is handed to the shared channel
///
/// No broker confirmation is awaited. `publish` and `send_to_queue` report failure as
/// `false` and never return an error, so a dropped notification cannot fail the
/// caller; use the `try_` variants to see the error.
#[derive(Clone)]
pub struct Publisher {
    connection: ConnectionManager,
    topology: Topology,
    app_id: String,
}

impl Publisher {
    pub fn new(connection: ConnectionManager, topology: Topology, app_id: &str) -> Self {
        Self {
            connection,
            topology,
            app_id: app_id.to_owned(),
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Publishes `message` to `exchange` for topic routing under `routing_key`.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
        options: PublishOptions,
    ) -> bool {
        match self.try_publish(exchange, routing_key, message, options).await {
            Ok(()) => true,
            Err(err) => {
                error!(
                    exchange = %exchange,
                    routing_key = %routing_key,
                    "error while publishing: {}", err
                );
                false
            }
        }
    }

    pub async fn try_publish<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
        options: PublishOptions,
    ) -> Result<(), RabbitMQError> {
        validate_routing_key(routing_key)?;
        let body = serde_json::to_vec(message)?;

        self.topology
            .assert_exchange(exchange, &options.exchange)
            .await?;

        let transport = self.connection.connect().await?;
        let size = body.len();
        transport
            .publish(exchange, routing_key, body, self.properties(&options))
            .await?;

        debug!("published {} bytes to {} with key {}", size, exchange, routing_key);
        Ok(())
    }

    /// Sends `message` directly to `queue` through the default exchange.
    pub async fn send_to_queue<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        message: &T,
        options: PublishOptions,
    ) -> bool {
        match self.try_send_to_queue(queue, message, options).await {
            Ok(()) => true,
            Err(err) => {
                error!(queue = %queue, "error while sending to queue: {}", err);
                false
            }
        }
    }

    pub async fn try_send_to_queue<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        message: &T,
        options: PublishOptions,
    ) -> Result<(), RabbitMQError> {
        let body = serde_json::to_vec(message)?;
        self.topology.assert_queue(queue, &options.queue).await?;

        let properties = self.properties(&options);
        self.forward_to_queue(queue, body, properties).await
    }

    /// Answers a request on its `reply_to` queue.
    ///
    /// The queue belongs to the requester and is often exclusive, non-durable or the
    /// `amq.rabbitmq.reply-to` pseudo queue, so it is never declared here: redeclaring
    /// it with other flags would close the shared channel.
    pub async fn try_reply<T: Serialize + ?Sized>(
        &self,
        reply_to: &str,
        message: &T,
        options: PublishOptions,
    ) -> Result<(), RabbitMQError> {
        let body = serde_json::to_vec(message)?;
        let properties = self.properties(&options);
        self.forward_to_queue(reply_to, body, properties).await
    }

    /// Puts an already encoded message on `queue`, keeping its original properties.
    pub(crate) async fn forward_to_queue(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), RabbitMQError> {
        let transport = self.connection.connect().await?;
        let size = body.len();
        transport.publish("", queue, body, properties).await?;

        debug!("sent {} bytes to queue {}", size, queue);
        Ok(())
    }

    fn properties(&self, options: &PublishOptions) -> MessageProperties {
        MessageProperties {
            content_type: Some(JSON_CONTENT_TYPE.to_owned()),
            persistent: options.persistent,
            timestamp: u64::try_from(Utc::now().timestamp()).ok(),
            message_id: Some(
                options
                    .message_id
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
            ),
            correlation_id: options.correlation_id.clone(),
            reply_to: options.reply_to.clone(),
            app_id: Some(self.app_id.clone()),
        }
    }
}
