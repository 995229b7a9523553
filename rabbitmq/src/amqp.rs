//! AMQP 0-9-1 transport backed by `amqprs`.

use std::sync::Arc;

use amqprs::{
    Ack, BasicProperties, Cancel, Close, Nack, Return,
    callbacks::{ChannelCallback, ConnectionCallback},
    channel::{
        BasicAckArguments, BasicCancelArguments, BasicConsumeArguments, BasicNackArguments, BasicPublishArguments,
        BasicQosArguments, Channel, ConsumerMessage, ExchangeDeclareArguments,
        QueueBindArguments, QueueDeclareArguments,
    },
    connection::{Connection, OpenConnectionArguments},
};
use async_trait::async_trait;
use tokio::{select, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    ConsumeOptions, Delivery, ExchangeOptions, MessageProperties, QueueOptions, RabbitMQError,
    transport::{Connector, DeliveryStream, Transport},
};

/// Opens real broker connections from an `amqp://` URL
#[derive(Debug, Default, Clone)]
pub struct AmqpConnector;

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Transport>, RabbitMQError> {
        let lost = CancellationToken::new();

        let connection = open_rabbit_connection(url, lost.clone()).await?;
        let channel = match open_rabbit_channel(&connection, lost.clone()).await {
            Ok(channel) => channel,
            Err(err) => {
                if let Err(close_err) = connection.close().await {
                    debug!("error closing half open connection: {}", close_err);
                }
                return Err(err);
            }
        };

        // The connection callback only sees broker initiated closes; socket
        // failures surface here instead.
        let io_connection = connection.clone();
        let io_token = lost.clone();
        tokio::spawn(async move {
            select! {
                _ = io_token.cancelled() => {},
                failed = io_connection.listen_network_io_failure() => {
                    if failed {
                        warn!("network io failure on rabbitmq connection");
                        io_token.cancel();
                    }
                }
            }
        });

        Ok(Arc::new(AmqpTransport {
            connection,
            channel,
            lost,
        }))
    }
}

/// A single connection with the one channel every operation goes through
pub struct AmqpTransport {
    connection: Connection,
    channel: Channel,
    lost: CancellationToken,
}

#[async_trait]
impl Transport for AmqpTransport {
    fn is_open(&self) -> bool {
        !self.lost.is_cancelled() && self.connection.is_open() && self.channel.is_open()
    }

    fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    async fn declare_exchange(
        &self,
        name: &str,
        options: &ExchangeOptions,
    ) -> Result<(), RabbitMQError> {
        let args = ExchangeDeclareArguments::new(name, options.kind.as_str())
            .durable(options.durable)
            .finish();

        self.channel
            .exchange_declare(args)
            .await
            .map_err(|err| RabbitMQError::ExchangeDeclarationError(err.to_string()))
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<(), RabbitMQError> {
        let args = QueueDeclareArguments::new(name)
            .durable(options.durable)
            .finish();

        self.channel
            .queue_declare(args)
            .await
            .map(|_| ())
            .map_err(|err| RabbitMQError::QueueDeclarationError(err.to_string()))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), RabbitMQError> {
        self.channel
            .queue_bind(QueueBindArguments::new(queue, exchange, routing_key))
            .await
            .map_err(|err| RabbitMQError::QueueBindingError(err.to_string()))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), RabbitMQError> {
        let args = BasicPublishArguments::new(exchange, routing_key);

        self.channel
            .basic_publish(into_basic_props(&properties), body, args)
            .await
            .map_err(|err| RabbitMQError::PublishError(err.to_string()))
    }

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, RabbitMQError> {
        if let Some(prefetch) = options.prefetch {
            self.channel
                .basic_qos(BasicQosArguments::new(0, prefetch, false))
                .await
                .map_err(|err| RabbitMQError::SubscriptionError(err.to_string()))?;
        }

        let args = BasicConsumeArguments::new(queue, "")
            .auto_ack(options.no_ack)
            .finish();

        let (consumer_tag, mut rx) = self
            .channel
            .basic_consume_rx(args)
            .await
            .map_err(|err| RabbitMQError::SubscriptionError(err.to_string()))?;

        let (tx, receiver) = mpsc::unbounded_channel();
        let queue_name = queue.to_owned();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match into_delivery(message) {
                    Some(delivery) => {
                        if tx.send(delivery).is_err() {
                            debug!("subscription to {} dropped its receiver", queue_name);
                            return;
                        }
                    }
                    None => warn!("message on {} without delivery frame", queue_name),
                }
            }
            debug!("consumer channel for {} closed", queue_name);
        });

        Ok(DeliveryStream {
            consumer_tag,
            receiver,
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), RabbitMQError> {
        self.channel
            .basic_cancel(BasicCancelArguments::new(consumer_tag))
            .await
            .map(|_| ())
            .map_err(|err| RabbitMQError::SubscriptionError(err.to_string()))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), RabbitMQError> {
        self.channel
            .basic_ack(BasicAckArguments::new(delivery_tag, false))
            .await
            .map_err(|err| RabbitMQError::AckMessageError(err.to_string()))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), RabbitMQError> {
        self.channel
            .basic_nack(BasicNackArguments::new(delivery_tag, false, requeue))
            .await
            .map_err(|err| RabbitMQError::AckMessageError(err.to_string()))
    }

    async fn close(&self) -> Result<(), RabbitMQError> {
        let channel_result = self.channel.clone().close().await;
        let connection_result = self.connection.clone().close().await;
        self.lost.cancel();

        channel_result.map_err(|err| RabbitMQError::CloseChannelError(err.to_string()))?;
        connection_result.map_err(|err| RabbitMQError::CloseChannelError(err.to_string()))
    }
}

fn into_basic_props(properties: &MessageProperties) -> BasicProperties {
    let mut props = BasicProperties::default();
    props.with_delivery_mode(if properties.persistent { 2 } else { 1 });

    if let Some(content_type) = &properties.content_type {
        props.with_content_type(content_type);
    }
    if let Some(timestamp) = properties.timestamp {
        props.with_timestamp(timestamp);
    }
    if let Some(message_id) = &properties.message_id {
        props.with_message_id(message_id);
    }
    if let Some(correlation_id) = &properties.correlation_id {
        props.with_correlation_id(correlation_id);
    }
    if let Some(reply_to) = &properties.reply_to {
        props.with_reply_to(reply_to);
    }
    if let Some(app_id) = &properties.app_id {
        props.with_app_id(app_id);
    }

    props.finish()
}

fn from_basic_props(props: &BasicProperties) -> MessageProperties {
    MessageProperties {
        content_type: props.content_type().cloned(),
        persistent: props.delivery_mode() == Some(2),
        timestamp: props.timestamp(),
        message_id: props.message_id().cloned(),
        correlation_id: props.correlation_id().cloned(),
        reply_to: props.reply_to().cloned(),
        app_id: props.app_id().cloned(),
    }
}

fn into_delivery(message: ConsumerMessage) -> Option<Delivery> {
    let deliver = message.deliver?;

    Some(Delivery {
        delivery_tag: deliver.delivery_tag(),
        exchange: deliver.exchange().to_string(),
        routing_key: deliver.routing_key().to_string(),
        redelivered: deliver.redelivered(),
        properties: message
            .basic_properties
            .as_ref()
            .map(from_basic_props)
            .unwrap_or_default(),
        body: message.content.unwrap_or_default(),
    })
}

async fn open_rabbit_connection(
    connection_string: &str,
    lost: CancellationToken,
) -> Result<Connection, RabbitMQError> {
    let open_conn_args = OpenConnectionArguments::try_from(connection_string).map_err(|err| {
        error!("Failed to parse connection string: {}", err);
        RabbitMQError::UriError(err.to_string())
    })?;

    debug!("Connecting to RabbitMQ server...");
    let conn = Connection::open(&open_conn_args).await.map_err(|err| {
        error!("Failed to connect to RabbitMQ: {}", err);
        RabbitMQError::ConnectionError(err.to_string())
    })?;

    conn.register_callback(RabbitConnectionCallback { lost })
        .await
        .map_err(|err| {
            error!("Failed to register connection callback: {}", err);
            RabbitMQError::ConnectionError(err.to_string())
        })?;

    info!("RabbitMQ connection established successfully");
    Ok(conn)
}

async fn open_rabbit_channel(
    conn: &Connection,
    lost: CancellationToken,
) -> Result<Channel, RabbitMQError> {
    let rabbit_channel = conn.open_channel(None).await.map_err(|err| {
        error!("Failed to open channel: {}", err);
        RabbitMQError::OpenChannelError(err.to_string())
    })?;

    rabbit_channel
        .register_callback(RabbitChannelCallback { lost })
        .await
        .map_err(|err| {
            error!("Failed to register channel callback: {}", err);
            RabbitMQError::OpenChannelError(err.to_string())
        })?;

    debug!("RabbitMQ channel opened successfully");
    Ok(rabbit_channel)
}

struct RabbitConnectionCallback {
    lost: CancellationToken,
}

#[async_trait]
impl ConnectionCallback for RabbitConnectionCallback {
    async fn close(
        &mut self,
        _connection: &Connection,
        close: Close,
    ) -> Result<(), amqprs::error::Error> {
        warn!("connection closed by broker {:?}", close);
        self.lost.cancel();
        Ok(())
    }

    /// Callback to handle connection `blocked` indication from server
    async fn blocked(&mut self, _connection: &Connection, reason: String) {
        warn!("connection blocked {:?}", reason);
    }

    /// Callback to handle connection `unblocked` indication from server
    async fn unblocked(&mut self, _connection: &Connection) {
        info!("connection unblocked");
    }

    /// Callback to handle secret updated indication from server
    async fn secret_updated(&mut self, _connection: &Connection) {
        debug!("connection secret updated");
    }
}

struct RabbitChannelCallback {
    lost: CancellationToken,
}

#[async_trait]
impl ChannelCallback for RabbitChannelCallback {
    async fn close(
        &mut self,
        _channel: &Channel,
        close: amqprs::CloseChannel,
    ) -> Result<(), amqprs::error::Error> {
        // One channel per process: losing it is losing the link.
        warn!("channel closed by broker {:?}", close);
        self.lost.cancel();
        Ok(())
    }

    async fn cancel(
        &mut self,
        _channel: &Channel,
        cancel: Cancel,
    ) -> Result<(), amqprs::error::Error> {
        warn!("consumer cancelled by broker {:?}", cancel);
        Ok(())
    }

    async fn flow(
        &mut self,
        _channel: &Channel,
        active: bool,
    ) -> Result<bool, amqprs::error::Error> {
        debug!("channel flow {:?}", active);
        Ok(true)
    }

    async fn publish_ack(&mut self, _channel: &Channel, _ack: Ack) {}

    async fn publish_nack(&mut self, _channel: &Channel, _nack: Nack) {}

    async fn publish_return(
        &mut self,
        _channel: &Channel,
        ret: Return,
        _props: BasicProperties,
        _content: Vec<u8>,
    ) {
        warn!("message returned by broker {:?}", ret);
    }
}
