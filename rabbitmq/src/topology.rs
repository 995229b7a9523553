use tracing::{debug, info};

use crate::{
    ExchangeOptions, QueueOptions, RabbitMQError, connection::ConnectionManager,
    routing::validate_routing_key,
};

/// Declares exchanges, queues and bindings on the shared connection.
///
/// Declarations are requests to the broker, not state tracked here: repeating one with
/// the same parameters is a no-op, while conflicting parameters come back as the
/// broker's error (and cost the channel).
#[derive(Clone)]
pub struct Topology {
    connection: ConnectionManager,
}

impl Topology {
    pub fn new(connection: ConnectionManager) -> Self {
        Self { connection }
    }

    pub async fn assert_exchange(
        &self,
        name: &str,
        options: &ExchangeOptions,
    ) -> Result<(), RabbitMQError> {
        let transport = self.connection.connect().await?;
        transport.declare_exchange(name, options).await?;
        debug!(
            "exchange {} asserted ({}, durable: {})",
            name,
            options.kind.as_str(),
            options.durable
        );
        Ok(())
    }

    pub async fn assert_queue(&self, name: &str, options: &QueueOptions) -> Result<(), RabbitMQError> {
        let transport = self.connection.connect().await?;
        transport.declare_queue(name, options).await?;
        debug!("queue {} asserted (durable: {})", name, options.durable);
        Ok(())
    }

    /// Binds `queue` to `exchange` under `routing_key`, asserting both with default
    /// (durable, topic) parameters first.
    pub async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), RabbitMQError> {
        self.bind_queue_with(
            queue,
            &QueueOptions::default(),
            exchange,
            &ExchangeOptions::default(),
            routing_key,
        )
        .await
    }

    pub async fn bind_queue_with(
        &self,
        queue: &str,
        queue_options: &QueueOptions,
        exchange: &str,
        exchange_options: &ExchangeOptions,
        routing_key: &str,
    ) -> Result<(), RabbitMQError> {
        validate_routing_key(routing_key)?;
        self.assert_queue(queue, queue_options).await?;
        self.assert_exchange(exchange, exchange_options).await?;

        let transport = self.connection.connect().await?;
        transport.bind_queue(queue, exchange, routing_key).await?;
        debug!("queue {} bound to {} with key {}", queue, exchange, routing_key);
        Ok(())
    }

    /// Applies a whole set of declarations in order: exchanges, queues, bindings.
    pub async fn declare(&self, declaration: &TopologyDeclaration) -> Result<(), RabbitMQError> {
        for (name, options) in &declaration.exchanges {
            self.assert_exchange(name, options).await?;
        }
        for (name, options) in &declaration.queues {
            self.assert_queue(name, options).await?;
        }

        let transport = self.connection.connect().await?;
        for binding in &declaration.bindings {
            validate_routing_key(&binding.routing_key)?;
            transport
                .bind_queue(&binding.queue, &binding.exchange, &binding.routing_key)
                .await?;
        }

        info!(
            "topology declared: {} exchanges, {} queues, {} bindings",
            declaration.exchanges.len(),
            declaration.queues.len(),
            declaration.bindings.len()
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingDeclaration {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// A batch of declarations applied by [`Topology::declare`]
///
/// Bindings are only valid for exchanges and queues listed in the same batch (or
/// declared earlier by someone else).
#[derive(Debug, Clone, Default)]
pub struct TopologyDeclaration {
    exchanges: Vec<(String, ExchangeOptions)>,
    queues: Vec<(String, QueueOptions)>,
    bindings: Vec<BindingDeclaration>,
}

impl TopologyDeclaration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exchange(mut self, name: &str, options: ExchangeOptions) -> Self {
        self.exchanges.push((name.to_owned(), options));
        self
    }

    pub fn queue(mut self, name: &str, options: QueueOptions) -> Self {
        self.queues.push((name.to_owned(), options));
        self
    }

    pub fn bind(mut self, queue: &str, exchange: &str, routing_key: &str) -> Self {
        self.bindings.push(BindingDeclaration {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        });
        self
    }

    pub fn exchanges(&self) -> impl Iterator<Item = &str> {
        self.exchanges.iter().map(|(name, _)| name.as_str())
    }

    pub fn queues(&self) -> impl Iterator<Item = &str> {
        self.queues.iter().map(|(name, _)| name.as_str())
    }

    pub fn bindings(&self) -> &[BindingDeclaration] {
        &self.bindings
    }
}
