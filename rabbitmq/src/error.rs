/// Error types for RabbitMQ operations
#[derive(Debug, thiserror::Error)]
pub enum RabbitMQError {
    /// Error in the provided URI
    #[error("Provided URI Error: {0}")]
    UriError(String),
    /// Error establishing connection
    #[error("Connection error: {0}")]
    ConnectionError(String),
    /// Error opening a channel
    #[error("Error while opening a rabbitmq channel: {0}")]
    OpenChannelError(String),
    /// Error declaring a queue
    #[error("Error while declaring a queue: {0}")]
    QueueDeclarationError(String),
    /// Error declaring an exchange
    #[error("Error while declaring a exchange: {0}")]
    ExchangeDeclarationError(String),
    /// Error starting to consume from a subscription
    #[error("Error while starting to consume from a subscription: {0}")]
    SubscriptionError(String),
    /// Error binding a queue to an exchange
    #[error("Error while binding a queue to exchange: {0}")]
    QueueBindingError(String),
    /// Error closing a channel or connection
    #[error("Error while closing a channel: {0}")]
    CloseChannelError(String),
    /// Error publishing a message
    #[error("Error while publishing a message: {0}")]
    PublishError(String),
    /// Error while acknowledging (or rejecting) a message
    #[error("Error while acknowledging a message: {0}")]
    AckMessageError(String),
    /// Payload could not be encoded to or decoded from JSON
    #[error("Error while serializing a message: {0}")]
    SerializationError(#[from] serde_json::Error),
    /// Routing key is not a valid dot separated key
    #[error("Invalid routing key: {0:?}")]
    InvalidRoutingKey(String),
    /// The channel went away underneath the caller
    #[error("Channel is closed")]
    ChannelClosed,
    /// `close()` was called on the client; no further operations are accepted
    #[error("Client was closed")]
    ClientClosed,
}

impl RabbitMQError {
    /// Whether the error is caused by a missing link to the broker rather than by the request.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::ConnectionError(_) | Self::OpenChannelError(_) | Self::ChannelClosed
        )
    }
}
