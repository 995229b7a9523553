use serde::de::DeserializeOwned;

/// Content type stamped on every message published through this crate
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Exchange routing strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Routes by dot separated pattern (`*` one word, `#` zero or more words)
    Topic,
    /// Routes by exact routing key equality
    Direct,
    /// Routes to every bound queue, ignoring the routing key
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Topic => "topic",
            Self::Direct => "direct",
            Self::Fanout => "fanout",
        }
    }
}

/// Exchange declaration parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            kind: ExchangeKind::Topic,
            durable: true,
        }
    }
}

impl ExchangeOptions {
    pub fn topic() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }
}

/// Queue declaration parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self { durable: true }
    }
}

impl QueueOptions {
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }
}

/// Subscription parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Broker settles deliveries on send; handlers outcomes are then ignored
    pub no_ack: bool,
    /// Upper bound of unacknowledged deliveries in flight (`basic.qos`)
    pub prefetch: Option<u16>,
    /// Queue declaration used when the subscription asserts its queue
    pub queue: QueueOptions,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            no_ack: false,
            prefetch: None,
            queue: QueueOptions::default(),
        }
    }
}

impl ConsumeOptions {
    pub fn no_ack(mut self, no_ack: bool) -> Self {
        self.no_ack = no_ack;
        self
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }
}

/// AMQP basic properties this crate reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    /// Delivery mode 2 when set, 1 otherwise
    pub persistent: bool,
    /// Seconds since the unix epoch
    pub timestamp: Option<u64>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub app_id: Option<String>,
}

/// Per-publish settings
///
/// Messages are persistent unless told otherwise. A message id is generated when
/// none is given, so consumers always have a stable key to count redeliveries by.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub persistent: bool,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Declaration used when the publisher asserts the target exchange
    pub exchange: ExchangeOptions,
    /// Declaration used when the publisher asserts the target queue
    pub queue: QueueOptions,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            persistent: true,
            message_id: None,
            correlation_id: None,
            reply_to: None,
            exchange: ExchangeOptions::default(),
            queue: QueueOptions::default(),
        }
    }
}

impl PublishOptions {
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    pub fn exchange(mut self, exchange: ExchangeOptions) -> Self {
        self.exchange = exchange;
        self
    }
}

/// A message handed to a consumer by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel scoped tag used to ack or nack this delivery
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    /// Set by the broker when the message was delivered before and not acked
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

impl Delivery {
    /// Decodes the JSON body
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Key identifying the message across redeliveries
    ///
    /// Without a `message_id` the key is the routing key plus the body, so two
    /// messages with equal bodies on the same routing key share one failure count.
    pub fn redelivery_key(&self) -> String {
        match &self.properties.message_id {
            Some(id) => id.clone(),
            None => format!(
                "{}:{}",
                self.routing_key,
                String::from_utf8_lossy(&self.body)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delivery(body: &[u8], message_id: Option<&str>) -> Delivery {
        Delivery {
            delivery_tag: 1,
            exchange: "user.events".into(),
            routing_key: "user.created".into(),
            redelivered: false,
            properties: MessageProperties {
                message_id: message_id.map(str::to_owned),
                ..Default::default()
            },
            body: body.to_vec(),
        }
    }

    #[test]
    fn publish_defaults_are_persistent_topic() {
        let options = PublishOptions::default();
        assert!(options.persistent);
        assert_eq!(options.exchange.kind, ExchangeKind::Topic);
        assert!(options.exchange.durable);
        assert!(options.queue.durable);
    }

    #[test]
    fn decode_reads_json_body() {
        let d = delivery(br#"{"userId":"u1","tags":[1,null,true]}"#, None);
        let value: serde_json::Value = d.decode().unwrap();
        assert_eq!(value, json!({"userId": "u1", "tags": [1, null, true]}));
    }

    #[test]
    fn redelivery_key_prefers_message_id() {
        assert_eq!(delivery(b"{}", Some("m-1")).redelivery_key(), "m-1");
        assert_eq!(
            delivery(b"{\"a\":1}", None).redelivery_key(),
            "user.created:{\"a\":1}"
        );

        let mut other_route = delivery(b"{\"a\":1}", None);
        other_route.routing_key = "user.deleted".into();
        assert_ne!(
            other_route.redelivery_key(),
            delivery(b"{\"a\":1}", None).redelivery_key()
        );
    }

    #[test]
    fn exchange_kind_names() {
        assert_eq!(ExchangeKind::Topic.as_str(), "topic");
        assert_eq!(ExchangeKind::Direct.as_str(), "direct");
        assert_eq!(ExchangeKind::Fanout.as_str(), "fanout");
    }
}
