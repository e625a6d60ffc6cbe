//! Broker fabric: durable topic exchanges, durable queues and bindings, with
//! manual acknowledgement of every delivery.
//!
//! Implementations:
//! - `AmqpBroker`: RabbitMQ via lapin (feature `amqp`, default)
//! - `KafkaBroker`: exchanges as topics, queues as consumer groups (feature `kafka`)
//! - `InMemoryBroker`: process-local fabric for tests and single-process runs

use std::sync::Arc;

use async_trait::async_trait;

#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

#[cfg(feature = "amqp")]
pub use amqp::{AmqpBroker, AmqpConfig};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaBroker, KafkaConfig};
pub use memory::InMemoryBroker;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Header carrying how many times a delivery has been handed back to its queue.
pub const REDELIVERY_HEADER: &str = "x-redelivery-count";
/// Header carrying the reason a delivery was dead-lettered.
pub const DEATH_REASON_HEADER: &str = "x-death-reason";
/// Header preserving the exchange a delivery was first published to.
pub const EXCHANGE_HEADER: &str = "x-exchange";
/// Header preserving the routing key a delivery was first published with.
pub const ROUTING_KEY_HEADER: &str = "x-routing-key";

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker is not connected; call connect() first")]
    NotConnected,

    #[error("broker connection is closed")]
    Closed,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("exchange '{0}' has not been declared")]
    UnknownExchange(String),

    #[error("queue '{0}' has not been declared")]
    UnknownQueue(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

impl BrokerError {
    /// Lifecycle errors are a caller bug, not a transport hiccup; retrying
    /// them only delays the failure.
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, BrokerError::NotConnected | BrokerError::Closed)
    }
}

/// Connection lifecycle shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connected,
    Closed,
}

impl ConnectionState {
    pub fn ensure_open(self) -> Result<()> {
        match self {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Idle => Err(BrokerError::NotConnected),
            ConnectionState::Closed => Err(BrokerError::Closed),
        }
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    /// Zero on first delivery.
    pub redelivery_count: u32,
    /// Set only on messages sitting in a dead-letter queue.
    pub death_reason: Option<String>,
}

impl Delivery {
    pub fn new(exchange: &str, routing_key: &str, payload: &[u8]) -> Self {
        Self {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
            redelivery_count: 0,
            death_reason: None,
        }
    }
}

/// What the broker does with a delivery once its handler returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Remove the message from the queue.
    Ack,
    /// Hand the message back to its queue with the redelivery count bumped.
    Requeue,
    /// Move the message to the queue's dead-letter queue.
    DeadLetter { reason: String },
}

/// Receives raw deliveries from a queue.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Disposition;
}

/// A durable, topic-routed publish/subscribe transport.
///
/// All operations except `connect` and `close` fail fast with
/// [`BrokerError::NotConnected`] before `connect` and [`BrokerError::Closed`]
/// after `close`.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> Result<()>;

    fn state(&self) -> ConnectionState;

    /// Declare a durable topic exchange.
    async fn declare_exchange(&self, exchange: &str) -> Result<()>;

    /// Declare a durable queue together with its dead-letter queue.
    async fn declare_queue(&self, queue: &str) -> Result<()>;

    /// Route messages on `exchange` whose routing key matches `pattern` to `queue`.
    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()>;

    /// Publish one persistent message. Returns once the broker has accepted it.
    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()>;

    /// Start delivering messages from `queue` to `handler` in the background.
    async fn consume(&self, queue: &str, handler: Arc<dyn DeliveryHandler>) -> Result<()>;

    /// Stop every consumer and release the connection.
    async fn close(&self) -> Result<()>;
}

/// Name of the dead-letter queue that backs `queue`.
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{}.dlq", queue)
}

/// AMQP topic matching: `*` matches exactly one word, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (None, Some(_)) => false,
        (Some((&"#", rest)), _) => {
            words_match(rest, key) || (!key.is_empty() && words_match(pattern, &key[1..]))
        }
        (Some(_), None) => false,
        (Some((&"*", rest)), Some((_, key_rest))) => words_match(rest, key_rest),
        (Some((word, rest)), Some((candidate, key_rest))) => {
            word == candidate && words_match(rest, key_rest)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matches_exact() {
        assert!(topic_matches("stock.created", "stock.created"));
        assert!(!topic_matches("stock.created", "stock.deleted"));
        assert!(!topic_matches("stock.created", "stock.created.extra"));
    }

    #[test]
    fn test_topic_matches_star_is_one_word() {
        assert!(topic_matches("stock.*", "stock.out_of_stock"));
        assert!(!topic_matches("stock.*", "stock"));
        assert!(!topic_matches("stock.*", "stock.a.b"));
        assert!(!topic_matches("stock.*", "product.created"));
    }

    #[test]
    fn test_topic_matches_hash_is_zero_or_more_words() {
        assert!(topic_matches("#", "product.created"));
        assert!(topic_matches("stock.#", "stock"));
        assert!(topic_matches("stock.#", "stock.a.b"));
        assert!(topic_matches("#.created", "product.created"));
        assert!(!topic_matches("#.created", "product.deleted"));
    }

    #[test]
    fn test_connection_state_guard() {
        assert!(matches!(
            ConnectionState::Idle.ensure_open(),
            Err(BrokerError::NotConnected)
        ));
        assert!(matches!(
            ConnectionState::Closed.ensure_open(),
            Err(BrokerError::Closed)
        ));
        assert!(ConnectionState::Connected.ensure_open().is_ok());
    }

    #[test]
    fn test_dead_letter_queue_name() {
        assert_eq!(dead_letter_queue("inventory_service_q"), "inventory_service_q.dlq");
    }
}
