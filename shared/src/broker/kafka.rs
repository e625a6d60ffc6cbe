//! Kafka broker.
//!
//! Maps the fabric onto Kafka: an exchange is a topic, a queue is a consumer
//! group, and binding patterns are applied on the consumer side against the
//! routing key carried in the message key and `x-routing-key` header.
//! Requeued deliveries go through `<queue>.retry`, dead letters through
//! `<queue>.dlq`, so neither leaks into other consumer groups.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    dead_letter_queue, topic_matches, Broker, BrokerError, ConnectionState, Delivery,
    DeliveryHandler, Disposition, Result, DEATH_REASON_HEADER, EXCHANGE_HEADER,
    REDELIVERY_HEADER, ROUTING_KEY_HEADER,
};

#[derive(Clone, Debug)]
pub struct KafkaConfig {
    /// Bootstrap servers (comma-separated).
    pub brokers: String,
    pub message_timeout: Duration,
}

impl KafkaConfig {
    pub fn new(brokers: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            message_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug)]
struct Binding {
    exchange: String,
    pattern: String,
}

pub struct KafkaBroker {
    config: KafkaConfig,
    state: Mutex<ConnectionState>,
    producer: Mutex<Option<FutureProducer>>,
    bindings: Mutex<HashMap<String, Vec<Binding>>>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

fn retry_topic(queue: &str) -> String {
    format!("{}.retry", queue)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl KafkaBroker {
    pub fn new(config: KafkaConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ConnectionState::Idle),
            producer: Mutex::new(None),
            bindings: Mutex::new(HashMap::new()),
            consumers: Mutex::new(Vec::new()),
        }
    }

    fn producer(&self) -> Result<FutureProducer> {
        self.state().ensure_open()?;
        lock(&self.producer).clone().ok_or(BrokerError::NotConnected)
    }

    async fn send(
        producer: &FutureProducer,
        topic: &str,
        routing_key: &str,
        payload: &[u8],
        headers: OwnedHeaders,
        timeout: Duration,
    ) -> Result<()> {
        let record = FutureRecord::to(topic)
            .key(routing_key)
            .payload(payload)
            .headers(headers);

        producer
            .send(record, timeout)
            .await
            .map_err(|(e, _)| BrokerError::Publish(format!("Failed to publish: {}", e)))?;
        Ok(())
    }

    async fn run_consumer(
        consumer: StreamConsumer,
        producer: FutureProducer,
        queue: String,
        bindings: Vec<Binding>,
        handler: Arc<dyn DeliveryHandler>,
        timeout: Duration,
    ) {
        let mut stream = consumer.stream();

        while let Some(message) = stream.next().await {
            let message = match message {
                Ok(m) => m,
                Err(e) => {
                    error!(queue = %queue, error = %e, "Error receiving message");
                    continue;
                }
            };

            if let Some(delivery) = to_delivery(&message, &queue, &bindings) {
                let disposition = handler.handle(&delivery).await;
                if let Err(e) = Self::settle(&producer, &queue, &delivery, disposition, timeout).await
                {
                    // Leave the offset uncommitted so a restart redelivers it.
                    error!(queue = %queue, error = %e, "Failed to settle delivery");
                    continue;
                }
            }

            if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                error!(queue = %queue, error = %e, "Error committing message");
            }
        }
    }

    async fn settle(
        producer: &FutureProducer,
        queue: &str,
        delivery: &Delivery,
        disposition: Disposition,
        timeout: Duration,
    ) -> Result<()> {
        let (topic, headers) = match disposition {
            Disposition::Ack => return Ok(()),
            Disposition::Requeue => (
                retry_topic(queue),
                forwarding_headers(delivery, delivery.redelivery_count + 1, None),
            ),
            Disposition::DeadLetter { reason } => {
                warn!(
                    queue = %queue,
                    routing_key = %delivery.routing_key,
                    reason = %reason,
                    "Dead-lettering delivery"
                );
                (
                    dead_letter_queue(queue),
                    forwarding_headers(delivery, delivery.redelivery_count, Some(&reason)),
                )
            }
        };
        Self::send(
            producer,
            &topic,
            &delivery.routing_key,
            &delivery.payload,
            headers,
            timeout,
        )
        .await
    }
}

fn forwarding_headers(delivery: &Delivery, redelivery_count: u32, reason: Option<&str>) -> OwnedHeaders {
    let count = redelivery_count.to_string();
    let headers = OwnedHeaders::new()
        .insert(Header {
            key: EXCHANGE_HEADER,
            value: Some(delivery.exchange.as_str()),
        })
        .insert(Header {
            key: ROUTING_KEY_HEADER,
            value: Some(delivery.routing_key.as_str()),
        })
        .insert(Header {
            key: REDELIVERY_HEADER,
            value: Some(count.as_str()),
        });
    match reason {
        Some(reason) => headers.insert(Header {
            key: DEATH_REASON_HEADER,
            value: Some(reason),
        }),
        None => headers,
    }
}

fn header_value(message: &BorrowedMessage<'_>, key: &str) -> Option<String> {
    message.headers().and_then(|headers| {
        headers
            .iter()
            .find(|header| header.key == key)
            .and_then(|header| header.value)
            .map(|value| String::from_utf8_lossy(value).into_owned())
    })
}

/// Translate a Kafka record into a delivery, or `None` if no binding of this
/// queue selects it.
fn to_delivery(message: &BorrowedMessage<'_>, queue: &str, bindings: &[Binding]) -> Option<Delivery> {
    let from_retry = message.topic() == retry_topic(queue);
    let exchange = header_value(message, EXCHANGE_HEADER).unwrap_or_else(|| message.topic().to_string());
    let routing_key = header_value(message, ROUTING_KEY_HEADER)
        .or_else(|| message.key().map(|key| String::from_utf8_lossy(key).into_owned()))?;

    let selected = from_retry
        || bindings
            .iter()
            .any(|b| b.exchange == exchange && topic_matches(&b.pattern, &routing_key));
    if !selected {
        debug!(queue = %queue, routing_key = %routing_key, "Skipping unbound routing key");
        return None;
    }

    Some(Delivery {
        exchange,
        routing_key,
        payload: message.payload().unwrap_or_default().to_vec(),
        redelivery_count: header_value(message, REDELIVERY_HEADER)
            .and_then(|count| count.parse().ok())
            .unwrap_or(0),
        death_reason: header_value(message, DEATH_REASON_HEADER),
    })
}

#[async_trait]
impl Broker for KafkaBroker {
    async fn connect(&self) -> Result<()> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .set("message.timeout.ms", self.config.message_timeout.as_millis().to_string())
            .create()
            .map_err(|e| BrokerError::Connection(format!("Failed to create producer: {}", e)))?;

        *lock(&self.producer) = Some(producer);
        *lock(&self.state) = ConnectionState::Connected;
        info!(brokers = %self.config.brokers, "Connected to Kafka");
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        // Topics are created on first use by the cluster.
        self.state().ensure_open()?;
        debug!(exchange = %exchange, "Exchange maps to topic");
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.state().ensure_open()?;
        lock(&self.bindings).entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        self.state().ensure_open()?;
        let mut bindings = lock(&self.bindings);
        let queue_bindings = bindings
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        queue_bindings.push(Binding {
            exchange: exchange.to_string(),
            pattern: pattern.to_string(),
        });
        info!(queue = %queue, exchange = %exchange, pattern = %pattern, "Bound queue to topic");
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        let producer = self.producer()?;
        let headers = OwnedHeaders::new().insert(Header {
            key: ROUTING_KEY_HEADER,
            value: Some(routing_key),
        });
        Self::send(
            &producer,
            exchange,
            routing_key,
            payload,
            headers,
            self.config.message_timeout,
        )
        .await?;
        debug!(exchange = %exchange, routing_key = %routing_key, "Published message");
        Ok(())
    }

    async fn consume(&self, queue: &str, handler: Arc<dyn DeliveryHandler>) -> Result<()> {
        let producer = self.producer()?;
        let bindings = lock(&self.bindings)
            .get(queue)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        if bindings.is_empty() {
            return Err(BrokerError::Subscribe(format!(
                "Queue '{}' has no bindings",
                queue
            )));
        }

        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", queue)
            .set("bootstrap.servers", &self.config.brokers)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "false")
            .create()
            .map_err(|e| BrokerError::Subscribe(format!("Failed to create consumer: {}", e)))?;

        let mut topics: Vec<String> = bindings.iter().map(|b| b.exchange.clone()).collect();
        topics.sort();
        topics.dedup();
        topics.push(retry_topic(queue));
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| BrokerError::Subscribe(format!("Failed to subscribe: {}", e)))?;

        let handle = tokio::spawn(Self::run_consumer(
            consumer,
            producer,
            queue.to_string(),
            bindings,
            handler,
            self.config.message_timeout,
        ));
        lock(&self.consumers).push(handle);

        info!(queue = %queue, topics = ?topics, "Kafka consumer started");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        for handle in lock(&self.consumers).drain(..) {
            handle.abort();
        }
        lock(&self.producer).take();
        *lock(&self.state) = ConnectionState::Closed;
        info!("Kafka connection closed");
        Ok(())
    }
}
