//! AMQP (RabbitMQ) broker.
//!
//! One connection and one channel per process, opened by `connect` and
//! released by `close`. Publishing uses publisher confirms and persistent
//! delivery mode; consumers acknowledge manually.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery as AmqpDelivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    dead_letter_queue, Broker, BrokerError, ConnectionState, Delivery, DeliveryHandler,
    Disposition, Result, DEATH_REASON_HEADER, EXCHANGE_HEADER, REDELIVERY_HEADER,
    ROUTING_KEY_HEADER,
};

/// Configuration for the AMQP connection.
#[derive(Clone, Debug)]
pub struct AmqpConfig {
    /// AMQP connection URL (e.g., amqp://localhost:5672).
    pub url: String,
    /// Unacknowledged deliveries a consumer may hold at once.
    pub prefetch: u16,
}

impl AmqpConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            prefetch: 16,
        }
    }
}

struct Link {
    connection: Connection,
    channel: Channel,
}

/// RabbitMQ-backed broker.
pub struct AmqpBroker {
    config: AmqpConfig,
    state: Mutex<ConnectionState>,
    link: RwLock<Option<Link>>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

impl AmqpBroker {
    pub fn new(config: AmqpConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ConnectionState::Idle),
            link: RwLock::new(None),
            consumers: Mutex::new(Vec::new()),
        }
    }

    async fn channel(&self) -> Result<Channel> {
        self.state().ensure_open()?;
        self.link
            .read()
            .await
            .as_ref()
            .map(|link| link.channel.clone())
            .ok_or(BrokerError::NotConnected)
    }

    async fn publish_with_headers(
        channel: &Channel,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        headers: FieldTable,
    ) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2) // persistent
            .with_headers(headers);

        let confirm = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Publish(format!("Failed to publish: {}", e)))?;

        let confirmation = confirm
            .await
            .map_err(|e| BrokerError::Publish(format!("Publish confirmation failed: {}", e)))?;
        if confirmation.is_nack() {
            return Err(BrokerError::Publish(
                "Broker negatively acknowledged the message".to_string(),
            ));
        }
        Ok(())
    }

    async fn run_consumer(
        channel: Channel,
        queue: String,
        mut consumer: lapin::Consumer,
        handler: Arc<dyn DeliveryHandler>,
    ) {
        while let Some(next) = consumer.next().await {
            let raw = match next {
                Ok(raw) => raw,
                Err(e) => {
                    error!(queue = %queue, error = %e, "Consumer delivery error, stopping");
                    break;
                }
            };

            let delivery = to_delivery(&raw);
            let disposition = handler.handle(&delivery).await;
            if let Err(e) = Self::settle(&channel, &queue, &raw, &delivery, disposition).await {
                error!(queue = %queue, error = %e, "Failed to settle delivery");
            }
        }
        info!(queue = %queue, "Consumer stream ended");
    }

    async fn settle(
        channel: &Channel,
        queue: &str,
        raw: &AmqpDelivery,
        delivery: &Delivery,
        disposition: Disposition,
    ) -> Result<()> {
        let forwarded = match disposition {
            Disposition::Ack => None,
            Disposition::Requeue => {
                // A plain nack would lose the counter, so hand the message back
                // through the default exchange with the count bumped.
                let headers = forwarding_headers(delivery, delivery.redelivery_count + 1, None);
                Some((queue.to_string(), headers))
            }
            Disposition::DeadLetter { reason } => {
                warn!(
                    queue = %queue,
                    routing_key = %delivery.routing_key,
                    reason = %reason,
                    "Dead-lettering delivery"
                );
                let headers = forwarding_headers(delivery, delivery.redelivery_count, Some(&reason));
                Some((dead_letter_queue(queue), headers))
            }
        };

        if let Some((target, headers)) = forwarded {
            if let Err(e) =
                Self::publish_with_headers(channel, "", &target, &delivery.payload, headers).await
            {
                error!(queue = %queue, target = %target, error = %e, "Forwarding failed, requeueing original");
                return raw
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| BrokerError::Subscribe(format!("Failed to nack: {}", e)));
            }
        }

        raw.ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Subscribe(format!("Failed to ack: {}", e)))
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn to_delivery(raw: &AmqpDelivery) -> Delivery {
    let headers = raw.properties.headers();
    Delivery {
        exchange: header_string(headers, EXCHANGE_HEADER)
            .unwrap_or_else(|| raw.exchange.as_str().to_string()),
        routing_key: header_string(headers, ROUTING_KEY_HEADER)
            .unwrap_or_else(|| raw.routing_key.as_str().to_string()),
        payload: raw.data.clone(),
        redelivery_count: header_u32(headers, REDELIVERY_HEADER).unwrap_or(0),
        death_reason: header_string(headers, DEATH_REASON_HEADER),
    }
}

fn forwarding_headers(delivery: &Delivery, redelivery_count: u32, reason: Option<&str>) -> FieldTable {
    let mut headers = FieldTable::default();
    headers.insert(
        EXCHANGE_HEADER.into(),
        AMQPValue::LongString(delivery.exchange.clone().into()),
    );
    headers.insert(
        ROUTING_KEY_HEADER.into(),
        AMQPValue::LongString(delivery.routing_key.clone().into()),
    );
    headers.insert(REDELIVERY_HEADER.into(), AMQPValue::LongUInt(redelivery_count));
    if let Some(reason) = reason {
        headers.insert(
            DEATH_REASON_HEADER.into(),
            AMQPValue::LongString(reason.to_string().into()),
        );
    }
    headers
}

fn header_string(headers: &Option<FieldTable>, key: &str) -> Option<String> {
    match headers.as_ref()?.inner().get(key)? {
        AMQPValue::LongString(value) => Some(String::from_utf8_lossy(value.as_bytes()).into_owned()),
        _ => None,
    }
}

fn header_u32(headers: &Option<FieldTable>, key: &str) -> Option<u32> {
    match headers.as_ref()?.inner().get(key)? {
        AMQPValue::LongUInt(value) => Some(*value),
        AMQPValue::LongInt(value) => u32::try_from(*value).ok(),
        AMQPValue::LongLongInt(value) => u32::try_from(*value).ok(),
        _ => None,
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self) -> Result<()> {
        let mut link = self.link.write().await;
        if link.is_some() {
            return Ok(());
        }

        let connection = Connection::connect(&self.config.url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to connect: {}", e)))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to create channel: {}", e)))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to enable confirms: {}", e)))?;
        channel
            .basic_qos(self.config.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to set prefetch: {}", e)))?;

        *link = Some(Link {
            connection,
            channel,
        });
        self.set_state(ConnectionState::Connected);

        info!(url = %self.config.url, "Connected to AMQP");
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to declare exchange: {}", e)))?;
        debug!(exchange = %exchange, "Declared exchange");
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        let channel = self.channel().await?;
        for name in [queue.to_string(), dead_letter_queue(queue)] {
            channel
                .queue_declare(
                    &name,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::Subscribe(format!("Failed to declare queue: {}", e)))?;
        }
        debug!(queue = %queue, "Declared queue");
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Subscribe(format!("Failed to bind queue: {}", e)))?;

        info!(queue = %queue, exchange = %exchange, pattern = %pattern, "Bound queue to exchange");
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        let channel = self.channel().await?;
        Self::publish_with_headers(&channel, exchange, routing_key, payload, FieldTable::default())
            .await?;
        debug!(exchange = %exchange, routing_key = %routing_key, "Published message");
        Ok(())
    }

    async fn consume(&self, queue: &str, handler: Arc<dyn DeliveryHandler>) -> Result<()> {
        let channel = self.channel().await?;
        let tag = format!("{}-{}", queue, uuid::Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        let handle = tokio::spawn(Self::run_consumer(
            channel,
            queue.to_string(),
            consumer,
            handler,
        ));
        lock(&self.consumers).push(handle);

        info!(queue = %queue, consumer_tag = %tag, "Consumer started");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        for handle in lock(&self.consumers).drain(..) {
            handle.abort();
        }
        self.set_state(ConnectionState::Closed);

        if let Some(link) = self.link.write().await.take() {
            if let Err(e) = link.channel.close(200, "closing").await {
                warn!(error = %e, "Failed to close channel");
            }
            if let Err(e) = link.connection.close(200, "closing").await {
                warn!(error = %e, "Failed to close connection");
            }
        }
        info!("AMQP connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarding_headers_preserve_origin() {
        let delivery = Delivery::new("inventory_event", "stock.created", b"{}");
        let headers = Some(forwarding_headers(&delivery, 3, Some("boom")));

        assert_eq!(
            header_string(&headers, EXCHANGE_HEADER).as_deref(),
            Some("inventory_event")
        );
        assert_eq!(
            header_string(&headers, ROUTING_KEY_HEADER).as_deref(),
            Some("stock.created")
        );
        assert_eq!(header_u32(&headers, REDELIVERY_HEADER), Some(3));
        assert_eq!(header_string(&headers, DEATH_REASON_HEADER).as_deref(), Some("boom"));
    }

    #[test]
    fn test_missing_headers_read_as_none() {
        assert_eq!(header_u32(&None, REDELIVERY_HEADER), None);
        assert_eq!(header_string(&Some(FieldTable::default()), EXCHANGE_HEADER), None);
    }

    #[tokio::test]
    async fn test_publish_before_connect_fails_fast() {
        let broker = AmqpBroker::new(AmqpConfig::new("amqp://localhost:5672"));
        assert!(matches!(
            broker.publish("inventory_event", "stock.created", b"{}").await,
            Err(BrokerError::NotConnected)
        ));
        broker.close().await.unwrap();
        assert!(matches!(
            broker.declare_queue("q").await,
            Err(BrokerError::Closed)
        ));
    }
}

/// Integration tests requiring a running RabbitMQ instance.
///
/// Run with: AMQP_URL=amqp://localhost:5672 cargo test -p shared amqp_integration -- --ignored
#[cfg(test)]
mod amqp_integration {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn amqp_url() -> String {
        std::env::var("AMQP_URL").unwrap_or_else(|_| "amqp://localhost:5672".to_string())
    }

    struct Forwarding(mpsc::Sender<Delivery>);

    #[async_trait]
    impl DeliveryHandler for Forwarding {
        async fn handle(&self, delivery: &Delivery) -> Disposition {
            let _ = self.0.send(delivery.clone()).await;
            Disposition::Ack
        }
    }

    #[tokio::test]
    #[ignore = "Requires RabbitMQ"]
    async fn test_publish_and_consume() {
        let broker = AmqpBroker::new(AmqpConfig::new(amqp_url()));
        broker.connect().await.expect("Failed to connect");

        let queue = format!("test-queue-{}", uuid::Uuid::new_v4());
        broker.declare_exchange("inventory_event").await.unwrap();
        broker.declare_queue(&queue).await.unwrap();
        broker
            .bind_queue(&queue, "inventory_event", "stock.*")
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        broker.consume(&queue, Arc::new(Forwarding(tx))).await.unwrap();
        broker
            .publish("inventory_event", "stock.created", br#"{"productId":1,"quantity":1}"#)
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("Timed out waiting for message")
            .expect("Channel closed");
        assert_eq!(received.routing_key, "stock.created");
        assert_eq!(received.redelivery_count, 0);

        broker.close().await.unwrap();
    }
}
