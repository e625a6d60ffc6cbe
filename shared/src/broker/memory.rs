//! In-memory broker fabric.
//!
//! Mirrors the AMQP model (topic exchanges, durable queues, bindings,
//! ack/requeue/dead-letter) inside one process. Used by the test suites and
//! by `--broker memory`, where a single service runs without a peer.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    dead_letter_queue, topic_matches, Broker, BrokerError, ConnectionState, Delivery,
    DeliveryHandler, Disposition, Result,
};

#[derive(Default)]
struct QueueState {
    messages: VecDeque<Delivery>,
    notify: Arc<Notify>,
    consumers: usize,
}

struct Binding {
    queue: String,
    exchange: String,
    pattern: String,
}

#[derive(Default)]
struct Fabric {
    exchanges: HashSet<String>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
}

impl Fabric {
    fn enqueue(&mut self, queue: &str, delivery: Delivery) -> Result<()> {
        let state = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        state.messages.push_back(delivery);
        state.notify.notify_one();
        Ok(())
    }
}

/// A delivery taken off its queue but not yet settled. Dropped unsettled
/// (the consumer task was aborted mid-handle), it goes back to the head of
/// the queue, as an unacked AMQP message would.
struct Unsettled {
    fabric: Arc<Mutex<Fabric>>,
    in_flight: Arc<AtomicUsize>,
    queue: String,
    delivery: Option<Delivery>,
}

impl Unsettled {
    fn settle(mut self, disposition: Disposition) {
        if let Some(delivery) = self.delivery.take() {
            InMemoryBroker::settle(&self.fabric, &self.queue, delivery, disposition);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for Unsettled {
    fn drop(&mut self) {
        let Some(delivery) = self.delivery.take() else {
            return;
        };
        let mut fabric = lock(&self.fabric);
        if let Some(state) = fabric.queues.get_mut(&self.queue) {
            debug!(queue = %self.queue, routing_key = %delivery.routing_key, "Returned unsettled delivery");
            state.messages.push_front(delivery);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Process-local broker. Cheap to share behind an `Arc`.
pub struct InMemoryBroker {
    fabric: Arc<Mutex<Fabric>>,
    state: Mutex<ConnectionState>,
    in_flight: Arc<AtomicUsize>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// A broker that still has to be connected.
    pub fn new() -> Self {
        Self {
            fabric: Arc::new(Mutex::new(Fabric::default())),
            state: Mutex::new(ConnectionState::Idle),
            in_flight: Arc::new(AtomicUsize::new(0)),
            consumers: Mutex::new(Vec::new()),
        }
    }

    /// A broker that is already connected.
    pub fn connected() -> Self {
        let broker = Self::new();
        *lock(&broker.state) = ConnectionState::Connected;
        broker
    }

    fn ensure_open(&self) -> Result<()> {
        lock(&self.state).ensure_open()
    }

    /// Messages currently waiting in `queue`, oldest first.
    pub fn queued(&self, queue: &str) -> Vec<Delivery> {
        lock(&self.fabric)
            .queues
            .get(queue)
            .map(|q| q.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove and return every message waiting in `queue`.
    pub fn drain(&self, queue: &str) -> Vec<Delivery> {
        lock(&self.fabric)
            .queues
            .get_mut(queue)
            .map(|q| q.messages.drain(..).collect())
            .unwrap_or_default()
    }

    /// Messages dead-lettered from `queue`.
    pub fn dead_letters(&self, queue: &str) -> Vec<Delivery> {
        self.queued(&dead_letter_queue(queue))
    }

    /// Wait until every queue with a consumer is empty and no delivery is
    /// being handled. Returns `false` if that did not happen within `timeout`.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_idle() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    fn is_idle(&self) -> bool {
        let fabric = lock(&self.fabric);
        let queues_drained = fabric
            .queues
            .values()
            .filter(|q| q.consumers > 0)
            .all(|q| q.messages.is_empty());
        queues_drained && self.in_flight.load(Ordering::SeqCst) == 0
    }

    async fn run_consumer(
        fabric: Arc<Mutex<Fabric>>,
        in_flight: Arc<AtomicUsize>,
        queue: String,
        notify: Arc<Notify>,
        handler: Arc<dyn DeliveryHandler>,
    ) {
        loop {
            let next = {
                let mut fabric = lock(&fabric);
                let delivery = fabric
                    .queues
                    .get_mut(&queue)
                    .and_then(|q| q.messages.pop_front());
                if delivery.is_some() {
                    in_flight.fetch_add(1, Ordering::SeqCst);
                }
                delivery
            };

            let Some(delivery) = next else {
                notify.notified().await;
                continue;
            };

            let unsettled = Unsettled {
                fabric: fabric.clone(),
                in_flight: in_flight.clone(),
                queue: queue.clone(),
                delivery: Some(delivery.clone()),
            };
            let disposition = handler.handle(&delivery).await;
            let requeued = matches!(disposition, Disposition::Requeue);
            unsettled.settle(disposition);

            if requeued {
                tokio::task::yield_now().await;
            }
        }
    }

    fn settle(fabric: &Mutex<Fabric>, queue: &str, mut delivery: Delivery, disposition: Disposition) {
        let mut fabric = lock(fabric);
        let outcome = match disposition {
            Disposition::Ack => Ok(()),
            Disposition::Requeue => {
                delivery.redelivery_count += 1;
                debug!(
                    queue = %queue,
                    routing_key = %delivery.routing_key,
                    redelivery_count = delivery.redelivery_count,
                    "Requeued delivery"
                );
                fabric.enqueue(queue, delivery)
            }
            Disposition::DeadLetter { reason } => {
                warn!(
                    queue = %queue,
                    routing_key = %delivery.routing_key,
                    reason = %reason,
                    "Dead-lettered delivery"
                );
                delivery.death_reason = Some(reason);
                fabric.enqueue(&dead_letter_queue(queue), delivery)
            }
        };
        if let Err(e) = outcome {
            warn!(queue = %queue, error = %e, "Failed to settle delivery");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> Result<()> {
        *lock(&self.state) = ConnectionState::Connected;
        info!("In-memory broker connected");
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        self.ensure_open()?;
        lock(&self.fabric).exchanges.insert(exchange.to_string());
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        let mut fabric = lock(&self.fabric);
        fabric.queues.entry(queue.to_string()).or_default();
        fabric.queues.entry(dead_letter_queue(queue)).or_default();
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        self.ensure_open()?;
        let mut fabric = lock(&self.fabric);
        if !fabric.exchanges.contains(exchange) {
            return Err(BrokerError::UnknownExchange(exchange.to_string()));
        }
        if !fabric.queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        }
        let exists = fabric
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.pattern == pattern);
        if !exists {
            fabric.bindings.push(Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                pattern: pattern.to_string(),
            });
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let mut fabric = lock(&self.fabric);
        if !fabric.exchanges.contains(exchange) {
            return Err(BrokerError::UnknownExchange(exchange.to_string()));
        }

        // One copy per queue, however many of its bindings match.
        let mut targets: Vec<String> = fabric
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && topic_matches(&b.pattern, routing_key))
            .map(|b| b.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();

        if targets.is_empty() {
            debug!(exchange = %exchange, routing_key = %routing_key, "Published message had no route");
        }
        for queue in targets {
            fabric.enqueue(&queue, Delivery::new(exchange, routing_key, payload))?;
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, handler: Arc<dyn DeliveryHandler>) -> Result<()> {
        self.ensure_open()?;
        let notify = {
            let mut fabric = lock(&self.fabric);
            let state = fabric
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
            state.consumers += 1;
            state.notify.clone()
        };

        let handle = tokio::spawn(Self::run_consumer(
            self.fabric.clone(),
            self.in_flight.clone(),
            queue.to_string(),
            notify,
            handler,
        ));
        lock(&self.consumers).push(handle);

        info!(queue = %queue, "In-memory consumer started");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        for handle in lock(&self.consumers).drain(..) {
            handle.abort();
        }
        {
            let mut fabric = lock(&self.fabric);
            for state in fabric.queues.values_mut() {
                state.consumers = 0;
            }
        }
        *lock(&self.state) = ConnectionState::Closed;
        info!("In-memory broker closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct Recording {
        seen: Mutex<Vec<Delivery>>,
        disposition: Disposition,
        calls: AtomicU32,
    }

    impl Recording {
        fn new(disposition: Disposition) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                disposition,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl DeliveryHandler for Recording {
        async fn handle(&self, delivery: &Delivery) -> Disposition {
            self.calls.fetch_add(1, Ordering::SeqCst);
            lock(&self.seen).push(delivery.clone());
            self.disposition.clone()
        }
    }

    async fn topology(broker: &InMemoryBroker) {
        broker.declare_exchange("inventory_event").await.unwrap();
        broker.declare_queue("product_service_q").await.unwrap();
        broker
            .bind_queue("product_service_q", "inventory_event", "stock.*")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_operations_fail_fast_before_connect() {
        let broker = InMemoryBroker::new();
        assert!(matches!(
            broker.declare_exchange("inventory_event").await,
            Err(BrokerError::NotConnected)
        ));
        assert!(matches!(
            broker.publish("inventory_event", "stock.created", b"{}").await,
            Err(BrokerError::NotConnected)
        ));

        broker.connect().await.unwrap();
        assert!(broker.declare_exchange("inventory_event").await.is_ok());
    }

    #[tokio::test]
    async fn test_operations_fail_fast_after_close() {
        let broker = InMemoryBroker::connected();
        topology(&broker).await;
        broker.close().await.unwrap();

        assert_eq!(broker.state(), ConnectionState::Closed);
        assert!(matches!(
            broker.publish("inventory_event", "stock.created", b"{}").await,
            Err(BrokerError::Closed)
        ));
        let handler = Recording::new(Disposition::Ack);
        assert!(matches!(
            broker.consume("product_service_q", handler).await,
            Err(BrokerError::Closed)
        ));
    }

    struct Stalled {
        started: Arc<Notify>,
    }

    #[async_trait]
    impl DeliveryHandler for Stalled {
        async fn handle(&self, _delivery: &Delivery) -> Disposition {
            self.started.notify_one();
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_close_returns_delivery_being_handled() {
        let broker = InMemoryBroker::connected();
        topology(&broker).await;
        let started = Arc::new(Notify::new());
        broker
            .consume(
                "product_service_q",
                Arc::new(Stalled {
                    started: started.clone(),
                }),
            )
            .await
            .unwrap();
        broker
            .publish("inventory_event", "stock.created", b"{\"productId\":1}")
            .await
            .unwrap();
        started.notified().await;
        assert!(broker.queued("product_service_q").is_empty());

        broker.close().await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while broker.queued("product_service_q").is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "delivery was lost");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let queued = broker.queued("product_service_q");
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].routing_key, "stock.created");
        assert_eq!(queued[0].redelivery_count, 0);
        assert!(broker.wait_idle(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_publish_routes_by_binding_pattern() {
        let broker = InMemoryBroker::connected();
        topology(&broker).await;
        broker.declare_exchange("products_event").await.unwrap();
        broker.declare_queue("audit_q").await.unwrap();
        broker.bind_queue("audit_q", "inventory_event", "#").await.unwrap();
        broker
            .bind_queue("audit_q", "inventory_event", "stock.created")
            .await
            .unwrap();

        broker
            .publish("inventory_event", "stock.created", b"{\"productId\":1}")
            .await
            .unwrap();
        broker
            .publish("products_event", "product.created", b"{}")
            .await
            .unwrap();

        assert_eq!(broker.queued("product_service_q").len(), 1);
        // Two matching bindings still yield a single copy.
        assert_eq!(broker.queued("audit_q").len(), 1);
        assert_eq!(broker.queued("audit_q")[0].routing_key, "stock.created");
    }

    #[tokio::test]
    async fn test_publish_to_undeclared_exchange_fails() {
        let broker = InMemoryBroker::connected();
        assert!(matches!(
            broker.publish("nowhere", "stock.created", b"{}").await,
            Err(BrokerError::UnknownExchange(_))
        ));
    }

    #[tokio::test]
    async fn test_ack_removes_message() {
        let broker = InMemoryBroker::connected();
        topology(&broker).await;
        let handler = Recording::new(Disposition::Ack);
        broker
            .consume("product_service_q", handler.clone())
            .await
            .unwrap();

        broker
            .publish("inventory_event", "stock.created", b"{}")
            .await
            .unwrap();
        assert!(broker.wait_idle(Duration::from_secs(2)).await);

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(broker.queued("product_service_q").is_empty());
        assert!(broker.dead_letters("product_service_q").is_empty());
    }

    #[tokio::test]
    async fn test_requeue_bumps_redelivery_count() {
        let broker = InMemoryBroker::connected();
        topology(&broker).await;
        broker
            .publish("inventory_event", "stock.replenish", b"{}")
            .await
            .unwrap();

        // Settle by hand so the requeued copy is observable.
        let delivery = broker.drain("product_service_q").remove(0);
        InMemoryBroker::settle(&broker.fabric, "product_service_q", delivery, Disposition::Requeue);

        let queued = broker.queued("product_service_q");
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].redelivery_count, 1);
    }

    #[tokio::test]
    async fn test_dead_letter_moves_message_with_reason() {
        let broker = InMemoryBroker::connected();
        topology(&broker).await;
        let handler = Recording::new(Disposition::DeadLetter {
            reason: "poison".to_string(),
        });
        broker
            .consume("product_service_q", handler.clone())
            .await
            .unwrap();

        broker
            .publish("inventory_event", "stock.deleted", b"garbage")
            .await
            .unwrap();
        assert!(broker.wait_idle(Duration::from_secs(2)).await);

        let dead = broker.dead_letters("product_service_q");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].payload, b"garbage".to_vec());
        assert_eq!(dead[0].death_reason.as_deref(), Some("poison"));
    }

    #[tokio::test]
    async fn test_unbounded_requeue_never_settles() {
        let broker = InMemoryBroker::connected();
        topology(&broker).await;
        let handler = Recording::new(Disposition::Requeue);
        broker
            .consume("product_service_q", handler.clone())
            .await
            .unwrap();

        broker
            .publish("inventory_event", "stock.created", b"{}")
            .await
            .unwrap();

        assert!(!broker.wait_idle(Duration::from_millis(100)).await);
        assert!(handler.calls.load(Ordering::SeqCst) > 1);
        broker.close().await.unwrap();
    }
}
