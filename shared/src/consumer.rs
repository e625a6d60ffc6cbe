//! Choreography consumer plumbing.
//!
//! A [`ConsumerGroup`] owns one durable queue and its bindings. Deliveries
//! are decoded into [`Fact`]s and handed to a [`FactHandler`]; the outcome
//! picks the broker disposition:
//!
//! | outcome                      | disposition                        |
//! |------------------------------|------------------------------------|
//! | `Ok(())`                     | ack                                |
//! | undecodable payload          | dead-letter                        |
//! | `HandlerError::Permanent`    | dead-letter                        |
//! | `HandlerError::Transient`    | requeue, dead-letter once exhausted|

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::broker::{Broker, BrokerError, Delivery, DeliveryHandler, Disposition};
use crate::facts::Fact;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The transition may succeed if the fact is delivered again.
    #[error("transient: {0}")]
    Transient(String),

    /// Redelivering the fact cannot help.
    #[error("permanent: {0}")]
    Permanent(String),
}

/// Applies one fact to local state. Implementations must be idempotent and
/// treat facts about unknown products as no-ops.
#[async_trait]
pub trait FactHandler: Send + Sync {
    async fn handle(&self, fact: Fact) -> Result<(), HandlerError>;
}

/// How many times a transiently failing fact goes back to its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedeliveryPolicy {
    /// Dead-letter after this many redeliveries.
    Bounded(u32),
    /// Requeue forever.
    Unbounded,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        RedeliveryPolicy::Bounded(5)
    }
}

impl RedeliveryPolicy {
    fn allows_redelivery(self, redelivery_count: u32) -> bool {
        match self {
            RedeliveryPolicy::Bounded(max) => redelivery_count < max,
            RedeliveryPolicy::Unbounded => true,
        }
    }
}

/// Bridges raw deliveries to a [`FactHandler`].
pub struct FactDispatcher {
    queue: String,
    handler: Arc<dyn FactHandler>,
    policy: RedeliveryPolicy,
}

impl FactDispatcher {
    pub fn new(queue: impl Into<String>, handler: Arc<dyn FactHandler>, policy: RedeliveryPolicy) -> Self {
        Self {
            queue: queue.into(),
            handler,
            policy,
        }
    }
}

#[async_trait]
impl DeliveryHandler for FactDispatcher {
    async fn handle(&self, delivery: &Delivery) -> Disposition {
        let span = info_span!(
            "fact",
            queue = %self.queue,
            routing_key = %delivery.routing_key,
            redelivery_count = delivery.redelivery_count,
        );

        async {
            let fact = match Fact::decode(&delivery.routing_key, &delivery.payload) {
                Ok(fact) => fact,
                Err(e) => {
                    error!(error = %e, "Undecodable fact");
                    return Disposition::DeadLetter {
                        reason: e.to_string(),
                    };
                }
            };
            let product_id = fact.product_id();

            match self.handler.handle(fact).await {
                Ok(()) => {
                    debug!(product_id = %product_id, "Fact applied");
                    Disposition::Ack
                }
                Err(HandlerError::Permanent(reason)) => {
                    error!(product_id = %product_id, reason = %reason, "Fact rejected");
                    Disposition::DeadLetter { reason }
                }
                Err(HandlerError::Transient(reason))
                    if self.policy.allows_redelivery(delivery.redelivery_count) =>
                {
                    warn!(product_id = %product_id, reason = %reason, "Fact failed, requeueing");
                    Disposition::Requeue
                }
                Err(HandlerError::Transient(reason)) => {
                    error!(product_id = %product_id, reason = %reason, "Redeliveries exhausted");
                    Disposition::DeadLetter {
                        reason: format!(
                            "redeliveries exhausted after {}: {}",
                            delivery.redelivery_count, reason
                        ),
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// A durable queue plus the bindings that feed it.
#[derive(Debug, Clone)]
pub struct ConsumerGroup {
    queue: String,
    bindings: Vec<(String, String)>,
    policy: RedeliveryPolicy,
}

impl ConsumerGroup {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            bindings: Vec::new(),
            policy: RedeliveryPolicy::default(),
        }
    }

    /// Route facts on `exchange` matching `pattern` into this group's queue.
    pub fn bind(mut self, exchange: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.bindings.push((exchange.into(), pattern.into()));
        self
    }

    pub fn with_policy(mut self, policy: RedeliveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Declare exchanges, queue and bindings, then start consuming.
    pub async fn start(
        &self,
        broker: &dyn Broker,
        handler: Arc<dyn FactHandler>,
    ) -> Result<(), BrokerError> {
        self.declare(broker).await?;
        let dispatcher = FactDispatcher::new(self.queue.clone(), handler, self.policy);
        broker.consume(&self.queue, Arc::new(dispatcher)).await?;
        info!(queue = %self.queue, policy = ?self.policy, "Consumer group started");
        Ok(())
    }

    /// Declare the topology without consuming.
    pub async fn declare(&self, broker: &dyn Broker) -> Result<(), BrokerError> {
        for (exchange, _) in &self.bindings {
            broker.declare_exchange(exchange).await?;
        }
        broker.declare_queue(&self.queue).await?;
        for (exchange, pattern) in &self.bindings {
            broker.bind_queue(&self.queue, exchange, pattern).await?;
        }
        Ok(())
    }
}
