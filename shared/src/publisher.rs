//! Resilient publisher: one-shot and bounded-retry publication of facts.
//!
//! Facts are published after the local transaction that produced them has
//! committed. Dropping the returned future cancels a retry loop in progress,
//! so callers bound the total wait with their own `tokio::time::timeout`.

use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::broker::{Broker, BrokerError};
use crate::facts::Fact;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("publish to {exchange}/{routing_key} failed after {attempts} attempt(s): {source}")]
    Transport {
        exchange: String,
        routing_key: String,
        attempts: usize,
        #[source]
        source: BrokerError,
    },
}

/// Bounded exponential backoff without jitter, so successive delays never
/// shrink.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay: initial_delay.max(RetryPolicy::default().max_delay),
            ..Self::default()
        }
    }

    /// Delay before each attempt: zero for the first, then the backoff.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let retries = self.max_attempts.max(1) - 1;
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.initial_delay)
            .with_max_delay(self.max_delay.max(self.initial_delay))
            .with_factor(self.factor.max(1.0))
            .with_max_times(retries)
            .build();
        std::iter::once(Duration::ZERO).chain(backoff)
    }
}

/// Publishes JSON payloads through a [`Broker`], retrying transport failures.
#[derive(Clone)]
pub struct ResilientPublisher {
    broker: Arc<dyn Broker>,
    retry: RetryPolicy,
}

impl ResilientPublisher {
    pub fn new(broker: Arc<dyn Broker>, retry: RetryPolicy) -> Self {
        Self { broker, retry }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Exactly one attempt.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &Value,
    ) -> Result<(), PublishError> {
        let body = serde_json::to_vec(payload)?;
        self.broker
            .publish(exchange, routing_key, &body)
            .await
            .map_err(|source| PublishError::Transport {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                attempts: 1,
                source,
            })
    }

    /// Up to `max_attempts` attempts with exponential delays starting at
    /// `initial_delay`. The last failure is returned once attempts run out.
    pub async fn publish_with_retry(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &Value,
        max_attempts: usize,
        initial_delay: Duration,
    ) -> Result<(), PublishError> {
        let policy = RetryPolicy {
            max_attempts,
            initial_delay,
            max_delay: self.retry.max_delay.max(initial_delay),
            factor: self.retry.factor,
        };
        self.publish_with_policy(exchange, routing_key, payload, &policy)
            .await
    }

    /// Announce a fact on its exchange using the configured retry policy.
    pub async fn announce(&self, fact: &Fact) -> Result<(), PublishError> {
        let payload = fact.payload()?;
        self.publish_with_policy(fact.exchange(), fact.routing_key(), &payload, &self.retry)
            .await
    }

    async fn publish_with_policy(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &Value,
        policy: &RetryPolicy,
    ) -> Result<(), PublishError> {
        let body = serde_json::to_vec(payload)?;
        let max_attempts = policy.max_attempts.max(1);
        let mut last_error = None;
        let mut attempts = 0;

        for (attempt, delay) in policy.delays().enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }
            attempts = attempt + 1;

            match self.broker.publish(exchange, routing_key, &body).await {
                Ok(()) => {
                    debug!(
                        exchange = %exchange,
                        routing_key = %routing_key,
                        attempt = attempts,
                        "Published fact"
                    );
                    return Ok(());
                }
                // Retrying cannot connect a broker that was never opened or
                // was already closed.
                Err(e) if e.is_lifecycle() => {
                    error!(exchange = %exchange, routing_key = %routing_key, error = %e, "Broker unavailable");
                    last_error = Some(e);
                    break;
                }
                Err(e) => {
                    warn!(
                        exchange = %exchange,
                        routing_key = %routing_key,
                        attempt = attempts,
                        max_attempts,
                        error = %e,
                        "Publish failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        let source = last_error.unwrap_or_else(|| BrokerError::Publish("no attempt made".to_string()));
        error!(
            exchange = %exchange,
            routing_key = %routing_key,
            attempts,
            error = %source,
            "Giving up on publish"
        );
        Err(PublishError::Transport {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            attempts,
            source,
        })
    }
}
