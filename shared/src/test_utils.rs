//! Fault injection for broker-dependent tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::broker::{Broker, BrokerError, ConnectionState, DeliveryHandler, Result};

/// Wraps a broker and fails the first `failures` publishes with a transport
/// error. Every other operation is delegated untouched.
pub struct FlakyBroker {
    inner: Arc<dyn Broker>,
    failures: usize,
    attempts: AtomicUsize,
}

impl FlakyBroker {
    pub fn new(inner: Arc<dyn Broker>, failures: usize) -> Self {
        Self {
            inner,
            failures,
            attempts: AtomicUsize::new(0),
        }
    }

    /// Publish attempts seen so far, failed or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for FlakyBroker {
    async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        self.inner.declare_exchange(exchange).await
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.inner.declare_queue(queue).await
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        self.inner.bind_queue(queue, exchange, pattern).await
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures && self.inner.state() == ConnectionState::Connected {
            return Err(BrokerError::Publish(format!(
                "injected failure {} of {}",
                attempt + 1,
                self.failures
            )));
        }
        self.inner.publish(exchange, routing_key, payload).await
    }

    async fn consume(&self, queue: &str, handler: Arc<dyn DeliveryHandler>) -> Result<()> {
        self.inner.consume(queue, handler).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
