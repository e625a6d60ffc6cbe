//! Building blocks shared by the inventory and product authorities: the fact
//! model, the broker fabric, the resilient publisher and the consumer
//! dispatcher.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod facts;
pub mod publisher;
pub mod telemetry;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use broker::{Broker, BrokerError, ConnectionState, Delivery, Disposition, InMemoryBroker};
pub use config::{connect_broker, BrokerArgs, BrokerKind};
pub use consumer::{ConsumerGroup, FactDispatcher, FactHandler, HandlerError, RedeliveryPolicy};
pub use facts::{Fact, FactError, FactKind, ProductId, INVENTORY_EXCHANGE, PRODUCTS_EXCHANGE};
pub use publisher::{PublishError, ResilientPublisher, RetryPolicy};
