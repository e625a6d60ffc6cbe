//! Inventory authority: the stock ledger, its engine, the consumer that
//! follows the product authority's facts, and the HTTP surface.

pub mod api;
pub mod db;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod models;
pub mod schema;
pub mod stock;
pub mod store;

use shared::{ConsumerGroup, RedeliveryPolicy, PRODUCTS_EXCHANGE};

pub use error::LedgerError;
pub use handlers::InventoryFactHandler;
pub use ledger::LedgerEngine;
pub use stock::{StockEntry, StockOp, StockTransition};

pub const QUEUE: &str = "inventory_service_q";

/// `inventory_service_q`, fed by the product lifecycle facts.
pub fn consumer_group(policy: RedeliveryPolicy) -> ConsumerGroup {
    ConsumerGroup::new(QUEUE)
        .bind(PRODUCTS_EXCHANGE, "product.created")
        .bind(PRODUCTS_EXCHANGE, "product.deleted")
        .with_policy(policy)
}
