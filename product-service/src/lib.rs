//! Product authority: the catalog, the availability projection kept in step
//! with the inventory ledger, and the seller/buyer HTTP surface.

pub mod api;
pub mod availability;
pub mod catalog;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod product;
pub mod schema;
pub mod store;

use shared::{ConsumerGroup, RedeliveryPolicy, INVENTORY_EXCHANGE, PRODUCTS_EXCHANGE};

pub use availability::{AvailabilityStatus, StatusUpdate};
pub use catalog::ProductCatalog;
pub use error::CatalogError;
pub use handlers::ProductFactHandler;
pub use product::{Product, ProductDraft};

pub const QUEUE: &str = "product_service_q";

/// `product_service_q`, fed by every stock fact and by this authority's own
/// deletions.
pub fn consumer_group(policy: RedeliveryPolicy) -> ConsumerGroup {
    ConsumerGroup::new(QUEUE)
        .bind(INVENTORY_EXCHANGE, "stock.*")
        .bind(PRODUCTS_EXCHANGE, "product.deleted")
        .with_policy(policy)
}
