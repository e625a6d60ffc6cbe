//! Catalog storage: products and their availability projection.

use async_trait::async_trait;
use shared::ProductId;

use crate::availability::{AvailabilityStatus, StatusUpdate};
use crate::error::CatalogError;
use crate::product::{Product, ProductDraft};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryProductStore;
pub use postgres::PgProductStore;

#[async_trait]
pub trait ProductStore: Send + Sync {
    /// Insert the product and a `PENDING` projection row atomically.
    async fn insert(&self, seller_id: i64, draft: &ProductDraft) -> Result<Product, CatalogError>;

    async fn find(&self, id: ProductId) -> Result<Option<Product>, CatalogError>;

    /// The seller's products, newest first.
    async fn list_by_seller(&self, seller_id: i64) -> Result<Vec<Product>, CatalogError>;

    /// Move the projection to `status` unless it is already there or terminal.
    async fn set_status(
        &self,
        id: ProductId,
        status: AvailabilityStatus,
    ) -> Result<StatusUpdate, CatalogError>;

    /// Drop the projection row and the product. Returns whether anything was
    /// removed.
    async fn remove(&self, id: ProductId) -> Result<bool, CatalogError>;
}
