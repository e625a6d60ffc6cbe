use std::sync::Arc;

use async_trait::async_trait;
use shared::{Fact, FactHandler, HandlerError, ProductId};
use tracing::{debug, info};

use crate::availability::{AvailabilityStatus, StatusUpdate};
use crate::error::CatalogError;
use crate::store::ProductStore;

/// Keeps the availability projection in step with the ledger.
pub struct ProductFactHandler {
    store: Arc<dyn ProductStore>,
}

impl ProductFactHandler {
    pub fn new(store: Arc<dyn ProductStore>) -> Self {
        Self { store }
    }

    async fn project(&self, product_id: ProductId, status: AvailabilityStatus) -> Result<(), HandlerError> {
        let update = self
            .store
            .set_status(product_id, status)
            .await
            .map_err(transient)?;
        match update {
            StatusUpdate::Updated => info!(product_id = %product_id, status = %status, "Availability updated"),
            StatusUpdate::Unchanged => debug!(product_id = %product_id, status = %status, "Availability unchanged"),
            StatusUpdate::Terminal => {
                debug!(product_id = %product_id, status = %status, "Product is deleted; ignoring")
            }
            StatusUpdate::Missing => info!(product_id = %product_id, "No local product; ignoring"),
        }
        Ok(())
    }
}

fn transient(e: CatalogError) -> HandlerError {
    HandlerError::Transient(e.to_string())
}

#[async_trait]
impl FactHandler for ProductFactHandler {
    async fn handle(&self, fact: Fact) -> Result<(), HandlerError> {
        match fact {
            Fact::StockCreated {
                product_id,
                quantity,
            } => {
                let status = if quantity > 0 {
                    AvailabilityStatus::Available
                } else {
                    AvailabilityStatus::OutOfStock
                };
                self.project(product_id, status).await
            }
            Fact::StockOutOfStock { product_id } => {
                self.project(product_id, AvailabilityStatus::OutOfStock).await
            }
            Fact::StockReplenish { product_id, .. } => {
                self.project(product_id, AvailabilityStatus::Available).await
            }
            Fact::ProductDeleted { product_id, .. } => {
                self.project(product_id, AvailabilityStatus::Deleted).await
            }
            Fact::StockDeleted { product_id, .. } => {
                let removed = self.store.remove(product_id).await.map_err(transient)?;
                if removed {
                    info!(product_id = %product_id, "Product removed");
                } else {
                    debug!(product_id = %product_id, "Product already removed");
                }
                Ok(())
            }
            Fact::ProductCreated { product_id, .. } => {
                debug!(product_id = %product_id, "Ignoring own product.created");
                Ok(())
            }
        }
    }
}
