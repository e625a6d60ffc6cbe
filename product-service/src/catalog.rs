//! Seller and buyer operations of the product authority.
//!
//! User-facing writes never touch the availability status beyond the initial
//! `PENDING`; every later status change arrives as a fact from the inventory
//! authority, or from this authority's own `product.deleted`.

use std::sync::Arc;

use shared::{Fact, ProductId, ResilientPublisher};
use tracing::{info, instrument, warn};

use crate::error::CatalogError;
use crate::product::{Product, ProductDraft};
use crate::store::ProductStore;

#[derive(Clone)]
pub struct ProductCatalog {
    store: Arc<dyn ProductStore>,
    publisher: ResilientPublisher,
}

impl ProductCatalog {
    pub fn new(store: Arc<dyn ProductStore>, publisher: ResilientPublisher) -> Self {
        Self { store, publisher }
    }

    /// Store the product as `PENDING`, then announce `product.created` so
    /// the inventory authority opens a ledger entry with `initial_stock`.
    #[instrument(skip_all, fields(seller_id = seller_id, initial_stock = initial_stock))]
    pub async fn create_product(
        &self,
        seller_id: i64,
        draft: ProductDraft,
        initial_stock: i64,
    ) -> Result<Product, CatalogError> {
        draft.validate()?;
        if initial_stock < 0 {
            return Err(CatalogError::InvalidArgument(format!(
                "initial stock must not be negative, got {}",
                initial_stock
            )));
        }

        let product = self.store.insert(seller_id, &draft).await?;
        info!(product_id = %product.id, "Product created");

        self.announce(Fact::ProductCreated {
            product_id: product.id,
            quantity: initial_stock,
            seller_id: Some(seller_id),
        })
        .await?;
        Ok(product)
    }

    /// Announce `product.deleted` for a product the seller owns. The rows go
    /// away once the inventory authority confirms with `stock.deleted`.
    #[instrument(skip_all, fields(seller_id = seller_id, product_id = %product_id))]
    pub async fn delete_product(&self, seller_id: i64, product_id: ProductId) -> Result<(), CatalogError> {
        let product = self
            .store
            .find(product_id)
            .await?
            .ok_or(CatalogError::NotFound(product_id))?;
        if product.seller_id != seller_id {
            return Err(CatalogError::Forbidden {
                product_id,
                seller_id,
            });
        }

        self.announce(Fact::ProductDeleted {
            product_id,
            seller_id: Some(seller_id),
        })
        .await?;
        info!("Product deletion announced");
        Ok(())
    }

    /// Buyer view: a product whose deletion was announced is already gone.
    pub async fn get_product(&self, product_id: ProductId) -> Result<Product, CatalogError> {
        self.store
            .find(product_id)
            .await?
            .filter(|product| !product.status.is_terminal())
            .ok_or(CatalogError::NotFound(product_id))
    }

    pub async fn list_seller_products(&self, seller_id: i64) -> Result<Vec<Product>, CatalogError> {
        self.store.list_by_seller(seller_id).await
    }

    async fn announce(&self, fact: Fact) -> Result<(), CatalogError> {
        let product_id = fact.product_id();
        self.publisher.announce(&fact).await.map_err(|source| {
            warn!(
                product_id = %product_id,
                routing_key = fact.routing_key(),
                error = %source,
                "Committed catalog change could not be announced"
            );
            CatalogError::Publish { product_id, source }
        })
    }
}
