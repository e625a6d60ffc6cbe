use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use shared::ProductId;

use super::ProductStore;
use crate::availability::{AvailabilityStatus, StatusUpdate};
use crate::error::CatalogError;
use crate::product::{Product, ProductDraft};

#[derive(Default)]
struct Catalog {
    next_id: i64,
    products: BTreeMap<ProductId, Product>,
}

/// Catalog held in process memory; ids are assigned sequentially from 1.
#[derive(Default)]
pub struct InMemoryProductStore {
    catalog: Mutex<Catalog>,
}

impl InMemoryProductStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn catalog(&self) -> MutexGuard<'_, Catalog> {
        self.catalog.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of products held, whatever their status.
    pub fn len(&self) -> usize {
        self.catalog().products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ProductStore for InMemoryProductStore {
    async fn insert(&self, seller_id: i64, draft: &ProductDraft) -> Result<Product, CatalogError> {
        let mut catalog = self.catalog();
        catalog.next_id += 1;
        let now = Utc::now();
        let product = Product {
            id: ProductId(catalog.next_id),
            seller_id,
            name: draft.name.clone(),
            description: draft.description.clone(),
            price: draft.price.clone(),
            category: draft.category.clone(),
            status: AvailabilityStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        catalog.products.insert(product.id, product.clone());
        Ok(product)
    }

    async fn find(&self, id: ProductId) -> Result<Option<Product>, CatalogError> {
        Ok(self.catalog().products.get(&id).cloned())
    }

    async fn list_by_seller(&self, seller_id: i64) -> Result<Vec<Product>, CatalogError> {
        let mut products: Vec<Product> = self
            .catalog()
            .products
            .values()
            .filter(|p| p.seller_id == seller_id)
            .cloned()
            .collect();
        products.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(products)
    }

    async fn set_status(
        &self,
        id: ProductId,
        status: AvailabilityStatus,
    ) -> Result<StatusUpdate, CatalogError> {
        let mut catalog = self.catalog();
        let Some(product) = catalog.products.get_mut(&id) else {
            return Ok(StatusUpdate::Missing);
        };
        let update = product.status.transition_to(status);
        if update == StatusUpdate::Updated {
            product.status = status;
            product.updated_at = Utc::now();
        }
        Ok(update)
    }

    async fn remove(&self, id: ProductId) -> Result<bool, CatalogError> {
        Ok(self.catalog().products.remove(&id).is_some())
    }
}
