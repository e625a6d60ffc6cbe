//! Stock Ledger Engine.
//!
//! Each operation runs as one guarded transition in the [`LedgerStore`].
//! Facts are announced only after the store has committed, and never while
//! the row lock is held. A failed announcement surfaces as
//! [`LedgerError::Publish`]; the ledger change stands.

use std::sync::Arc;

use shared::{Fact, ProductId, ResilientPublisher};
use tracing::{info, instrument, warn};

use crate::error::LedgerError;
use crate::stock::{StockEntry, StockOp};
use crate::store::LedgerStore;

#[derive(Clone)]
pub struct LedgerEngine {
    store: Arc<dyn LedgerStore>,
    publisher: ResilientPublisher,
}

impl LedgerEngine {
    pub fn new(store: Arc<dyn LedgerStore>, publisher: ResilientPublisher) -> Self {
        Self { store, publisher }
    }

    /// Create the entry unless it exists, then announce `stock.created` with
    /// the units currently available. Re-creation is a no-op on the ledger
    /// but announces again, so a redelivered `product.created` repairs a
    /// lost announcement.
    #[instrument(skip_all, fields(product_id = %product_id, quantity = quantity))]
    pub async fn create_entry(&self, product_id: ProductId, quantity: i64) -> Result<StockEntry, LedgerError> {
        if quantity < 0 {
            return Err(LedgerError::InvalidArgument(format!(
                "initial quantity must not be negative, got {}",
                quantity
            )));
        }

        let (entry, created) = self.store.create_if_absent(product_id, quantity).await?;
        if created {
            info!("Ledger entry created");
        } else {
            info!(quantity = entry.quantity, "Ledger entry already exists");
        }

        self.announce(Fact::StockCreated {
            product_id,
            quantity: entry.available(),
        })
        .await?;
        Ok(entry)
    }

    pub async fn reserve(&self, product_id: ProductId, quantity: i64) -> Result<StockEntry, LedgerError> {
        self.transition(product_id, StockOp::Reserve(quantity)).await
    }

    pub async fn release(&self, product_id: ProductId, quantity: i64) -> Result<StockEntry, LedgerError> {
        self.transition(product_id, StockOp::Release(quantity)).await
    }

    pub async fn sell(&self, product_id: ProductId, quantity: i64) -> Result<StockEntry, LedgerError> {
        self.transition(product_id, StockOp::Sell(quantity)).await
    }

    pub async fn replenish(&self, product_id: ProductId, quantity: i64) -> Result<StockEntry, LedgerError> {
        self.transition(product_id, StockOp::Replenish(quantity)).await
    }

    pub async fn get_available(&self, product_id: ProductId) -> Result<i64, LedgerError> {
        Ok(self.get_entry(product_id).await?.available())
    }

    pub async fn get_entry(&self, product_id: ProductId) -> Result<StockEntry, LedgerError> {
        self.store
            .find(product_id)
            .await?
            .ok_or(LedgerError::NotFound(product_id))
    }

    /// Remove the entry and announce `stock.deleted`. A missing entry is
    /// `NotFound` and announces nothing.
    #[instrument(skip_all, fields(product_id = %product_id))]
    pub async fn delete_entry(&self, product_id: ProductId) -> Result<StockEntry, LedgerError> {
        let entry = self
            .store
            .delete(product_id)
            .await?
            .ok_or(LedgerError::NotFound(product_id))?;
        info!(quantity = entry.quantity, reserved = entry.reserved, "Ledger entry deleted");

        self.announce(Fact::StockDeleted {
            product_id,
            quantity: Some(entry.quantity),
        })
        .await?;
        Ok(entry)
    }

    /// Announce `stock.deleted` for an entry that is already gone, without a
    /// quantity. Lets a redelivered `product.deleted` finish a deletion whose
    /// first announcement was lost.
    #[instrument(skip_all, fields(product_id = %product_id))]
    pub async fn reannounce_deleted(&self, product_id: ProductId) -> Result<(), LedgerError> {
        self.announce(Fact::StockDeleted {
            product_id,
            quantity: None,
        })
        .await
    }

    #[instrument(skip_all, fields(product_id = %product_id, op = op.name(), quantity = op.quantity()))]
    async fn transition(&self, product_id: ProductId, op: StockOp) -> Result<StockEntry, LedgerError> {
        op.validate()?;
        let transition = self.store.apply(product_id, op).await?;
        info!(
            quantity = transition.after.quantity,
            reserved = transition.after.reserved,
            available = transition.after.available(),
            "Ledger updated"
        );

        if let Some(fact) = transition.boundary_fact() {
            self.announce(fact).await?;
        }
        Ok(transition.after)
    }

    async fn announce(&self, fact: Fact) -> Result<(), LedgerError> {
        let product_id = fact.product_id();
        self.publisher.announce(&fact).await.map_err(|source| {
            warn!(
                product_id = %product_id,
                routing_key = fact.routing_key(),
                error = %source,
                "Committed ledger change could not be announced"
            );
            LedgerError::Publish { product_id, source }
        })
    }
}
