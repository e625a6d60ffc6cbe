use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use shared::ProductId;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};

use super::LedgerStore;
use crate::error::LedgerError;
use crate::stock::{StockEntry, StockOp, StockTransition};

type Slot = Arc<RowLock<Option<StockEntry>>>;

/// Ledger store held in process memory. Each product has its own async lock,
/// acquired with the same bounded wait as the Postgres `lock_timeout`.
pub struct InMemoryLedgerStore {
    rows: Mutex<HashMap<ProductId, Slot>>,
    lock_timeout: Duration,
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl InMemoryLedgerStore {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            lock_timeout,
        }
    }

    fn rows(&self) -> MutexGuard<'_, HashMap<ProductId, Slot>> {
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot(&self, product_id: ProductId) -> Option<Slot> {
        self.rows().get(&product_id).cloned()
    }

    fn is_current(&self, product_id: ProductId, slot: &Slot) -> bool {
        self.rows()
            .get(&product_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    async fn lock(&self, slot: Slot) -> Result<OwnedMutexGuard<Option<StockEntry>>, LedgerError> {
        tokio::time::timeout(self.lock_timeout, slot.lock_owned())
            .await
            .map_err(|_| LedgerError::LockTimeout)
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn create_if_absent(
        &self,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<(StockEntry, bool), LedgerError> {
        loop {
            let slot = self.rows().entry(product_id).or_default().clone();
            let mut row = self.lock(slot.clone()).await?;
            // A concurrent delete may have unlinked the slot while we waited.
            if !self.is_current(product_id, &slot) {
                continue;
            }
            if let Some(existing) = row.as_ref() {
                return Ok((existing.clone(), false));
            }
            let entry = StockEntry::new(product_id, quantity, Utc::now());
            *row = Some(entry.clone());
            return Ok((entry, true));
        }
    }

    async fn apply(&self, product_id: ProductId, op: StockOp) -> Result<StockTransition, LedgerError> {
        let slot = self.slot(product_id).ok_or(LedgerError::NotFound(product_id))?;
        let mut row = self.lock(slot).await?;
        let before = row.clone().ok_or(LedgerError::NotFound(product_id))?;

        let mut after = before.apply(op)?;
        after.updated_at = Utc::now();
        *row = Some(after.clone());
        Ok(StockTransition { op, before, after })
    }

    async fn find(&self, product_id: ProductId) -> Result<Option<StockEntry>, LedgerError> {
        match self.slot(product_id) {
            Some(slot) => Ok(self.lock(slot).await?.clone()),
            None => Ok(None),
        }
    }

    async fn delete(&self, product_id: ProductId) -> Result<Option<StockEntry>, LedgerError> {
        let Some(slot) = self.slot(product_id) else {
            return Ok(None);
        };
        let mut row = self.lock(slot.clone()).await?;
        let removed = row.take();
        // Unlink while still holding the row so a waiting create sees it.
        if self.is_current(product_id, &slot) {
            self.rows().remove(&product_id);
        }
        drop(row);
        Ok(removed)
    }
}
