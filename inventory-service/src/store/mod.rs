//! Ledger storage. One row per product, mutated atomically under a row lock.

use async_trait::async_trait;
use clap::ValueEnum;
use shared::ProductId;

use crate::error::LedgerError;
use crate::stock::{StockEntry, StockOp, StockTransition};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryLedgerStore;
pub use postgres::PgLedgerStore;

/// How concurrent writers to the same row are serialised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockingStrategy {
    /// `SELECT ... FOR UPDATE` inside the transaction.
    Pessimistic,
    /// Compare-and-swap update, retried up to `max_retries` times before
    /// giving up with [`LedgerError::ConcurrencyConflict`].
    Optimistic { max_retries: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LockingKind {
    Pessimistic,
    Optimistic,
}

impl LockingStrategy {
    pub fn from_kind(kind: LockingKind, max_retries: u32) -> Self {
        match kind {
            LockingKind::Pessimistic => LockingStrategy::Pessimistic,
            LockingKind::Optimistic => LockingStrategy::Optimistic { max_retries },
        }
    }
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert an entry with `reserved = 0` unless one exists. Returns the
    /// stored entry and whether this call created it.
    async fn create_if_absent(
        &self,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<(StockEntry, bool), LedgerError>;

    /// Read, check and write one entry as a single atomic step.
    async fn apply(&self, product_id: ProductId, op: StockOp) -> Result<StockTransition, LedgerError>;

    async fn find(&self, product_id: ProductId) -> Result<Option<StockEntry>, LedgerError>;

    /// Remove an entry, returning it if it existed.
    async fn delete(&self, product_id: ProductId) -> Result<Option<StockEntry>, LedgerError>;
}
