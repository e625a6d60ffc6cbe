//! Stock ledger entries and the guarded transitions between them.
//!
//! Every entry satisfies `0 <= reserved <= quantity`. [`StockEntry::apply`]
//! is the only way to derive a new entry from an old one, and it refuses any
//! operation that would break that invariant, so stores only ever persist
//! what it returns.

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::{Fact, ProductId};

use crate::error::LedgerError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StockEntry {
    pub product_id: ProductId,
    pub quantity: i64,
    pub reserved: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A mutation of an existing entry. Quantities must be positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockOp {
    Reserve(i64),
    Release(i64),
    Sell(i64),
    Replenish(i64),
}

impl StockOp {
    pub fn quantity(self) -> i64 {
        match self {
            StockOp::Reserve(n) | StockOp::Release(n) | StockOp::Sell(n) | StockOp::Replenish(n) => n,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StockOp::Reserve(_) => "reserve",
            StockOp::Release(_) => "release",
            StockOp::Sell(_) => "sell",
            StockOp::Replenish(_) => "replenish",
        }
    }

    pub fn validate(self) -> Result<(), LedgerError> {
        if self.quantity() <= 0 {
            return Err(LedgerError::InvalidArgument(format!(
                "{} quantity must be positive, got {}",
                self.name(),
                self.quantity()
            )));
        }
        Ok(())
    }
}

fn overflow(product_id: ProductId, op: StockOp) -> LedgerError {
    LedgerError::InvalidArgument(format!(
        "{} of {} overflows the ledger entry for product {}",
        op.name(),
        op.quantity(),
        product_id
    ))
}

impl StockEntry {
    pub fn new(product_id: ProductId, quantity: i64, now: DateTime<Utc>) -> Self {
        Self {
            product_id,
            quantity,
            reserved: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn available(&self) -> i64 {
        self.quantity - self.reserved
    }

    /// The entry after `op`, or the business rule it violates. Timestamps
    /// are left for the store to maintain.
    pub fn apply(&self, op: StockOp) -> Result<StockEntry, LedgerError> {
        op.validate()?;
        let n = op.quantity();
        let mut next = self.clone();

        match op {
            StockOp::Reserve(_) => {
                if self.available() < n {
                    return Err(LedgerError::InsufficientStock {
                        product_id: self.product_id,
                        requested: n,
                        available: self.available(),
                    });
                }
                next.reserved = self
                    .reserved
                    .checked_add(n)
                    .ok_or_else(|| overflow(self.product_id, op))?;
            }
            StockOp::Release(_) => {
                if self.reserved < n {
                    return Err(LedgerError::InvalidRelease {
                        product_id: self.product_id,
                        requested: n,
                        reserved: self.reserved,
                    });
                }
                next.reserved -= n;
            }
            StockOp::Sell(_) => {
                if self.reserved < n {
                    return Err(LedgerError::InsufficientReserved {
                        product_id: self.product_id,
                        requested: n,
                        reserved: self.reserved,
                    });
                }
                next.reserved -= n;
                next.quantity -= n;
            }
            StockOp::Replenish(_) => {
                next.quantity = self
                    .quantity
                    .checked_add(n)
                    .ok_or_else(|| overflow(self.product_id, op))?;
            }
        }
        Ok(next)
    }
}

/// A committed change to one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockTransition {
    pub op: StockOp,
    pub before: StockEntry,
    pub after: StockEntry,
}

impl StockTransition {
    /// The fact announcing a crossing of the zero-availability boundary, if
    /// this transition made one. A sale never does: it consumes units that
    /// were already reserved, so `available` is unchanged.
    pub fn boundary_fact(&self) -> Option<Fact> {
        let product_id = self.after.product_id;
        let (was, now) = (self.before.available(), self.after.available());
        match self.op {
            StockOp::Reserve(_) if was > 0 && now == 0 => Some(Fact::StockOutOfStock { product_id }),
            StockOp::Release(_) | StockOp::Replenish(_) if was == 0 && now > 0 => {
                Some(Fact::StockReplenish {
                    product_id,
                    available: Some(now),
                })
            }
            _ => None,
        }
    }
}
