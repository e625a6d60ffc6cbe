use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use scoped_futures::ScopedFutureExt;
use shared::ProductId;
use tracing::debug;

use super::{LedgerStore, LockingStrategy};
use crate::error::LedgerError;
use crate::models::{NewStockRow, StockRow};
use crate::schema::inventory;
use crate::stock::{StockEntry, StockOp, StockTransition};

pub type DbPool = Pool<AsyncPgConnection>;

pub struct PgLedgerStore {
    pool: DbPool,
    strategy: LockingStrategy,
    lock_timeout: Duration,
}

impl PgLedgerStore {
    pub fn new(pool: DbPool, strategy: LockingStrategy, lock_timeout: Duration) -> Self {
        Self {
            pool,
            strategy,
            lock_timeout,
        }
    }

    async fn apply_pessimistic(
        &self,
        product_id: ProductId,
        op: StockOp,
    ) -> Result<StockTransition, LedgerError> {
        let mut conn = self.pool.get().await?;
        let lock_timeout = self.lock_timeout.as_millis();

        conn.build_transaction()
            .read_committed()
            .run(|conn| Self::locked_update(conn, product_id, op, lock_timeout).scope_boxed())
            .await
    }

    /// Runs inside the transaction; the row lock is released on commit or
    /// rollback.
    async fn locked_update(
        conn: &mut AsyncPgConnection,
        product_id: ProductId,
        op: StockOp,
        lock_timeout_ms: u128,
    ) -> Result<StockTransition, LedgerError> {
        diesel::sql_query(format!("SET LOCAL lock_timeout = '{}ms'", lock_timeout_ms))
            .execute(conn)
            .await?;

        let before: StockEntry = inventory::table
            .find(product_id.get())
            .select(StockRow::as_select())
            .for_update()
            .first::<StockRow>(conn)
            .await
            .optional()?
            .ok_or(LedgerError::NotFound(product_id))?
            .into();

        let after = before.apply(op)?;

        let row = diesel::update(inventory::table.find(product_id.get()))
            .set((
                inventory::quantity.eq(after.quantity),
                inventory::reserved.eq(after.reserved),
                inventory::updated_at.eq(Utc::now()),
            ))
            .returning(StockRow::as_returning())
            .get_result::<StockRow>(conn)
            .await?;

        Ok(StockTransition {
            op,
            before,
            after: row.into(),
        })
    }

    async fn apply_optimistic(
        &self,
        product_id: ProductId,
        op: StockOp,
        max_retries: u32,
    ) -> Result<StockTransition, LedgerError> {
        let mut conn = self.pool.get().await?;

        for attempt in 0..=max_retries {
            let before: StockEntry = inventory::table
                .find(product_id.get())
                .select(StockRow::as_select())
                .first::<StockRow>(&mut conn)
                .await
                .optional()?
                .ok_or(LedgerError::NotFound(product_id))?
                .into();

            let after = before.apply(op)?;

            // Only succeeds if nobody changed the row since we read it.
            let updated = diesel::update(
                inventory::table
                    .find(product_id.get())
                    .filter(inventory::quantity.eq(before.quantity))
                    .filter(inventory::reserved.eq(before.reserved)),
            )
            .set((
                inventory::quantity.eq(after.quantity),
                inventory::reserved.eq(after.reserved),
                inventory::updated_at.eq(Utc::now()),
            ))
            .returning(StockRow::as_returning())
            .get_result::<StockRow>(&mut conn)
            .await
            .optional()?;

            if let Some(row) = updated {
                return Ok(StockTransition {
                    op,
                    before,
                    after: row.into(),
                });
            }
            debug!(product_id = %product_id, attempt, "Compare-and-swap lost the race");
        }

        Err(LedgerError::ConcurrencyConflict {
            product_id,
            attempts: max_retries + 1,
        })
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn create_if_absent(
        &self,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<(StockEntry, bool), LedgerError> {
        let mut conn = self.pool.get().await?;

        let inserted = diesel::insert_into(inventory::table)
            .values(&NewStockRow {
                product_id: product_id.get(),
                quantity,
                reserved: 0,
            })
            .on_conflict(inventory::product_id)
            .do_nothing()
            .returning(StockRow::as_returning())
            .get_result::<StockRow>(&mut conn)
            .await
            .optional()?;

        if let Some(row) = inserted {
            return Ok((row.into(), true));
        }

        let existing = inventory::table
            .find(product_id.get())
            .select(StockRow::as_select())
            .first::<StockRow>(&mut conn)
            .await
            .optional()?
            .ok_or(LedgerError::NotFound(product_id))?;
        Ok((existing.into(), false))
    }

    async fn apply(&self, product_id: ProductId, op: StockOp) -> Result<StockTransition, LedgerError> {
        match self.strategy {
            LockingStrategy::Pessimistic => self.apply_pessimistic(product_id, op).await,
            LockingStrategy::Optimistic { max_retries } => {
                self.apply_optimistic(product_id, op, max_retries).await
            }
        }
    }

    async fn find(&self, product_id: ProductId) -> Result<Option<StockEntry>, LedgerError> {
        let mut conn = self.pool.get().await?;
        let row = inventory::table
            .find(product_id.get())
            .select(StockRow::as_select())
            .first::<StockRow>(&mut conn)
            .await
            .optional()?;
        Ok(row.map(StockEntry::from))
    }

    async fn delete(&self, product_id: ProductId) -> Result<Option<StockEntry>, LedgerError> {
        let mut conn = self.pool.get().await?;
        let row = diesel::delete(inventory::table.find(product_id.get()))
            .returning(StockRow::as_returning())
            .get_result::<StockRow>(&mut conn)
            .await
            .optional()?;
        Ok(row.map(StockEntry::from))
    }
}
