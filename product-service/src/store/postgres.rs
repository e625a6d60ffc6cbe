use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use scoped_futures::ScopedFutureExt;
use shared::ProductId;

use super::ProductStore;
use crate::availability::{AvailabilityStatus, StatusUpdate, UnknownStatus};
use crate::error::CatalogError;
use crate::models::{AvailabilityRow, NewProductRow, ProductRow};
use crate::product::{Product, ProductDraft};
use crate::schema::{product_availability, products};

pub type DbPool = Pool<AsyncPgConnection>;

pub struct PgProductStore {
    pool: DbPool,
}

impl PgProductStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn insert_rows(
        conn: &mut AsyncPgConnection,
        seller_id: i64,
        draft: &ProductDraft,
    ) -> Result<Product, CatalogError> {
        let row = diesel::insert_into(products::table)
            .values(&NewProductRow {
                seller_id,
                name: &draft.name,
                description: &draft.description,
                price: &draft.price,
                category: &draft.category,
            })
            .returning(ProductRow::as_returning())
            .get_result::<ProductRow>(conn)
            .await?;

        let pending = AvailabilityStatus::Pending.as_str();
        diesel::insert_into(product_availability::table)
            .values(&AvailabilityRow {
                product_id: row.id,
                status: pending.to_string(),
                updated_at: Utc::now(),
            })
            .execute(conn)
            .await?;

        row.into_product(pending)
    }

    async fn update_status(
        conn: &mut AsyncPgConnection,
        id: ProductId,
        target: AvailabilityStatus,
    ) -> Result<StatusUpdate, CatalogError> {
        let current = product_availability::table
            .find(id.get())
            .select(product_availability::status)
            .for_update()
            .first::<String>(conn)
            .await
            .optional()?;

        let Some(current) = current else {
            return Ok(StatusUpdate::Missing);
        };
        let current: AvailabilityStatus = current
            .parse()
            .map_err(|e: UnknownStatus| CatalogError::Storage(e.to_string()))?;

        let update = current.transition_to(target);
        if update == StatusUpdate::Updated {
            diesel::update(product_availability::table.find(id.get()))
                .set((
                    product_availability::status.eq(target.as_str()),
                    product_availability::updated_at.eq(Utc::now()),
                ))
                .execute(conn)
                .await?;
        }
        Ok(update)
    }

    async fn remove_rows(conn: &mut AsyncPgConnection, id: ProductId) -> Result<bool, CatalogError> {
        let projections = diesel::delete(product_availability::table.find(id.get()))
            .execute(conn)
            .await?;
        let removed = diesel::delete(products::table.find(id.get()))
            .execute(conn)
            .await?;
        Ok(projections + removed > 0)
    }
}

#[async_trait]
impl ProductStore for PgProductStore {
    async fn insert(&self, seller_id: i64, draft: &ProductDraft) -> Result<Product, CatalogError> {
        let mut conn = self.pool.get().await?;
        conn.transaction(|conn| Self::insert_rows(conn, seller_id, draft).scope_boxed())
            .await
    }

    async fn find(&self, id: ProductId) -> Result<Option<Product>, CatalogError> {
        let mut conn = self.pool.get().await?;
        let row = products::table
            .inner_join(product_availability::table)
            .filter(products::id.eq(id.get()))
            .select((ProductRow::as_select(), product_availability::status))
            .first::<(ProductRow, String)>(&mut conn)
            .await
            .optional()?;
        row.map(|(product, status)| product.into_product(&status))
            .transpose()
    }

    async fn list_by_seller(&self, seller_id: i64) -> Result<Vec<Product>, CatalogError> {
        let mut conn = self.pool.get().await?;
        let rows = products::table
            .inner_join(product_availability::table)
            .filter(products::seller_id.eq(seller_id))
            .order((products::created_at.desc(), products::id.desc()))
            .select((ProductRow::as_select(), product_availability::status))
            .load::<(ProductRow, String)>(&mut conn)
            .await?;
        rows.into_iter()
            .map(|(product, status)| product.into_product(&status))
            .collect()
    }

    async fn set_status(
        &self,
        id: ProductId,
        status: AvailabilityStatus,
    ) -> Result<StatusUpdate, CatalogError> {
        let mut conn = self.pool.get().await?;
        conn.transaction(|conn| Self::update_status(conn, id, status).scope_boxed())
            .await
    }

    async fn remove(&self, id: ProductId) -> Result<bool, CatalogError> {
        let mut conn = self.pool.get().await?;
        conn.transaction(|conn| Self::remove_rows(conn, id).scope_boxed())
            .await
    }
}
