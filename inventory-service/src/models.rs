use chrono::{DateTime, Utc};
use diesel::prelude::*;
use shared::ProductId;

use crate::stock::StockEntry;

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::inventory)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct StockRow {
    pub product_id: i64,
    pub quantity: i64,
    pub reserved: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::inventory)]
pub struct NewStockRow {
    pub product_id: i64,
    pub quantity: i64,
    pub reserved: i64,
}

impl From<StockRow> for StockEntry {
    fn from(row: StockRow) -> Self {
        Self {
            product_id: ProductId(row.product_id),
            quantity: row.quantity,
            reserved: row.reserved,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
