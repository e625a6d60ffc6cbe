use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use shared::ProductId;

use crate::availability::AvailabilityStatus;
use crate::error::CatalogError;
use crate::product::Product;

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::products)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ProductRow {
    pub id: i64,
    pub seller_id: i64,
    pub name: String,
    pub description: String,
    pub price: BigDecimal,
    pub category: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::products)]
pub struct NewProductRow<'a> {
    pub seller_id: i64,
    pub name: &'a str,
    pub description: &'a str,
    pub price: &'a BigDecimal,
    pub category: &'a str,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = crate::schema::product_availability)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct AvailabilityRow {
    pub product_id: i64,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

impl ProductRow {
    pub fn into_product(self, status: &str) -> Result<Product, CatalogError> {
        let status: AvailabilityStatus = status
            .parse()
            .map_err(|e: crate::availability::UnknownStatus| CatalogError::Storage(e.to_string()))?;
        Ok(Product {
            id: ProductId(self.id),
            seller_id: self.seller_id,
            name: self.name,
            description: self.description,
            price: self.price,
            category: self.category,
            status,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
