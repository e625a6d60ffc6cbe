use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::ProductId;

use crate::availability::AvailabilityStatus;
use crate::error::CatalogError;

/// A catalog product together with its availability as last heard from the
/// inventory authority.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: ProductId,
    pub seller_id: i64,
    pub name: String,
    pub description: String,
    pub price: BigDecimal,
    pub category: String,
    pub status: AvailabilityStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductDraft {
    pub name: String,
    pub description: String,
    pub price: BigDecimal,
    pub category: String,
}

impl ProductDraft {
    pub fn validate(&self) -> Result<(), CatalogError> {
        let blank = [
            ("name", &self.name),
            ("description", &self.description),
            ("category", &self.category),
        ]
        .into_iter()
        .find(|(_, value)| value.trim().is_empty());

        if let Some((field, _)) = blank {
            return Err(CatalogError::InvalidArgument(format!("{} is required", field)));
        }
        if self.price <= BigDecimal::zero() {
            return Err(CatalogError::InvalidArgument(
                "price must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
