use diesel::result::Error as DieselError;
use shared::{ProductId, PublishError};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("product {0} not found")]
    NotFound(ProductId),

    #[error("seller {seller_id} does not own product {product_id}")]
    Forbidden { product_id: ProductId, seller_id: i64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// The catalog change is committed; only the announcement was lost.
    #[error("product {product_id} saved but its fact was not published: {source}")]
    Publish {
        product_id: ProductId,
        #[source]
        source: PublishError,
    },
}

impl From<DieselError> for CatalogError {
    fn from(e: DieselError) -> Self {
        CatalogError::Storage(e.to_string())
    }
}

impl From<bb8::RunError<diesel_async::pooled_connection::PoolError>> for CatalogError {
    fn from(e: bb8::RunError<diesel_async::pooled_connection::PoolError>) -> Self {
        CatalogError::Storage(format!("connection pool: {}", e))
    }
}
