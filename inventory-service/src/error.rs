use diesel::result::Error as DieselError;
use shared::{ProductId, PublishError};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("no ledger entry for product {0}")]
    NotFound(ProductId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: ProductId,
        requested: i64,
        available: i64,
    },

    #[error("insufficient reserved stock for product {product_id}: requested {requested}, reserved {reserved}")]
    InsufficientReserved {
        product_id: ProductId,
        requested: i64,
        reserved: i64,
    },

    #[error("cannot release {requested} units of product {product_id}: only {reserved} reserved")]
    InvalidRelease {
        product_id: ProductId,
        requested: i64,
        reserved: i64,
    },

    /// Optimistic strategy only: the row kept changing underneath us.
    #[error("concurrent update of product {product_id} after {attempts} attempts; retry the operation")]
    ConcurrencyConflict { product_id: ProductId, attempts: u32 },

    #[error("timed out waiting for the ledger row lock")]
    LockTimeout,

    #[error("storage error: {0}")]
    Storage(String),

    /// The ledger change is committed; only the announcement was lost.
    #[error("product {product_id} updated but its fact was not published: {source}")]
    Publish {
        product_id: ProductId,
        #[source]
        source: PublishError,
    },
}

impl LedgerError {
    /// Whether a consumer should ask for redelivery of the fact that led
    /// here. Only meaningful for the idempotent consumer paths: a caller that
    /// repeats a `reserve` after `Publish` reserves twice.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::ConcurrencyConflict { .. }
                | LedgerError::LockTimeout
                | LedgerError::Storage(_)
                | LedgerError::Publish { .. }
        )
    }
}

impl From<DieselError> for LedgerError {
    fn from(e: DieselError) -> Self {
        match &e {
            // SQLSTATE 55P03, raised once `lock_timeout` elapses.
            DieselError::DatabaseError(_, info) if info.message().contains("lock timeout") => {
                LedgerError::LockTimeout
            }
            _ => LedgerError::Storage(e.to_string()),
        }
    }
}

impl From<bb8::RunError<diesel_async::pooled_connection::PoolError>> for LedgerError {
    fn from(e: bb8::RunError<diesel_async::pooled_connection::PoolError>) -> Self {
        LedgerError::Storage(format!("connection pool: {}", e))
    }
}
