use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::ProductId;
use tower_http::trace::TraceLayer;

use crate::error::LedgerError;
use crate::ledger::LedgerEngine;
use crate::stock::StockEntry;

#[derive(Clone)]
pub struct AppState {
    pub engine: LedgerEngine,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEntryRequest {
    pub product_id: i64,
    pub quantity: i64,
}

#[derive(Debug, Deserialize)]
pub struct QuantityRequest {
    pub quantity: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StockResponse {
    pub product_id: ProductId,
    pub quantity: i64,
    pub reserved: i64,
    pub available: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<StockEntry> for StockResponse {
    fn from(entry: StockEntry) -> Self {
        Self {
            available: entry.available(),
            product_id: entry.product_id,
            quantity: entry.quantity,
            reserved: entry.reserved,
            created_at: entry.created_at,
            updated_at: entry.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

fn error_response(e: LedgerError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &e {
        LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
        LedgerError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        LedgerError::InsufficientStock { .. }
        | LedgerError::InsufficientReserved { .. }
        | LedgerError::InvalidRelease { .. } => StatusCode::CONFLICT,
        LedgerError::ConcurrencyConflict { .. } | LedgerError::LockTimeout => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        LedgerError::Publish { .. } => StatusCode::BAD_GATEWAY,
        LedgerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!("Ledger request failed: {}", e);
    }
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/inventory", post(create_entry))
        .route("/api/inventory/:product_id", get(get_entry))
        .route("/api/inventory/:product_id/reserve", post(reserve))
        .route("/api/inventory/:product_id/release", post(release))
        .route("/api/inventory/:product_id/sell", post(sell))
        .route("/api/inventory/:product_id/replenish", post(replenish))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn create_entry(
    State(state): State<AppState>,
    Json(request): Json<CreateEntryRequest>,
) -> ApiResult<StockResponse> {
    let entry = state
        .engine
        .create_entry(ProductId(request.product_id), request.quantity)
        .await
        .map_err(error_response)?;
    Ok(Json(entry.into()))
}

pub async fn get_entry(
    State(state): State<AppState>,
    Path(product_id): Path<i64>,
) -> ApiResult<StockResponse> {
    let entry = state
        .engine
        .get_entry(ProductId(product_id))
        .await
        .map_err(error_response)?;
    Ok(Json(entry.into()))
}

pub async fn reserve(
    State(state): State<AppState>,
    Path(product_id): Path<i64>,
    Json(request): Json<QuantityRequest>,
) -> ApiResult<StockResponse> {
    let entry = state
        .engine
        .reserve(ProductId(product_id), request.quantity)
        .await
        .map_err(error_response)?;
    Ok(Json(entry.into()))
}

pub async fn release(
    State(state): State<AppState>,
    Path(product_id): Path<i64>,
    Json(request): Json<QuantityRequest>,
) -> ApiResult<StockResponse> {
    let entry = state
        .engine
        .release(ProductId(product_id), request.quantity)
        .await
        .map_err(error_response)?;
    Ok(Json(entry.into()))
}

pub async fn sell(
    State(state): State<AppState>,
    Path(product_id): Path<i64>,
    Json(request): Json<QuantityRequest>,
) -> ApiResult<StockResponse> {
    let entry = state
        .engine
        .sell(ProductId(product_id), request.quantity)
        .await
        .map_err(error_response)?;
    Ok(Json(entry.into()))
}

pub async fn replenish(
    State(state): State<AppState>,
    Path(product_id): Path<i64>,
    Json(request): Json<QuantityRequest>,
) -> ApiResult<StockResponse> {
    let entry = state
        .engine
        .replenish(ProductId(product_id), request.quantity)
        .await
        .map_err(error_response)?;
    Ok(Json(entry.into()))
}

pub async fn health_check() -> &'static str {
    "OK"
}
