use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{delete, get},
    Router,
};
use serde::{Deserialize, Serialize};
use shared::ProductId;
use tower_http::trace::TraceLayer;

use crate::catalog::ProductCatalog;
use crate::error::CatalogError;
use crate::product::{Product, ProductDraft};

/// Set by the gateway after it has verified the caller's token.
pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub catalog: ProductCatalog,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProductRequest {
    #[serde(flatten)]
    pub draft: ProductDraft,
    #[serde(default)]
    pub initial_stock: i64,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn error_response(e: CatalogError) -> ApiError {
    let status = match &e {
        CatalogError::NotFound(_) => StatusCode::NOT_FOUND,
        CatalogError::Forbidden { .. } => StatusCode::FORBIDDEN,
        CatalogError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        CatalogError::Publish { .. } => StatusCode::BAD_GATEWAY,
        CatalogError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!("Catalog request failed: {}", e);
    }
    error(status, e.to_string())
}

fn seller_id(headers: &HeaderMap) -> Result<i64, ApiError> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| error(StatusCode::UNAUTHORIZED, "missing or invalid x-user-id header"))
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/seller/products",
            get(list_seller_products).post(create_product),
        )
        .route("/api/seller/products/:id", delete(delete_product))
        .route("/api/products/:id", get(get_product))
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

pub async fn create_product(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateProductRequest>,
) -> Result<(StatusCode, Json<Product>), ApiError> {
    let seller_id = seller_id(&headers)?;
    let product = state
        .catalog
        .create_product(seller_id, request.draft, request.initial_stock)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(product)))
}

pub async fn list_seller_products(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Product>>, ApiError> {
    let seller_id = seller_id(&headers)?;
    let products = state
        .catalog
        .list_seller_products(seller_id)
        .await
        .map_err(error_response)?;
    Ok(Json(products))
}

pub async fn delete_product(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let seller_id = seller_id(&headers)?;
    state
        .catalog
        .delete_product(seller_id, ProductId(id))
        .await
        .map_err(error_response)?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Product>, ApiError> {
    let product = state
        .catalog
        .get_product(ProductId(id))
        .await
        .map_err(error_response)?;
    Ok(Json(product))
}

pub async fn health_check() -> &'static str {
    "OK"
}
