use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use http::header::{ACCEPT, CONTENT_TYPE};
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod ledger;
mod state;
mod store;

use crate::config::load_config;
use crate::error::ApiError;
use crate::ledger::{CancelStatus, ConfirmStatus, HoldLedger, ReserveStatus};
use crate::state::{AppState, PerfCounters};

fn now_epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

// Request fields arrive as Options so an absent field maps to a 400 with the
// field name instead of a generic deserialize rejection.
fn require_field<'a>(value: &'a Option<String>, field: &'static str) -> Result<&'a str, ApiError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ApiError::new(StatusCode::BAD_REQUEST, format!("Missing {field}"))),
    }
}

fn require_positive(quantity: Option<i64>, field: &'static str) -> Result<i64, ApiError> {
    match quantity {
        Some(q) if q > 0 => Ok(q),
        Some(_) => Err(ApiError::new(StatusCode::BAD_REQUEST, "Quantity must be positive")),
        None => Err(ApiError::new(StatusCode::BAD_REQUEST, format!("Missing {field}"))),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReserveRequest {
    sku: Option<String>,
    quantity: Option<i64>,
    cart_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckoutRequest {
    sku: Option<String>,
    cart_id: Option<String>,
    quantity: Option<i64>,
}

// ===== HTTP handlers =====

async fn health_check(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    sqlx::query("SELECT 1")
        .fetch_one(&state.db)
        .await
        .map_err(|e| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, format!("db error: {e}")))?;
    Ok(Json(serde_json::json!({
        "status": "healthy",
        "database": "connected"
    })))
}

async fn get_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let totals = state.ledger.totals();
    Json(serde_json::json!({
        "reservations": state.perf.snapshot_json(),
        "ledger": {
            "skus": totals.skus,
            "active_holds": totals.active_holds,
            "held_units": totals.held_units,
        }
    }))
}

async fn get_inventory(
    State(state): State<AppState>,
    Path(sku): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if sku.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "Missing sku"));
    }
    let now = now_epoch_secs();

    let stock = match state.ledger.available(&sku, now).await {
        Some(stock) => stock,
        None => {
            let product = store::find_by_sku(&state, &sku)
                .await?
                .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Product not found"))?;
            info!(
                %sku,
                stock = product.stock,
                catalog_updated_at = %product.updated_at,
                "seeded counter from catalog"
            );
            state.ledger.seed(&sku, product.stock).await
        }
    };

    Ok(Json(serde_json::json!({
        "sku": sku,
        "availableStock": stock
    })))
}

async fn reserve_inventory(
    State(state): State<AppState>,
    Json(req): Json<ReserveRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let sku = require_field(&req.sku, "sku")?;
    let cart_id = require_field(&req.cart_id, "cartId")?;
    let quantity = require_positive(req.quantity, "quantity")?;
    state.perf.reserve_received.fetch_add(1, Ordering::Relaxed);

    let ttl = state.cfg.reservation.ttl_seconds;
    let mut status = state
        .ledger
        .reserve(sku, quantity, cart_id, now_epoch_secs(), ttl)
        .await?;

    if status == ReserveStatus::Uninitialized {
        // Cold counter: seed from the catalog and retry exactly once.
        let product = store::find_by_sku(&state, sku)
            .await?
            .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Product not found"))?;
        state.ledger.seed(sku, product.stock).await;
        status = state
            .ledger
            .reserve(sku, quantity, cart_id, now_epoch_secs(), ttl)
            .await?;
    }

    match status {
        ReserveStatus::Reserved { available } => {
            state.perf.reserve_committed.fetch_add(1, Ordering::Relaxed);
            Ok((
                StatusCode::CREATED,
                Json(serde_json::json!({
                    "message": "Inventory reserved successfully",
                    "sku": sku,
                    "quantity": quantity,
                    "cartId": cart_id,
                    "availableStock": available
                })),
            ))
        }
        ReserveStatus::Refreshed { expires_at } => {
            state.perf.reserve_refreshed.fetch_add(1, Ordering::Relaxed);
            Ok((
                StatusCode::OK,
                Json(serde_json::json!({
                    "message": "Reservation refreshed",
                    "sku": sku,
                    "quantity": quantity,
                    "cartId": cart_id,
                    "expiresAt": expires_at
                })),
            ))
        }
        ReserveStatus::Insufficient { .. } => {
            state.perf.reserve_insufficient.fetch_add(1, Ordering::Relaxed);
            Err(ApiError::new(StatusCode::BAD_REQUEST, "Not enough stock"))
        }
        ReserveStatus::Uninitialized => Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Stock counter failed to initialize",
        )),
    }
}

async fn checkout_confirm(
    State(state): State<AppState>,
    Json(req): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let sku = require_field(&req.sku, "sku")?;
    let cart_id = require_field(&req.cart_id, "cartId")?;
    if req.quantity.is_some() {
        require_positive(req.quantity, "quantity")?;
    }
    state.perf.confirm_received.fetch_add(1, Ordering::Relaxed);

    let now = now_epoch_secs();
    match state.ledger.settle(sku, cart_id, req.quantity, now).await {
        ConfirmStatus::Confirmed { quantity, available } => {
            // The counter, not the catalog, is authoritative at confirm time.
            let saved = store::save_stock(&state, sku, available).await?;
            if !saved {
                error!(sku, "product missing from catalog during confirm");
                return Err(ApiError::new(StatusCode::NOT_FOUND, "Product not found"));
            }
            state.perf.confirm_settled.fetch_add(1, Ordering::Relaxed);
            info!(sku, cart_id, quantity, stock = available, "order confirmed, catalog synced");
            Ok((
                StatusCode::OK,
                Json(serde_json::json!({
                    "message": "Order confirmed",
                    "sku": sku,
                    "cartId": cart_id,
                    "quantity": quantity
                })),
            ))
        }
        ConfirmStatus::Expired => {
            state.perf.confirm_expired.fetch_add(1, Ordering::Relaxed);
            Err(ApiError::new(StatusCode::BAD_REQUEST, "Reservation expired"))
        }
        ConfirmStatus::AlreadyConfirmed => {
            state.perf.confirm_noop.fetch_add(1, Ordering::Relaxed);
            Ok((
                StatusCode::OK,
                Json(serde_json::json!({
                    "message": "Order already confirmed",
                    "sku": sku,
                    "cartId": cart_id
                })),
            ))
        }
    }
}

async fn checkout_cancel(
    State(state): State<AppState>,
    Json(req): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let sku = require_field(&req.sku, "sku")?;
    let cart_id = require_field(&req.cart_id, "cartId")?;
    if req.quantity.is_some() {
        require_positive(req.quantity, "quantity")?;
    }
    state.perf.cancel_received.fetch_add(1, Ordering::Relaxed);

    match state.ledger.cancel(sku, cart_id, req.quantity).await {
        CancelStatus::Cancelled { quantity, available } => {
            state.perf.cancel_restored.fetch_add(1, Ordering::Relaxed);
            Ok((
                StatusCode::OK,
                Json(serde_json::json!({
                    "message": "Reservation cancelled",
                    "sku": sku,
                    "cartId": cart_id,
                    "quantity": quantity,
                    "availableStock": available
                })),
            ))
        }
        CancelStatus::NotFound => {
            state.perf.cancel_missing.fetch_add(1, Ordering::Relaxed);
            Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                "Reservation not found or expired",
            ))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = Arc::new(load_config()?);

    let db = PgPoolOptions::new()
        .min_connections(cfg.database.min_pool_size)
        .max_connections(cfg.database.max_pool_size)
        .acquire_timeout(Duration::from_secs(cfg.database.acquire_timeout_seconds))
        .max_lifetime(Duration::from_secs(cfg.database.max_lifetime_seconds))
        .connect(&cfg.database.url)
        .await
        .context("failed to connect to postgres")?;

    store::ensure_schema(&db)
        .await
        .context("failed to ensure catalog schema")?;

    let perf = Arc::new(PerfCounters::new());
    let ledger = HoldLedger::new(cfg.reservation.retry_max, perf.clone());
    let state = AppState { cfg: cfg.clone(), db, ledger, perf };

    let allowed_headers = [CONTENT_TYPE, ACCEPT];
    let allowed_methods = [Method::GET, Method::POST, Method::OPTIONS];
    let cors = if cfg.api.cors_origins.iter().any(|x| x == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(allowed_methods)
            .allow_headers(allowed_headers)
    } else {
        let origins: Vec<HeaderValue> = cfg
            .api
            .cors_origins
            .iter()
            .filter_map(|origin| HeaderValue::from_str(origin).ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(allowed_methods)
            .allow_headers(allowed_headers)
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(get_stats))
        .route("/inventory/{sku}", get(get_inventory))
        .route("/inventory/reserve", post(reserve_inventory))
        .route("/checkout/confirm", post(checkout_confirm))
        .route("/checkout/cancel", post(checkout_cancel))
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", cfg.api.host, cfg.api.port).parse()?;
    info!(%addr, ttl_seconds = cfg.reservation.ttl_seconds, "inventory API listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
