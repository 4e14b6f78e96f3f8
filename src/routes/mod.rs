pub mod liquidity;
pub mod payments;
pub mod reports;
pub mod risk;
pub mod settlement;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;

use crate::config::GatewayConfig;
use crate::db::payments::PaymentRepository;
use crate::error::ApiError;
use crate::events::EventBus;
use crate::idempotency::{idempotency_layer, IdempotencyState};
use crate::kv::KeyValue;
use crate::liquidity::LiquidityCoordinator;
use crate::reports::Reporting;
use crate::risk::RiskController;
use crate::settlement::SettlementEngine;

// ---------------------------------------------------------------------------
// App state (shared via Axum's State extractor)
// ---------------------------------------------------------------------------

pub struct AppState {
    pub config: GatewayConfig,
    pub pool: PgPool,
    pub kv: Arc<dyn KeyValue>,
    pub bus: Arc<dyn EventBus>,
    pub payments: Arc<PaymentRepository>,
    pub risk: RiskController,
    pub settlement: Arc<SettlementEngine>,
    pub liquidity: LiquidityCoordinator,
    pub reports: Reporting,
}

/// Assembles the full HTTP surface. The idempotency middleware wraps every
/// route; it gates POSTs and memoizes PUT/PATCH on request.
pub fn router(state: Arc<AppState>) -> Router {
    let idempotency = IdempotencyState {
        kv: Arc::clone(&state.kv),
        ttl_secs: state.config.idempotency_ttl_secs,
    };

    Router::new()
        .route("/health", get(health))
        .route("/payments/initiate", post(payments::initiate))
        .route("/payments/:id/status", get(payments::status))
        .route("/payments/:id/cancel", post(payments::cancel))
        .route("/settlement/close-batch", post(settlement::close_batch))
        .route("/settlement/status", get(settlement::status))
        .route("/settlement/batches/:id", get(settlement::batch_details))
        .route("/liquidity/quotes", get(liquidity::get_quotes))
        .route("/liquidity/quotes/:id", get(liquidity::quote_details))
        .route("/liquidity/quotes/:id/execute", post(liquidity::execute))
        .route("/risk/mode", get(risk::get_mode).post(risk::set_mode))
        .route("/risk/metrics", get(risk::metrics))
        .route("/risk/assess/:txn", post(risk::assess))
        .route("/risk/thresholds", get(risk::thresholds))
        .route("/reports/proof-of-reserves", get(reports::proof_of_reserves))
        .route("/reports/proof-of-settlement", get(reports::proof_of_settlement))
        .route("/reports/transactions", get(reports::transactions))
        .route("/reports/compliance", get(reports::compliance))
        .layer(axum::middleware::from_fn_with_state(idempotency, idempotency_layer))
        .with_state(state)
}

/// Aggregated dependency probe: 200 when the durable store, the KV store
/// and the event bus all answer, 503 otherwise.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let db_ok = sqlx::query("SELECT 1").execute(&state.pool).await.is_ok();
    let kv_ok = state.kv.ping().await.is_ok();
    let bus_ok = state.bus.healthy().await;

    let healthy = db_ok && kv_ok && bus_ok;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if healthy { "ok" } else { "degraded" },
            "version": env!("CARGO_PKG_VERSION"),
            "service": "rail-gateway",
            "components": {
                "database": if db_ok { "up" } else { "down" },
                "cache": if kv_ok { "up" } else { "down" },
                "event_bus": if bus_ok { "up" } else { "down" },
            },
        })),
    )
}

/// Shared helper: parse a path segment as a UUID or answer 400.
pub(crate) fn parse_uuid(raw: &str, field: &str) -> Result<uuid::Uuid, ApiError> {
    uuid::Uuid::parse_str(raw)
        .map_err(|_| ApiError::validation(field, format!("{field} must be a valid UUID")))
}
