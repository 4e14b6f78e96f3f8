use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::error::ApiError;
use crate::model::RiskMode;
use crate::risk::thresholds_for;
use crate::routes::{parse_uuid, AppState};

/// GET /risk/mode
pub async fn get_mode(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.risk.current_mode().await?))
}

#[derive(Debug, Deserialize)]
pub struct ModeUpdateRequest {
    pub mode: String,
    pub reason: Option<String>,
    pub auto_escalation: Option<bool>,
}

/// POST /risk/mode
pub async fn set_mode(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ModeUpdateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mode = RiskMode::parse(&request.mode)
        .ok_or_else(|| ApiError::validation("mode", "mode must be Low, Medium or High"))?;
    let state_after = state
        .risk
        .set_mode(mode, request.reason, request.auto_escalation.unwrap_or(true))
        .await?;
    Ok(Json(state_after))
}

/// GET /risk/metrics
pub async fn metrics(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.risk.metrics().await?))
}

/// POST /risk/assess/{txn}
pub async fn assess(
    State(state): State<Arc<AppState>>,
    Path(txn): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let transaction_id = parse_uuid(&txn, "transaction_id")?;
    Ok(Json(state.risk.assess(transaction_id).await?))
}

/// GET /risk/thresholds
pub async fn thresholds() -> impl IntoResponse {
    Json(json!({
        "Low": thresholds_for(RiskMode::Low),
        "Medium": thresholds_for(RiskMode::Medium),
        "High": thresholds_for(RiskMode::High),
    }))
}
