use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::error::ApiError;
use crate::model::SettlementWindow;
use crate::routes::{parse_uuid, AppState};

#[derive(Debug, Deserialize)]
pub struct CloseBatchParams {
    pub window: String,
}

/// POST /settlement/close-batch?window=intraday|EOD
pub async fn close_batch(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CloseBatchParams>,
) -> Result<impl IntoResponse, ApiError> {
    let window = SettlementWindow::parse(&params.window).ok_or_else(|| {
        ApiError::validation("window", "window must be 'intraday' or 'EOD'")
    })?;

    let summary = state.settlement.close_window(window).await?;

    Ok(Json(json!({
        // Empty-window sentinel: no batch row was written.
        "batch_id": summary.batch_id.map(|id| id.to_string()).unwrap_or_default(),
        "window": summary.window.as_str(),
        "total_transactions": summary.total_transactions,
        "total_amount": summary.total_amount,
        "net_positions": summary.net_positions,
        "closed_at": summary.closed_at,
    })))
}

/// GET /settlement/status
pub async fn status(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let status = state.settlement.status().await?;

    let current_batch = if status.backlog.transaction_count > 0 {
        json!({
            "transaction_count": status.backlog.transaction_count,
            "total_amount": status.backlog.total_amount,
            "oldest_transaction": status.backlog.oldest_transaction,
        })
    } else {
        serde_json::Value::Null
    };

    Ok(Json(json!({
        "current_batch": current_batch,
        "completed_batches": status.completed_batches,
        "net_positions": status.net_positions,
    })))
}

/// GET /settlement/batches/{id}
pub async fn batch_details(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let batch_id = parse_uuid(&id, "batch_id")?;

    let (batch, transactions) = state
        .settlement
        .batch_details(batch_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Batch not found"))?;

    Ok(Json(json!({
        "batch": batch,
        "transactions": transactions,
    })))
}
