use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;

use crate::error::ApiError;
use crate::liquidity::QuoteRequest;
use crate::routes::{parse_uuid, AppState};

#[derive(Debug, Deserialize)]
pub struct QuoteParams {
    pub from_currency: String,
    pub to_currency: String,
    pub amount: Decimal,
    pub settlement_method: Option<String>,
    pub max_sources: Option<usize>,
}

/// GET /liquidity/quotes
pub async fn get_quotes(
    State(state): State<Arc<AppState>>,
    Query(params): Query<QuoteParams>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state
        .liquidity
        .get_quotes(QuoteRequest {
            from_currency: params.from_currency,
            to_currency: params.to_currency,
            amount: params.amount,
            settlement_method: params.settlement_method.unwrap_or_else(|| "PVP".to_string()),
            max_sources: params.max_sources.unwrap_or(3),
        })
        .await?;
    Ok(Json(response))
}

/// GET /liquidity/quotes/{id}
pub async fn quote_details(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let quote_id = parse_uuid(&id, "quote_id")?;
    let quote = state
        .liquidity
        .get_quote(quote_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Quote not found or expired"))?;
    Ok(Json(quote))
}

/// POST /liquidity/quotes/{id}/execute
pub async fn execute(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let quote_id = parse_uuid(&id, "quote_id")?;
    let result = state.liquidity.execute(quote_id).await?;
    Ok(Json(result))
}
