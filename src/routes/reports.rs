use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::error::ApiError;
use crate::routes::AppState;

fn parse_date(raw: &str, field: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ApiError::validation(field, format!("{field} must be YYYY-MM-DD")))
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc()
}

/// GET /reports/proof-of-reserves
pub async fn proof_of_reserves(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.reports.proof_of_reserves().await?))
}

#[derive(Debug, Deserialize)]
pub struct SettlementReportParams {
    pub settlement_date: Option<String>,
}

/// GET /reports/proof-of-settlement?settlement_date=YYYY-MM-DD
pub async fn proof_of_settlement(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SettlementReportParams>,
) -> Result<impl IntoResponse, ApiError> {
    let date = params
        .settlement_date
        .as_deref()
        .map(|raw| parse_date(raw, "settlement_date"))
        .transpose()?;
    Ok(Json(state.reports.proof_of_settlement(date).await?))
}

#[derive(Debug, Deserialize)]
pub struct TransactionReportParams {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub currency: Option<String>,
    pub status: Option<String>,
    pub limit: Option<i64>,
}

/// GET /reports/transactions
pub async fn transactions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TransactionReportParams>,
) -> Result<impl IntoResponse, ApiError> {
    let start = params
        .start_date
        .as_deref()
        .map(|raw| parse_date(raw, "start_date").map(start_of_day))
        .transpose()?;
    // End bound is exclusive of the following midnight.
    let end = params
        .end_date
        .as_deref()
        .map(|raw| parse_date(raw, "end_date").map(|d| start_of_day(d) + Duration::days(1)))
        .transpose()?;
    let limit = params.limit.unwrap_or(100);
    if !(1..=1000).contains(&limit) {
        return Err(ApiError::validation("limit", "limit must be between 1 and 1000"));
    }

    let rows = state
        .reports
        .transactions(
            start,
            end,
            params.currency.as_deref(),
            params.status.as_deref(),
            limit,
        )
        .await?;

    let transactions: Vec<_> = rows
        .iter()
        .map(|row| {
            json!({
                "transaction_id": row.transaction_id,
                "uetr": row.uetr,
                "amount": row.amount,
                "currency": row.currency,
                "status": row.status,
                "created_at": row.created_at,
                "settled_at": row.updated_at,
                "risk_score": row.risk_score,
            })
        })
        .collect();

    Ok(Json(json!({
        "transactions": transactions,
        "total_count": rows.len(),
        "filters": {
            "start_date": params.start_date,
            "end_date": params.end_date,
            "currency": params.currency,
            "status": params.status,
        },
    })))
}

#[derive(Debug, Deserialize)]
pub struct ComplianceReportParams {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

/// GET /reports/compliance
pub async fn compliance(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ComplianceReportParams>,
) -> Result<impl IntoResponse, ApiError> {
    let period_end = match params.end_date.as_deref() {
        Some(raw) => start_of_day(parse_date(raw, "end_date")?) + Duration::days(1),
        None => Utc::now(),
    };
    let period_start = match params.start_date.as_deref() {
        Some(raw) => start_of_day(parse_date(raw, "start_date")?),
        None => period_end - Duration::days(30),
    };
    if period_start >= period_end {
        return Err(ApiError::validation("start_date", "start_date must precede end_date"));
    }

    Ok(Json(state.reports.compliance(period_start, period_end).await?))
}
