use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::db::payments::{CancelOutcome, InsertOutcome, NewPayment};
use crate::error::{ApiError, ErrorCode};
use crate::events;
use crate::idempotency::IDEMPOTENCY_HEADER;
use crate::ids;
use crate::model::{Payment, PaymentPurpose, PaymentStatus, RecommendedAction, SettlementMethod};
use crate::routes::{parse_uuid, AppState};

#[derive(Debug, Deserialize)]
pub struct PaymentInitiateRequest {
    pub amount: String,
    pub currency: String,
    pub debtor_account: String,
    pub creditor_account: String,
    pub payment_purpose: Option<String>,
    pub settlement_method: Option<String>,
}

/// POST /payments/initiate
///
/// Validates, consults the risk gate, persists the row and publishes
/// `payment.initiated`. The response always acknowledges INITIATED; the
/// row may already be APPROVED when the gate straight-through-processed it.
pub async fn initiate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<PaymentInitiateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let idempotency_key = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| uuid::Uuid::parse_str(v).ok())
        .ok_or_else(|| {
            ApiError::new(
                ErrorCode::MissingIdempotencyKey,
                "Idempotency-Key header is required for POST requests",
            )
        })?;

    let amount = Decimal::from_str(&request.amount)
        .ok()
        .filter(|a| *a > Decimal::ZERO)
        .ok_or_else(|| ApiError::validation("amount", "Amount must be positive"))?;

    if request.currency.chars().count() != 3 {
        return Err(ApiError::validation(
            "currency",
            "Currency must be 3-letter ISO code",
        ));
    }

    let payment_purpose = match &request.payment_purpose {
        Some(raw) => PaymentPurpose::try_from(raw.clone())
            .map_err(|e| ApiError::validation("payment_purpose", e))?,
        None => PaymentPurpose::Trade,
    };
    let settlement_method = match &request.settlement_method {
        Some(raw) => SettlementMethod::try_from(raw.clone())
            .map_err(|e| ApiError::validation("settlement_method", e))?,
        None => SettlementMethod::Pvp,
    };

    // Risk gate: clean payments go straight through to APPROVED; anything
    // flagged is held at INITIATED for screening. A gate outage holds too.
    let status = match state
        .risk
        .gate(amount, &request.currency, &request.debtor_account)
        .await
    {
        Ok(RecommendedAction::Approve) => PaymentStatus::Approved,
        Ok(_) => PaymentStatus::Initiated,
        Err(e) => {
            warn!(error = %e, "risk gate unavailable, holding payment at INITIATED");
            PaymentStatus::Initiated
        }
    };

    let new_payment = NewPayment {
        transaction_id: ids::new_v7(),
        uetr: ids::new_uetr(),
        amount,
        currency: request.currency.clone(),
        debtor_account: request.debtor_account.clone(),
        creditor_account: request.creditor_account.clone(),
        payment_purpose,
        settlement_method,
        status,
        idempotency_key,
    };

    let payment = match state.payments.insert(&new_payment).await? {
        InsertOutcome::Created(payment) => {
            info!(transaction_id = %payment.transaction_id, "payment initiated");
            events::publish_event(
                state.bus.as_ref(),
                events::PAYMENT_INITIATED,
                json!({
                    "transaction_id": payment.transaction_id,
                    "uetr": payment.uetr,
                    "payment_data": &payment,
                }),
            )
            .await;
            payment
        }
        InsertOutcome::Duplicate(existing) => {
            info!(
                transaction_id = %existing.transaction_id,
                "duplicate initiate resolved to existing payment"
            );
            existing
        }
    };

    Ok(Json(json!({
        "transaction_id": payment.transaction_id,
        "uetr": payment.uetr,
        "status": PaymentStatus::Initiated.as_str(),
        "timestamp": Utc::now().to_rfc3339(),
        "message": "Payment initiated successfully",
    })))
}

/// GET /payments/{id}/status
pub async fn status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let transaction_id = parse_uuid(&id, "payment_id")?;

    let payment = state
        .payments
        .find_by_id(transaction_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Payment not found"))?;

    let settlement_details = settlement_details(&state, &payment).await;

    Ok(Json(json!({
        "transaction_id": payment.transaction_id,
        "uetr": payment.uetr,
        "status": payment.status.as_str(),
        "current_step": payment.current_step,
        "settlement_details": settlement_details,
        "ledger_proof": serde_json::Value::Null,
        "estimated_completion": payment.estimated_completion,
    })))
}

async fn settlement_details(state: &AppState, payment: &Payment) -> serde_json::Value {
    if !payment.status.is_settled_or_later() {
        return serde_json::Value::Null;
    }
    let Some(batch_id) = payment.settlement_batch_id else {
        return serde_json::Value::Null;
    };
    match state.settlement.batch_details(batch_id).await {
        Ok(Some((batch, _))) => json!({
            "batch_id": batch.batch_id,
            "window": batch.window_kind.as_str(),
            "status": batch.status,
            "closed_at": batch.closed_at,
        }),
        Ok(None) => serde_json::Value::Null,
        Err(e) => {
            warn!(batch_id = %batch_id, error = %e, "settlement detail lookup failed");
            serde_json::Value::Null
        }
    }
}

/// POST /payments/{id}/cancel
///
/// The gate check and the transition are one conditional update: a payment
/// that settles mid-request still answers 409.
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let transaction_id = parse_uuid(&id, "payment_id")?;

    match state.payments.cancel(transaction_id).await? {
        CancelOutcome::Cancelled(payment) => {
            info!(transaction_id = %transaction_id, "payment cancelled");
            events::publish_event(
                state.bus.as_ref(),
                events::PAYMENT_CANCELLED,
                json!({
                    "transaction_id": payment.transaction_id,
                    "cancelled_at": payment.updated_at.to_rfc3339(),
                }),
            )
            .await;
            Ok(Json(json!({ "message": "Payment cancelled successfully" })))
        }
        CancelOutcome::NotCancellable(status) => Err(ApiError::new(
            ErrorCode::PaymentCancelled,
            "Cannot cancel completed payment",
        )
        .with_details(json!({ "status": status.as_str() }))
        .with_transaction_id(transaction_id)),
        CancelOutcome::NotFound => Err(ApiError::not_found("Payment not found")),
    }
}
