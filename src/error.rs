use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;
use uuid::Uuid;

/// Wire-level error tags. Serialized exactly as SCREAMING_SNAKE_CASE into
/// the error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ValidationError,
    NotFound,
    Conflict,
    MissingIdempotencyKey,
    InvalidIdempotencyKey,
    PaymentExpired,
    PaymentCancelled,
    DuplicatePayment,
    SettlementFailed,
    BatchClosed,
    LiquidityUnavailable,
    RiskThresholdExceeded,
    RiskAssessmentFailed,
    SanctionsViolation,
    PepViolation,
    TravelRuleViolation,
    ComplianceCheckFailed,
    ExternalServiceError,
    TimeoutError,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::MissingIdempotencyKey => "MISSING_IDEMPOTENCY_KEY",
            ErrorCode::InvalidIdempotencyKey => "INVALID_IDEMPOTENCY_KEY",
            ErrorCode::PaymentExpired => "PAYMENT_EXPIRED",
            ErrorCode::PaymentCancelled => "PAYMENT_CANCELLED",
            ErrorCode::DuplicatePayment => "DUPLICATE_PAYMENT",
            ErrorCode::SettlementFailed => "SETTLEMENT_FAILED",
            ErrorCode::BatchClosed => "BATCH_CLOSED",
            ErrorCode::LiquidityUnavailable => "LIQUIDITY_UNAVAILABLE",
            ErrorCode::RiskThresholdExceeded => "RISK_THRESHOLD_EXCEEDED",
            ErrorCode::RiskAssessmentFailed => "RISK_ASSESSMENT_FAILED",
            ErrorCode::SanctionsViolation => "SANCTIONS_VIOLATION",
            ErrorCode::PepViolation => "PEP_VIOLATION",
            ErrorCode::TravelRuleViolation => "TRAVEL_RULE_VIOLATION",
            ErrorCode::ComplianceCheckFailed => "COMPLIANCE_CHECK_FAILED",
            ErrorCode::ExternalServiceError => "EXTERNAL_SERVICE_ERROR",
            ErrorCode::TimeoutError => "TIMEOUT_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorCode::ValidationError
            | ErrorCode::MissingIdempotencyKey
            | ErrorCode::InvalidIdempotencyKey
            | ErrorCode::TravelRuleViolation => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict
            | ErrorCode::PaymentCancelled
            | ErrorCode::DuplicatePayment
            | ErrorCode::BatchClosed => StatusCode::CONFLICT,
            ErrorCode::PaymentExpired => StatusCode::GONE,
            ErrorCode::RiskThresholdExceeded
            | ErrorCode::SanctionsViolation
            | ErrorCode::PepViolation => StatusCode::FORBIDDEN,
            ErrorCode::LiquidityUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::ExternalServiceError => StatusCode::BAD_GATEWAY,
            ErrorCode::TimeoutError => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::SettlementFailed
            | ErrorCode::RiskAssessmentFailed
            | ErrorCode::ComplianceCheckFailed
            | ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// The typed error every handler returns. Converted into the wire envelope
/// `{"error": {"code", "message", "details?"}, "transaction_id?": ...}`.
#[derive(Debug, thiserror::Error)]
#[error("{}: {}", .code.as_str(), .message)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub transaction_id: Option<Uuid>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            transaction_id: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_transaction_id(mut self, id: Uuid) -> Self {
        self.transaction_id = Some(id);
        self
    }

    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message).with_details(json!({ "field": field }))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn external_service(service: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ExternalServiceError, message)
            .with_details(json!({ "service": service }))
    }

    /// Message shown to clients. 5xx internals are sanitized; everything
    /// else carries the typed message through.
    fn public_message(&self) -> &str {
        match self.code {
            ErrorCode::InternalError => "internal error",
            ErrorCode::SettlementFailed => "settlement processing failed",
            ErrorCode::RiskAssessmentFailed => "risk assessment failed",
            ErrorCode::ComplianceCheckFailed => "compliance check failed",
            _ => &self.message,
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ApiError::not_found("record not found"),
            other => ApiError::internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.code.http_status();
        if status.is_server_error() {
            error!(code = self.code.as_str(), error = %self.message, "request failed");
        }

        let mut error_obj = json!({
            "code": self.code.as_str(),
            "message": self.public_message(),
        });
        if let Some(details) = &self.details {
            error_obj["details"] = details.clone();
        }
        let mut body = json!({ "error": error_obj });
        if let Some(txn) = self.transaction_id {
            body["transaction_id"] = json!(txn);
        }
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ErrorCode::ValidationError.http_status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::PaymentExpired.http_status(), StatusCode::GONE);
        assert_eq!(ErrorCode::PaymentCancelled.http_status(), StatusCode::CONFLICT);
        assert_eq!(ErrorCode::ExternalServiceError.http_status(), StatusCode::BAD_GATEWAY);
        assert_eq!(ErrorCode::TimeoutError.http_status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            ErrorCode::LiquidityUnavailable.http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ErrorCode::RiskThresholdExceeded.http_status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_internal_message_sanitized() {
        let err = ApiError::internal("connection refused at 10.0.0.3:5432");
        assert_eq!(err.public_message(), "internal error");

        let err = ApiError::validation("amount", "Amount must be positive");
        assert_eq!(err.public_message(), "Amount must be positive");
    }
}
