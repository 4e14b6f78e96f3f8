use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Payment lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentStatus {
    Initiated,
    Validated,
    Screened,
    Approved,
    Settled,
    Completed,
    Rejected,
    Cancelled,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Initiated => "INITIATED",
            PaymentStatus::Validated => "VALIDATED",
            PaymentStatus::Screened => "SCREENED",
            PaymentStatus::Approved => "APPROVED",
            PaymentStatus::Settled => "SETTLED",
            PaymentStatus::Completed => "COMPLETED",
            PaymentStatus::Rejected => "REJECTED",
            PaymentStatus::Cancelled => "CANCELLED",
            PaymentStatus::Failed => "FAILED",
        }
    }

    pub const ALL: [PaymentStatus; 9] = [
        PaymentStatus::Initiated,
        PaymentStatus::Validated,
        PaymentStatus::Screened,
        PaymentStatus::Approved,
        PaymentStatus::Settled,
        PaymentStatus::Completed,
        PaymentStatus::Rejected,
        PaymentStatus::Cancelled,
        PaymentStatus::Failed,
    ];

    /// Settlement has made the payment irrevocable.
    pub fn is_settled_or_later(&self) -> bool {
        matches!(self, PaymentStatus::Settled | PaymentStatus::Completed)
    }

    /// Cancellation gate: cancel succeeds iff the payment has not settled
    /// (status not SETTLED or COMPLETED). Re-cancelling an already
    /// CANCELLED, REJECTED or FAILED payment passes the gate and is
    /// idempotent in effect.
    pub fn can_cancel(&self) -> bool {
        !self.is_settled_or_later()
    }
}

impl TryFrom<String> for PaymentStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "INITIATED" => Ok(PaymentStatus::Initiated),
            "VALIDATED" => Ok(PaymentStatus::Validated),
            "SCREENED" => Ok(PaymentStatus::Screened),
            "APPROVED" => Ok(PaymentStatus::Approved),
            "SETTLED" => Ok(PaymentStatus::Settled),
            "COMPLETED" => Ok(PaymentStatus::Completed),
            "REJECTED" => Ok(PaymentStatus::Rejected),
            "CANCELLED" => Ok(PaymentStatus::Cancelled),
            "FAILED" => Ok(PaymentStatus::Failed),
            other => Err(format!("unknown payment status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SettlementMethod {
    Instant,
    Pvp,
    Netting,
    Correspondent,
}

impl SettlementMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementMethod::Instant => "INSTANT",
            SettlementMethod::Pvp => "PVP",
            SettlementMethod::Netting => "NETTING",
            SettlementMethod::Correspondent => "CORRESPONDENT",
        }
    }
}

impl TryFrom<String> for SettlementMethod {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "INSTANT" => Ok(SettlementMethod::Instant),
            "PVP" => Ok(SettlementMethod::Pvp),
            "NETTING" => Ok(SettlementMethod::Netting),
            "CORRESPONDENT" => Ok(SettlementMethod::Correspondent),
            other => Err(format!("unknown settlement method: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentPurpose {
    Trade,
    Services,
    Investment,
    Personal,
    Government,
    Charity,
    Pension,
    Tax,
}

impl PaymentPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentPurpose::Trade => "TRADE",
            PaymentPurpose::Services => "SERVICES",
            PaymentPurpose::Investment => "INVESTMENT",
            PaymentPurpose::Personal => "PERSONAL",
            PaymentPurpose::Government => "GOVERNMENT",
            PaymentPurpose::Charity => "CHARITY",
            PaymentPurpose::Pension => "PENSION",
            PaymentPurpose::Tax => "TAX",
        }
    }
}

impl TryFrom<String> for PaymentPurpose {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "TRADE" => Ok(PaymentPurpose::Trade),
            "SERVICES" => Ok(PaymentPurpose::Services),
            "INVESTMENT" => Ok(PaymentPurpose::Investment),
            "PERSONAL" => Ok(PaymentPurpose::Personal),
            "GOVERNMENT" => Ok(PaymentPurpose::Government),
            "CHARITY" => Ok(PaymentPurpose::Charity),
            "PENSION" => Ok(PaymentPurpose::Pension),
            "TAX" => Ok(PaymentPurpose::Tax),
            other => Err(format!("unknown payment purpose: {other}")),
        }
    }
}

/// A payments-ledger row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Payment {
    pub transaction_id: Uuid,
    pub uetr: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub debtor_account: String,
    pub creditor_account: String,
    #[sqlx(try_from = "String")]
    pub payment_purpose: PaymentPurpose,
    #[sqlx(try_from = "String")]
    pub settlement_method: SettlementMethod,
    #[sqlx(try_from = "String")]
    pub status: PaymentStatus,
    pub idempotency_key: Uuid,
    pub settlement_batch_id: Option<Uuid>,
    pub current_step: Option<String>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Settlement
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementWindow {
    #[serde(rename = "intraday")]
    Intraday,
    #[serde(rename = "EOD")]
    Eod,
}

impl SettlementWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementWindow::Intraday => "intraday",
            SettlementWindow::Eod => "EOD",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "intraday" => Some(SettlementWindow::Intraday),
            "EOD" => Some(SettlementWindow::Eod),
            _ => None,
        }
    }

    /// Selection horizon: `intraday` reaches back 4 hours, `EOD` to the
    /// start of the current UTC day.
    pub fn lower_bound(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            SettlementWindow::Intraday => now - Duration::hours(4),
            SettlementWindow::Eod => now
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .expect("midnight is always valid")
                .and_utc(),
        }
    }
}

impl TryFrom<String> for SettlementWindow {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("unknown settlement window: {value}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SettlementInstruction {
    Pay,
    Receive,
}

/// Per (account, currency) multilateral net. `amount` is the absolute
/// magnitude; the sign lives in `settlement_instruction`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetPosition {
    pub account: String,
    pub currency: String,
    pub amount: Decimal,
    pub settlement_instruction: SettlementInstruction,
}

/// A closed settlement batch. Immutable once written.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SettlementBatch {
    pub batch_id: Uuid,
    #[sqlx(try_from = "String")]
    #[serde(rename = "window")]
    pub window_kind: SettlementWindow,
    pub total_transactions: i64,
    pub total_amount: Decimal,
    pub net_positions: serde_json::Value,
    pub status: String,
    pub closed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Risk
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskMode {
    Low,
    Medium,
    High,
}

impl RiskMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskMode::Low => "Low",
            RiskMode::Medium => "Medium",
            RiskMode::High => "High",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Low" => Some(RiskMode::Low),
            "Medium" => Some(RiskMode::Medium),
            "High" => Some(RiskMode::High),
            _ => None,
        }
    }
}

impl TryFrom<String> for RiskMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("unknown risk mode: {value}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecommendedAction {
    Approve,
    EnhancedMonitoring,
    ManualReview,
}

impl RecommendedAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendedAction::Approve => "APPROVE",
            RecommendedAction::EnhancedMonitoring => "ENHANCED_MONITORING",
            RecommendedAction::ManualReview => "MANUAL_REVIEW",
        }
    }
}

// ---------------------------------------------------------------------------
// Liquidity
// ---------------------------------------------------------------------------

/// A provider quote. Lives in KV under `quote:<id>` until executed or
/// expired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub quote_id: Uuid,
    pub from_currency: String,
    pub to_currency: String,
    pub amount: Decimal,
    pub mid_rate: f64,
    pub applied_rate: f64,
    pub spread: f64,
    pub source: String,
    pub latency_ms: u64,
    pub ttl_seconds: u64,
    pub expires_at: DateTime<Utc>,
    pub utility_score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_gate() {
        // Cancellable while the payment has not settled.
        assert!(PaymentStatus::Initiated.can_cancel());
        assert!(PaymentStatus::Validated.can_cancel());
        assert!(PaymentStatus::Screened.can_cancel());
        assert!(PaymentStatus::Approved.can_cancel());
        // Re-cancel of an already-ended payment passes the gate.
        assert!(PaymentStatus::Cancelled.can_cancel());
        assert!(PaymentStatus::Rejected.can_cancel());
        assert!(PaymentStatus::Failed.can_cancel());
        // Settlement closes the gate.
        assert!(!PaymentStatus::Settled.can_cancel());
        assert!(!PaymentStatus::Completed.can_cancel());
    }

    #[test]
    fn test_cancel_gate_blocks_exactly_the_settled_states() {
        let blocked: Vec<&str> = PaymentStatus::ALL
            .iter()
            .filter(|s| !s.can_cancel())
            .map(|s| s.as_str())
            .collect();
        assert_eq!(blocked, vec!["SETTLED", "COMPLETED"]);
    }

    #[test]
    fn test_window_lower_bound() {
        let now = DateTime::parse_from_rfc3339("2026-03-10T14:30:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let intraday = SettlementWindow::Intraday.lower_bound(now);
        assert_eq!(intraday, now - Duration::hours(4));

        let eod = SettlementWindow::Eod.lower_bound(now);
        assert_eq!(eod.to_rfc3339(), "2026-03-10T00:00:00+00:00");
    }

    #[test]
    fn test_wire_strings_round_trip() {
        assert_eq!(PaymentStatus::try_from("SETTLED".to_string()).unwrap(), PaymentStatus::Settled);
        assert_eq!(SettlementMethod::try_from("PVP".to_string()).unwrap(), SettlementMethod::Pvp);
        assert_eq!(SettlementWindow::parse("EOD").unwrap(), SettlementWindow::Eod);
        assert_eq!(RiskMode::parse("High").unwrap(), RiskMode::High);
        assert!(PaymentStatus::try_from("SETTLING".to_string()).is_err());

        let json = serde_json::to_string(&RecommendedAction::ManualReview).unwrap();
        assert_eq!(json, "\"MANUAL_REVIEW\"");
        let json = serde_json::to_string(&SettlementWindow::Eod).unwrap();
        assert_eq!(json, "\"EOD\"");
    }
}
