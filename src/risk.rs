use chrono::{DateTime, Datelike, Utc, Weekday};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::payments::PaymentRepository;
use crate::db::risk::{AssessmentRecord, RiskRepository};
use crate::error::{ApiError, ErrorCode};
use crate::events::{self, EventBus};
use crate::kv::KeyValue;
use crate::model::{RecommendedAction, RiskMode};

const MODE_CACHE_KEY: &str = "risk:current_mode";
const MODE_CACHE_TTL_SECS: u64 = 300;
const METRICS_CACHE_KEY: &str = "risk:metrics";
const METRICS_CACHE_TTL_SECS: u64 = 60;

const HIGH_RISK_CURRENCIES: [&str; 3] = ["AED", "INR", "CNY"];

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskThresholds {
    pub spread_threshold: f64,
    pub depth_threshold: f64,
    pub deviation_threshold: f64,
    pub latency_threshold_ms: i64,
    pub volume_threshold_usd: f64,
}

pub fn thresholds_for(mode: RiskMode) -> RiskThresholds {
    match mode {
        RiskMode::Low => RiskThresholds {
            spread_threshold: 0.001,
            depth_threshold: 1_000_000.0,
            deviation_threshold: 0.05,
            latency_threshold_ms: 100,
            volume_threshold_usd: 10_000_000.0,
        },
        RiskMode::Medium => RiskThresholds {
            spread_threshold: 0.005,
            depth_threshold: 500_000.0,
            deviation_threshold: 0.10,
            latency_threshold_ms: 200,
            volume_threshold_usd: 5_000_000.0,
        },
        RiskMode::High => RiskThresholds {
            spread_threshold: 0.01,
            depth_threshold: 100_000.0,
            deviation_threshold: 0.20,
            latency_threshold_ms: 500,
            volume_threshold_usd: 1_000_000.0,
        },
    }
}

// ---------------------------------------------------------------------------
// Per-transaction scoring (pure)
// ---------------------------------------------------------------------------

/// The features the additive score is computed from.
#[derive(Debug, Clone)]
pub struct RiskFeatures {
    pub amount: Decimal,
    pub currency: String,
    pub debtor_txn_count_24h: i64,
    pub weekend: bool,
}

#[derive(Debug, Clone)]
pub struct ScoredRisk {
    pub risk_score: f64,
    pub risk_factors: Vec<String>,
    pub recommended_action: RecommendedAction,
}

pub fn score_features(features: &RiskFeatures) -> ScoredRisk {
    let mut score = 0.0;
    let mut factors = Vec::new();

    if features.amount > Decimal::from(100_000) {
        factors.push("HIGH_VALUE".to_string());
        score += 20.0;
    }
    if HIGH_RISK_CURRENCIES.contains(&features.currency.as_str()) {
        factors.push("HIGH_RISK_CURRENCY".to_string());
        score += 15.0;
    }
    if features.debtor_txn_count_24h > 10 {
        factors.push("HIGH_FREQUENCY".to_string());
        score += 10.0;
    }
    if features.weekend {
        factors.push("WEEKEND_TRANSACTION".to_string());
        score += 5.0;
    }

    ScoredRisk {
        risk_score: score,
        risk_factors: factors,
        recommended_action: action_for_score(score),
    }
}

pub fn action_for_score(score: f64) -> RecommendedAction {
    if score >= 40.0 {
        RecommendedAction::ManualReview
    } else if score >= 20.0 {
        RecommendedAction::EnhancedMonitoring
    } else {
        RecommendedAction::Approve
    }
}

fn is_weekend(now: DateTime<Utc>) -> bool {
    matches!(now.weekday(), Weekday::Sat | Weekday::Sun)
}

// ---------------------------------------------------------------------------
// Sliding-window metrics (pure over quote samples)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub spread: f64,
    pub depth: f64,
    pub deviation: f64,
    pub latency_ms: i64,
    pub volume_24h_usd: f64,
    pub risk_score: f64,
}

/// Aggregates (spread, latency_ms, amount) quote samples against the active
/// thresholds. Score adds 25 per threshold breach. With no samples at all,
/// nominal baseline figures are reported.
pub fn metrics_from_samples(
    samples: &[(f64, i64, Decimal)],
    thresholds: &RiskThresholds,
) -> RiskMetrics {
    if samples.is_empty() {
        return RiskMetrics {
            spread: 0.002,
            depth: 1_000_000.0,
            deviation: 0.05,
            latency_ms: 80,
            volume_24h_usd: 5_000_000.0,
            risk_score: 25.0,
        };
    }

    let n = samples.len() as f64;
    let avg_spread = samples.iter().map(|(s, _, _)| s).sum::<f64>() / n;
    let avg_latency = samples.iter().map(|(_, l, _)| *l as f64).sum::<f64>() / n;
    let total_volume = samples
        .iter()
        .map(|(_, _, a)| a.to_f64().unwrap_or(0.0))
        .sum::<f64>();

    // Coefficient of variation of the spread; nominal with one sample.
    let deviation = if samples.len() > 1 && avg_spread > 0.0 {
        let variance = samples
            .iter()
            .map(|(s, _, _)| (s - avg_spread).powi(2))
            .sum::<f64>()
            / n;
        variance.sqrt() / avg_spread
    } else {
        0.05
    };

    let mut risk_score = 0.0;
    if avg_spread > thresholds.spread_threshold {
        risk_score += 25.0;
    }
    if deviation > thresholds.deviation_threshold {
        risk_score += 25.0;
    }
    if avg_latency > thresholds.latency_threshold_ms as f64 {
        risk_score += 25.0;
    }
    if total_volume > thresholds.volume_threshold_usd {
        risk_score += 25.0;
    }

    RiskMetrics {
        spread: avg_spread,
        depth: total_volume,
        deviation,
        latency_ms: avg_latency as i64,
        volume_24h_usd: total_volume,
        risk_score,
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// The globally-consistent mode view served to callers and mirrored in KV.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskModeState {
    pub current_mode: RiskMode,
    pub thresholds: RiskThresholds,
    pub last_changed: Option<DateTime<Utc>>,
    pub changed_by: Option<String>,
    pub auto_escalation: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssessmentOutcome {
    pub transaction_id: Uuid,
    pub risk_score: f64,
    pub risk_factors: Vec<String>,
    pub recommended_action: RecommendedAction,
    pub assessment_time: DateTime<Utc>,
}

pub struct RiskController {
    repo: RiskRepository,
    payments: Arc<PaymentRepository>,
    kv: Arc<dyn KeyValue>,
    bus: Arc<dyn EventBus>,
}

impl RiskController {
    pub fn new(
        repo: RiskRepository,
        payments: Arc<PaymentRepository>,
        kv: Arc<dyn KeyValue>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            repo,
            payments,
            kv,
            bus,
        }
    }

    /// KV first, then the newest active DB row, then the Medium default.
    /// The KV mirror is best-effort; a stale read within the TTL is fine.
    pub async fn current_mode(&self) -> Result<RiskModeState, ApiError> {
        match self.kv.get(MODE_CACHE_KEY).await {
            Ok(Some(cached)) => {
                if let Ok(state) = serde_json::from_str::<RiskModeState>(&cached) {
                    return Ok(state);
                }
                warn!("unreadable risk mode cache entry, falling back to database");
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "risk mode cache read failed"),
        }

        let state = match self.repo.active_config().await.map_err(risk_error)? {
            Some(row) => RiskModeState {
                current_mode: row.mode,
                thresholds: thresholds_for(row.mode),
                last_changed: Some(row.updated_at),
                changed_by: Some(row.changed_by),
                auto_escalation: row.auto_escalation,
            },
            None => RiskModeState {
                current_mode: RiskMode::Medium,
                thresholds: thresholds_for(RiskMode::Medium),
                last_changed: None,
                changed_by: None,
                auto_escalation: true,
            },
        };

        self.cache_mode(&state).await;
        Ok(state)
    }

    pub async fn set_mode(
        &self,
        mode: RiskMode,
        reason: Option<String>,
        auto_escalation: bool,
    ) -> Result<RiskModeState, ApiError> {
        let reason = reason.unwrap_or_else(|| "Manual update".to_string());
        let row = self
            .repo
            .set_mode(mode, &reason, "system", auto_escalation)
            .await
            .map_err(risk_error)?;

        let state = RiskModeState {
            current_mode: row.mode,
            thresholds: thresholds_for(row.mode),
            last_changed: Some(row.updated_at),
            changed_by: Some(row.changed_by),
            auto_escalation: row.auto_escalation,
        };
        self.cache_mode(&state).await;

        info!(mode = mode.as_str(), reason = %reason, "risk mode updated");
        events::publish_event(
            self.bus.as_ref(),
            events::RISK_MODE_CHANGED,
            serde_json::json!({
                "new_mode": mode.as_str(),
                "reason": reason,
                "thresholds": state.thresholds,
            }),
        )
        .await;

        Ok(state)
    }

    pub async fn metrics(&self) -> Result<RiskMetrics, ApiError> {
        match self.kv.get(METRICS_CACHE_KEY).await {
            Ok(Some(cached)) => {
                if let Ok(metrics) = serde_json::from_str::<RiskMetrics>(&cached) {
                    return Ok(metrics);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "risk metrics cache read failed"),
        }

        let mode = self.current_mode().await?;
        let samples = self
            .repo
            .quote_samples_last_hour()
            .await
            .map_err(risk_error)?;
        let metrics = metrics_from_samples(&samples, &mode.thresholds);

        if let Ok(json) = serde_json::to_string(&metrics) {
            if let Err(e) = self
                .kv
                .set_ex(METRICS_CACHE_KEY, &json, METRICS_CACHE_TTL_SECS)
                .await
            {
                warn!(error = %e, "risk metrics cache write failed");
            }
        }
        Ok(metrics)
    }

    /// Full assessment of a persisted payment: score, store, publish.
    pub async fn assess(&self, transaction_id: Uuid) -> Result<AssessmentOutcome, ApiError> {
        let payment = self
            .payments
            .find_by_id(transaction_id)
            .await
            .map_err(risk_error)?
            .ok_or_else(|| ApiError::not_found("Transaction not found"))?;

        let debtor_txn_count_24h = self
            .payments
            .debtor_count_last_24h(&payment.debtor_account)
            .await
            .map_err(risk_error)?;

        let scored = score_features(&RiskFeatures {
            amount: payment.amount,
            currency: payment.currency.clone(),
            debtor_txn_count_24h,
            weekend: is_weekend(Utc::now()),
        });

        let assessed_at = Utc::now();
        self.repo
            .save_assessment(&AssessmentRecord {
                transaction_id,
                risk_score: scored.risk_score,
                risk_factors: scored.risk_factors.clone(),
                recommended_action: scored.recommended_action.as_str().to_string(),
                assessed_at,
            })
            .await
            .map_err(risk_error)?;

        events::publish_event(
            self.bus.as_ref(),
            events::RISK_ASSESSMENT_COMPLETED,
            serde_json::json!({
                "transaction_id": transaction_id,
                "risk_score": scored.risk_score,
                "risk_factors": scored.risk_factors,
                "recommended_action": scored.recommended_action.as_str(),
            }),
        )
        .await;

        Ok(AssessmentOutcome {
            transaction_id,
            risk_score: scored.risk_score,
            risk_factors: scored.risk_factors,
            recommended_action: scored.recommended_action,
            assessment_time: assessed_at,
        })
    }

    /// Lightweight ingress gate: scores the request features without
    /// persisting anything. Used by payment initiation for the
    /// straight-through decision.
    pub async fn gate(
        &self,
        amount: Decimal,
        currency: &str,
        debtor_account: &str,
    ) -> Result<RecommendedAction, ApiError> {
        let debtor_txn_count_24h = self
            .payments
            .debtor_count_last_24h(debtor_account)
            .await
            .map_err(risk_error)?;
        let scored = score_features(&RiskFeatures {
            amount,
            currency: currency.to_string(),
            debtor_txn_count_24h,
            weekend: is_weekend(Utc::now()),
        });
        Ok(scored.recommended_action)
    }

    async fn cache_mode(&self, state: &RiskModeState) {
        if let Ok(json) = serde_json::to_string(state) {
            if let Err(e) = self.kv.set_ex(MODE_CACHE_KEY, &json, MODE_CACHE_TTL_SECS).await {
                warn!(error = %e, "risk mode cache write failed");
            }
        }
    }
}

fn risk_error(e: sqlx::Error) -> ApiError {
    ApiError::new(ErrorCode::RiskAssessmentFailed, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_weekend_high_value_aed() {
        // 250k AED, 12 prior debtor payments, Saturday: 20 + 15 + 10 + 5.
        let scored = score_features(&RiskFeatures {
            amount: dec!(250000),
            currency: "AED".into(),
            debtor_txn_count_24h: 12,
            weekend: true,
        });
        assert_eq!(scored.risk_score, 50.0);
        assert_eq!(
            scored.risk_factors,
            vec![
                "HIGH_VALUE",
                "HIGH_RISK_CURRENCY",
                "HIGH_FREQUENCY",
                "WEEKEND_TRANSACTION"
            ]
        );
        assert_eq!(scored.recommended_action, RecommendedAction::ManualReview);
    }

    #[test]
    fn test_plain_payment_approves() {
        let scored = score_features(&RiskFeatures {
            amount: dec!(100.00),
            currency: "USD".into(),
            debtor_txn_count_24h: 0,
            weekend: false,
        });
        assert_eq!(scored.risk_score, 0.0);
        assert!(scored.risk_factors.is_empty());
        assert_eq!(scored.recommended_action, RecommendedAction::Approve);
    }

    #[test]
    fn test_score_boundaries() {
        assert_eq!(action_for_score(19.9), RecommendedAction::Approve);
        assert_eq!(action_for_score(20.0), RecommendedAction::EnhancedMonitoring);
        assert_eq!(action_for_score(39.9), RecommendedAction::EnhancedMonitoring);
        assert_eq!(action_for_score(40.0), RecommendedAction::ManualReview);
    }

    #[test]
    fn test_threshold_boundaries_are_strict() {
        // Exactly 100 000 is not HIGH_VALUE; exactly 10 is not HIGH_FREQUENCY.
        let scored = score_features(&RiskFeatures {
            amount: dec!(100000),
            currency: "USD".into(),
            debtor_txn_count_24h: 10,
            weekend: false,
        });
        assert_eq!(scored.risk_score, 0.0);
    }

    #[test]
    fn test_metrics_defaults_without_samples() {
        let metrics = metrics_from_samples(&[], &thresholds_for(RiskMode::Medium));
        assert_eq!(metrics.spread, 0.002);
        assert_eq!(metrics.deviation, 0.05);
        assert_eq!(metrics.latency_ms, 80);
        assert_eq!(metrics.risk_score, 25.0);
    }

    #[test]
    fn test_metrics_breach_counting() {
        let thresholds = thresholds_for(RiskMode::Medium);

        // Calm market: tight spread, fast, low volume.
        let calm = vec![(0.001, 50, dec!(1000)), (0.001, 60, dec!(2000))];
        assert_eq!(metrics_from_samples(&calm, &thresholds).risk_score, 0.0);

        // Spread and latency both breached; volume and deviation not.
        let stressed = vec![(0.02, 500, dec!(1000)), (0.02, 600, dec!(2000))];
        let metrics = metrics_from_samples(&stressed, &thresholds);
        assert_eq!(metrics.risk_score, 50.0);
    }

    #[test]
    fn test_metrics_single_sample_nominal_deviation() {
        let thresholds = thresholds_for(RiskMode::Low);
        let metrics = metrics_from_samples(&[(0.0005, 20, dec!(100))], &thresholds);
        assert_eq!(metrics.deviation, 0.05);
        assert_eq!(metrics.latency_ms, 20);
    }

    #[test]
    fn test_thresholds_tighten_with_mode() {
        let low = thresholds_for(RiskMode::Low);
        let high = thresholds_for(RiskMode::High);
        assert!(low.spread_threshold < high.spread_threshold);
        assert!(low.volume_threshold_usd > high.volume_threshold_usd);
    }
}
