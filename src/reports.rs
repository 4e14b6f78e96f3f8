use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::reports::{ReportsRepository, TransactionReportRow};
use crate::error::ApiError;
use crate::events::{self, EventBus};
use crate::ids;

/// Mock reserve coverage applied to settled balances.
const RESERVE_RATIO: f64 = 1.10;

/// Hard-coded USD conversion table; unknown currencies convert 1:1.
const USD_RATES: [(&str, f64); 6] = [
    ("USD", 1.0),
    ("EUR", 1.18),
    ("GBP", 1.33),
    ("JPY", 0.009),
    ("AED", 0.27),
    ("INR", 0.012),
];

fn usd_rate(currency: &str) -> f64 {
    USD_RATES
        .iter()
        .find(|(c, _)| *c == currency)
        .map(|(_, r)| *r)
        .unwrap_or(1.0)
}

// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct CurrencyReserve {
    pub settled_amount: f64,
    pub pending_amount: f64,
    pub reserves: f64,
    pub liabilities: f64,
    pub reserve_ratio: Option<f64>,
    pub usd_value_reserves: f64,
    pub usd_value_liabilities: f64,
}

#[derive(Debug, Serialize)]
pub struct ProofOfReserves {
    pub report_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub total_reserves_usd: f64,
    pub total_liabilities_usd: f64,
    pub reserve_ratio: Option<f64>,
    pub currencies: BTreeMap<String, CurrencyReserve>,
    pub attestation_hash: String,
    pub valid_until: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct SettledTransaction {
    pub transaction_id: Uuid,
    pub uetr: Uuid,
    pub amount: f64,
    pub currency: String,
    pub amount_usd: f64,
}

#[derive(Debug, Serialize)]
pub struct BatchManifest {
    pub batch_id: Uuid,
    pub window: String,
    pub closed_at: DateTime<Utc>,
    pub transactions: Vec<SettledTransaction>,
    pub total_amount_usd: f64,
}

#[derive(Debug, Serialize)]
pub struct ProofOfSettlement {
    pub report_id: Uuid,
    pub settlement_date: NaiveDate,
    pub generated_at: DateTime<Utc>,
    pub total_settled_transactions: usize,
    pub total_settled_amount_usd: f64,
    pub settlement_batches: Vec<BatchManifest>,
    pub iso20022_manifest: serde_json::Value,
    pub merkle_root: String,
    pub block_references: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ComplianceReport {
    pub report_id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_transactions: i64,
    pub travel_rule_applicable: i64,
    pub sanctions_hits: i64,
    pub pep_matches: i64,
    pub manual_reviews: i64,
    pub compliance_rate: f64,
}

// ---------------------------------------------------------------------------
// Hashing helpers
// ---------------------------------------------------------------------------

/// SHA-256 over the sorted concatenation of transaction ids. Empty set
/// hashes to the empty string.
pub fn merkle_root(transaction_ids: &[Uuid]) -> String {
    if transaction_ids.is_empty() {
        return String::new();
    }
    let mut sorted: Vec<String> = transaction_ids.iter().map(|id| id.to_string()).collect();
    sorted.sort();
    hex::encode(Sha256::digest(sorted.concat().as_bytes()))
}

fn attestation_hash(
    report_id: Uuid,
    reserves_usd: f64,
    liabilities_usd: f64,
    generated_at: DateTime<Utc>,
) -> String {
    let payload = format!(
        "{report_id}{reserves_usd}{liabilities_usd}{}",
        generated_at.to_rfc3339()
    );
    hex::encode(Sha256::digest(payload.as_bytes()))
}

// ---------------------------------------------------------------------------
// Component
// ---------------------------------------------------------------------------

pub struct Reporting {
    repo: ReportsRepository,
    bus: Arc<dyn EventBus>,
}

impl Reporting {
    pub fn new(repo: ReportsRepository, bus: Arc<dyn EventBus>) -> Self {
        Self { repo, bus }
    }

    /// Per-currency reserves vs liabilities over the trailing 30 days,
    /// with a signed attestation hash. Read-only over payments.
    pub async fn proof_of_reserves(&self) -> Result<ProofOfReserves, ApiError> {
        let report_id = ids::new_v7();
        let generated_at = Utc::now();
        let balances = self.repo.currency_balances_30d().await?;

        let mut currencies = BTreeMap::new();
        let mut total_reserves_usd = 0.0;
        let mut total_liabilities_usd = 0.0;

        for balance in &balances {
            let settled = balance.settled_amount.to_f64().unwrap_or(0.0);
            let pending = balance.pending_amount.to_f64().unwrap_or(0.0);
            let rate = usd_rate(&balance.currency);

            let reserves = settled * RESERVE_RATIO;
            let liabilities = pending;

            currencies.insert(
                balance.currency.clone(),
                CurrencyReserve {
                    settled_amount: settled,
                    pending_amount: pending,
                    reserves,
                    liabilities,
                    reserve_ratio: (liabilities > 0.0).then(|| reserves / liabilities),
                    usd_value_reserves: reserves * rate,
                    usd_value_liabilities: liabilities * rate,
                },
            );

            total_reserves_usd += reserves * rate;
            total_liabilities_usd += liabilities * rate;
        }

        let report = ProofOfReserves {
            report_id,
            generated_at,
            total_reserves_usd,
            total_liabilities_usd,
            reserve_ratio: (total_liabilities_usd > 0.0)
                .then(|| total_reserves_usd / total_liabilities_usd),
            currencies,
            attestation_hash: attestation_hash(
                report_id,
                total_reserves_usd,
                total_liabilities_usd,
                generated_at,
            ),
            valid_until: generated_at + Duration::hours(24),
        };

        self.persist("PROOF_OF_RESERVES", report_id, &report, generated_at).await;

        events::publish_event(
            self.bus.as_ref(),
            events::REPORTS_PROOF_OF_RESERVES_GENERATED,
            serde_json::json!({
                "report_id": report_id,
                "total_reserves_usd": total_reserves_usd,
                "reserve_ratio": report.reserve_ratio,
            }),
        )
        .await;

        info!(report_id = %report_id, "proof of reserves generated");
        Ok(report)
    }

    /// ISO-20022-shaped manifest of everything settled on the given date
    /// (default: today UTC), grouped by closing batch.
    pub async fn proof_of_settlement(
        &self,
        settlement_date: Option<NaiveDate>,
    ) -> Result<ProofOfSettlement, ApiError> {
        let target_date = settlement_date.unwrap_or_else(|| Utc::now().date_naive());
        let report_id = ids::new_v7();
        let generated_at = Utc::now();

        let rows = self.repo.settled_on(target_date).await?;

        let mut batches: Vec<BatchManifest> = Vec::new();
        let mut currency_breakdown: BTreeMap<String, f64> = BTreeMap::new();
        let mut transaction_ids = Vec::with_capacity(rows.len());
        let mut total_amount_usd = 0.0;

        for row in &rows {
            let amount = row.amount.to_f64().unwrap_or(0.0);
            let amount_usd = amount * usd_rate(&row.currency);
            transaction_ids.push(row.transaction_id);
            *currency_breakdown.entry(row.currency.clone()).or_insert(0.0) += amount;
            total_amount_usd += amount_usd;

            let entry = SettledTransaction {
                transaction_id: row.transaction_id,
                uetr: row.uetr,
                amount,
                currency: row.currency.clone(),
                amount_usd,
            };
            match batches.iter_mut().find(|b| b.batch_id == row.settlement_batch_id) {
                Some(batch) => {
                    batch.transactions.push(entry);
                    batch.total_amount_usd += amount_usd;
                }
                None => batches.push(BatchManifest {
                    batch_id: row.settlement_batch_id,
                    window: row.window_kind.clone(),
                    closed_at: row.closed_at,
                    transactions: vec![entry],
                    total_amount_usd: amount_usd,
                }),
            }
        }

        let iso20022_manifest = serde_json::json!({
            "message_type": "camt.053.001.08",
            "creation_date_time": generated_at.to_rfc3339(),
            "number_of_transactions": rows.len(),
            "control_sum": total_amount_usd,
            "settlement_method": "NETTING",
            "currency_breakdown": currency_breakdown,
            "batch_references": batches.iter().map(|b| b.batch_id).collect::<Vec<_>>(),
        });

        let block_references = (0..batches.len())
            .map(|i| format!("block_{i}_{target_date}"))
            .collect();

        let report = ProofOfSettlement {
            report_id,
            settlement_date: target_date,
            generated_at,
            total_settled_transactions: rows.len(),
            total_settled_amount_usd: total_amount_usd,
            settlement_batches: batches,
            iso20022_manifest,
            merkle_root: merkle_root(&transaction_ids),
            block_references,
        };

        self.persist("PROOF_OF_SETTLEMENT", report_id, &report, generated_at).await;

        info!(report_id = %report_id, date = %target_date, "proof of settlement generated");
        Ok(report)
    }

    pub async fn transactions(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        currency: Option<&str>,
        status: Option<&str>,
        limit: i64,
    ) -> Result<Vec<TransactionReportRow>, ApiError> {
        Ok(self
            .repo
            .transactions(start, end, currency, status, limit)
            .await?)
    }

    pub async fn compliance(
        &self,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<ComplianceReport, ApiError> {
        let stats = self.repo.compliance_stats(period_start, period_end).await?;

        let compliance_issues = stats.sanctions_hits + stats.pep_matches;
        let compliance_rate = if stats.total_transactions > 0 {
            (stats.total_transactions - compliance_issues) as f64 / stats.total_transactions as f64
                * 100.0
        } else {
            100.0
        };

        Ok(ComplianceReport {
            report_id: ids::new_v7(),
            period_start,
            period_end,
            total_transactions: stats.total_transactions,
            travel_rule_applicable: stats.travel_rule_applicable,
            sanctions_hits: stats.sanctions_hits,
            pep_matches: stats.pep_matches,
            manual_reviews: stats.manual_reviews,
            compliance_rate,
        })
    }

    /// Reports are derived artifacts; failing to archive one is logged but
    /// does not fail the read.
    async fn persist<T: Serialize>(
        &self,
        report_type: &str,
        report_id: Uuid,
        report: &T,
        generated_at: DateTime<Utc>,
    ) {
        match serde_json::to_value(report) {
            Ok(data) => {
                if let Err(e) = self.repo.save(report_id, report_type, &data, generated_at).await {
                    warn!(report_id = %report_id, error = %e, "report archive write failed");
                }
            }
            Err(e) => warn!(error = %e, "report serialization failed"),
        }
    }
}
