use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

/// Per-currency settled/pending sums over the trailing 30 days.
#[derive(Debug, sqlx::FromRow)]
pub struct CurrencyBalance {
    pub currency: String,
    pub settled_amount: Decimal,
    pub pending_amount: Decimal,
}

/// A settled payment joined to its closing batch.
#[derive(Debug, sqlx::FromRow)]
pub struct SettledPayment {
    pub transaction_id: Uuid,
    pub uetr: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub settlement_batch_id: Uuid,
    pub window_kind: String,
    pub closed_at: DateTime<Utc>,
}

/// A row of the filtered transactions report.
#[derive(Debug, sqlx::FromRow)]
pub struct TransactionReportRow {
    pub transaction_id: Uuid,
    pub uetr: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub risk_score: Option<f64>,
}

/// Aggregate compliance counters for a reporting period.
#[derive(Debug, sqlx::FromRow)]
pub struct ComplianceStats {
    pub total_transactions: i64,
    pub travel_rule_applicable: i64,
    pub sanctions_hits: i64,
    pub pep_matches: i64,
    pub manual_reviews: i64,
}

pub struct ReportsRepository {
    pool: PgPool,
}

impl ReportsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn currency_balances_30d(&self) -> Result<Vec<CurrencyBalance>, sqlx::Error> {
        sqlx::query_as::<_, CurrencyBalance>(
            "SELECT currency, \
             COALESCE(SUM(CASE WHEN status IN ('SETTLED', 'COMPLETED') THEN amount ELSE 0 END), 0) \
                 AS settled_amount, \
             COALESCE(SUM(CASE WHEN status IN ('INITIATED', 'VALIDATED', 'SCREENED', 'APPROVED') \
                 THEN amount ELSE 0 END), 0) AS pending_amount \
             FROM payments \
             WHERE created_at >= now() - INTERVAL '30 days' \
             GROUP BY currency \
             ORDER BY currency",
        )
        .fetch_all(&self.pool)
        .await
    }

    /// Settled payments whose batch closed on the given UTC date.
    pub async fn settled_on(&self, date: NaiveDate) -> Result<Vec<SettledPayment>, sqlx::Error> {
        sqlx::query_as::<_, SettledPayment>(
            "SELECT p.transaction_id, p.uetr, p.amount, p.currency, \
                    p.settlement_batch_id, sb.window_kind, sb.closed_at \
             FROM payments p \
             JOIN settlement_batches sb ON p.settlement_batch_id = sb.batch_id \
             WHERE sb.closed_at::date = $1 AND p.status = 'SETTLED' \
             ORDER BY sb.closed_at, p.created_at",
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn transactions(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        currency: Option<&str>,
        status: Option<&str>,
        limit: i64,
    ) -> Result<Vec<TransactionReportRow>, sqlx::Error> {
        sqlx::query_as::<_, TransactionReportRow>(
            "SELECT p.transaction_id, p.uetr, p.amount, p.currency, p.status, \
                    p.created_at, p.updated_at, ra.risk_score \
             FROM payments p \
             LEFT JOIN risk_assessments ra ON p.transaction_id = ra.transaction_id \
             WHERE ($1::timestamptz IS NULL OR p.created_at >= $1) \
               AND ($2::timestamptz IS NULL OR p.created_at < $2) \
               AND ($3::text IS NULL OR p.currency = $3) \
               AND ($4::text IS NULL OR p.status = $4) \
             ORDER BY p.created_at DESC \
             LIMIT $5",
        )
        .bind(start)
        .bind(end)
        .bind(currency)
        .bind(status)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn compliance_stats(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ComplianceStats, sqlx::Error> {
        sqlx::query_as::<_, ComplianceStats>(
            "SELECT COUNT(*) AS total_transactions, \
             COUNT(*) FILTER (WHERE p.amount >= 1000) AS travel_rule_applicable, \
             COUNT(*) FILTER (WHERE ra.risk_factors @> '[\"SANCTIONS_HIT\"]') AS sanctions_hits, \
             COUNT(*) FILTER (WHERE ra.risk_factors @> '[\"PEP_MATCH\"]') AS pep_matches, \
             COUNT(*) FILTER (WHERE ra.recommended_action = 'MANUAL_REVIEW') AS manual_reviews \
             FROM payments p \
             LEFT JOIN risk_assessments ra ON p.transaction_id = ra.transaction_id \
             WHERE p.created_at >= $1 AND p.created_at < $2",
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn save(
        &self,
        report_id: Uuid,
        report_type: &str,
        data: &serde_json::Value,
        generated_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO reports (report_id, report_type, data, generated_at) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(report_id)
        .bind(report_type)
        .bind(data)
        .bind(generated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
