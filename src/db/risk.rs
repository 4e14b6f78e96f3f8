use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::model::RiskMode;

/// The active risk configuration row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RiskConfigRow {
    #[sqlx(try_from = "String")]
    pub mode: RiskMode,
    pub reason: String,
    pub changed_by: String,
    pub auto_escalation: bool,
    pub updated_at: DateTime<Utc>,
}

/// A persisted assessment verdict.
pub struct AssessmentRecord {
    pub transaction_id: Uuid,
    pub risk_score: f64,
    pub risk_factors: Vec<String>,
    pub recommended_action: String,
    pub assessed_at: DateTime<Utc>,
}

pub struct RiskRepository {
    pool: PgPool,
}

impl RiskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn active_config(&self) -> Result<Option<RiskConfigRow>, sqlx::Error> {
        sqlx::query_as::<_, RiskConfigRow>(
            "SELECT mode, reason, changed_by, auto_escalation, updated_at \
             FROM risk_config WHERE is_active = true \
             ORDER BY updated_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
    }

    /// Swaps the active configuration in one transaction so readers never
    /// observe zero or two active rows.
    pub async fn set_mode(
        &self,
        mode: RiskMode,
        reason: &str,
        changed_by: &str,
        auto_escalation: bool,
    ) -> Result<RiskConfigRow, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE risk_config SET is_active = false WHERE is_active = true")
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query_as::<_, RiskConfigRow>(
            "INSERT INTO risk_config (mode, reason, changed_by, auto_escalation, is_active, updated_at) \
             VALUES ($1, $2, $3, $4, true, now()) \
             RETURNING mode, reason, changed_by, auto_escalation, updated_at",
        )
        .bind(mode.as_str())
        .bind(reason)
        .bind(changed_by)
        .bind(auto_escalation)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row)
    }

    /// Upserts on transaction_id: re-assessing replaces the prior verdict.
    pub async fn save_assessment(&self, record: &AssessmentRecord) -> Result<(), sqlx::Error> {
        let factors = serde_json::to_value(&record.risk_factors)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        sqlx::query(
            "INSERT INTO risk_assessments \
             (transaction_id, risk_score, risk_factors, recommended_action, assessed_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (transaction_id) DO UPDATE SET \
             risk_score = EXCLUDED.risk_score, \
             risk_factors = EXCLUDED.risk_factors, \
             recommended_action = EXCLUDED.recommended_action, \
             assessed_at = EXCLUDED.assessed_at",
        )
        .bind(record.transaction_id)
        .bind(record.risk_score)
        .bind(&factors)
        .bind(&record.recommended_action)
        .bind(record.assessed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Spread/latency/volume samples from the trailing hour of quotes.
    pub async fn quote_samples_last_hour(
        &self,
    ) -> Result<Vec<(f64, i64, rust_decimal::Decimal)>, sqlx::Error> {
        let since = Utc::now() - Duration::hours(1);
        sqlx::query_as(
            "SELECT spread, latency_ms, amount FROM liquidity_quotes WHERE created_at >= $1",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
    }
}
