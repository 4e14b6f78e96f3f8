use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::ids;
use crate::model::{Payment, SettlementBatch, SettlementWindow};
use crate::settlement::{net_positions, BatchCloseSummary, PaymentLeg};

/// Advisory lock namespace for settlement window closes.
const SETTLEMENT_LOCK_NS: i32 = 0x5e77;

const PAYMENT_COLUMNS: &str = "transaction_id, uetr, amount, currency, debtor_account, \
     creditor_account, payment_purpose, settlement_method, status, idempotency_key, \
     settlement_batch_id, current_step, estimated_completion, created_at, updated_at";

const BATCH_COLUMNS: &str =
    "batch_id, window_kind, total_transactions, total_amount, net_positions, status, closed_at";

/// Current unbatched backlog of APPROVED payments.
pub struct Backlog {
    pub transaction_count: i64,
    pub total_amount: Decimal,
    pub oldest_transaction: Option<DateTime<Utc>>,
}

pub struct SettlementRepository {
    pool: PgPool,
}

impl SettlementRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Atomically claims the window's candidate set and closes it as a batch.
    ///
    /// One transaction: advisory lock on the window, row locks on the
    /// candidates, batch insert, candidate update, commit. Any failure
    /// before commit rolls the whole claim back and the payments stay
    /// eligible for the next attempt.
    pub async fn close_batch(
        &self,
        window: SettlementWindow,
    ) -> Result<BatchCloseSummary, sqlx::Error> {
        let now = Utc::now();
        let lower_bound = window.lower_bound(now);

        let mut tx = self.pool.begin().await?;

        // Serializes concurrent closes of the same window so a loser does
        // not observe an empty candidate set mid-claim.
        let window_key: i32 = match window {
            SettlementWindow::Intraday => 1,
            SettlementWindow::Eod => 2,
        };
        sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
            .bind(SETTLEMENT_LOCK_NS)
            .bind(window_key)
            .execute(&mut *tx)
            .await?;

        let candidates = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments \
             WHERE status = 'APPROVED' AND settlement_batch_id IS NULL AND created_at >= $1 \
             ORDER BY created_at \
             FOR UPDATE"
        ))
        .bind(lower_bound)
        .fetch_all(&mut *tx)
        .await?;

        if candidates.is_empty() {
            return Ok(BatchCloseSummary::empty(window, now));
        }

        let batch_id = ids::new_v7();
        let legs: Vec<PaymentLeg> = candidates.iter().map(PaymentLeg::from).collect();
        let positions = net_positions(&legs);
        let total_amount: Decimal = candidates.iter().map(|p| p.amount).sum();
        let positions_json =
            serde_json::to_value(&positions).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

        sqlx::query(
            "INSERT INTO settlement_batches \
             (batch_id, window_kind, total_transactions, total_amount, net_positions, status, closed_at) \
             VALUES ($1, $2, $3, $4, $5, 'CLOSED', $6)",
        )
        .bind(batch_id)
        .bind(window.as_str())
        .bind(candidates.len() as i64)
        .bind(total_amount)
        .bind(&positions_json)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let transaction_ids: Vec<Uuid> = candidates.iter().map(|p| p.transaction_id).collect();
        sqlx::query(
            "UPDATE payments \
             SET settlement_batch_id = $1, status = 'SETTLED', updated_at = $2 \
             WHERE transaction_id = ANY($3)",
        )
        .bind(batch_id)
        .bind(now)
        .bind(&transaction_ids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(BatchCloseSummary {
            batch_id: Some(batch_id),
            window,
            total_transactions: candidates.len() as i64,
            total_amount,
            net_positions: positions,
            closed_at: now,
        })
    }

    pub async fn find_batch(&self, batch_id: Uuid) -> Result<Option<SettlementBatch>, sqlx::Error> {
        sqlx::query_as::<_, SettlementBatch>(&format!(
            "SELECT {BATCH_COLUMNS} FROM settlement_batches WHERE batch_id = $1"
        ))
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn recent_batches(&self, limit: i64) -> Result<Vec<SettlementBatch>, sqlx::Error> {
        sqlx::query_as::<_, SettlementBatch>(&format!(
            "SELECT {BATCH_COLUMNS} FROM settlement_batches ORDER BY closed_at DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn batch_payments(&self, batch_id: Uuid) -> Result<Vec<Payment>, sqlx::Error> {
        sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments \
             WHERE settlement_batch_id = $1 ORDER BY created_at"
        ))
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Read-only snapshot of the unbatched backlog; may be slightly stale.
    pub async fn backlog(&self) -> Result<Backlog, sqlx::Error> {
        let row: (i64, Option<Decimal>, Option<DateTime<Utc>>) = sqlx::query_as(
            "SELECT COUNT(*), SUM(amount), MIN(created_at) FROM payments \
             WHERE status = 'APPROVED' AND settlement_batch_id IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(Backlog {
            transaction_count: row.0,
            total_amount: row.1.unwrap_or_default(),
            oldest_transaction: row.2,
        })
    }

    /// Legs of the current backlog, for the hypothetical net computation.
    pub async fn backlog_legs(&self) -> Result<Vec<PaymentLeg>, sqlx::Error> {
        let rows: Vec<(String, String, String, Decimal)> = sqlx::query_as(
            "SELECT debtor_account, creditor_account, currency, amount FROM payments \
             WHERE status = 'APPROVED' AND settlement_batch_id IS NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(debtor_account, creditor_account, currency, amount)| PaymentLeg {
                debtor_account,
                creditor_account,
                currency,
                amount,
            })
            .collect())
    }
}
