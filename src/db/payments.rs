use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::model::{Payment, PaymentPurpose, PaymentStatus, SettlementMethod};

const PAYMENT_COLUMNS: &str = "transaction_id, uetr, amount, currency, debtor_account, \
     creditor_account, payment_purpose, settlement_method, status, idempotency_key, \
     settlement_batch_id, current_step, estimated_completion, created_at, updated_at";

/// A validated payment ready for insertion.
pub struct NewPayment {
    pub transaction_id: Uuid,
    pub uetr: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub debtor_account: String,
    pub creditor_account: String,
    pub payment_purpose: PaymentPurpose,
    pub settlement_method: SettlementMethod,
    pub status: PaymentStatus,
    pub idempotency_key: Uuid,
}

/// Result of an idempotency-guarded insert.
pub enum InsertOutcome {
    /// The row was created by this call.
    Created(Payment),
    /// Another request with the same idempotency key already created a row.
    Duplicate(Payment),
}

/// Result of a cancellation attempt.
pub enum CancelOutcome {
    Cancelled(Payment),
    /// The payment exists but has settled; the gate rejected the transition.
    NotCancellable(PaymentStatus),
    NotFound,
}

pub struct PaymentRepository {
    pool: PgPool,
}

impl PaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts the payment, deferring to any existing row carrying the same
    /// idempotency key (defense-in-depth under the unique index).
    pub async fn insert(&self, payment: &NewPayment) -> Result<InsertOutcome, sqlx::Error> {
        let inserted = sqlx::query_as::<_, Payment>(&format!(
            "INSERT INTO payments (transaction_id, uetr, amount, currency, debtor_account, \
             creditor_account, payment_purpose, settlement_method, status, idempotency_key) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (idempotency_key) DO NOTHING \
             RETURNING {PAYMENT_COLUMNS}"
        ))
        .bind(payment.transaction_id)
        .bind(payment.uetr)
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(&payment.debtor_account)
        .bind(&payment.creditor_account)
        .bind(payment.payment_purpose.as_str())
        .bind(payment.settlement_method.as_str())
        .bind(payment.status.as_str())
        .bind(payment.idempotency_key)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(row) => Ok(InsertOutcome::Created(row)),
            None => {
                let existing = self
                    .find_by_idempotency_key(payment.idempotency_key)
                    .await?
                    .ok_or(sqlx::Error::RowNotFound)?;
                Ok(InsertOutcome::Duplicate(existing))
            }
        }
    }

    pub async fn find_by_id(&self, transaction_id: Uuid) -> Result<Option<Payment>, sqlx::Error> {
        sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE transaction_id = $1"
        ))
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn find_by_idempotency_key(
        &self,
        idempotency_key: Uuid,
    ) -> Result<Option<Payment>, sqlx::Error> {
        sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE idempotency_key = $1"
        ))
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
    }

    /// Cancels in a single conditional update so the gate check and the
    /// transition are atomic (no settle-between-check-and-write window).
    /// The blocked-status set is the `PaymentStatus::can_cancel` gate.
    pub async fn cancel(&self, transaction_id: Uuid) -> Result<CancelOutcome, sqlx::Error> {
        let blocked: Vec<String> = PaymentStatus::ALL
            .iter()
            .filter(|status| !status.can_cancel())
            .map(|status| status.as_str().to_string())
            .collect();

        let cancelled = sqlx::query_as::<_, Payment>(&format!(
            "UPDATE payments \
             SET status = 'CANCELLED', updated_at = now() \
             WHERE transaction_id = $1 AND status <> ALL($2) \
             RETURNING {PAYMENT_COLUMNS}"
        ))
        .bind(transaction_id)
        .bind(&blocked)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = cancelled {
            return Ok(CancelOutcome::Cancelled(row));
        }
        match self.find_by_id(transaction_id).await? {
            Some(row) => Ok(CancelOutcome::NotCancellable(row.status)),
            None => Ok(CancelOutcome::NotFound),
        }
    }

    /// Number of payments this debtor originated in the trailing 24 hours.
    pub async fn debtor_count_last_24h(&self, debtor_account: &str) -> Result<i64, sqlx::Error> {
        let since = Utc::now() - Duration::hours(24);
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM payments WHERE debtor_account = $1 AND created_at >= $2",
        )
        .bind(debtor_account)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }
}
