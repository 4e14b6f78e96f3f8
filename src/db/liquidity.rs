use sqlx::PgPool;

use crate::model::Quote;

/// Audit trail for generated quotes. Feeds the risk metrics window.
pub struct QuoteAuditRepository {
    pool: PgPool,
}

impl QuoteAuditRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, quote: &Quote) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO liquidity_quotes \
             (quote_id, from_currency, to_currency, amount, mid_rate, applied_rate, \
              spread, source, latency_ms, utility_score, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (quote_id) DO NOTHING",
        )
        .bind(quote.quote_id)
        .bind(&quote.from_currency)
        .bind(&quote.to_currency)
        .bind(quote.amount)
        .bind(quote.mid_rate)
        .bind(quote.applied_rate)
        .bind(quote.spread)
        .bind(&quote.source)
        .bind(quote.latency_ms as i64)
        .bind(quote.utility_score)
        .bind(quote.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
