use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

use crate::db::settlement::{Backlog, SettlementRepository};
use crate::error::{ApiError, ErrorCode};
use crate::events::{self, EventBus};
use crate::model::{
    NetPosition, Payment, SettlementBatch, SettlementInstruction, SettlementWindow,
};

/// Ignore net magnitudes at or below a cent: rounding noise, not an
/// obligation.
const ROUNDING_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// The debit/credit flows of one payment, the only inputs netting needs.
#[derive(Debug, Clone)]
pub struct PaymentLeg {
    pub debtor_account: String,
    pub creditor_account: String,
    pub currency: String,
    pub amount: Decimal,
}

impl From<&Payment> for PaymentLeg {
    fn from(p: &Payment) -> Self {
        Self {
            debtor_account: p.debtor_account.clone(),
            creditor_account: p.creditor_account.clone(),
            currency: p.currency.clone(),
            amount: p.amount,
        }
    }
}

/// Multilateral netting: signed per-(account, currency) sums, debit and
/// credit mirrored per payment, so each currency conserves to zero by
/// construction. Output is sorted by (account, currency) ascending.
pub fn net_positions(legs: &[PaymentLeg]) -> Vec<NetPosition> {
    let mut acc: BTreeMap<(String, String), Decimal> = BTreeMap::new();

    for leg in legs {
        *acc.entry((leg.debtor_account.clone(), leg.currency.clone()))
            .or_insert(Decimal::ZERO) -= leg.amount;
        *acc.entry((leg.creditor_account.clone(), leg.currency.clone()))
            .or_insert(Decimal::ZERO) += leg.amount;
    }

    acc.into_iter()
        .filter(|(_, amount)| amount.abs() > ROUNDING_TOLERANCE)
        .map(|((account, currency), amount)| NetPosition {
            account,
            currency,
            settlement_instruction: if amount < Decimal::ZERO {
                SettlementInstruction::Pay
            } else {
                SettlementInstruction::Receive
            },
            amount: amount.abs(),
        })
        .collect()
}

/// Result of a window close. `batch_id` is `None` for the empty-window
/// sentinel (no batch row was written).
#[derive(Debug, Clone, Serialize)]
pub struct BatchCloseSummary {
    pub batch_id: Option<Uuid>,
    pub window: SettlementWindow,
    pub total_transactions: i64,
    pub total_amount: Decimal,
    pub net_positions: Vec<NetPosition>,
    pub closed_at: DateTime<Utc>,
}

impl BatchCloseSummary {
    pub fn empty(window: SettlementWindow, closed_at: DateTime<Utc>) -> Self {
        Self {
            batch_id: None,
            window,
            total_transactions: 0,
            total_amount: Decimal::ZERO,
            net_positions: Vec::new(),
            closed_at,
        }
    }
}

/// Current settlement overview: unbatched backlog, recent closed batches,
/// and the hypothetical net of the backlog.
pub struct SettlementStatus {
    pub backlog: Backlog,
    pub completed_batches: Vec<SettlementBatch>,
    pub net_positions: Vec<NetPosition>,
}

pub struct SettlementEngine {
    repo: SettlementRepository,
    bus: Arc<dyn EventBus>,
}

impl SettlementEngine {
    pub fn new(repo: SettlementRepository, bus: Arc<dyn EventBus>) -> Self {
        Self { repo, bus }
    }

    /// Closes the window: claims candidates, nets, persists, publishes.
    pub async fn close_window(
        &self,
        window: SettlementWindow,
    ) -> Result<BatchCloseSummary, ApiError> {
        let summary = self.repo.close_batch(window).await.map_err(|e| {
            ApiError::new(ErrorCode::SettlementFailed, format!("batch close failed: {e}"))
        })?;

        match summary.batch_id {
            Some(batch_id) => {
                info!(
                    batch_id = %batch_id,
                    window = window.as_str(),
                    transactions = summary.total_transactions,
                    "settlement batch closed"
                );
                events::publish_event(
                    self.bus.as_ref(),
                    events::SETTLEMENT_BATCH_CLOSED,
                    serde_json::json!({
                        "batch_id": batch_id,
                        "window": window.as_str(),
                        "transaction_count": summary.total_transactions,
                        "total_amount": summary.total_amount,
                        "net_positions": &summary.net_positions,
                    }),
                )
                .await;
            }
            None => info!(window = window.as_str(), "no transactions to settle"),
        }

        Ok(summary)
    }

    pub async fn status(&self) -> Result<SettlementStatus, ApiError> {
        let backlog = self.repo.backlog().await.map_err(settlement_error)?;
        let completed_batches = self.repo.recent_batches(10).await.map_err(settlement_error)?;
        let legs = self.repo.backlog_legs().await.map_err(settlement_error)?;
        Ok(SettlementStatus {
            backlog,
            completed_batches,
            net_positions: net_positions(&legs),
        })
    }

    pub async fn batch_details(
        &self,
        batch_id: Uuid,
    ) -> Result<Option<(SettlementBatch, Vec<Payment>)>, ApiError> {
        let Some(batch) = self.repo.find_batch(batch_id).await.map_err(settlement_error)? else {
            return Ok(None);
        };
        let payments = self
            .repo
            .batch_payments(batch_id)
            .await
            .map_err(settlement_error)?;
        Ok(Some((batch, payments)))
    }

    /// Spawns the periodic intraday close. Runs until the runtime shuts
    /// down; each tick failure is logged and the next tick retries.
    pub fn spawn_tick_loop(self: &Arc<Self>, tick_secs: u64) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(tick_secs));
            // First tick fires immediately; skip it so boot doesn't close.
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = engine.close_window(SettlementWindow::Intraday).await {
                    error!(error = %e, "scheduled settlement tick failed");
                }
            }
        });
    }
}

fn settlement_error(e: sqlx::Error) -> ApiError {
    ApiError::new(ErrorCode::SettlementFailed, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn leg(debtor: &str, creditor: &str, currency: &str, amount: Decimal) -> PaymentLeg {
        PaymentLeg {
            debtor_account: debtor.into(),
            creditor_account: creditor.into(),
            currency: currency.into(),
            amount,
        }
    }

    #[test]
    fn test_three_party_cycle() {
        // A→B 100, B→C 40, C→A 20 in USD.
        let legs = vec![
            leg("A", "B", "USD", dec!(100)),
            leg("B", "C", "USD", dec!(40)),
            leg("C", "A", "USD", dec!(20)),
        ];
        let positions = net_positions(&legs);

        assert_eq!(positions.len(), 3);
        assert_eq!(positions[0].account, "A");
        assert_eq!(positions[0].amount, dec!(80));
        assert_eq!(positions[0].settlement_instruction, SettlementInstruction::Pay);
        assert_eq!(positions[1].account, "B");
        assert_eq!(positions[1].amount, dec!(60));
        assert_eq!(positions[1].settlement_instruction, SettlementInstruction::Receive);
        assert_eq!(positions[2].account, "C");
        assert_eq!(positions[2].amount, dec!(20));
        assert_eq!(positions[2].settlement_instruction, SettlementInstruction::Receive);
    }

    #[test]
    fn test_conservation_per_currency() {
        let legs = vec![
            leg("A", "B", "USD", dec!(123.45)),
            leg("B", "A", "USD", dec!(23.40)),
            leg("C", "A", "USD", dec!(77.01)),
            leg("A", "C", "EUR", dec!(500.00)),
            leg("B", "C", "EUR", dec!(19.99)),
        ];
        let positions = net_positions(&legs);

        for currency in ["USD", "EUR"] {
            let signed_sum: Decimal = positions
                .iter()
                .filter(|p| p.currency == currency)
                .map(|p| match p.settlement_instruction {
                    SettlementInstruction::Pay => -p.amount,
                    SettlementInstruction::Receive => p.amount,
                })
                .sum();
            assert!(
                signed_sum.abs() <= dec!(0.01),
                "{currency} nets to {signed_sum}"
            );
        }
    }

    #[test]
    fn test_flat_positions_dropped() {
        // A→B and B→A of equal size cancel exactly.
        let legs = vec![
            leg("A", "B", "USD", dec!(50)),
            leg("B", "A", "USD", dec!(50)),
        ];
        assert!(net_positions(&legs).is_empty());

        // A residual of exactly one cent is still within tolerance.
        let legs = vec![
            leg("A", "B", "USD", dec!(50.01)),
            leg("B", "A", "USD", dec!(50.00)),
        ];
        assert!(net_positions(&legs).is_empty());

        // Two cents is an obligation.
        let legs = vec![
            leg("A", "B", "USD", dec!(50.02)),
            leg("B", "A", "USD", dec!(50.00)),
        ];
        assert_eq!(net_positions(&legs).len(), 2);
    }

    #[test]
    fn test_currencies_net_independently() {
        let legs = vec![
            leg("A", "B", "USD", dec!(100)),
            leg("B", "A", "AED", dec!(100)),
        ];
        let positions = net_positions(&legs);
        assert_eq!(positions.len(), 4);
        // Sorted by (account, currency).
        assert_eq!(
            positions
                .iter()
                .map(|p| (p.account.as_str(), p.currency.as_str()))
                .collect::<Vec<_>>(),
            vec![("A", "AED"), ("A", "USD"), ("B", "AED"), ("B", "USD")]
        );
    }

    #[test]
    fn test_empty_summary_sentinel() {
        let summary = BatchCloseSummary::empty(SettlementWindow::Eod, Utc::now());
        assert!(summary.batch_id.is_none());
        assert_eq!(summary.total_transactions, 0);
        assert_eq!(summary.total_amount, Decimal::ZERO);
        assert!(summary.net_positions.is_empty());
    }
}
