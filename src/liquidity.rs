use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::liquidity::QuoteAuditRepository;
use crate::error::{ApiError, ErrorCode};
use crate::events::{self, EventBus};
use crate::ids;
use crate::kv::KeyValue;
pub use crate::model::Quote;

const QUOTE_TTL_SECS: u64 = 30;
const RESPONSE_CACHE_TTL_SECS: u64 = 30;
pub const MAX_SOURCES_CEILING: usize = 5;

// ---------------------------------------------------------------------------
// Provider stubs
// ---------------------------------------------------------------------------

/// A simulated liquidity provider. Deterministic apart from the spread and
/// utility perturbations.
pub struct Provider {
    pub id: &'static str,
    pub name: &'static str,
    pub currencies: &'static [&'static str],
    pub base_spread: f64,
    pub latency_ms: u64,
    pub utility_score: f64,
}

pub static PROVIDERS: [Provider; 4] = [
    Provider {
        id: "treasury",
        name: "Treasury Desk",
        currencies: &["USD", "EUR", "GBP", "JPY", "CHF"],
        base_spread: 0.002,
        latency_ms: 50,
        utility_score: 0.9,
    },
    Provider {
        id: "fund",
        name: "Investment Fund",
        currencies: &["USD", "AED", "INR", "SGD", "HKD"],
        base_spread: 0.003,
        latency_ms: 80,
        utility_score: 0.8,
    },
    Provider {
        id: "p2p",
        name: "P2P Network",
        currencies: &["USD", "EUR", "AED", "INR"],
        base_spread: 0.001,
        latency_ms: 120,
        utility_score: 0.7,
    },
    Provider {
        id: "mm",
        name: "Market Maker",
        currencies: &["USD", "EUR", "GBP", "JPY", "AED", "INR"],
        base_spread: 0.0015,
        latency_ms: 30,
        utility_score: 0.95,
    },
];

const STATIC_RATES: [((&str, &str), f64); 13] = [
    (("USD", "EUR"), 0.85),
    (("USD", "GBP"), 0.75),
    (("USD", "JPY"), 110.0),
    (("USD", "AED"), 3.67),
    (("USD", "INR"), 83.0),
    (("AED", "INR"), 22.6),
    (("EUR", "GBP"), 0.88),
    (("EUR", "USD"), 1.18),
    (("GBP", "USD"), 1.33),
    (("JPY", "USD"), 0.009),
    (("AED", "USD"), 0.27),
    (("INR", "USD"), 0.012),
    (("INR", "AED"), 0.044),
];

/// Static mid-rate, the reverse pair's reciprocal, or `None` (caller
/// synthesizes).
pub fn static_mid_rate(from: &str, to: &str) -> Option<f64> {
    if let Some((_, rate)) = STATIC_RATES.iter().find(|((f, t), _)| *f == from && *t == to) {
        return Some(*rate);
    }
    STATIC_RATES
        .iter()
        .find(|((f, t), _)| *f == to && *t == from)
        .map(|(_, rate)| 1.0 / rate)
}

/// Builds the provider's quote for the pair: rate lookup or synthesis,
/// spread and utility perturbations, 30 s expiry.
fn build_quote(provider: &Provider, from: &str, to: &str, amount: Decimal) -> Quote {
    let mut rng = rand::thread_rng();

    let mid_rate = static_mid_rate(from, to).unwrap_or_else(|| rng.gen_range(0.5..2.0));
    let spread = provider.base_spread * (1.0 + rng.gen_range(-0.2..0.2));
    let applied_rate = mid_rate * (1.0 - spread);
    let utility_score = provider.utility_score * rng.gen_range(0.9..1.1);

    Quote {
        quote_id: ids::new_v7(),
        from_currency: from.to_string(),
        to_currency: to.to_string(),
        amount,
        mid_rate,
        applied_rate,
        spread,
        source: provider.name.to_string(),
        latency_ms: provider.latency_ms,
        ttl_seconds: QUOTE_TTL_SECS,
        expires_at: Utc::now() + ChronoDuration::seconds(QUOTE_TTL_SECS as i64),
        utility_score,
    }
}

// ---------------------------------------------------------------------------
// Request/response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct QuoteRequest {
    pub from_currency: String,
    pub to_currency: String,
    pub amount: Decimal,
    pub settlement_method: String,
    pub max_sources: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteResponse {
    pub quotes: Vec<Quote>,
    pub best_quote: Option<Quote>,
    pub request_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub sla_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub quote_id: Uuid,
    pub executed_rate: f64,
    pub executed_at: DateTime<Utc>,
    pub status: &'static str,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct LiquidityCoordinator {
    kv: Arc<dyn KeyValue>,
    bus: Arc<dyn EventBus>,
    /// Absent in tests that run without a database.
    audit: Option<QuoteAuditRepository>,
    deadline: Duration,
}

impl LiquidityCoordinator {
    pub fn new(
        kv: Arc<dyn KeyValue>,
        bus: Arc<dyn EventBus>,
        audit: Option<QuoteAuditRepository>,
        deadline_ms: u64,
    ) -> Self {
        Self {
            kv,
            bus,
            audit,
            deadline: Duration::from_millis(deadline_ms),
        }
    }

    /// Fans out to up to `max_sources` providers in parallel under the
    /// wall-clock deadline; stragglers are aborted, not awaited.
    pub async fn get_quotes(&self, request: QuoteRequest) -> Result<QuoteResponse, ApiError> {
        let started = Instant::now();
        let request_id = ids::new_v7();

        if request.from_currency == request.to_currency {
            return Err(ApiError::validation(
                "to_currency",
                "From and to currencies cannot be the same",
            ));
        }
        if request.amount <= Decimal::ZERO {
            return Err(ApiError::validation("amount", "Amount must be positive"));
        }
        if request.max_sources == 0 || request.max_sources > MAX_SOURCES_CEILING {
            return Err(ApiError::validation(
                "max_sources",
                format!("max_sources must be between 1 and {MAX_SOURCES_CEILING}"),
            ));
        }

        let cache_key = format!(
            "liquidity:{}:{}:{}:{}",
            request.from_currency, request.to_currency, request.amount, request.settlement_method
        );
        match self.kv.get(&cache_key).await {
            Ok(Some(cached)) => {
                if let Ok(mut response) = serde_json::from_str::<QuoteResponse>(&cached) {
                    response.request_id = request_id;
                    return Ok(response);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "liquidity cache read failed"),
        }

        let mut set: JoinSet<Quote> = JoinSet::new();
        let mut dispatched = 0usize;
        for provider in PROVIDERS
            .iter()
            .filter(|p| {
                p.currencies.contains(&request.from_currency.as_str())
                    && p.currencies.contains(&request.to_currency.as_str())
            })
            .take(request.max_sources)
        {
            let from = request.from_currency.clone();
            let to = request.to_currency.clone();
            let amount = request.amount;
            let latency = Duration::from_millis(provider.latency_ms);
            dispatched += 1;
            set.spawn(async move {
                tokio::time::sleep(latency).await;
                build_quote(provider, &from, &to, amount)
            });
        }

        let deadline = tokio::time::Instant::now() + self.deadline;
        let mut quotes: Vec<Quote> = Vec::with_capacity(dispatched);
        while let Ok(Some(joined)) = tokio::time::timeout_at(deadline, set.join_next()).await {
            match joined {
                Ok(quote) => quotes.push(quote),
                Err(e) => warn!(error = %e, "provider task failed"),
            }
        }
        // Whoever missed the deadline is abandoned.
        set.abort_all();

        if quotes.is_empty() {
            return Err(ApiError::new(
                ErrorCode::ExternalServiceError,
                "No liquidity providers available",
            )
            .with_details(serde_json::json!({ "service": "liquidity_providers" })));
        }

        for quote in &quotes {
            self.persist_quote(quote).await;
        }

        let best_quote = quotes
            .iter()
            .max_by(|a, b| a.utility_score.total_cmp(&b.utility_score))
            .cloned();

        let sla_ms = started.elapsed().as_millis() as u64;
        let response = QuoteResponse {
            quotes,
            best_quote,
            request_id,
            generated_at: Utc::now(),
            sla_ms,
        };

        if let Ok(json) = serde_json::to_string(&response) {
            if let Err(e) = self.kv.set_ex(&cache_key, &json, RESPONSE_CACHE_TTL_SECS).await {
                warn!(error = %e, "liquidity cache write failed");
            }
        }

        events::publish_event(
            self.bus.as_ref(),
            events::LIQUIDITY_QUOTE_GENERATED,
            serde_json::json!({
                "request_id": request_id,
                "from_currency": request.from_currency,
                "to_currency": request.to_currency,
                "amount": request.amount,
                "quote_count": response.quotes.len(),
                "sla_ms": sla_ms,
            }),
        )
        .await;

        info!(
            request_id = %request_id,
            quote_count = response.quotes.len(),
            sla_ms,
            "liquidity quotes generated"
        );
        Ok(response)
    }

    pub async fn get_quote(&self, quote_id: Uuid) -> Result<Option<Quote>, ApiError> {
        let raw = self
            .kv
            .get(&quote_key(quote_id))
            .await
            .map_err(|e| ApiError::external_service("cache", e.to_string()))?;
        match raw {
            Some(json) => {
                let quote = serde_json::from_str(&json)
                    .map_err(|e| ApiError::internal(format!("corrupt quote record: {e}")))?;
                Ok(Some(quote))
            }
            None => Ok(None),
        }
    }

    /// Single-use execution: the atomic get-and-delete guarantees at most
    /// one caller observes the quote.
    pub async fn execute(&self, quote_id: Uuid) -> Result<ExecutionResult, ApiError> {
        let raw = self
            .kv
            .get_del(&quote_key(quote_id))
            .await
            .map_err(|e| ApiError::external_service("cache", e.to_string()))?
            .ok_or_else(|| ApiError::not_found("Quote not found or expired"))?;

        let quote: Quote = serde_json::from_str(&raw)
            .map_err(|e| ApiError::internal(format!("corrupt quote record: {e}")))?;

        if Utc::now() > quote.expires_at {
            return Err(ApiError::new(ErrorCode::PaymentExpired, "Quote has expired"));
        }

        let result = ExecutionResult {
            execution_id: ids::new_v7(),
            quote_id,
            executed_rate: quote.applied_rate,
            executed_at: Utc::now(),
            status: "EXECUTED",
        };

        events::publish_event(
            self.bus.as_ref(),
            events::LIQUIDITY_QUOTE_EXECUTED,
            serde_json::json!({
                "execution_id": result.execution_id,
                "quote_id": quote_id,
                "executed_rate": result.executed_rate,
                "executed_at": result.executed_at.to_rfc3339(),
                "status": result.status,
            }),
        )
        .await;

        info!(quote_id = %quote_id, "quote executed");
        Ok(result)
    }

    /// KV for the execution handle, audit table for the metrics window.
    /// Both best-effort: a returned quote is still a quote.
    async fn persist_quote(&self, quote: &Quote) {
        match serde_json::to_string(quote) {
            Ok(json) => {
                if let Err(e) = self
                    .kv
                    .set_ex(&quote_key(quote.quote_id), &json, quote.ttl_seconds)
                    .await
                {
                    warn!(quote_id = %quote.quote_id, error = %e, "quote cache write failed");
                }
            }
            Err(e) => warn!(error = %e, "quote serialization failed"),
        }
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.record(quote).await {
                warn!(quote_id = %quote.quote_id, error = %e, "quote audit write failed");
            }
        }
    }
}

fn quote_key(quote_id: Uuid) -> String {
    format!("quote:{quote_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_rate_lookup_and_reverse() {
        assert_eq!(static_mid_rate("USD", "EUR"), Some(0.85));
        // EUR/USD is listed explicitly and wins over the reciprocal.
        assert_eq!(static_mid_rate("EUR", "USD"), Some(1.18));
        // GBP/EUR is only reachable through the reverse pair.
        let derived = static_mid_rate("GBP", "EUR").unwrap();
        assert!((derived - 1.0 / 0.88).abs() < 1e-9);
        // Listed in neither direction.
        assert_eq!(static_mid_rate("GBP", "JPY"), None);
        assert_eq!(static_mid_rate("CHF", "USD"), None);
    }

    #[test]
    fn test_quote_math_bounds() {
        let provider = &PROVIDERS[0]; // Treasury Desk
        for _ in 0..50 {
            let quote = build_quote(provider, "USD", "EUR", Decimal::from(1000));
            assert_eq!(quote.mid_rate, 0.85);
            // spread = base * (1 ± 0.2)
            assert!(quote.spread >= provider.base_spread * 0.8);
            assert!(quote.spread <= provider.base_spread * 1.2);
            assert!((quote.applied_rate - quote.mid_rate * (1.0 - quote.spread)).abs() < 1e-12);
            // utility = nominal * (0.9..1.1)
            assert!(quote.utility_score >= provider.utility_score * 0.9);
            assert!(quote.utility_score <= provider.utility_score * 1.1);
            assert_eq!(quote.ttl_seconds, QUOTE_TTL_SECS);
            assert_eq!(quote.quote_id.get_version_num(), 7);
        }
    }

    #[test]
    fn test_synthesized_rate_in_range() {
        let provider = &PROVIDERS[3]; // Market Maker quotes GBP/JPY
        for _ in 0..50 {
            let quote = build_quote(provider, "GBP", "JPY", Decimal::from(10));
            assert!(quote.mid_rate >= 0.5 && quote.mid_rate < 2.0);
        }
    }

    #[test]
    fn test_provider_eligibility() {
        let eligible: Vec<&str> = PROVIDERS
            .iter()
            .filter(|p| p.currencies.contains(&"AED") && p.currencies.contains(&"INR"))
            .map(|p| p.id)
            .collect();
        assert_eq!(eligible, vec!["fund", "p2p", "mm"]);
    }
}
