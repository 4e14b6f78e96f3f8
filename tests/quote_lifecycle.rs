//! Liquidity coordinator behavior over the in-memory KV and recording bus:
//! fan-out under the deadline, best-quote selection, response caching, and
//! single-use execution semantics.

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use rail_gateway::error::ErrorCode;
use rail_gateway::events::{EventBus, MemoryBus, LIQUIDITY_QUOTE_EXECUTED, LIQUIDITY_QUOTE_GENERATED};
use rail_gateway::ids;
use rail_gateway::kv::{KeyValue, MemoryKv};
use rail_gateway::liquidity::{LiquidityCoordinator, QuoteRequest, Quote};

fn coordinator(deadline_ms: u64) -> (LiquidityCoordinator, Arc<MemoryKv>, Arc<MemoryBus>) {
    let kv = Arc::new(MemoryKv::new());
    let bus = Arc::new(MemoryBus::new());
    let coordinator = LiquidityCoordinator::new(
        Arc::clone(&kv) as Arc<dyn KeyValue>,
        Arc::clone(&bus) as Arc<dyn EventBus>,
        None,
        deadline_ms,
    );
    (coordinator, kv, bus)
}

fn request(from: &str, to: &str, max_sources: usize) -> QuoteRequest {
    QuoteRequest {
        from_currency: from.to_string(),
        to_currency: to.to_string(),
        amount: Decimal::from(1000),
        settlement_method: "PVP".to_string(),
        max_sources,
    }
}

#[tokio::test]
async fn test_fan_out_selects_best_by_utility() {
    let (coordinator, _, bus) = coordinator(400);

    let response = coordinator.get_quotes(request("USD", "EUR", 5)).await.unwrap();

    // Treasury Desk (50ms), P2P Network (120ms) and Market Maker (30ms)
    // support USD/EUR; Investment Fund does not.
    assert_eq!(response.quotes.len(), 3);
    let best = response.best_quote.as_ref().unwrap();
    let max_utility = response
        .quotes
        .iter()
        .map(|q| q.utility_score)
        .fold(f64::MIN, f64::max);
    assert_eq!(best.utility_score, max_utility);

    assert_eq!(bus.count_for(LIQUIDITY_QUOTE_GENERATED), 1);
}

#[tokio::test]
async fn test_deadline_abandons_slow_providers() {
    // 90ms budget: Market Maker (30ms) and Treasury Desk (50ms) answer,
    // P2P Network (120ms) is abandoned.
    let (coordinator, _, _) = coordinator(90);

    let response = coordinator.get_quotes(request("USD", "EUR", 5)).await.unwrap();
    let sources: Vec<&str> = response.quotes.iter().map(|q| q.source.as_str()).collect();
    assert_eq!(response.quotes.len(), 2, "sources: {sources:?}");
    assert!(!sources.contains(&"P2P Network"));
}

#[tokio::test]
async fn test_all_providers_timing_out_is_bad_gateway() {
    let (coordinator, _, _) = coordinator(1);

    let started = Instant::now();
    let err = coordinator.get_quotes(request("USD", "EUR", 5)).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ExternalServiceError);
    // The deadline bounds the wall clock; nothing waited for the stubs.
    assert!(started.elapsed().as_millis() < 1000);
}

#[tokio::test]
async fn test_unsupported_pair_is_bad_gateway() {
    let (coordinator, _, _) = coordinator(400);
    let err = coordinator.get_quotes(request("CHF", "AED", 5)).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ExternalServiceError);
}

#[tokio::test]
async fn test_same_currency_rejected() {
    let (coordinator, _, _) = coordinator(400);
    let err = coordinator.get_quotes(request("USD", "USD", 3)).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ValidationError);
}

#[tokio::test]
async fn test_max_sources_bounds() {
    let (coordinator, _, _) = coordinator(400);
    for bad in [0usize, 6] {
        let err = coordinator.get_quotes(request("USD", "EUR", bad)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);
    }

    let response = coordinator.get_quotes(request("USD", "EUR", 1)).await.unwrap();
    assert_eq!(response.quotes.len(), 1);
}

#[tokio::test]
async fn test_response_cached_with_fresh_request_id() {
    let (coordinator, _, bus) = coordinator(400);

    let first = coordinator.get_quotes(request("USD", "EUR", 5)).await.unwrap();
    let second = coordinator.get_quotes(request("USD", "EUR", 5)).await.unwrap();

    // Same quotes, new request id, no second fan-out.
    let first_ids: Vec<Uuid> = first.quotes.iter().map(|q| q.quote_id).collect();
    let second_ids: Vec<Uuid> = second.quotes.iter().map(|q| q.quote_id).collect();
    assert_eq!(first_ids, second_ids);
    assert_ne!(first.request_id, second.request_id);
    assert_eq!(bus.count_for(LIQUIDITY_QUOTE_GENERATED), 1);
}

#[tokio::test]
async fn test_execute_is_single_use() {
    let (coordinator, _, bus) = coordinator(400);

    let response = coordinator.get_quotes(request("USD", "EUR", 5)).await.unwrap();
    let quote_id = response.best_quote.unwrap().quote_id;

    let execution = coordinator.execute(quote_id).await.unwrap();
    assert_eq!(execution.status, "EXECUTED");
    assert_eq!(execution.quote_id, quote_id);
    assert_eq!(bus.count_for(LIQUIDITY_QUOTE_EXECUTED), 1);

    // The handle is consumed: a second execution finds nothing.
    let err = coordinator.execute(quote_id).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NotFound);
    assert_eq!(bus.count_for(LIQUIDITY_QUOTE_EXECUTED), 1);
}

#[tokio::test]
async fn test_expired_quote_is_gone() {
    let (coordinator, kv, _) = coordinator(400);

    // A quote whose wall-clock expiry has passed but whose KV entry is
    // still present.
    let quote = Quote {
        quote_id: ids::new_v7(),
        from_currency: "USD".into(),
        to_currency: "EUR".into(),
        amount: Decimal::from(1000),
        mid_rate: 0.85,
        applied_rate: 0.8483,
        spread: 0.002,
        source: "Treasury Desk".into(),
        latency_ms: 50,
        ttl_seconds: 30,
        expires_at: Utc::now() - Duration::seconds(1),
        utility_score: 0.9,
    };
    kv.set_ex(
        &format!("quote:{}", quote.quote_id),
        &serde_json::to_string(&quote).unwrap(),
        60,
    )
    .await
    .unwrap();

    let err = coordinator.execute(quote.quote_id).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::PaymentExpired);
}

#[tokio::test]
async fn test_unknown_quote_not_found() {
    let (coordinator, _, _) = coordinator(400);
    let err = coordinator.execute(ids::new_v7()).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NotFound);
}
