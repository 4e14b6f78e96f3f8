use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

use crate::ids;

// ---------------------------------------------------------------------------
// Subjects
// ---------------------------------------------------------------------------

pub const PAYMENT_INITIATED: &str = "payment.initiated";
pub const PAYMENT_CANCELLED: &str = "payment.cancelled";
pub const SETTLEMENT_BATCH_CLOSED: &str = "settlement.batch_closed";
pub const RISK_MODE_CHANGED: &str = "risk.mode_changed";
pub const RISK_ASSESSMENT_COMPLETED: &str = "risk.assessment_completed";
pub const LIQUIDITY_QUOTE_GENERATED: &str = "liquidity.quote_generated";
pub const LIQUIDITY_QUOTE_EXECUTED: &str = "liquidity.quote_executed";
pub const REPORTS_PROOF_OF_RESERVES_GENERATED: &str = "reports.proof_of_reserves_generated";

/// Stream retention classes. Payment and liquidity traffic ride the
/// transactions stream; report events ride the audit stream.
const STREAMS: &[(&str, &[&str], u64)] = &[
    ("transactions", &["payment.>", "liquidity.>"], 7),
    ("settlement", &["settlement.>"], 30),
    ("risk", &["risk.>"], 7),
    ("compliance", &["compliance.>"], 90),
    ("notifications", &["notifications.>"], 1),
    ("audit", &["reports.>", "audit.>"], 90),
];

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("event bus error: {0}")]
    Backend(String),
}

/// At-least-once durable pub/sub. Consumers dedupe on the `message_id`
/// carried in every payload.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, subject: &str, payload: serde_json::Value) -> Result<(), BusError>;

    async fn healthy(&self) -> bool;
}

/// Wraps the payload in the standard envelope and publishes fire-and-forget:
/// a failed publish is logged, never surfaced to the caller. The business
/// write has already committed by the time this runs.
pub async fn publish_event(bus: &dyn EventBus, subject: &str, mut payload: serde_json::Value) {
    if let Some(map) = payload.as_object_mut() {
        map.insert("message_id".into(), serde_json::json!(ids::new_v7()));
        map.insert(
            "emitted_at".into(),
            serde_json::json!(chrono::Utc::now().to_rfc3339()),
        );
    }
    if let Err(e) = bus.publish(subject, payload).await {
        warn!(subject, error = %e, "event publish failed");
    }
}

// ---------------------------------------------------------------------------
// NATS implementation
// ---------------------------------------------------------------------------

pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BusError::Backend(e.to_string()))?;
        Ok(Self { client })
    }

    /// Creates or updates the JetStream streams that capture our subjects.
    pub async fn ensure_streams(&self) -> Result<(), BusError> {
        let js = async_nats::jetstream::new(self.client.clone());
        for (name, subjects, retention_days) in STREAMS {
            let config = async_nats::jetstream::stream::Config {
                name: (*name).to_string(),
                subjects: subjects.iter().map(|s| s.to_string()).collect(),
                max_age: Duration::from_secs(retention_days * 24 * 60 * 60),
                ..Default::default()
            };
            js.get_or_create_stream(config)
                .await
                .map_err(|e| BusError::Backend(format!("stream {name}: {e}")))?;
        }
        Ok(())
    }

    pub async fn flush(&self) {
        let _ = self.client.flush().await;
    }
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(&self, subject: &str, payload: serde_json::Value) -> Result<(), BusError> {
        let bytes = serde_json::to_vec(&payload).map_err(|e| BusError::Backend(e.to_string()))?;
        self.client
            .publish(subject.to_string(), bytes.into())
            .await
            .map_err(|e| BusError::Backend(e.to_string()))
    }

    async fn healthy(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }
}

// ---------------------------------------------------------------------------
// Recording implementation (tests)
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryBus {
    published: std::sync::Mutex<Vec<(String, serde_json::Value)>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<(String, serde_json::Value)> {
        self.published.lock().expect("bus lock poisoned").clone()
    }

    pub fn count_for(&self, subject: &str) -> usize {
        self.published()
            .iter()
            .filter(|(s, _)| s == subject)
            .count()
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, subject: &str, payload: serde_json::Value) -> Result<(), BusError> {
        self.published
            .lock()
            .expect("bus lock poisoned")
            .push((subject.to_string(), payload));
        Ok(())
    }

    async fn healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_envelope_has_message_id() {
        let bus = MemoryBus::new();
        publish_event(&bus, PAYMENT_INITIATED, serde_json::json!({"transaction_id": "t-1"})).await;

        let published = bus.published();
        assert_eq!(published.len(), 1);
        let (subject, payload) = &published[0];
        assert_eq!(subject, PAYMENT_INITIATED);
        assert_eq!(payload["transaction_id"], "t-1");
        assert!(payload["message_id"].is_string());
        assert!(payload["emitted_at"].is_string());
    }

    #[tokio::test]
    async fn test_stream_map_covers_all_subjects() {
        for subject in [
            PAYMENT_INITIATED,
            PAYMENT_CANCELLED,
            SETTLEMENT_BATCH_CLOSED,
            RISK_MODE_CHANGED,
            RISK_ASSESSMENT_COMPLETED,
            LIQUIDITY_QUOTE_GENERATED,
            LIQUIDITY_QUOTE_EXECUTED,
            REPORTS_PROOF_OF_RESERVES_GENERATED,
        ] {
            let covered = STREAMS.iter().any(|(_, patterns, _)| {
                patterns
                    .iter()
                    .any(|p| subject.starts_with(p.trim_end_matches('>')))
            });
            assert!(covered, "subject {subject} not captured by any stream");
        }
    }
}
