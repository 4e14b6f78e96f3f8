//! Cross-border payment rail gateway: payment ingress with idempotency,
//! multilateral settlement netting, risk mode control and scoring, and
//! liquidity quote fan-out, backed by Postgres, Redis and NATS.

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod ids;
pub mod kv;
pub mod liquidity;
pub mod model;
pub mod reports;
pub mod risk;
pub mod routes;
pub mod settlement;
