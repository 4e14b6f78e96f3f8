use std::env;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    // Server
    pub host: String,
    pub port: u16,

    // Backing services
    pub database_url: String,
    pub redis_url: String,
    pub nats_url: String,

    // Connection pool
    pub db_pool_min: u32,
    pub db_pool_max: u32,

    // Idempotency
    pub idempotency_ttl_secs: u64,

    // Liquidity fan-out
    pub quote_deadline_ms: u64,

    // Settlement tick (0 = disabled, close-batch is endpoint-driven only)
    pub settlement_tick_secs: u64,

    // Logging
    pub log_level: String,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = require_env("DATABASE_URL")?;
        validate_url(&database_url, "DATABASE_URL", &["postgres://", "postgresql://"])?;
        let redis_url = require_env("REDIS_URL")?;
        validate_url(&redis_url, "REDIS_URL", &["redis://", "rediss://"])?;
        let nats_url = require_env("NATS_URL")?;
        validate_url(&nats_url, "NATS_URL", &["nats://", "tls://"])?;

        let db_pool_min: u32 = parse_env_or("DB_POOL_MIN", 5)?;
        let db_pool_max: u32 = parse_env_or("DB_POOL_MAX", 20)?;
        if db_pool_max == 0 || db_pool_min > db_pool_max {
            return Err(ConfigError::Invalid(
                "DB_POOL_MAX".into(),
                "must be > 0 and >= DB_POOL_MIN".into(),
            ));
        }

        let idempotency_ttl_secs: u64 = parse_env_or("IDEMPOTENCY_TTL_SECS", 3600)?;
        if idempotency_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "IDEMPOTENCY_TTL_SECS".into(),
                "must be > 0".into(),
            ));
        }
        let quote_deadline_ms: u64 = parse_env_or("QUOTE_DEADLINE_MS", 120)?;
        if quote_deadline_ms == 0 {
            return Err(ConfigError::Invalid(
                "QUOTE_DEADLINE_MS".into(),
                "must be > 0".into(),
            ));
        }
        let settlement_tick_secs: u64 = parse_env_or("SETTLEMENT_TICK_SECS", 0)?;

        Ok(Self {
            host: env::var("GATEWAY_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env::var("GATEWAY_PORT")
                .unwrap_or_else(|_| "8000".into())
                .parse()
                .map_err(|_| {
                    ConfigError::Invalid("GATEWAY_PORT".into(), "must be a valid port number".into())
                })?,
            database_url,
            redis_url,
            nats_url,
            db_pool_min,
            db_pool_max,
            idempotency_ttl_secs,
            quote_deadline_ms,
            settlement_tick_secs,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
        })
    }
}

fn require_env(name: &str) -> Result<String, ConfigError> {
    env::var(name)
        .map_err(|_| ConfigError::Missing(name.into()))
        .and_then(|v| {
            if v.is_empty() {
                Err(ConfigError::Missing(name.into()))
            } else {
                Ok(v)
            }
        })
}

fn parse_env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(v) if !v.is_empty() => v
            .parse()
            .map_err(|_| ConfigError::Invalid(name.into(), format!("could not parse '{v}'"))),
        _ => Ok(default),
    }
}

fn validate_url(url: &str, name: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let lower = url.to_lowercase();
    if schemes.iter().any(|s| lower.starts_with(s)) {
        return Ok(());
    }
    Err(ConfigError::Invalid(
        name.into(),
        format!("must start with one of: {}", schemes.join(", ")),
    ))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env var: {0}")]
    Missing(String),
    #[error("invalid env var {0}: {1}")]
    Invalid(String, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_scheme_validation() {
        assert!(validate_url("postgres://x/y", "DATABASE_URL", &["postgres://", "postgresql://"]).is_ok());
        assert!(validate_url("mysql://x/y", "DATABASE_URL", &["postgres://", "postgresql://"]).is_err());
        assert!(validate_url("nats://localhost:4222", "NATS_URL", &["nats://", "tls://"]).is_ok());
    }
}
