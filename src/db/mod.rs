pub mod liquidity;
pub mod payments;
pub mod reports;
pub mod risk;
pub mod settlement;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::GatewayConfig;

/// Builds the connection pool and applies pending migrations.
pub async fn connect(config: &GatewayConfig) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .min_connections(config.db_pool_min)
        .max_connections(config.db_pool_max)
        .connect(&config.database_url)
        .await?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))?;

    Ok(pool)
}
