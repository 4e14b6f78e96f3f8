use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use rail_gateway::config::GatewayConfig;
use rail_gateway::db;
use rail_gateway::db::liquidity::QuoteAuditRepository;
use rail_gateway::db::payments::PaymentRepository;
use rail_gateway::db::reports::ReportsRepository;
use rail_gateway::db::risk::RiskRepository;
use rail_gateway::db::settlement::SettlementRepository;
use rail_gateway::events::{EventBus, NatsBus};
use rail_gateway::kv::{KeyValue, RedisKv};
use rail_gateway::liquidity::LiquidityCoordinator;
use rail_gateway::reports::Reporting;
use rail_gateway::risk::RiskController;
use rail_gateway::routes::{self, AppState};
use rail_gateway::settlement::SettlementEngine;

#[tokio::main]
async fn main() {
    // Initialize tracing (env-filter: RUST_LOG=rail_gateway=debug,info)
    let default_filter = format!(
        "rail_gateway={},tower_http=info",
        std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into())
    );
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    // Load and validate config
    let config = match GatewayConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[rail-gateway] configuration error: {e}");
            std::process::exit(1);
        }
    };

    info!(
        host = %config.host,
        port = config.port,
        db_pool_max = config.db_pool_max,
        quote_deadline_ms = config.quote_deadline_ms,
        settlement_tick_secs = config.settlement_tick_secs,
        "starting rail-gateway"
    );

    // Durable store (runs migrations)
    let pool = match db::connect(&config).await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("[rail-gateway] database connection failed: {e}");
            std::process::exit(1);
        }
    };

    // KV store
    let kv: Arc<dyn KeyValue> = match RedisKv::new(&config.redis_url) {
        Ok(kv) => Arc::new(kv),
        Err(e) => {
            eprintln!("[rail-gateway] redis client failed: {e}");
            std::process::exit(1);
        }
    };

    // Event bus + stream bootstrap
    let nats = match NatsBus::connect(&config.nats_url).await {
        Ok(bus) => Arc::new(bus),
        Err(e) => {
            eprintln!("[rail-gateway] nats connection failed: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = nats.ensure_streams().await {
        // Publishing still works against pre-provisioned streams.
        warn!(error = %e, "stream bootstrap failed");
    }
    let bus: Arc<dyn EventBus> = nats.clone();

    // Components
    let payments = Arc::new(PaymentRepository::new(pool.clone()));
    let risk = RiskController::new(
        RiskRepository::new(pool.clone()),
        Arc::clone(&payments),
        Arc::clone(&kv),
        Arc::clone(&bus),
    );
    let settlement = Arc::new(SettlementEngine::new(
        SettlementRepository::new(pool.clone()),
        Arc::clone(&bus),
    ));
    let liquidity = LiquidityCoordinator::new(
        Arc::clone(&kv),
        Arc::clone(&bus),
        Some(QuoteAuditRepository::new(pool.clone())),
        config.quote_deadline_ms,
    );
    let reports = Reporting::new(ReportsRepository::new(pool.clone()), Arc::clone(&bus));

    if config.settlement_tick_secs > 0 {
        settlement.spawn_tick_loop(config.settlement_tick_secs);
        info!(tick_secs = config.settlement_tick_secs, "settlement tick enabled");
    }

    let state = Arc::new(AppState {
        config: config.clone(),
        pool,
        kv,
        bus,
        payments,
        risk,
        settlement,
        liquidity,
        reports,
    });

    let app = routes::router(Arc::clone(&state))
        .layer(RequestBodyLimitLayer::new(100 * 1024)) // 100KB
        .layer(TraceLayer::new_for_http());

    // Bind and serve
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .expect("invalid listen address");

    info!(addr = %addr, "rail-gateway listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(nats))
        .await
        .expect("server error");

    info!("rail-gateway shut down");
}

async fn shutdown_signal(nats: Arc<NatsBus>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }

    // Push any buffered publishes out before the connection drops.
    nats.flush().await;
}
