use secrecy::ExposeSecret;
use std::{net::SocketAddr, sync::Arc};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use coupon_issuance::api::{self, AppState};
use coupon_issuance::config::{Config, StorageBackend};
use coupon_issuance::db;
use coupon_issuance::services::{CouponIssueService, IssuanceTransaction};
use coupon_issuance::store::{InMemoryStore, IssuanceStore, PgIssuanceStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coupon_issuance=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting coupon issuance server...");

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!(
        storage = ?config.storage,
        lock_strategy = ?config.lock_strategy,
        max_attempts = config.retry_policy.max_attempts(),
        "Configuration loaded successfully"
    );

    let store: Arc<dyn IssuanceStore> = match config.storage {
        StorageBackend::Postgres => {
            let database_url = config
                .database_url
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("database_url is not configured"))?;

            let pool = db::create_pool(
                database_url.expose_secret(),
                config.db_max_connections,
                config.db_acquire_timeout,
            )
            .await?;
            tracing::info!("Database pool created");

            db::run_migrations(&pool).await?;
            tracing::info!("Database migrations completed");

            Arc::new(PgIssuanceStore::new(pool))
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory store; issued coupons are lost on restart");
            Arc::new(InMemoryStore::new())
        }
    };

    let transaction = IssuanceTransaction::new(store, config.lock_strategy.ledger());
    let state = AppState::new(CouponIssueService::new(transaction, config.retry_policy));

    let app = api::router(state).layer(TraceLayer::new_for_http());

    let host: std::net::IpAddr = config.host.parse()?;
    let addr = SocketAddr::new(host, config.port);
    tracing::info!("Listening on {}", addr);

    // Start server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    tracing::info!("Shutdown signal received, cleaning up...");
}
