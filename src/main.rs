use anyhow::{Context, Result};
use axum::{Router, middleware, routing::get};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;

use spamgate::{
    BatchScanner, ConfigReloader, GateDecisionEngine, HttpReputationClient, PeriodicScan,
    ReputationCache, SettingsHandle, SpamGateConfig,
    api::{GateApiState, body_size_middleware, create_gate_router, security_headers_middleware},
    config::sanitize_for_logging,
    database::DatabasePool,
    scan::{AccountStore, CursorStore, InMemoryAccountStore, InMemoryCursorStore},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first - rejects anything invalid before we bind
    let config = SpamGateConfig::from_env().map_err(|e| {
        eprintln!("Configuration error: {}", e);
        eprintln!("Please check SPAMGATE_* environment variables.");
        e
    })?;

    init_logging(&config)?;

    info!("Starting SpamGate server");
    info!(
        email = config.criteria.email,
        username = config.criteria.username,
        ip = config.criteria.ip,
        delay_secs = config.registration.delay_secs,
        protect = config.registration.protect,
        "Spam criteria loaded"
    );
    match config.remote.api_key.as_deref() {
        Some(key) => info!("Reputation API key: {}", sanitize_for_logging(key)),
        None => info!("No reputation API key configured, spam reporting unavailable"),
    }

    let settings = Arc::new(SettingsHandle::load(config.clone()).context("Invalid settings")?);
    let snapshot = settings.current();

    let client = Arc::new(
        HttpReputationClient::new(snapshot.settings.client.clone())
            .context("Failed to create reputation client")?,
    );
    let cache = Arc::new(ReputationCache::new(snapshot.settings.cache.clone()));
    let engine = Arc::new(GateDecisionEngine::new(client, cache.clone()));

    let (accounts, cursors) = open_stores(&config).await?;
    let scanner = Arc::new(BatchScanner::new(
        engine.clone(),
        accounts.clone(),
        cursors,
        settings.clone(),
    ));
    let reloader = Arc::new(ConfigReloader::http(settings.clone(), engine.clone()));

    let shutdown = CancellationToken::new();

    // The ticker runs whenever an interval is set, so a reload can raise the user limit
    if config.scan.interval_secs > 0 {
        PeriodicScan::new(scanner.clone(), Duration::from_secs(config.scan.interval_secs))
            .spawn(shutdown.child_token());
    }
    if config.scan.user_limit > 0 {
        info!(
            per_run = config.scan.user_limit,
            interval_secs = config.scan.interval_secs,
            action = %config.scan.action,
            "Account scanning enabled"
        );
    } else {
        info!("Account scanning disabled (SPAMGATE_CRON_USER_LIMIT is 0)");
    }

    spawn_cache_janitor(cache, config.cache.ttl_secs, shutdown.child_token());

    let app = Router::new()
        .merge(create_gate_router(GateApiState {
            engine,
            scanner,
            settings,
            reloader,
            accounts,
            shutdown: shutdown.clone(),
        }))
        .route("/health", get(|| async { "OK" }))
        .layer(middleware::from_fn(body_size_middleware))
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(TraceLayer::new_for_http());

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", bind_addr, e))?;

    info!("SpamGate listening on {}", bind_addr);
    if config.server.admin_api_key.is_none() {
        warn!("SPAMGATE_ADMIN_API_KEY not set, admin scan routes are disabled");
    }

    // Serve with connect info for client IP extraction
    let signal = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("Could not install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
        info!("Shutdown requested");
        signal.cancel();
    })
    .await?;

    Ok(())
}

/// `SPAMGATE_LOG` takes tracing directives (`spamgate=debug,sqlx=warn`); without it the
/// configured level applies to everything
fn init_logging(config: &SpamGateConfig) -> Result<()> {
    let log_level = match config.logging.level.to_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" => Level::WARN,
        "info" => Level::INFO,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    };
    let filter = EnvFilter::try_from_env("SPAMGATE_LOG")
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string().to_lowercase()));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set logging subscriber: {}", e))?;

    Ok(())
}

/// Postgres-backed stores, or in-memory ones when Postgres is disabled
async fn open_stores(
    config: &SpamGateConfig,
) -> Result<(Arc<dyn AccountStore>, Arc<dyn CursorStore>)> {
    if !config.database.postgres_enabled {
        warn!("PostgreSQL disabled, scan cursor will not survive restarts");
        let accounts: Arc<dyn AccountStore> = Arc::new(InMemoryAccountStore::new());
        let cursors: Arc<dyn CursorStore> = Arc::new(InMemoryCursorStore::new());
        return Ok((accounts, cursors));
    }

    let db = DatabasePool::new(
        &config.database.postgres_url,
        config.database.max_connections,
    )
    .await?;
    db.init_schema().await?;

    let accounts: Arc<dyn AccountStore> = db.accounts();
    let cursors: Arc<dyn CursorStore> = db.cursor();
    Ok((accounts, cursors))
}

/// Drop expired cache entries once per TTL
fn spawn_cache_janitor(cache: Arc<ReputationCache>, ttl_secs: u64, cancel: CancellationToken) {
    let period = Duration::from_secs(ttl_secs.max(60));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let purged = cache.purge_expired().await;
                    if purged > 0 {
                        tracing::debug!(purged, "Purged expired reputation entries");
                    }
                }
            }
        }
    });
}
