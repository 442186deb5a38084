//! Learning Sync Server
//!
//! Lets several devices edit one user's learning data and reconcile it
//! through a versioned change log.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use learning_sync_server::config::Config;
use learning_sync_server::db::{self, SqliteStore};
use learning_sync_server::routes;
use learning_sync_server::state::AppState;
use learning_sync_server::sync::UserLocks;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "learning_sync_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env();

    tracing::info!("Starting Learning Sync Server v{}", env!("CARGO_PKG_VERSION"));

    // Initialize database
    let db_pool = db::create_pool(&config.database)
        .await
        .context("Failed to initialize database")?;
    tracing::info!("Database initialized at {}", config.database.url);

    let store = Arc::new(SqliteStore::new(
        db_pool.clone(),
        UserLocks::new(config.sync.lock_timeout()),
    ));
    let app_state = AppState::new(config.clone(), store);

    // Background reconciliation
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler_task = config.sync.reconcile_interval().map(|period| {
        app_state
            .reconciler()
            .clone()
            .spawn_periodic(period, shutdown_rx)
    });
    if reconciler_task.is_none() {
        tracing::info!("Background reconciliation disabled");
    }

    let app = routes::app(app_state);

    // Start server with graceful shutdown
    let ip = config
        .server
        .host
        .parse()
        .with_context(|| format!("Invalid SERVER_HOST {}", config.server.host))?;
    let addr = SocketAddr::new(ip, config.server.port);
    tracing::info!("Learning Sync Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Stop the reconciler before closing the pool
    shutdown_tx.send(true).ok();
    if let Some(task) = reconciler_task {
        if let Err(e) = task.await {
            tracing::warn!("Reconciler task ended abnormally: {}", e);
        }
    }
    db_pool.close().await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
