//! Stitch Server
//!
//! Chunked, resumable upload server with verified merge and stale-session
//! cleanup.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stitch_server::config::{Config, RegistryBackend};
use stitch_server::db;
use stitch_server::routes;
use stitch_server::state::AppState;
use stitch_server::upload::{
    LocalBlobStore, MemoryRegistry, SessionRegistry, SqliteRegistry, UploadService,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stitch_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env().context("invalid configuration")?;

    tracing::info!("Starting Stitch Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Storage root: {}", config.storage.root);

    let store = Arc::new(
        LocalBlobStore::new(&config.storage.root).context("failed to open storage root")?,
    );

    let registry: Arc<dyn SessionRegistry> = match config.registry.backend {
        RegistryBackend::Sqlite => {
            let pool = db::create_pool(&config.registry.database_url)
                .await
                .context("failed to initialize database")?;
            tracing::info!("Database initialized at {}", config.registry.database_url);
            Arc::new(SqliteRegistry::new(pool))
        }
        RegistryBackend::Memory => {
            tracing::warn!("Using in-memory session registry, sessions are lost on restart");
            Arc::new(MemoryRegistry::new())
        }
    };

    let uploads = UploadService::new(registry, store, config.upload.settings());

    // Start background sweeper
    let sweeper = uploads
        .sweeper()
        .clone()
        .start(config.upload.sweep_interval(), config.upload.session_ttl());
    tracing::info!(
        interval_secs = config.upload.sweep_interval_secs,
        ttl_secs = config.upload.session_ttl_secs,
        retention = %config.upload.retention,
        "Cleanup sweeper started"
    );

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let app = routes::app(AppState::new(config, uploads));

    // Start server with graceful shutdown
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("Stitch Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    sweeper.abort();
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
                tracing::error!("Failed to install signal handler: {}", e);
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
