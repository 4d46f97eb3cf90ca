//! # Grantflow Server
//!
//! Standalone service exposing the Grantflow ETL engine: an HTTP control
//! surface to start, monitor and cancel tracked runs, plus a WebSocket
//! endpoint streaming execution progress to live subscribers.
//!
//! ## Key Features
//!
//! - **Tracked runs**: seeding and sync runs per (entity, year) pair with a
//!   crash-tolerant execution state machine
//! - **Catalog consistency**: reference tables are validated and refreshed
//!   before any transactional load
//! - **Real-time progress**: execution state changes stream to WebSocket
//!   subscribers, with resync snapshots for late joiners
//! - **Cancellation support**: cooperative cancellation of running
//!   extractions
//!
//! ## Crate Organization
//!
//! - **api/**: HTTP routes and the WebSocket live-update endpoint
//! - **config.rs**: validated server configuration
//! - **error.rs**: HTTP mapping of engine errors
//! - **main.rs**: entry point, wiring and graceful shutdown

use std::{net::SocketAddr, str::FromStr, sync::Arc, time::Duration};

use clap::Parser;
use grantflow_core::broadcast::ProgressBroadcaster;
use grantflow_core::catalog::{CatalogSource, CatalogSyncEngine, CatalogValidator, HttpCatalogSource};
use grantflow_core::extract::{HttpPageFetcher, PageFetcher, RetryPolicy, SourceRegistry};
use grantflow_core::{ExecutionTracker, Orchestrator};
use grantflow_server::{api, ApiContext, Config};
use grantflow_storage::{MemoryStore, Store};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

/// Control-surface server for the Grantflow ETL engine
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Base URL of the upstream subsidy API
    #[arg(long, env = "GRANTFLOW_SOURCE_URL")]
    source_url: Url,

    /// Host address to bind to
    #[arg(long, env = "GRANTFLOW_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(long, env = "GRANTFLOW_PORT", default_value = "3041")]
    port: u16,

    /// PostgreSQL connection string (in-memory storage when omitted)
    #[arg(long, env = "GRANTFLOW_DATABASE_URL")]
    database_url: Option<String>,

    /// Timeout per page request in seconds
    #[arg(long, env = "GRANTFLOW_PAGE_TIMEOUT", default_value = "180")]
    page_timeout: u64,

    /// Attempts per page request before a transient failure escalates
    #[arg(long, env = "GRANTFLOW_RETRY_ATTEMPTS", default_value = "4")]
    retry_attempts: u32,

    /// Logging level (info, debug, trace)
    #[arg(long, env = "GRANTFLOW_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[cfg(feature = "postgres")]
async fn build_store(config: &Config) -> Result<Arc<dyn Store>, grantflow_storage::Error> {
    match &config.database_url {
        Some(database_url) => {
            info!("Connecting to PostgreSQL storage");
            Ok(Arc::new(
                grantflow_storage::PostgresStore::connect(database_url, 10).await?,
            ))
        }
        None => Ok(Arc::new(MemoryStore::new())),
    }
}

#[cfg(not(feature = "postgres"))]
async fn build_store(_config: &Config) -> Result<Arc<dyn Store>, grantflow_storage::Error> {
    Ok(Arc::new(MemoryStore::new()))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = Level::from_str(cli.log_level.to_lowercase().as_str()).unwrap_or(Level::INFO);
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_target(true),
        )
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    info!(
        version = %env!("CARGO_PKG_VERSION"),
        "Starting Grantflow server"
    );

    let config = match Config::try_new(
        cli.source_url,
        cli.database_url,
        cli.page_timeout,
        cli.retry_attempts,
    ) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        source_url = %config.source_base_url,
        page_timeout_secs = config.page_timeout.as_secs(),
        retry_attempts = config.retry_attempts,
        "Configuration validated successfully"
    );

    let store = match build_store(&config).await {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to initialize storage: {}", e);
            std::process::exit(1);
        }
    };

    let tracker = Arc::new(ExecutionTracker::new(store.clone()));

    // executions still marked running belong to a process that no longer
    // exists
    match tracker.reclaim_interrupted().await {
        Ok(reclaimed) if reclaimed > 0 => {
            info!(reclaimed, "Reclaimed orphaned executions from previous run")
        }
        Ok(_) => {}
        Err(e) => {
            error!("Failed to reclaim orphaned executions: {}", e);
            std::process::exit(1);
        }
    }

    let fetcher: Arc<dyn PageFetcher> = match HttpPageFetcher::new(config.page_timeout) {
        Ok(fetcher) => Arc::new(fetcher),
        Err(e) => {
            error!("Failed to build source client: {}", e);
            std::process::exit(1);
        }
    };

    let catalog_source: Arc<dyn CatalogSource> =
        match HttpCatalogSource::new(config.source_base_url.clone(), config.page_timeout) {
            Ok(source) => Arc::new(source),
            Err(e) => {
                error!("Failed to build catalog client: {}", e);
                std::process::exit(1);
            }
        };

    let retry = RetryPolicy {
        max_attempts: config.retry_attempts,
        ..Default::default()
    };

    let catalog_engine = CatalogSyncEngine::new(store.clone(), tracker.clone(), catalog_source);
    let validator = CatalogValidator::new(store.clone());
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        tracker.clone(),
        SourceRegistry::standard(),
        fetcher,
        catalog_engine,
        validator,
        config.source_base_url.clone(),
        retry,
    ));
    let broadcaster = ProgressBroadcaster::new(tracker.clone(), store.clone());

    let context = Arc::new(ApiContext {
        config,
        store,
        tracker,
        orchestrator,
        broadcaster,
    });

    // Create shutdown signal handler
    let shutdown_token = CancellationToken::new();
    let shutdown_token_ = shutdown_token.clone();

    tokio::spawn(async move {
        handle_shutdown_signals(shutdown_token_).await;
    });

    let app = api::router(context);

    let addr: SocketAddr = match format!("{}:{}", cli.host, cli.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Failed to parse socket address: {}", e);
            std::process::exit(1);
        }
    };

    info!(addr = %addr, "Listening for connections");
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to address {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("Server started, press Ctrl+C to stop");
    let server_handle = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_handler(shutdown_token))
        .await;

    match server_handle {
        Ok(_) => info!("Server shut down gracefully"),
        Err(e) => error!(error = %e, "Server error during shutdown"),
    }

    info!("Grantflow server shutdown complete");
}

/// Handler function for shutdown signals
async fn handle_shutdown_signals(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        },
    }

    shutdown_token.cancel();
}

/// Returns a future that resolves when the shutdown signal is received
async fn shutdown_signal_handler(token: CancellationToken) {
    token.cancelled().await;
    info!("Shutdown signal received, starting graceful shutdown");

    // Give in-flight requests some time to complete
    tokio::time::sleep(Duration::from_secs(1)).await;
}
