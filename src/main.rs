use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::{net::TcpListener, sync::mpsc};
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use routes::AppState;
use services::{
    storage_service::StorageService,
    thumbnail::{Pipeline, ThumbnailTrigger, TransformStage, run_dispatcher},
};

/// Finalize events buffered between the store and the dispatcher. Uploads
/// wait for room once this many are pending.
const EVENT_QUEUE_DEPTH: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;
    tracing::info!("Starting thumbnailer with config: {:?}", cfg);
    if cfg.emulator {
        tracing::warn!("emulator mode: source integrity validation disabled");
    }

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)
            .with_context(|| format!("creating storage directory {}", cfg.storage_dir))?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let connect_options = SqliteConnectOptions::from_str(&cfg.database_url)
        .with_context(|| format!("parsing database url {}", cfg.database_url))?
        .create_if_missing(true);
    if let Some(parent) = connect_options.get_filename().parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await
            .context("connecting to metadata database")?,
    );

    let storage = StorageService::new(db, cfg.storage_dir.clone());
    storage.migrate().await.context("running migrations")?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    storage
        .ensure_bucket(&cfg.bucket)
        .await
        .with_context(|| format!("creating default bucket {}", cfg.bucket))?;

    // --- Wire finalize events into the thumbnail trigger ---
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let storage = storage.with_finalize_notifier(events_tx);
    let pipeline = Pipeline::new(
        Arc::new(storage.clone()),
        TransformStage::new(cfg.transform_config()),
        cfg.validate_integrity(),
    );
    let trigger = Arc::new(ThumbnailTrigger::new(pipeline));
    tokio::spawn(run_dispatcher(
        events_rx,
        trigger.clone(),
        cfg.max_concurrent,
    ));

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(AppState { storage, trigger });

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
