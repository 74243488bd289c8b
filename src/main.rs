use anyhow::{Context, Result};
use axum::Router;
use std::{fs, io::ErrorKind, net::SocketAddr, path::Path, sync::Arc};
use tokio::{net::TcpListener, sync::watch};
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;

use services::{
    content_store::ContentStore,
    dispatcher::{Dispatcher, UploadLimits},
    media_store::MediaStore,
    pipeline::Pipeline,
    thumbnailer::{ImageThumbnailer, ProcessThumbnailer, Thumbnailer},
    tokens::TokenIssuer,
    upkeep::{Upkeep, UpkeepSchedule},
};

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

    tracing::info!("Starting imager with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db = db::connect(&cfg.database_url)
        .await
        .with_context(|| format!("connecting to {}", cfg.database_url))?;

    // --- Handle migration mode ---
    if migrate {
        db::run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }
    db::run_migrations(&db).await?;

    // --- Initialize core services ---
    let store = MediaStore::new(db.clone(), ContentStore::new(&cfg.storage_dir));
    let tokens = TokenIssuer::new(db.clone(), cfg.token_ttl);

    let thumbnailer: Arc<dyn Thumbnailer> = match cfg
        .thumbnailer
        .as_deref()
        .and_then(ProcessThumbnailer::from_command_line)
    {
        Some(external) => {
            tracing::info!(command = ?cfg.thumbnailer, "using external thumbnailer");
            Arc::new(external)
        }
        None => {
            tracing::info!("using built-in image thumbnailer");
            Arc::new(ImageThumbnailer::default())
        }
    };

    let pipeline = Arc::new(Pipeline::new(store.clone(), tokens.clone(), thumbnailer));
    let dispatcher = Dispatcher::start(
        cfg.thumb_workers,
        UploadLimits {
            max_file_bytes: cfg.max_upload_bytes,
            max_smile_bytes: cfg.max_smile_bytes,
        },
        pipeline,
    );

    // --- Background upkeep ---
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let upkeep = Upkeep::new(store.clone(), tokens.clone(), cfg.identity_retention);
    let upkeep_task = tokio::spawn(upkeep.run(UpkeepSchedule::default(), shutdown_rx));

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.max_upload_bytes)
        .with_state(state::AppState {
            dispatcher,
            store,
            tokens,
        });

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
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    let _ = shutdown_tx.send(true);
    if let Err(err) = upkeep_task.await {
        tracing::warn!(error = %err, "upkeep task ended abnormally");
    }
    tracing::info!("Shut down cleanly.");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received.");
}
