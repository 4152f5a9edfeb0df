use anyhow::{Context, Result};
use axum::Router;
use std::{fs, io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod auth;
mod client;
mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use client::{
    planner::FileSource,
    scheduler::{Uploader, UploaderConfig},
    transport::HttpTransport,
    tuning::Tuning,
};
use config::{AppConfig, PushArgs, RunMode};
use services::{
    append_store::DiskAppendStore, catalog::SqliteCatalog, upload_service::UploadService,
};

/// Sessions expired per reaper transaction batch.
const REAP_BATCH: u32 = 100;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;

    match mode {
        RunMode::Push(args) => push(args).await,
        RunMode::Migrate => {
            let db = db::connect(&cfg.database_url).await?;
            db::run_migrations(&db).await?;
            tracing::info!("Database migration complete.");
            Ok(())
        }
        RunMode::Serve => serve(cfg).await,
    }
}

async fn serve(cfg: AppConfig) -> Result<()> {
    tracing::info!("Starting resumable-upload with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db = db::connect(&cfg.database_url).await?;
    // every statement is IF NOT EXISTS
    db::run_migrations(&db)
        .await
        .context("applying database schema")?;

    // --- Initialize core service ---
    let store = Arc::new(DiskAppendStore::new(&cfg.storage_dir));
    let catalog = Arc::new(SqliteCatalog::new(db.clone()));
    let service = UploadService::new(
        db,
        store,
        catalog,
        cfg.session_policy(),
        cfg.append_timeout(),
    );

    // --- Background reaper ---
    let shutdown = CancellationToken::new();
    let reaper = tokio::spawn(
        service
            .reaper(REAP_BATCH)
            .run(cfg.reap_interval(), shutdown.clone()),
    );

    // --- Build router ---
    let max_chunk = usize::try_from(service.max_chunk_size()).unwrap_or(usize::MAX);
    let app: Router = routes::routes::routes(max_chunk).with_state(service);

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
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown requested");
            }
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    reaper.await.ok();
    Ok(())
}

/// Client mode: upload one file to a running server.
async fn push(args: PushArgs) -> Result<()> {
    let source = Arc::new(
        FileSource::open(&args.file)
            .await
            .with_context(|| format!("opening {}", args.file.display()))?,
    );
    let transport = HttpTransport::new(
        args.server.as_str(),
        args.principal.as_str(),
        Duration::from_secs(args.timeout_secs),
    )?
    .with_admin_role(args.admin);

    let uploader = Uploader::new(
        Arc::new(transport),
        UploaderConfig {
            initial: Tuning {
                chunk_size: args.chunk_size,
                parallelism: args.parallelism,
            },
            ..UploaderConfig::default()
        },
    );

    // Ctrl-C stops dispatch; chunks already sending are allowed to finish.
    let cancel = uploader.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let mut progress = uploader.subscribe();
    let reporter = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let p = progress.borrow_and_update().clone();
            tracing::info!(
                session_id = %p.session_id,
                uploaded = p.uploaded_count,
                total = p.total_chunks,
                percent = p.progress_percent,
                chunk_size = p.chunk_size,
                parallelism = p.parallelism,
                throughput_bps = p.throughput,
                "upload progress"
            );
        }
    });

    let result = match &args.resume {
        Some(session_id) => uploader.resume(session_id, source).await,
        None => {
            let name = args
                .name
                .clone()
                .or_else(|| source.file_name())
                .context("cannot derive a file name, pass --name")?;
            uploader
                .upload(source, &name, &args.mime_type, args.folder.clone())
                .await
        }
    };
    reporter.abort();

    match result {
        Ok(file) => {
            println!("{}", serde_json::to_string_pretty(&file)?);
            Ok(())
        }
        Err(err) => {
            if let Some(session_id) = err.resumable_session() {
                tracing::warn!(
                    session_id,
                    "upload interrupted, rerun with --resume {}",
                    session_id
                );
            }
            Err(err.into())
        }
    }
}
