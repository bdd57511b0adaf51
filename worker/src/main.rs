// ==============================================================================
// main.rs - Genomics Ingest Worker Process
// ==============================================================================
// Description: Polls the PostgreSQL job table, normalizes claimed uploads into
//              staging tables and optionally annotates VCF jobs
// Author: Matt Barham
// Created: 2026-10-16
// Modified: 2026-10-16
// Version: 1.0.0
// ==============================================================================

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use genomics_ingest::config::WorkerConfig;
use genomics_ingest::dispatcher::{Dispatcher, DispatcherConfig};
use genomics_ingest::processor::JobProcessor;
use genomics_ingest::store::PgStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    init_tracing();

    info!("Starting Genomics Ingest Worker v1.0.0");

    let config = WorkerConfig::from_lookup(|key| std::env::var(key).ok())
        .context("Invalid worker configuration")?;

    if !config.data_dir.exists() {
        warn!("Data directory {:?} does not exist; only db:// uploads can be processed", config.data_dir);
    }

    // Initialize database connection
    let db_pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    info!("Connected to PostgreSQL");

    let store = PgStore::new(db_pool);
    store.ensure_schema().await.context("Failed to bootstrap schema")?;

    let processor = JobProcessor::from_config(&config)?;
    match &config.annotation {
        Some(annotation) => info!(
            "VCF annotation enabled -> {:?} (chunk size {}, {} retries)",
            annotation.output_dir, annotation.annotator.chunk_size, annotation.annotator.max_retries
        ),
        None => info!("VCF annotation disabled"),
    }

    let dispatcher = Dispatcher::new(Arc::new(store), processor, DispatcherConfig::from(&config));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown requested; finishing current job");
        let _ = shutdown_tx.send(true);
    });

    info!("Worker {} ready, waiting for jobs...", dispatcher.worker_id());
    dispatcher.run(shutdown_rx).await
}

/// Compact text logs by default, JSON lines with LOG_FORMAT=json
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    let json = std::env::var("LOG_FORMAT").map_or(false, |v| v.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
