// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use clap::Parser;
use search_sync_engine::{ElasticsearchSink, PgSource, SyncConfig, SyncEngine, WatermarkStore};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "search-sync", version, about = "Keep a search index in sync with Postgres")]
struct Args {
    /// TOML config file (missing file = defaults + environment).
    #[arg(long, default_value = "search-sync.toml")]
    config: PathBuf,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();
    // Metrics go to the `metrics` facade; no recorder is installed here.

    let config = match SyncConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %args.config.display(), error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    info!(config = ?config, "Configuration loaded");

    let source = match PgSource::connect(&config.source, &config.tracked).await {
        Ok(source) => Arc::new(source),
        Err(e) => {
            error!(error = %e, "Cannot connect to source database");
            return ExitCode::FAILURE;
        }
    };

    let sink = match ElasticsearchSink::new(&config.sink, config.settings.retry.clone()) {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            error!(error = %e, "Cannot build search sink");
            return ExitCode::FAILURE;
        }
    };

    let watermarks = WatermarkStore::open_file(&config.watermark.path);
    let engine = SyncEngine::new(config, source, sink, watermarks);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, finishing current page");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                // Dropping the sender would stop the engine.
                warn!(error = %e, "Cannot listen for interrupts");
                std::future::pending::<()>().await;
                drop(shutdown_tx);
            }
        }
    });

    match engine.run(shutdown_rx).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Sync engine failed");
            ExitCode::FAILURE
        }
    }
}
