mod api;
mod config;
mod indexer;
mod utils;

use anyhow::Context;
use clap::Parser;
use std::{net::SocketAddr, path::PathBuf};
use tokio::net::TcpListener;
use tracing::info;

use crate::{
    config::{CheckpointBackend, IngestionConfig, IngestionMode, ServerConfig},
    indexer::{
        checkpoint::{CheckpointStore, FileCheckpointStore, SqliteCheckpointStore},
        db::{init_pool, run_migrations, PointsLedger},
        engine::{start_ingestion, EngineSettings, IngestionEngine},
        source::JsonRpcLogSource,
    },
};

/// Ingests Mint/Borrow events into a points ledger and serves balances.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Environment file to load instead of `./.env`
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Overrides `INGESTION_MODE`
    #[arg(long, value_enum)]
    mode: Option<IngestionMode>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match &args.env_file {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("failed to load {}", path.display()))?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    let mut config = IngestionConfig::from_env()?;
    if let Some(mode) = args.mode {
        config.set_mode(mode);
    }
    let server_config = ServerConfig::from_env()?;

    let pool = init_pool(config.database_url())
        .await
        .context("failed to open database")?;
    run_migrations(&pool).await.context("failed to apply migrations")?;
    let ledger = PointsLedger::new(pool);

    let checkpoint_store: Box<dyn CheckpointStore> = match config.checkpoint_backend() {
        CheckpointBackend::File(path) => {
            let store = FileCheckpointStore::new(path.clone());
            info!(path = %store.path().display(), "Using file checkpoint");
            Box::new(store)
        }
        CheckpointBackend::Sqlite => {
            info!("Using database checkpoint");
            Box::new(SqliteCheckpointStore::new(ledger.pool().clone()))
        }
    };

    let source = JsonRpcLogSource::new(
        config.rpc_url(),
        config.ws_url(),
        config.backfill_window_size(),
        config.rpc_timeout(),
    )?;

    let engine = IngestionEngine::open(
        source,
        config.event_schema(),
        checkpoint_store,
        ledger.clone(),
        EngineSettings::from_config(&config),
    )
    .await
    .context("failed to read checkpoint")?;
    let mut ingestion = start_ingestion(engine);

    if config.mode() == IngestionMode::Backfill {
        tokio::select! {
            _ = ingestion.finished() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                ingestion.stop().await;
            }
        }
        return Ok(());
    }

    let app = api::router(ledger);
    let addr = SocketAddr::from(([0, 0, 0, 0], server_config.port()));
    info!(%addr, mode = ?config.mode(), "Server running at http://");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown requested");
        })
        .await?;

    ingestion.stop().await;
    Ok(())
}
