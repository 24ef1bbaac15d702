use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

use tabql::config::{llm_config_from_env, Args};
use tabql::dataset::DatasetRegistry;
use tabql::ingest::UploadRegistry;
use tabql::server::{serve, ServerState};
use tabql::store::StoreHandle;
use tabql::tools::{AppState, ToolRegistry};

const REAP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tabql=info".into()),
        ))
        .with(fmt::layer())
        .init();

    let db_path = args.resolved_db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = StoreHandle::open(&db_path, args.pool_size)?;
    tracing::info!("analytical store opened at {:?} (pool_size={})", db_path, args.pool_size);

    let datasets = Arc::new(DatasetRegistry::new());
    let uploads = Arc::new(UploadRegistry::new());

    let reaper_datasets = datasets.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REAP_INTERVAL);
        loop {
            ticker.tick().await;
            let expired = reaper_datasets.reap_expired();
            if !expired.is_empty() {
                tracing::info!("reaped {} expired dataset(s): {:?}", expired.len(), expired);
            }
        }
    });

    let app_state = AppState { datasets, store, uploads };
    let registry = Arc::new(ToolRegistry::new());
    let default_llm_config = llm_config_from_env();
    if default_llm_config.is_none() {
        tracing::warn!("no TABQL_LLM_* environment configured; requests must supply llm_config explicitly");
    }

    let state = ServerState { app: app_state, registry, default_llm_config };

    serve(&args.bind, state).await
}
