//! Allocation pipeline service: ingests trade executions reported by the
//! upstream Trade Service, resolves portfolios, and hands batched
//! transactions to the downstream Portfolio Accounting CLI.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use alloc_pipeline_backend::api::{self, AppState};
use alloc_pipeline_backend::config::{CliArgs, Config};
use alloc_pipeline_backend::format::invoker::ProcessCliInvoker;
use alloc_pipeline_backend::ingest::IngestionEngine;
use alloc_pipeline_backend::lookup::http::HttpTradeLookupClient;
use alloc_pipeline_backend::send::SendEngine;
use alloc_pipeline_backend::store::sqlite::SqliteAllocationStore;

/// Recommended default: ~25 active connections backing the store.
const DEFAULT_POOL_SIZE: u32 = 25;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    if let Some(path) = &args.config_path {
        dotenv::from_path(path).ok();
    }
    let config = Config::from_env()?.apply_cli_overrides(&args);

    init_tracing(&config.log_level);

    info!(
        port = config.server_port,
        output_dir = %config.output_dir,
        "starting allocation pipeline service"
    );

    let store = Arc::new(
        SqliteAllocationStore::new(&config.store.name, DEFAULT_POOL_SIZE)
            .with_context(|| format!("open sqlite store at {}", config.store.name))?,
    );
    let lookup = Arc::new(
        HttpTradeLookupClient::new(config.trade_service_base_url.clone(), config.retry.clone())
            .context("build trade lookup client")?,
    );
    let invoker = Arc::new(ProcessCliInvoker::new(config.cli_command_template.clone()));

    let ingestion = Arc::new(IngestionEngine::new(store.clone(), lookup));
    let send_engine = Arc::new(SendEngine::new(
        store.clone(),
        invoker,
        config.output_dir.clone(),
        config.file_cleanup_enabled,
    ));

    let state = AppState {
        store,
        ingestion,
        send_engine,
    };

    let app = api::router_with_request_logging(state);

    let addr: SocketAddr = format!("0.0.0.0:{}", config.server_port)
        .parse()
        .context("invalid listen address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, "allocation pipeline listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")?;

    Ok(())
}

fn init_tracing(log_level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            format!("alloc_pipeline_backend={log_level},tower_http=info").into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
