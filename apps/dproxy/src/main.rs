use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dproxy_core::config;
use dproxy_core::probe::ProbeFilter;
use dproxy_core::queue::{DEFAULT_QUEUE_CAPACITY, RecordQueue};
use dproxy_core::registry::UpstreamRegistry;
use dproxy_core::upstream::{UpstreamClient, UpstreamClientConfig};
use dproxy_router::{GatewayState, proxy_router};
use dproxy_storage::{InteractionStore, WriterConfig, dropped_batches, flush_remaining, spawn_writer};

mod cli;
mod dsn;

use cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config = config::load(Path::new("config.json")).context("load config.json")?;
    let registry = UpstreamRegistry::from_config(&config);
    let probe = ProbeFilter::new(config.probe_request.clone(), &config.probe_filter);

    let store_dsn = dsn::sqlite_dsn("interactions.db").context("prepare interactions.db")?;
    let store = InteractionStore::connect(&store_dsn)
        .await
        .context("open interactions.db")?;
    store.sync().await.context("sync interactions schema")?;

    let queue = Arc::new(RecordQueue::new(DEFAULT_QUEUE_CAPACITY));
    let writer_config = WriterConfig::default();
    let writer_batch = writer_config.batch_size;
    let writer = spawn_writer(store.clone(), queue.clone(), writer_config);

    let client =
        UpstreamClient::new(UpstreamClientConfig::default()).context("build upstream client")?;

    let state = Arc::new(GatewayState {
        registry,
        probe,
        client,
        queue: queue.clone(),
    });
    let app = proxy_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(event = "listening", addr = %addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Drain: stop the periodic writer, then commit whatever is still queued.
    writer.abort();
    flush_remaining(&store, &queue, writer_batch).await;
    info!(
        event = "shutdown_complete",
        dropped_records = queue.dropped(),
        dropped_batches = dropped_batches()
    );
    Ok(())
}

fn init_tracing(level: &str) {
    let directive = match level {
        "DEBUG" => "debug",
        "WARNING" => "warn",
        "ERROR" => "error",
        _ => "info",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directive))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
