use anyhow::Context;
use std::{net::SocketAddr, path::Path, sync::Arc};
use theatre_hub::{config::load_config, logging::init_logging, AppState, ConnectionRegistry};
use theatre_storage::{NotificationStore, SqliteOperationalSource};
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config();
    let _log_guard = init_logging(&config);

    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return Err(err).context("parse --addr");
        }
    };

    ensure_parent_dir(&config.db_path)?;
    ensure_parent_dir(&config.ops_db_path)?;
    let store = Arc::new(
        NotificationStore::open(&config.db_path)
            .with_context(|| format!("open notification store {}", config.db_path))?,
    );
    let source = Arc::new(
        SqliteOperationalSource::open(&config.ops_db_path)
            .with_context(|| format!("open operational source {}", config.ops_db_path))?,
    );

    let aggregation_interval = config.aggregation_interval;
    let state = AppState::new(config, store, source, Arc::new(ConnectionRegistry::new()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let aggregator = state
        .aggregator
        .clone()
        .spawn_periodic(aggregation_interval, shutdown_rx);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(event = "hub_start", addr = %addr);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    if let Err(err) = theatre_hub::serve(listener, state, shutdown).await {
        error!(event = "hub_error", error = %err);
    }

    let _ = shutdown_tx.send(true);
    let _ = aggregator.await;
    info!(event = "hub_stop");
    Ok(())
}

fn ensure_parent_dir(path: &str) -> anyhow::Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
    }
    Ok(())
}
