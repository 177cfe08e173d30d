use anyhow::Context;
use clap::Parser;
use std::{path::Path, sync::Arc};
use theatre_client::{HttpTransport, NotificationCenter, OfflineQueue, TabBus, TracingAlertSink};
use theatre_core::tabs::TabId;
use theatre_core::Recipient;
use theatre_storage::QueueStore;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8430";
const DEFAULT_QUEUE_DB: &str = ".theatre/offline-queue.db";

#[derive(Parser, Debug)]
#[command(name = "theatre-tail")]
struct Args {
    #[arg(long, default_value = "")]
    base_url: String,
    #[arg(long, default_value = "")]
    recipient: String,
    #[arg(long, default_value = "")]
    role: String,
    #[arg(long, default_value = "")]
    queue_db: String,
    #[arg(long, default_value = "")]
    tab_id: String,
    #[arg(long, default_value = "")]
    queue_owner: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[derive(Clone, Debug)]
struct Config {
    base_url: String,
    recipient: Recipient,
    queue_db: String,
    queue_owner: Option<String>,
    tab_id: TabId,
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    init_logging(config.debug);

    if let Some(parent) = Path::new(&config.queue_db).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
    }
    let store = Arc::new(
        QueueStore::open(&config.queue_db)
            .with_context(|| format!("open offline queue {}", config.queue_db))?,
    );
    let queue = Arc::new(match &config.queue_owner {
        Some(owner) => OfflineQueue::new(store, owner.clone()),
        None => OfflineQueue::for_recipient(store, &config.recipient),
    });
    let transport = Arc::new(HttpTransport::new(&config.base_url, config.recipient.clone()));
    let bus = TabBus::default();

    let center = Arc::new(
        NotificationCenter::new(config.tab_id.clone(), transport, Arc::new(TracingAlertSink))
            .with_tab_bus(&bus)
            .with_queue(queue.clone()),
    );
    info!(
        event = "tail_start",
        base_url = %config.base_url,
        recipient = %config.recipient.id,
        tab = %config.tab_id,
        queue_owner = %queue.owner()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(center.clone().run(shutdown_rx));

    let _ = tokio::signal::ctrl_c().await;
    let _ = shutdown_tx.send(true);
    let _ = running.await;

    info!(
        event = "tail_stop",
        unread = center.unread_count(),
        pending_writes = center.pending_writes().unwrap_or(0)
    );
    Ok(())
}

fn load_config() -> anyhow::Result<Config> {
    let args = Args::parse();
    let recipient_id = resolve_flag(&args.recipient, "THEATRE_RECIPIENT", "");
    if recipient_id.trim().is_empty() {
        anyhow::bail!("--recipient or THEATRE_RECIPIENT is required");
    }
    let role = resolve_flag(&args.role, "THEATRE_ROLE", "nurse");
    let tab_id = resolve_flag(&args.tab_id, "THEATRE_TAB_ID", "");
    let tab_id = if tab_id.trim().is_empty() {
        TabId::generate()
    } else {
        TabId(tab_id)
    };
    let queue_owner = resolve_flag(&args.queue_owner, "THEATRE_QUEUE_OWNER", "");
    let queue_owner = (!queue_owner.trim().is_empty()).then_some(queue_owner);
    Ok(Config {
        base_url: resolve_flag(&args.base_url, "THEATRE_BASE_URL", DEFAULT_BASE_URL),
        recipient: Recipient::new(recipient_id, role),
        queue_db: resolve_flag(&args.queue_db, "THEATRE_QUEUE_DB", DEFAULT_QUEUE_DB),
        queue_owner,
        tab_id,
        debug: args.debug || env_true("THEATRE_TAIL_DEBUG"),
    })
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("THEATRE_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn resolve_flag(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    default.to_string()
}
