pub mod aggregator;
pub mod channel;
pub mod config;
pub mod error;
pub mod identity;
pub mod logging;
pub mod registry;
pub mod routes;

use std::{future::Future, sync::Arc};
use theatre_core::source::OperationalSource;
use theatre_storage::{NotificationStore, StorageError};
use tokio::net::TcpListener;
use tracing::info;

pub use aggregator::TimelineAggregator;
pub use error::ApiError;
pub use config::HubConfig;
pub use registry::ConnectionRegistry;
pub use routes::router;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HubConfig>,
    pub store: Arc<NotificationStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub aggregator: Arc<TimelineAggregator>,
}

impl AppState {
    pub fn new(
        config: HubConfig,
        store: Arc<NotificationStore>,
        source: Arc<dyn OperationalSource>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        let config = Arc::new(config);
        let aggregator = Arc::new(TimelineAggregator::new(
            source,
            store.clone(),
            registry.clone(),
            config.clone(),
        ));
        Self {
            config,
            store,
            registry,
            aggregator,
        }
    }
}

impl AppState {
    /// Runs a store call on the blocking pool so SQLite never stalls an
    /// async worker.
    pub async fn with_store<T, F>(&self, call: F) -> Result<T, ApiError>
    where
        F: FnOnce(&NotificationStore) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || call(store.as_ref()))
            .await
            .map_err(|err| ApiError::Task(err.to_string()))?
            .map_err(ApiError::from)
    }
}

/// Serves the hub on an already-bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(event = "hub_listening", addr = %addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
