//! Application startup and lifecycle management.

use crate::config::SyncServiceConfig;
use crate::handlers;
use crate::services::{Database, FeedProvider, HttpFeedProvider, LedgerStore, SyncService};
use axum::{
    middleware::from_fn,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::{metrics::metrics_middleware, tracing::request_id_middleware};
use std::future::IntoFuture;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Sync service over type-erased store and provider handles.
pub type DynSyncService = SyncService<dyn LedgerStore, dyn FeedProvider>;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub sync: Arc<DynSyncService>,
    /// Present when backed by PostgreSQL; drives the readiness probe.
    pub db: Option<Database>,
}

impl AppState {
    pub fn new(sync: Arc<DynSyncService>, db: Option<Database>) -> Self {
        Self { sync, db }
    }
}

/// Build the HTTP router with the standard middleware stack.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .route(
            "/principals/:principal_id/sync",
            post(handlers::sync_principal),
        )
        .route(
            "/principals/:principal_id/items/:item_id/sync",
            post(handlers::sync_item),
        )
        .route(
            "/principals/:principal_id/rollups",
            post(handlers::apply_rollups),
        )
        .route(
            "/principals/:principal_id/rollups/:period_key",
            get(handlers::get_rollups),
        )
        .with_state(state)
        .layer(from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &axum::http::Request<_>| {
                let request_id = service_core::middleware::tracing::request_id(request.headers())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    server: Box<dyn std::future::Future<Output = std::io::Result<()>> + Send + Unpin>,
    state: AppState,
}

impl Application {
    /// Connect to PostgreSQL, run migrations and bind the listener.
    pub async fn build(config: SyncServiceConfig) -> Result<Self, AppError> {
        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!("Failed to connect to PostgreSQL: {}", e);
            e
        })?;
        db.run_migrations().await?;

        let provider = HttpFeedProvider::new(config.provider.clone())
            .map_err(|e| AppError::ConfigError(anyhow::Error::new(e)))?;
        if provider.is_configured() {
            tracing::info!(base_url = %config.provider.base_url, "Feed provider client initialized");
        } else {
            tracing::warn!("Feed provider credentials not configured - syncs will fail");
        }

        let store: Arc<dyn LedgerStore> = Arc::new(db.clone());
        let provider: Arc<dyn FeedProvider> = Arc::new(provider);
        let sync = Arc::new(SyncService::new(store, provider, config.sync.clone()));

        Self::build_with(config, AppState::new(sync, Some(db))).await
    }

    /// Bind the listener for an already assembled state.
    pub async fn build_with(config: SyncServiceConfig, state: AppState) -> Result<Self, AppError> {
        let addr = config.common.bind_address();
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind TCP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!("Sync service listening on port {}", port);

        let server = axum::serve(listener, router(state.clone()));

        Ok(Self {
            port,
            server: Box::new(server.into_future()),
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        self.server.await
    }
}
