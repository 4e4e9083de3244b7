use crate::routes;
use axum::{Extension, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tributary_core::o11y::redaction::RedactionPolicy;
use tributary_core::{
    ConnectionService, ProviderRegistry, RecordingPipeline, Result as CoreResult, SqliteSyncStore,
    SyncConfig, SyncOrchestrator, SyncScheduler, SyncStore, WebhookReceiver,
};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ProviderRegistry>,
    pub store: Arc<dyn SyncStore>,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub connections: Arc<ConnectionService>,
    pub webhooks: Arc<WebhookReceiver>,
    pub started_at: Instant,
}

impl AppState {
    /// Build the sync services on top of one SQLite store, which also receives pipeline records.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<SqliteSyncStore>,
        config: SyncConfig,
        redaction: RedactionPolicy,
        public_url: Option<String>,
    ) -> Self {
        let pipeline = Arc::new(RecordingPipeline::new(store.clone()));
        let sync_store: Arc<dyn SyncStore> = store;

        let orchestrator = SyncOrchestrator::new(
            registry.clone(),
            sync_store.clone(),
            pipeline,
            config.clone(),
        )
        .with_redaction(redaction);
        let webhooks = WebhookReceiver::new(
            registry.clone(),
            sync_store.clone(),
            orchestrator.processor().clone(),
            &config,
        );

        let mut connections = ConnectionService::new(registry.clone(), sync_store.clone());
        if let Some(base) = public_url {
            connections = connections.with_webhook_base_url(base);
        }

        Self {
            registry,
            store: sync_store,
            orchestrator: Arc::new(orchestrator),
            connections: Arc::new(connections),
            webhooks: Arc::new(webhooks),
            started_at: Instant::now(),
        }
    }
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn router(state: AppState) -> Router {
    let state = Arc::new(state);

    Router::new()
        .merge(routes::router())
        .layer(Extension(state))
        .layer(SetRequestIdLayer::new(
            axum::http::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Serve the API until ctrl-c, with the due-sync scheduler running alongside when enabled.
#[tracing::instrument(level = "info", skip_all, fields(addr = %addr))]
pub async fn serve(addr: SocketAddr, state: AppState, scheduler_enabled: bool) -> CoreResult<()> {
    if scheduler_enabled {
        let scheduler = SyncScheduler::from_config(state.orchestrator.clone(), state.store.clone())?;
        tokio::spawn(async move {
            tracing::info!("sync scheduler background loop started");
            if let Err(e) = scheduler.run_loop().await {
                tracing::error!(error = %e, "sync scheduler stopped");
            }
        });
    } else {
        tracing::info!("sync scheduler background loop disabled");
    }

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| tributary_core::Error::backend(format!("bind {addr}"), e))?;
    tracing::info!("listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| tributary_core::Error::backend("http server", e))?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
