use crate::error::ApiError;
use crate::extract::{parse_provider, UserIdHeader};
use crate::server::AppState;
use axum::extract::Path;
use axum::routing::{get, post};
use axum::{Extension, Json};
use bytes::Bytes;
use std::sync::Arc;
use tributary_core::{ProviderSyncOutcome, SyncOptions, SyncResult, SyncState, SyncStatusView};

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/sync", post(sync_all))
        .route("/sync/status", get(list_statuses))
        .route("/sync/{provider}", post(sync_provider))
        .route("/sync/{provider}/status", get(get_status))
        .route("/sync/{provider}/pause", post(pause))
        .route("/sync/{provider}/resume", post(resume))
}

/// An empty body means default options.
fn parse_options(body: &[u8]) -> Result<SyncOptions, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(SyncOptions::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::InvalidInput(format!("sync options: {e}")))
}

#[tracing::instrument(level = "info", skip_all, fields(provider = %provider))]
pub async fn sync_provider(
    UserIdHeader(user_id): UserIdHeader,
    Extension(state): Extension<Arc<AppState>>,
    Path(provider): Path<String>,
    body: Bytes,
) -> Result<Json<SyncResult>, ApiError> {
    let provider = parse_provider(&provider)?;
    let options = parse_options(&body)?;
    let result = state
        .orchestrator
        .sync_integration(user_id, provider, options)
        .await?;
    Ok(Json(result))
}

#[tracing::instrument(level = "info", skip_all)]
pub async fn sync_all(
    UserIdHeader(user_id): UserIdHeader,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Vec<ProviderSyncOutcome>>, ApiError> {
    Ok(Json(state.orchestrator.sync_all_integrations(user_id).await?))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn list_statuses(
    UserIdHeader(user_id): UserIdHeader,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Vec<SyncStatusView>>, ApiError> {
    Ok(Json(state.orchestrator.list_sync_statuses(user_id).await?))
}

#[tracing::instrument(level = "debug", skip_all, fields(provider = %provider))]
pub async fn get_status(
    UserIdHeader(user_id): UserIdHeader,
    Extension(state): Extension<Arc<AppState>>,
    Path(provider): Path<String>,
) -> Result<Json<SyncStatusView>, ApiError> {
    let provider = parse_provider(&provider)?;
    Ok(Json(state.orchestrator.sync_status(user_id, provider).await?))
}

#[tracing::instrument(level = "info", skip_all, fields(provider = %provider))]
pub async fn pause(
    UserIdHeader(user_id): UserIdHeader,
    Extension(state): Extension<Arc<AppState>>,
    Path(provider): Path<String>,
) -> Result<Json<SyncState>, ApiError> {
    let provider = parse_provider(&provider)?;
    Ok(Json(state.orchestrator.set_paused(user_id, provider, true).await?))
}

#[tracing::instrument(level = "info", skip_all, fields(provider = %provider))]
pub async fn resume(
    UserIdHeader(user_id): UserIdHeader,
    Extension(state): Extension<Arc<AppState>>,
    Path(provider): Path<String>,
) -> Result<Json<SyncState>, ApiError> {
    let provider = parse_provider(&provider)?;
    Ok(Json(state.orchestrator.set_paused(user_id, provider, false).await?))
}
