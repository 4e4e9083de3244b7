use crate::error::ApiError;
use crate::extract::parse_provider;
use crate::server::AppState;
use axum::extract::Path;
use axum::routing::get;
use axum::{Extension, Json};
use std::sync::Arc;
use tributary_core::{Error as CoreError, ProviderDefinition};

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/providers", get(list_providers))
        .route("/providers/{provider}", get(get_provider))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn list_providers(
    Extension(state): Extension<Arc<AppState>>,
) -> Json<Vec<ProviderDefinition>> {
    Json(state.registry.definitions().into_iter().cloned().collect())
}

#[tracing::instrument(level = "debug", skip_all, fields(provider = %provider))]
pub async fn get_provider(
    Extension(state): Extension<Arc<AppState>>,
    Path(provider): Path<String>,
) -> Result<Json<ProviderDefinition>, ApiError> {
    let id = parse_provider(&provider)?;
    let def = state
        .registry
        .definition(id)
        .cloned()
        .ok_or_else(|| CoreError::NotFound(format!("provider {id} is not registered")))?;
    Ok(Json(def))
}
