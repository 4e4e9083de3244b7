use crate::error::ApiError;
use crate::extract::{parse_provider, UserIdHeader};
use crate::server::AppState;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Extension, Json};
use serde::Deserialize;
use std::sync::Arc;
use tributary_core::{AuthorizationRequest, Integration, WebhookRegistration, WebhookSubscription};

#[derive(Debug, Deserialize)]
pub struct OAuthCallbackRequest {
    pub code: String,
    /// Echoed `state`; accepted for client convenience but not checked server-side.
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiKeyRequest {
    pub api_key: String,
}

#[derive(Debug, Deserialize)]
pub struct WebhookSubscriptionRequest {
    #[serde(default)]
    pub webhook_id: Option<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    pub secret: String,
    #[serde(default)]
    pub events: Vec<String>,
}

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/integrations", get(list_integrations))
        .route("/integrations/{provider}", delete(disconnect))
        .route("/integrations/{provider}/authorize", post(authorize))
        .route("/integrations/{provider}/callback", post(oauth_callback))
        .route("/integrations/{provider}/api-key", post(connect_api_key))
        .route("/integrations/{provider}/webhook", post(add_webhook))
}

#[tracing::instrument(level = "debug", skip_all)]
pub async fn list_integrations(
    UserIdHeader(user_id): UserIdHeader,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Vec<Integration>>, ApiError> {
    Ok(Json(state.connections.list_integrations(user_id).await?))
}

#[tracing::instrument(level = "info", skip_all, fields(provider = %provider))]
pub async fn authorize(
    UserIdHeader(user_id): UserIdHeader,
    Extension(state): Extension<Arc<AppState>>,
    Path(provider): Path<String>,
) -> Result<Json<AuthorizationRequest>, ApiError> {
    let provider = parse_provider(&provider)?;
    Ok(Json(state.connections.authorize(user_id, provider)?))
}

#[tracing::instrument(level = "info", skip_all, fields(provider = %provider))]
pub async fn oauth_callback(
    UserIdHeader(user_id): UserIdHeader,
    Extension(state): Extension<Arc<AppState>>,
    Path(provider): Path<String>,
    Json(req): Json<OAuthCallbackRequest>,
) -> Result<(StatusCode, Json<Integration>), ApiError> {
    let provider = parse_provider(&provider)?;
    let integration = state
        .connections
        .complete_oauth(user_id, provider, &req.code)
        .await?;
    Ok((StatusCode::CREATED, Json(integration)))
}

#[tracing::instrument(level = "info", skip_all, fields(provider = %provider))]
pub async fn connect_api_key(
    UserIdHeader(user_id): UserIdHeader,
    Extension(state): Extension<Arc<AppState>>,
    Path(provider): Path<String>,
    Json(req): Json<ApiKeyRequest>,
) -> Result<(StatusCode, Json<Integration>), ApiError> {
    let provider = parse_provider(&provider)?;
    let integration = state
        .connections
        .connect_api_key(user_id, provider, &req.api_key)
        .await?;
    Ok((StatusCode::CREATED, Json(integration)))
}

#[tracing::instrument(level = "info", skip_all, fields(provider = %provider))]
pub async fn add_webhook(
    UserIdHeader(user_id): UserIdHeader,
    Extension(state): Extension<Arc<AppState>>,
    Path(provider): Path<String>,
    Json(req): Json<WebhookSubscriptionRequest>,
) -> Result<(StatusCode, Json<WebhookSubscription>), ApiError> {
    let provider = parse_provider(&provider)?;
    if req.secret.trim().is_empty() {
        return Err(ApiError::InvalidInput("secret is required".to_string()));
    }
    let registration = WebhookRegistration {
        webhook_id: req.webhook_id,
        webhook_url: req.webhook_url,
        secret: req.secret,
        events: req.events,
    };
    let sub = state
        .connections
        .add_webhook_subscription(user_id, provider, registration)
        .await?;
    Ok((StatusCode::CREATED, Json(sub)))
}

#[tracing::instrument(level = "info", skip_all, fields(provider = %provider))]
pub async fn disconnect(
    UserIdHeader(user_id): UserIdHeader,
    Extension(state): Extension<Arc<AppState>>,
    Path(provider): Path<String>,
) -> Result<StatusCode, ApiError> {
    let provider = parse_provider(&provider)?;
    state.connections.disconnect(user_id, provider).await?;
    Ok(StatusCode::NO_CONTENT)
}
