use crate::error::ApiError;
use crate::extract::parse_provider;
use crate::server::AppState;
use axum::extract::Path;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Extension, Json};
use bytes::Bytes;
use std::sync::Arc;
use tributary_core::{WebhookAck, WebhookRequest};

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new().route("/webhooks/{provider}", post(receive))
}

/// Headers whose values are not valid UTF-8 are dropped.
fn to_webhook_request(headers: &HeaderMap, body: Bytes) -> WebhookRequest {
    headers
        .iter()
        .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?)))
        .fold(WebhookRequest::new(body.to_vec()), |req, (name, value)| {
            req.with_header(name, value)
        })
}

/// Unauthenticated provider delivery, mounted outside `/api/v1`; trust comes from the signature
/// check alone.
#[tracing::instrument(level = "info", skip_all, fields(provider = %provider))]
pub async fn receive(
    Extension(state): Extension<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let provider = parse_provider(&provider)?;
    let request = to_webhook_request(&headers, body);
    Ok(Json(state.webhooks.receive(provider, request).await?))
}
