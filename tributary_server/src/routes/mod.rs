use axum::Router;
use axum::routing::get;

pub mod health;
pub mod integrations;
pub mod providers;
pub mod sync;
pub mod webhooks;

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> Router {
    Router::new()
        .route("/health", get(health::get_health))
        .merge(webhooks::router())
        .merge(api_v1_router())
}

#[tracing::instrument(level = "debug", skip_all)]
fn api_v1_router() -> Router {
    Router::new().nest(
        "/api/v1",
        Router::new()
            .route("/health", get(health::get_health))
            .merge(providers::router())
            .merge(integrations::router())
            .merge(sync::router()),
    )
}
