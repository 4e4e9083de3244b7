//! Provider adapters for Tributary and the registry bootstrap that wires them up.

pub mod config;
pub mod connectors;

use std::sync::Arc;
use tributary_core::{ProviderRegistry, Result};

pub use config::{IntegrationsConfig, OAuthClient};

/// Build the registry with every adapter compiled into this crate.
///
/// The only place adapters are registered; call it once at startup.
#[tracing::instrument(level = "info", skip(config))]
pub fn bootstrap_registry(config: &IntegrationsConfig) -> Result<ProviderRegistry> {
    #[allow(unused_mut)]
    let mut builder = ProviderRegistry::builder();

    #[cfg(feature = "readwise")]
    {
        builder = builder.register(Arc::new(
            connectors::readwise::ReadwiseConnector::new()?
                .with_page_delay(config.readwise_page_delay),
        ));
    }
    #[cfg(feature = "google_calendar")]
    {
        use tributary_core::ProviderId;
        builder = builder.register(Arc::new(
            connectors::google_calendar::GoogleCalendarConnector::new(
                config.oauth_app(ProviderId::GoogleCalendar),
            )?,
        ));
    }
    #[cfg(feature = "github")]
    {
        use tributary_core::ProviderId;
        builder = builder.register(Arc::new(connectors::github::GithubConnector::new(
            config.oauth_app(ProviderId::Github),
        )?));
    }
    #[cfg(feature = "linear")]
    {
        builder = builder.register(Arc::new(connectors::linear::LinearConnector::new()?));
    }

    let registry = builder.build()?;
    tracing::info!(providers = registry.len(), "provider registry ready");
    Ok(registry)
}
