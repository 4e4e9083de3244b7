use std::error::Error as StdError;

use crate::models::ProviderId;

/// Common error type for `tributary_core`.
///
/// Run-level variants (`TokenRefresh`, `ProviderApi`, `DeadlineExceeded`) abort a sync run and are
/// persisted on the integration's sync state. `ItemProcessing` is isolated per item and never
/// aborts a batch. Storage backends should preserve the underlying error chain via
/// `Error::backend`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("provider '{0}' is not connected")]
    NotConnected(ProviderId),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("token refresh failed for {provider}: {message}")]
    TokenRefresh {
        provider: ProviderId,
        message: String,
    },

    #[error("{provider} api error{}: {message}", status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    ProviderApi {
        provider: ProviderId,
        status: Option<u16>,
        message: String,
    },

    #[error("item '{source_id}' failed: {message}")]
    ItemProcessing { source_id: String, message: String },

    #[error("sync already in progress for {0}")]
    SyncInProgress(ProviderId),

    #[error("sync is paused for {0}")]
    SyncPaused(ProviderId),

    #[error("sync run exceeded its deadline after {0:?}")]
    DeadlineExceeded(std::time::Duration),

    #[error("webhook signature verification failed")]
    WebhookSignature,

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),
}

impl Error {
    #[tracing::instrument(level = "debug", name = "tributary.error.backend", skip(source))]
    pub fn backend(
        context: impl Into<String> + std::fmt::Debug,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    pub fn provider_api(
        provider: ProviderId,
        status: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        Self::ProviderApi {
            provider,
            status,
            message: message.into(),
        }
    }

    pub fn token_refresh(provider: ProviderId, message: impl Into<String>) -> Self {
        Self::TokenRefresh {
            provider,
            message: message.into(),
        }
    }

    /// Whether a caller can reasonably retry the same operation later without intervention.
    ///
    /// Token refresh failures require the user to reconnect; signature failures and invalid
    /// input will fail the same way again.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::SyncInProgress(_)
            | Error::ItemProcessing { .. }
            | Error::ProviderApi { .. }
            | Error::DeadlineExceeded(_)
            | Error::Backend { .. }
            | Error::BackendMessage(_) => true,
            Error::InvalidInput(_)
            | Error::NotFound(_)
            | Error::NotConnected(_)
            | Error::Conflict(_)
            | Error::Unauthorized(_)
            | Error::TokenRefresh { .. }
            | Error::SyncPaused(_)
            | Error::WebhookSignature
            | Error::PayloadTooLarge => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
