use crate::models::{IntegrationId, ProviderId, UserId};
use crate::sync::hashing::verify_hmac_sha256;
use crate::sync::models::{
    AccountInfo, Integration, PipelineOutput, ProviderDefinition, StandardIngestItem, SyncBatch,
    SyncOptions, TokenSet, WebhookRegistration, WebhookRequest,
};
use crate::{Error, Result};
use async_trait::async_trait;
use uuid::Uuid;

/// Per-run inputs handed to an adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncContext {
    pub user_id: UserId,
    pub integration_id: IntegrationId,
    pub provider: ProviderId,
    pub tokens: TokenSet,
    /// The integration's provider metadata (selected repo, team, ...).
    pub metadata: serde_json::Value,
}

impl SyncContext {
    pub fn from_integration(integration: &Integration) -> Self {
        Self {
            user_id: integration.user_id,
            integration_id: integration.id,
            provider: integration.provider,
            tokens: integration.tokens.clone(),
            metadata: integration.metadata.clone(),
        }
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
    }
}

/// One external service: auth, pull sync and webhook transforms.
///
/// Implementations live in `tributary_integrations`. Adapters are stateless with respect to
/// sync progress: cursors come in through `SyncOptions` and go out through `SyncBatch`, and
/// webhook transforms never touch storage.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn definition(&self) -> &ProviderDefinition;

    fn id(&self) -> ProviderId {
        self.definition().id
    }

    /// OAuth2 consent URL. Non-OAuth providers reject this.
    fn authorization_url(&self, _state: &str) -> Result<String> {
        Err(Error::InvalidInput(format!(
            "{} does not use oauth2",
            self.id()
        )))
    }

    async fn exchange_code_for_tokens(&self, _code: &str) -> Result<TokenSet> {
        Err(Error::InvalidInput(format!(
            "{} does not use oauth2",
            self.id()
        )))
    }

    async fn refresh_access_token(&self, _refresh_token: &str) -> Result<TokenSet> {
        Err(Error::token_refresh(
            self.id(),
            "provider does not support token refresh",
        ))
    }

    async fn validate_connection(&self, tokens: &TokenSet) -> Result<bool>;

    async fn account_info(&self, _tokens: &TokenSet) -> Result<AccountInfo> {
        Ok(AccountInfo::default())
    }

    /// Fetch one bounded batch starting at `options.cursor` / `options.since`.
    async fn sync(&self, ctx: &SyncContext, options: &SyncOptions) -> Result<SyncBatch>;

    /// Event name carried by a delivery (header or body), if any.
    fn webhook_event(&self, _request: &WebhookRequest) -> Option<String> {
        None
    }

    /// Provider-side hook id carried by a delivery, used to route it to a subscription.
    fn webhook_id(&self, _request: &WebhookRequest) -> Option<String> {
        None
    }

    /// HMAC-SHA256 over the raw body, read from the definition's signature header.
    fn verify_webhook(&self, secret: &str, request: &WebhookRequest) -> bool {
        let Some(header) = self.definition().webhook_signature_header else {
            return false;
        };
        let Some(signature) = request.header(header) else {
            return false;
        };
        verify_hmac_sha256(secret, &request.body, signature)
    }

    /// Turn a verified delivery into normalized items. Must not mutate state.
    async fn handle_webhook(
        &self,
        _ctx: &SyncContext,
        _request: &WebhookRequest,
        _event: &str,
    ) -> Result<Vec<StandardIngestItem>> {
        Ok(vec![])
    }

    /// Create a webhook on the provider side. `None` when the provider has nothing to register.
    async fn register_webhook(
        &self,
        _tokens: &TokenSet,
        _metadata: &serde_json::Value,
        _callback_url: &str,
    ) -> Result<Option<WebhookRegistration>> {
        Ok(None)
    }
}

/// Identifies the ledger row an item is being processed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineContext {
    pub user_id: UserId,
    pub integration_id: IntegrationId,
    pub ingested_item_id: Uuid,
}

/// Downstream consumer turning normalized items into product records.
#[async_trait]
pub trait IngestionPipeline: Send + Sync {
    async fn process(
        &self,
        ctx: &PipelineContext,
        item: &StandardIngestItem,
    ) -> Result<PipelineOutput>;
}
