use crate::models::{ProviderId, UserId};
use crate::store::traits::SyncStore;
use crate::sync::models::{
    AccountInfo, AuthMethod, Integration, TokenSet, WebhookRegistration, WebhookSubscription,
};
use crate::sync::registry::ProviderRegistry;
use crate::sync::traits::ProviderAdapter;
use crate::{Error, Result};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// OAuth consent redirect handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorizationRequest {
    pub url: String,
    /// Opaque value the provider echoes on the callback.
    pub state: String,
}

/// Connection lifecycle: OAuth2 and API-key connect, webhook registration, disconnect.
pub struct ConnectionService {
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn SyncStore>,
    /// Public base URL for webhook callbacks; registration is skipped when unset.
    webhook_base_url: Option<String>,
}

impl ConnectionService {
    pub fn new(registry: Arc<ProviderRegistry>, store: Arc<dyn SyncStore>) -> Self {
        Self {
            registry,
            store,
            webhook_base_url: None,
        }
    }

    pub fn with_webhook_base_url(mut self, base: impl Into<String>) -> Self {
        let base = base.into();
        self.webhook_base_url = Some(base.trim_end_matches('/').to_string());
        self
    }

    fn adapter_for(&self, provider: ProviderId, auth: AuthMethod) -> Result<Arc<dyn ProviderAdapter>> {
        let adapter = self.registry.get(provider)?;
        if adapter.definition().auth_method != auth {
            return Err(Error::InvalidInput(format!(
                "{provider} does not use {}",
                match auth {
                    AuthMethod::Oauth2 => "oauth2",
                    AuthMethod::ApiKey => "api keys",
                    AuthMethod::Custom => "custom auth",
                }
            )));
        }
        Ok(adapter)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn authorize(&self, user_id: UserId, provider: ProviderId) -> Result<AuthorizationRequest> {
        let adapter = self.adapter_for(provider, AuthMethod::Oauth2)?;
        let state = Uuid::new_v4().simple().to_string();
        let url = adapter.authorization_url(&state)?;
        Ok(AuthorizationRequest { url, state })
    }

    /// Exchange the OAuth2 callback code and store the connection.
    #[tracing::instrument(level = "info", skip(self, code), fields(user_id = %user_id, provider = %provider))]
    pub async fn complete_oauth(
        &self,
        user_id: UserId,
        provider: ProviderId,
        code: &str,
    ) -> Result<Integration> {
        if code.trim().is_empty() {
            return Err(Error::InvalidInput("authorization code is empty".to_string()));
        }
        let adapter = self.adapter_for(provider, AuthMethod::Oauth2)?;
        let tokens = adapter.exchange_code_for_tokens(code).await?;
        self.connect_with_tokens(user_id, adapter.as_ref(), tokens).await
    }

    /// Validate an API key against the provider and store the connection.
    #[tracing::instrument(level = "info", skip(self, api_key), fields(user_id = %user_id, provider = %provider))]
    pub async fn connect_api_key(
        &self,
        user_id: UserId,
        provider: ProviderId,
        api_key: &str,
    ) -> Result<Integration> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(Error::InvalidInput("api key is empty".to_string()));
        }
        let adapter = self.adapter_for(provider, AuthMethod::ApiKey)?;
        let tokens = TokenSet::api_key(api_key);
        if !adapter.validate_connection(&tokens).await? {
            return Err(Error::Unauthorized(format!("{provider} rejected the api key")));
        }
        self.connect_with_tokens(user_id, adapter.as_ref(), tokens).await
    }

    async fn connect_with_tokens(
        &self,
        user_id: UserId,
        adapter: &dyn ProviderAdapter,
        tokens: TokenSet,
    ) -> Result<Integration> {
        let provider = adapter.id();
        let account = match adapter.account_info(&tokens).await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(%provider, error = %e, "account info unavailable");
                AccountInfo::default()
            }
        };

        let existing = self.store.get_integration(user_id, provider).await?;
        let mut metadata = existing
            .as_ref()
            .map(|i| i.metadata.clone())
            .filter(|m| m.is_object())
            .unwrap_or_else(|| serde_json::json!({}));
        merge_account(&mut metadata, &account);

        let now = Utc::now();
        let integration = Integration::new(user_id, provider, tokens, metadata, Some(now))?;
        let stored = self.store.upsert_integration(&integration).await?;
        self.store.ensure_sync_state(&stored, now).await?;

        if adapter.definition().features.webhooks {
            if let Some(base) = self.webhook_base_url.as_deref() {
                let callback = format!("{base}/webhooks/{provider}");
                match adapter
                    .register_webhook(&stored.tokens, &stored.metadata, &callback)
                    .await
                {
                    Ok(Some(registration)) => {
                        let sub = WebhookSubscription::from_registration(&stored, registration, now)?;
                        self.store.upsert_webhook_subscription(&sub).await?;
                        tracing::info!(%provider, "webhook registered");
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(%provider, error = %e, "webhook registration failed");
                    }
                }
            }
        }

        tracing::info!(%provider, integration_id = %stored.id, "integration connected");
        Ok(stored)
    }

    /// Record a webhook the user created on the provider side (e.g. copied signing secret).
    #[tracing::instrument(level = "info", skip(self, registration))]
    pub async fn add_webhook_subscription(
        &self,
        user_id: UserId,
        provider: ProviderId,
        registration: WebhookRegistration,
    ) -> Result<WebhookSubscription> {
        let integration = self
            .store
            .get_integration(user_id, provider)
            .await?
            .ok_or(Error::NotConnected(provider))?;
        let sub = WebhookSubscription::from_registration(&integration, registration, Utc::now())?;
        self.store.upsert_webhook_subscription(&sub).await?;
        self.store
            .get_webhook_subscription(integration.id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("webhook subscription for {provider}")))
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn disconnect(&self, user_id: UserId, provider: ProviderId) -> Result<()> {
        let integration = self
            .store
            .get_integration(user_id, provider)
            .await?
            .ok_or(Error::NotConnected(provider))?;
        self.store.delete_integration(integration.id).await
    }

    pub async fn list_integrations(&self, user_id: UserId) -> Result<Vec<Integration>> {
        self.store.list_integrations(user_id).await
    }
}

fn merge_account(metadata: &mut serde_json::Value, account: &AccountInfo) {
    let Some(obj) = metadata.as_object_mut() else {
        return;
    };
    if let Some(name) = &account.account_name {
        obj.insert("account_name".into(), serde_json::Value::String(name.clone()));
    }
    if let Some(email) = &account.account_email {
        obj.insert("account_email".into(), serde_json::Value::String(email.clone()));
    }
    if let Some(extra) = account.extra.as_object() {
        for (k, v) in extra {
            obj.insert(k.clone(), v.clone());
        }
    }
}
