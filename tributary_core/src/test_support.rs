//! Scripted adapter and pipeline doubles for engine tests.

use crate::models::{ProviderId, UserId};
use crate::store::sqlite::SqliteSyncStore;
use crate::store::traits::SyncStore;
use crate::sync::models::{
    AuthMethod, Integration, ItemType, PipelineOutput, ProcessingHints, ProviderDefinition,
    ProviderFeatures, StandardIngestItem, SyncBatch, SyncMethod, SyncOptions, TokenSet,
    WebhookRegistration, WebhookRequest,
};
use crate::sync::traits::{IngestionPipeline, PipelineContext, ProviderAdapter, SyncContext};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const FAKE_SIGNATURE_HEADER: &str = "x-fake-signature";
pub const FAKE_EVENT_HEADER: &str = "x-fake-event";

pub enum ScriptedSync {
    Batch(SyncBatch),
    Fail(u16),
}

/// Adapter whose `sync` replays scripted batches and records what it was called with.
pub struct FakeAdapter {
    definition: ProviderDefinition,
    script: Mutex<VecDeque<ScriptedSync>>,
    pub sync_calls: Mutex<Vec<(SyncOptions, String)>>,
    pub refresh_calls: AtomicUsize,
    refreshed_tokens: Option<TokenSet>,
    sync_delay: Duration,
    registration: Option<WebhookRegistration>,
}

impl FakeAdapter {
    pub fn new(provider: ProviderId) -> Self {
        Self {
            definition: ProviderDefinition {
                id: provider,
                name: "Fake",
                auth_method: AuthMethod::Oauth2,
                item_types: vec![ItemType::Note],
                sync_method: SyncMethod::Pull,
                default_sync_interval_secs: Some(3600),
                features: ProviderFeatures {
                    realtime: true,
                    bidirectional: false,
                    incremental_sync: true,
                    webhooks: true,
                },
                webhook_signature_header: Some(FAKE_SIGNATURE_HEADER),
                webhook_events: vec!["item.created"],
            },
            script: Mutex::new(VecDeque::new()),
            sync_calls: Mutex::new(Vec::new()),
            refresh_calls: AtomicUsize::new(0),
            refreshed_tokens: None,
            sync_delay: Duration::ZERO,
            registration: None,
        }
    }

    pub fn with_auth_method(mut self, auth: AuthMethod) -> Self {
        self.definition.auth_method = auth;
        self
    }

    pub fn with_batch(self, batch: SyncBatch) -> Self {
        self.push(ScriptedSync::Batch(batch));
        self
    }

    pub fn with_failure(self, status: u16) -> Self {
        self.push(ScriptedSync::Fail(status));
        self
    }

    pub fn with_refresh(mut self, tokens: TokenSet) -> Self {
        self.refreshed_tokens = Some(tokens);
        self
    }

    pub fn with_sync_delay(mut self, delay: Duration) -> Self {
        self.sync_delay = delay;
        self
    }

    pub fn with_registration(mut self, registration: WebhookRegistration) -> Self {
        self.registration = Some(registration);
        self
    }

    pub fn without_interval(mut self) -> Self {
        self.definition.default_sync_interval_secs = None;
        self
    }

    pub fn push(&self, step: ScriptedSync) {
        self.script.lock().unwrap().push_back(step);
    }

    pub fn sync_count(&self) -> usize {
        self.sync_calls.lock().unwrap().len()
    }

    pub fn last_options(&self) -> Option<SyncOptions> {
        self.sync_calls.lock().unwrap().last().map(|(o, _)| o.clone())
    }
}

#[async_trait]
impl ProviderAdapter for FakeAdapter {
    fn definition(&self) -> &ProviderDefinition {
        &self.definition
    }

    fn authorization_url(&self, state: &str) -> Result<String> {
        Ok(format!("https://fake.example/oauth?state={state}"))
    }

    async fn exchange_code_for_tokens(&self, code: &str) -> Result<TokenSet> {
        if code == "bad" {
            return Err(Error::provider_api(self.id(), Some(400), "invalid_grant"));
        }
        Ok(TokenSet {
            access_token: format!("at-{code}"),
            refresh_token: Some(format!("rt-{code}")),
            expires_at: None,
        })
    }

    async fn refresh_access_token(&self, _refresh_token: &str) -> Result<TokenSet> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.refreshed_tokens
            .clone()
            .ok_or_else(|| Error::token_refresh(self.id(), "invalid_grant"))
    }

    async fn validate_connection(&self, tokens: &TokenSet) -> Result<bool> {
        Ok(tokens.access_token != "rejected")
    }

    async fn sync(&self, ctx: &SyncContext, options: &SyncOptions) -> Result<SyncBatch> {
        self.sync_calls
            .lock()
            .unwrap()
            .push((options.clone(), ctx.tokens.access_token.clone()));
        if !self.sync_delay.is_zero() {
            tokio::time::sleep(self.sync_delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(ScriptedSync::Batch(b)) => Ok(b),
            Some(ScriptedSync::Fail(status)) => {
                Err(Error::provider_api(self.id(), Some(status), "scripted failure"))
            }
            None => Ok(SyncBatch::default()),
        }
    }

    fn webhook_event(&self, request: &WebhookRequest) -> Option<String> {
        request.header(FAKE_EVENT_HEADER).map(str::to_string)
    }

    fn webhook_id(&self, request: &WebhookRequest) -> Option<String> {
        request
            .json()
            .ok()?
            .get("hook_id")?
            .as_str()
            .map(str::to_string)
    }

    /// Body: `{"items": [{"id": "...", "content": "...", "ts": "<rfc3339>"}]}`.
    async fn handle_webhook(
        &self,
        _ctx: &SyncContext,
        request: &WebhookRequest,
        _event: &str,
    ) -> Result<Vec<StandardIngestItem>> {
        let body = request.json()?;
        let Some(items) = body.get("items").and_then(|v| v.as_array()) else {
            return Err(Error::InvalidInput("missing items".to_string()));
        };
        let mut out = Vec::with_capacity(items.len());
        for it in items {
            let id = it.get("id").and_then(|v| v.as_str()).unwrap_or_default();
            let content = it.get("content").and_then(|v| v.as_str()).unwrap_or_default();
            let mut item = note(self.id(), id, content, None)?;
            if let Some(ts) = it.get("ts").and_then(|v| v.as_str()) {
                let ts = ts
                    .parse::<DateTime<Utc>>()
                    .map_err(|e| Error::InvalidInput(e.to_string()))?;
                item = item.with_timestamp(ts);
            }
            out.push(item);
        }
        Ok(out)
    }

    async fn register_webhook(
        &self,
        _tokens: &TokenSet,
        _metadata: &serde_json::Value,
        callback_url: &str,
    ) -> Result<Option<WebhookRegistration>> {
        Ok(self.registration.clone().map(|mut r| {
            r.webhook_url = Some(callback_url.to_string());
            r
        }))
    }
}

/// Note item with `extract_memories` set, optionally timestamped.
pub fn note(
    provider: ProviderId,
    source_id: &str,
    content: &str,
    ts: Option<DateTime<Utc>>,
) -> Result<StandardIngestItem> {
    let mut item = StandardIngestItem::new(provider, source_id, ItemType::Note, content)?
        .with_hints(ProcessingHints {
            extract_tasks: false,
            extract_memories: true,
        });
    item.metadata.timestamp = ts;
    Ok(item)
}

/// Pipeline that fails for the configured source ids and records a capture id otherwise.
#[derive(Default)]
pub struct FailingPipeline {
    fail_source_ids: HashSet<String>,
    pub calls: AtomicUsize,
}

impl FailingPipeline {
    pub fn failing_on(ids: &[&str]) -> Self {
        Self {
            fail_source_ids: ids.iter().map(|s| s.to_string()).collect(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl IngestionPipeline for FailingPipeline {
    async fn process(
        &self,
        _ctx: &PipelineContext,
        item: &StandardIngestItem,
    ) -> Result<PipelineOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_source_ids.contains(&item.source_id) {
            return Err(Error::BackendMessage(format!(
                "pipeline rejected {}",
                item.source_id
            )));
        }
        Ok(PipelineOutput {
            capture_id: Some(Uuid::new_v4()),
            memory_ids: vec![],
            task_ids: vec![],
        })
    }
}

/// In-memory store with one connected integration for `provider`.
pub async fn store_with_integration(
    provider: ProviderId,
    tokens: TokenSet,
) -> (Arc<SqliteSyncStore>, Integration) {
    let store = Arc::new(SqliteSyncStore::in_memory().await.unwrap());
    let integration = Integration::new(
        UserId(Uuid::new_v4()),
        provider,
        tokens,
        serde_json::json!({}),
        None,
    )
    .unwrap();
    let integration = store.upsert_integration(&integration).await.unwrap();
    store
        .ensure_sync_state(&integration, Utc::now())
        .await
        .unwrap();
    (store, integration)
}
