use crate::models::{IntegrationId, ProviderId, UserId};
use crate::sync::models::{
    CursorAdvance, IngestedItem, IngestedItemStatus, Integration, ItemType, PipelineOutput,
    SyncCompletion, SyncState, TokenSet, UpsertOutcome, WebhookSubscription,
};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Run-level failure persisted on the sync state.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncFailure {
    pub error: String,
    /// Progress from items already processed before the abort.
    pub advance: Option<CursorAdvance>,
    pub items_synced: u64,
    pub next_sync_at: Option<DateTime<Utc>>,
    /// Lease start this run won with; see [`SyncCompletion::started_at`].
    pub started_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
}

/// Durable state for integrations, sync progress, the dedup ledger and webhooks.
///
/// Implementations must make `try_start_sync` and `upsert_ingested_item` atomic: they are the
/// only concurrency control between runs and webhook deliveries, including across processes.
#[async_trait]
pub trait SyncStore: Send + Sync {
    // Integrations
    /// Insert or replace the (user, provider) integration, returning the stored row.
    async fn upsert_integration(&self, integration: &Integration) -> Result<Integration>;
    async fn get_integration(
        &self,
        user_id: UserId,
        provider: ProviderId,
    ) -> Result<Option<Integration>>;
    async fn get_integration_by_id(&self, id: IntegrationId) -> Result<Option<Integration>>;
    async fn list_integrations(&self, user_id: UserId) -> Result<Vec<Integration>>;
    async fn update_tokens(
        &self,
        id: IntegrationId,
        tokens: &TokenSet,
        now: DateTime<Utc>,
    ) -> Result<()>;
    /// Deletes the integration with its sync state, ingested items and webhook subscriptions.
    async fn delete_integration(&self, id: IntegrationId) -> Result<()>;

    // Sync state
    /// Create the `pending` state if missing; returns the current state either way.
    async fn ensure_sync_state(
        &self,
        integration: &Integration,
        now: DateTime<Utc>,
    ) -> Result<SyncState>;
    async fn get_sync_state(&self, integration_id: IntegrationId) -> Result<Option<SyncState>>;
    async fn list_sync_states(&self, user_id: UserId) -> Result<Vec<SyncState>>;
    /// Compare-and-set into `syncing`. True only for the caller that won the transition.
    async fn try_start_sync(
        &self,
        integration_id: IntegrationId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool>;
    /// Release the lease as `completed`. Only applies while the lease started at
    /// `completion.started_at` is still held.
    async fn complete_sync(
        &self,
        integration_id: IntegrationId,
        completion: &SyncCompletion,
    ) -> Result<()>;
    async fn fail_sync(&self, integration_id: IntegrationId, failure: &SyncFailure) -> Result<()>;
    /// Record an error outside a run (e.g. token refresh). No-op while a run holds the lease.
    async fn record_sync_error(
        &self,
        integration_id: IntegrationId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;
    /// Pause (only when not syncing) or resume (only when paused). True when the row changed.
    async fn set_paused(
        &self,
        integration_id: IntegrationId,
        paused: bool,
        now: DateTime<Utc>,
    ) -> Result<bool>;
    /// Counter and timestamp touch-ups for webhook-ingested items.
    async fn record_webhook_progress(
        &self,
        integration_id: IntegrationId,
        created: u64,
        advance: Option<&CursorAdvance>,
        now: DateTime<Utc>,
    ) -> Result<()>;
    /// States whose `next_sync_at` has passed, plus abandoned `syncing` leases.
    async fn list_due_sync_states(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SyncState>>;

    // Ingested items
    async fn upsert_ingested_item(&self, item: &IngestedItem) -> Result<UpsertOutcome>;
    async fn get_ingested_item(
        &self,
        integration_id: IntegrationId,
        source_id: &str,
    ) -> Result<Option<IngestedItem>>;
    async fn count_ingested_items(&self, integration_id: IntegrationId) -> Result<u64>;
    async fn mark_item_processed(
        &self,
        id: Uuid,
        output: &PipelineOutput,
        status: IngestedItemStatus,
        now: DateTime<Utc>,
    ) -> Result<()>;
    async fn mark_item_failed(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<()>;

    // Webhook subscriptions
    async fn upsert_webhook_subscription(&self, sub: &WebhookSubscription) -> Result<()>;
    async fn get_webhook_subscription(
        &self,
        integration_id: IntegrationId,
    ) -> Result<Option<WebhookSubscription>>;
    /// Active subscriptions for `provider`, narrowed to `webhook_id` when given.
    async fn list_active_webhook_subscriptions(
        &self,
        provider: ProviderId,
        webhook_id: Option<&str>,
    ) -> Result<Vec<WebhookSubscription>>;
    /// Touch `last_received_at`, bump counters, set `verified_at` on first delivery.
    async fn record_webhook_delivery(
        &self,
        id: Uuid,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub id: Uuid,
    pub user_id: UserId,
    pub integration_id: IntegrationId,
    pub ingested_item_id: Uuid,
    pub provider: ProviderId,
    pub item_type: ItemType,
    pub title: Option<String>,
    pub content: String,
    pub source_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: Uuid,
    pub user_id: UserId,
    pub integration_id: IntegrationId,
    pub ingested_item_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub user_id: UserId,
    pub integration_id: IntegrationId,
    pub ingested_item_id: Uuid,
    pub title: String,
    pub source_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Everything the pipeline derives from one ingested item.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemRecords {
    pub ingested_item_id: Uuid,
    pub capture: CaptureRecord,
    pub memories: Vec<MemoryRecord>,
    pub tasks: Vec<TaskRecord>,
}

/// Product-level records written by the ingestion pipeline.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Atomically drop whatever an earlier attempt wrote for `records.ingested_item_id` and
    /// write `records` in its place. On error nothing from this call is visible.
    async fn replace_item_records(&self, records: &ItemRecords) -> Result<()>;
    async fn list_captures(&self, user_id: UserId) -> Result<Vec<CaptureRecord>>;
    async fn list_memories(&self, user_id: UserId) -> Result<Vec<MemoryRecord>>;
    async fn list_tasks(&self, user_id: UserId) -> Result<Vec<TaskRecord>>;
}
