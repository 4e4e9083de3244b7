use crate::models::{IntegrationId, ProviderId, UserId};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// OAuth / API-key credentials for one integration.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenSet {
    pub fn api_key(key: impl Into<String>) -> Self {
        Self {
            access_token: key.into(),
            refresh_token: None,
            expires_at: None,
        }
    }
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A user's connection to one provider. Unique per (user, provider).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Integration {
    pub id: IntegrationId,
    pub user_id: UserId,
    pub provider: ProviderId,
    #[serde(skip_serializing)]
    pub tokens: TokenSet,
    /// Opaque provider metadata (account info, selected repo/team, ...).
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Integration {
    #[tracing::instrument(level = "debug", skip(tokens, metadata))]
    pub fn new(
        user_id: UserId,
        provider: ProviderId,
        tokens: TokenSet,
        metadata: serde_json::Value,
        now: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        if tokens.access_token.trim().is_empty() {
            return Err(Error::InvalidInput("access token is empty".to_string()));
        }
        let now = now.unwrap_or_else(Utc::now);
        Ok(Self {
            id: IntegrationId::new(),
            user_id,
            provider,
            tokens,
            metadata,
            created_at: now,
            updated_at: now,
        })
    }

    /// True when the access token expires within `buffer` of `now` and can be refreshed.
    pub fn needs_refresh(&self, buffer: Duration, now: DateTime<Utc>) -> bool {
        match (self.tokens.expires_at, &self.tokens.refresh_token) {
            (Some(expires_at), Some(_)) => expires_at - now <= buffer,
            _ => false,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Completed,
    Failed,
    Paused,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
            SyncStatus::Paused => "paused",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncStatus::Pending),
            "syncing" => Some(SyncStatus::Syncing),
            "completed" => Some(SyncStatus::Completed),
            "failed" => Some(SyncStatus::Failed),
            "paused" => Some(SyncStatus::Paused),
            _ => None,
        }
    }
}

/// Persisted per-integration sync progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub id: Uuid,
    pub user_id: UserId,
    pub integration_id: IntegrationId,
    pub provider: ProviderId,
    pub status: SyncStatus,
    pub cursor: Option<String>,
    pub last_item_id: Option<String>,
    pub last_item_timestamp: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_successful_sync_at: Option<DateTime<Utc>>,
    pub next_sync_at: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub total_items_synced: u64,
    pub items_synced_this_run: u64,
    /// Lease start of the run currently holding `syncing`.
    pub sync_started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl SyncState {
    pub fn new_pending(integration: &Integration, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: integration.user_id,
            integration_id: integration.id,
            provider: integration.provider,
            status: SyncStatus::Pending,
            cursor: None,
            last_item_id: None,
            last_item_timestamp: None,
            last_sync_at: None,
            last_successful_sync_at: None,
            // Newly connected integrations are due immediately.
            next_sync_at: Some(now),
            error_count: 0,
            last_error: None,
            last_error_at: None,
            total_items_synced: 0,
            items_synced_this_run: 0,
            sync_started_at: None,
            updated_at: now,
        }
    }
}

/// Forward-only progress marker derived from a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorAdvance {
    pub last_item_id: String,
    pub last_item_timestamp: DateTime<Utc>,
}

impl CursorAdvance {
    /// The item with the greatest metadata timestamp (first wins on ties).
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a StandardIngestItem>) -> Option<Self> {
        let mut best: Option<CursorAdvance> = None;
        for item in items {
            let Some(ts) = item.metadata.timestamp else {
                continue;
            };
            if best.as_ref().map_or(true, |b| ts > b.last_item_timestamp) {
                best = Some(CursorAdvance {
                    last_item_id: item.source_id.clone(),
                    last_item_timestamp: ts,
                });
            }
        }
        best
    }

    /// Progress over the items that succeeded, held strictly below the earliest failed item so a
    /// fetch filtered on the stored timestamp returns the failures again.
    pub fn before_failures<'a>(
        succeeded: impl IntoIterator<Item = &'a StandardIngestItem>,
        failed: impl IntoIterator<Item = &'a StandardIngestItem>,
    ) -> Option<Self> {
        let floor = failed.into_iter().filter_map(|i| i.metadata.timestamp).min();
        Self::from_items(
            succeeded
                .into_iter()
                .filter(|i| match (floor, i.metadata.timestamp) {
                    (Some(floor), Some(ts)) => ts < floor,
                    _ => true,
                }),
        )
    }

    pub fn max(a: Option<Self>, b: Option<Self>) -> Option<Self> {
        match (a, b) {
            (Some(a), Some(b)) => Some(if b.last_item_timestamp > a.last_item_timestamp {
                b
            } else {
                a
            }),
            (a, b) => a.or(b),
        }
    }
}

/// Everything persisted when a run completes successfully.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncCompletion {
    /// Replaces the stored cursor when set; `None` keeps it (unless `full_sync`).
    pub cursor: Option<String>,
    pub advance: Option<CursorAdvance>,
    pub items_synced: u64,
    /// Allows cursor and item timestamp to move backward.
    pub full_sync: bool,
    pub next_sync_at: Option<DateTime<Utc>>,
    /// Lease start this run won with; the write is dropped if another run has since taken over.
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Caller-controlled knobs for a sync run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    pub cursor: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub full_sync: bool,
    /// Decide created/updated/unchanged but skip pipeline dispatch.
    pub dry_run: bool,
}

/// One bounded batch returned by `ProviderAdapter::sync`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncBatch {
    pub items: Vec<StandardIngestItem>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncItemError {
    pub source_id: Option<String>,
    pub message: String,
    pub recoverable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    pub items_processed: u64,
    pub items_created: u64,
    pub items_updated: u64,
    /// Previously failed items processed again with unchanged content.
    pub items_retried: u64,
    pub items_skipped: u64,
    pub items_failed: u64,
    pub has_more: bool,
    pub errors: Vec<SyncItemError>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Note,
    Highlight,
    Document,
    Event,
    Meeting,
    Message,
    Email,
    Issue,
    PullRequest,
    Comment,
    Task,
    Payment,
    Other,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Note => "note",
            ItemType::Highlight => "highlight",
            ItemType::Document => "document",
            ItemType::Event => "event",
            ItemType::Meeting => "meeting",
            ItemType::Message => "message",
            ItemType::Email => "email",
            ItemType::Issue => "issue",
            ItemType::PullRequest => "pull_request",
            ItemType::Comment => "comment",
            ItemType::Task => "task",
            ItemType::Payment => "payment",
            ItemType::Other => "other",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "note" => Some(ItemType::Note),
            "highlight" => Some(ItemType::Highlight),
            "document" => Some(ItemType::Document),
            "event" => Some(ItemType::Event),
            "meeting" => Some(ItemType::Meeting),
            "message" => Some(ItemType::Message),
            "email" => Some(ItemType::Email),
            "issue" => Some(ItemType::Issue),
            "pull_request" => Some(ItemType::PullRequest),
            "comment" => Some(ItemType::Comment),
            "task" => Some(ItemType::Task),
            "payment" => Some(ItemType::Payment),
            "other" => Some(ItemType::Other),
            _ => None,
        }
    }

    /// Item types that are themselves actionable work.
    pub fn is_actionable(&self) -> bool {
        matches!(
            self,
            ItemType::Issue | ItemType::PullRequest | ItemType::Task
        )
    }
}

/// Typed provider details for well-known item types.
///
/// Anything not covered here goes into `ItemMetadata::custom`; each adapter documents the keys
/// it writes there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemDetails {
    Highlight {
        book_title: Option<String>,
        book_author: Option<String>,
        location: Option<i64>,
        note: Option<String>,
    },
    Event {
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        attendees: Vec<String>,
        location: Option<String>,
        status: Option<String>,
    },
    Issue {
        identifier: String,
        state: Option<String>,
        assignee: Option<String>,
        labels: Vec<String>,
        repository: Option<String>,
    },
    Message {
        channel: Option<String>,
        thread_id: Option<String>,
    },
    Payment {
        amount_minor: i64,
        currency: String,
        status: Option<String>,
        customer: Option<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemMetadata {
    /// Source-side last-modified time; drives incremental cursors.
    pub timestamp: Option<DateTime<Utc>>,
    pub author: Option<String>,
    pub tags: Vec<String>,
    pub details: Option<ItemDetails>,
    pub custom: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingHints {
    pub extract_tasks: bool,
    pub extract_memories: bool,
}

impl ProcessingHints {
    pub fn any(&self) -> bool {
        self.extract_tasks || self.extract_memories
    }
}

/// Provider-agnostic representation of one external record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardIngestItem {
    pub source_provider: ProviderId,
    pub source_id: String,
    pub source_url: Option<String>,
    #[serde(rename = "type")]
    pub item_type: ItemType,
    pub title: Option<String>,
    pub content: String,
    pub summary: Option<String>,
    pub metadata: ItemMetadata,
    pub processing_hints: ProcessingHints,
    #[serde(default)]
    pub raw_data: Option<serde_json::Value>,
}

impl StandardIngestItem {
    #[tracing::instrument(level = "debug", skip(content))]
    pub fn new(
        source_provider: ProviderId,
        source_id: impl Into<String> + std::fmt::Debug,
        item_type: ItemType,
        content: impl Into<String>,
    ) -> Result<Self> {
        let source_id = source_id.into();
        if source_id.trim().is_empty() {
            return Err(Error::InvalidInput("item source_id is empty".to_string()));
        }
        Ok(Self {
            source_provider,
            source_id,
            source_url: None,
            item_type,
            title: None,
            content: content.into(),
            summary: None,
            metadata: ItemMetadata::default(),
            processing_hints: ProcessingHints::default(),
            raw_data: None,
        })
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_url(mut self, url: Option<String>) -> Self {
        self.source_url = url;
        self
    }

    pub fn with_summary(mut self, summary: Option<String>) -> Self {
        self.summary = summary;
        self
    }

    pub fn with_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.metadata.timestamp = Some(ts);
        self
    }

    pub fn with_author(mut self, author: Option<String>) -> Self {
        self.metadata.author = author;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.metadata.tags = tags;
        self
    }

    pub fn with_details(mut self, details: ItemDetails) -> Self {
        self.metadata.details = Some(details);
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.custom.insert(key.into(), value);
        self
    }

    pub fn with_hints(mut self, hints: ProcessingHints) -> Self {
        self.processing_hints = hints;
        self
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw_data = Some(raw);
        self
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestedItemStatus {
    Pending,
    Processed,
    Skipped,
    Failed,
}

impl IngestedItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestedItemStatus::Pending => "pending",
            IngestedItemStatus::Processed => "processed",
            IngestedItemStatus::Skipped => "skipped",
            IngestedItemStatus::Failed => "failed",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(IngestedItemStatus::Pending),
            "processed" => Some(IngestedItemStatus::Processed),
            "skipped" => Some(IngestedItemStatus::Skipped),
            "failed" => Some(IngestedItemStatus::Failed),
            _ => None,
        }
    }
}

/// Dedup ledger row, unique on (integration_id, source_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestedItem {
    pub id: Uuid,
    pub user_id: UserId,
    pub integration_id: IntegrationId,
    pub provider: ProviderId,
    pub source_id: String,
    pub source_hash: String,
    pub source_url: Option<String>,
    pub item_type: ItemType,
    pub title: Option<String>,
    pub content: String,
    pub capture_id: Option<Uuid>,
    pub memory_ids: Vec<Uuid>,
    pub task_ids: Vec<Uuid>,
    pub status: IngestedItemStatus,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub raw_data: Option<serde_json::Value>,
    pub metadata: ItemMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IngestedItem {
    /// Fresh `pending` row for `item` (the store decides whether it is inserted).
    pub fn from_item(
        integration: &Integration,
        item: &StandardIngestItem,
        source_hash: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: integration.user_id,
            integration_id: integration.id,
            provider: integration.provider,
            source_id: item.source_id.clone(),
            source_hash,
            source_url: item.source_url.clone(),
            item_type: item.item_type,
            title: item.title.clone(),
            content: item.content.clone(),
            capture_id: None,
            memory_ids: Vec::new(),
            task_ids: Vec::new(),
            status: IngestedItemStatus::Pending,
            processed_at: None,
            error: None,
            raw_data: item.raw_data.clone(),
            metadata: item.metadata.clone(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Result of the dedup upsert.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created(Uuid),
    Updated(Uuid),
    /// Same hash as a row whose pipeline run failed; re-admitted for another attempt.
    Retried(Uuid),
    Unchanged(Uuid),
}

impl UpsertOutcome {
    pub fn id(&self) -> Uuid {
        match self {
            UpsertOutcome::Created(id)
            | UpsertOutcome::Updated(id)
            | UpsertOutcome::Retried(id)
            | UpsertOutcome::Unchanged(id) => *id,
        }
    }
}

/// Records derived from one ingested item by the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub capture_id: Option<Uuid>,
    pub memory_ids: Vec<Uuid>,
    pub task_ids: Vec<Uuid>,
}

impl PipelineOutput {
    pub fn is_empty(&self) -> bool {
        self.capture_id.is_none() && self.memory_ids.is_empty() && self.task_ids.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub user_id: UserId,
    pub integration_id: IntegrationId,
    pub provider: ProviderId,
    /// Provider-side hook id, used to route deliveries.
    pub webhook_id: Option<String>,
    pub webhook_url: Option<String>,
    #[serde(skip_serializing)]
    pub secret: String,
    pub events: Vec<String>,
    pub is_active: bool,
    pub verified_at: Option<DateTime<Utc>>,
    pub last_received_at: Option<DateTime<Utc>>,
    pub delivery_count: u64,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookSubscription {
    pub fn from_registration(
        integration: &Integration,
        registration: WebhookRegistration,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if registration.secret.trim().is_empty() {
            return Err(Error::InvalidInput("webhook secret is empty".to_string()));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            user_id: integration.user_id,
            integration_id: integration.id,
            provider: integration.provider,
            webhook_id: registration.webhook_id,
            webhook_url: registration.webhook_url,
            secret: registration.secret,
            events: registration.events,
            is_active: true,
            verified_at: None,
            last_received_at: None,
            delivery_count: 0,
            error_count: 0,
            last_error: None,
            last_error_at: None,
            created_at: now,
            updated_at: now,
        })
    }
}

/// What a provider hands back after creating a webhook on its side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookRegistration {
    pub webhook_id: Option<String>,
    pub webhook_url: Option<String>,
    pub secret: String,
    pub events: Vec<String>,
}

/// Raw inbound webhook delivery. Header names are lowercased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookRequest {
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl WebhookRequest {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn json(&self) -> Result<serde_json::Value> {
        serde_json::from_slice(&self.body)
            .map_err(|e| Error::InvalidInput(format!("webhook body is not valid json: {e}")))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub account_name: Option<String>,
    pub account_email: Option<String>,
    #[serde(default)]
    pub extra: serde_json::Value,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Oauth2,
    ApiKey,
    Custom,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMethod {
    Pull,
    Webhook,
    Push,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderFeatures {
    pub realtime: bool,
    pub bidirectional: bool,
    pub incremental_sync: bool,
    pub webhooks: bool,
}

/// Declarative capability metadata published by each adapter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderDefinition {
    pub id: ProviderId,
    pub name: &'static str,
    pub auth_method: AuthMethod,
    pub item_types: Vec<ItemType>,
    pub sync_method: SyncMethod,
    /// `None` for providers that are never scheduled (push/webhook only).
    pub default_sync_interval_secs: Option<u64>,
    pub features: ProviderFeatures,
    /// Header carrying the HMAC signature on webhook deliveries.
    pub webhook_signature_header: Option<&'static str>,
    pub webhook_events: Vec<&'static str>,
}

impl ProviderDefinition {
    pub fn default_sync_interval(&self) -> Option<Duration> {
        self.default_sync_interval_secs
            .map(|secs| Duration::seconds(secs as i64))
    }

    pub fn supports_event(&self, event: &str) -> bool {
        self.webhook_events.iter().any(|e| *e == event)
    }
}

/// Read-only view for the sync-status query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatusView {
    pub provider: ProviderId,
    pub integration_id: IntegrationId,
    pub state: SyncState,
    pub definition: Option<ProviderDefinition>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn item(id: &str, ts: Option<DateTime<Utc>>) -> StandardIngestItem {
        let mut it = StandardIngestItem::new(ProviderId::Readwise, id, ItemType::Note, "x").unwrap();
        it.metadata.timestamp = ts;
        it
    }

    #[test]
    fn cursor_advance_picks_latest_timestamp() {
        let t1 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();
        let t3 = Utc.with_ymd_and_hms(2026, 1, 3, 0, 0, 0).unwrap();
        let items = vec![
            item("b", Some(t2)),
            item("c", Some(t3)),
            item("none", None),
            item("a", Some(t1)),
        ];
        let adv = CursorAdvance::from_items(&items).unwrap();
        assert_eq!(adv.last_item_id, "c");
        assert_eq!(adv.last_item_timestamp, t3);
    }

    #[test]
    fn cursor_advance_none_without_timestamps() {
        assert!(CursorAdvance::from_items(&[item("a", None)]).is_none());
    }

    #[test]
    fn cursor_advance_stops_below_earliest_failure() {
        let t1 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();
        let t3 = Utc.with_ymd_and_hms(2026, 1, 3, 0, 0, 0).unwrap();
        let ok = vec![item("a", Some(t1)), item("c", Some(t3))];
        let failed = vec![item("b", Some(t2)), item("undated", None)];

        let adv = CursorAdvance::before_failures(&ok, &failed).unwrap();
        assert_eq!(adv.last_item_id, "a");
        assert!(CursorAdvance::before_failures(&ok[1..], &failed).is_none());
        let adv = CursorAdvance::before_failures(&ok, &failed[1..]).unwrap();
        assert_eq!(adv.last_item_id, "c");
    }

    #[test]
    fn needs_refresh_requires_refresh_token_and_buffer() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let mut integ = Integration::new(
            UserId(Uuid::new_v4()),
            ProviderId::GoogleCalendar,
            TokenSet {
                access_token: "at".into(),
                refresh_token: Some("rt".into()),
                expires_at: Some(now + Duration::minutes(4)),
            },
            serde_json::json!({}),
            Some(now),
        )
        .unwrap();
        assert!(integ.needs_refresh(Duration::minutes(5), now));

        integ.tokens.expires_at = Some(now + Duration::minutes(30));
        assert!(!integ.needs_refresh(Duration::minutes(5), now));

        integ.tokens.expires_at = Some(now - Duration::minutes(1));
        integ.tokens.refresh_token = None;
        assert!(!integ.needs_refresh(Duration::minutes(5), now));
    }

    #[test]
    fn token_debug_is_redacted() {
        let t = TokenSet {
            access_token: "super-secret".into(),
            refresh_token: Some("also-secret".into()),
            expires_at: None,
        };
        let s = format!("{t:?}");
        assert!(!s.contains("super-secret"));
        assert!(!s.contains("also-secret"));
    }

    #[test]
    fn item_details_are_tagged() {
        let d = ItemDetails::Payment {
            amount_minor: 1250,
            currency: "usd".into(),
            status: Some("succeeded".into()),
            customer: None,
        };
        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v["kind"], "payment");
        assert_eq!(v["amount_minor"], 1250);
    }

    #[test]
    fn empty_source_id_is_rejected() {
        assert!(StandardIngestItem::new(ProviderId::Github, "  ", ItemType::Issue, "x").is_err());
    }
}
