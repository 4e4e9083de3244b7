//! SQLite-backed `SyncStore` and `RecordSink`.
//!
//! Persists integrations, sync state, the ingested-item ledger, webhook subscriptions and the
//! pipeline's captures/memories/tasks in a single WAL-mode SQLite file.
//!
//! Usage:
//! ```ignore
//! let store = SqliteSyncStore::new("/path/to/tributary.db").await?;
//! ```
//!
//! Timestamps are stored as RFC3339 text with fixed microsecond precision, so SQL string
//! comparison orders them chronologically.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{Error as CoreError, Result as CoreResult};
use crate::models::{IntegrationId, ProviderId, UserId};
use crate::store::secrets::TokenCipher;
use crate::store::traits::{
    CaptureRecord, ItemRecords, MemoryRecord, RecordSink, SyncFailure, SyncStore, TaskRecord,
};
use crate::sync::models::{
    CursorAdvance, IngestedItem, IngestedItemStatus, Integration, ItemType, PipelineOutput,
    SyncCompletion, SyncState, SyncStatus, TokenSet, UpsertOutcome, WebhookSubscription,
};

use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Clone)]
pub struct SqliteSyncStore {
    pool: SqlitePool,
    cipher: Option<TokenCipher>,
}

impl SqliteSyncStore {
    /// Create (or open) a store at the given file path.
    ///
    /// Creates the file and parent directories if they don't exist.
    /// Runs the schema migration on startup.
    pub async fn new(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CoreError::backend("sqlite_sync_store", e))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path.display()))
            .map_err(|e| CoreError::backend("sqlite_sync_store", e))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .map_err(|e| CoreError::backend("sqlite_sync_store", e))?;

        let store = Self { pool, cipher: None };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database. A single connection keeps every query on the same database.
    pub async fn in_memory() -> CoreResult<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| CoreError::backend("sqlite_sync_store", e))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await
            .map_err(|e| CoreError::backend("sqlite_sync_store", e))?;

        let store = Self { pool, cipher: None };
        store.migrate().await?;
        Ok(store)
    }

    /// Encrypt tokens and webhook secrets written from now on.
    pub fn with_cipher(mut self, cipher: TokenCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Apply the schema (idempotent).
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn migrate(&self) -> CoreResult<()> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::backend("sqlite_sync_store_migration", e))?;
        Ok(())
    }

    fn seal(&self, value: &str) -> CoreResult<String> {
        match &self.cipher {
            Some(c) => c.encrypt(value),
            None => Ok(value.to_string()),
        }
    }

    fn open(&self, value: String) -> CoreResult<String> {
        match &self.cipher {
            Some(c) => c.decrypt(&value),
            None => Ok(value),
        }
    }

    fn row_to_integration(&self, r: &SqliteRow) -> CoreResult<Integration> {
        let access_token: String = r.try_get("access_token").map_err(db_err)?;
        let refresh_token: Option<String> = r.try_get("refresh_token").map_err(db_err)?;
        Ok(Integration {
            id: IntegrationId(parse_uuid(&get_str(r, "id")?)?),
            user_id: UserId(parse_uuid(&get_str(r, "user_id")?)?),
            provider: parse_provider(&get_str(r, "provider")?)?,
            tokens: TokenSet {
                access_token: self.open(access_token)?,
                refresh_token: refresh_token.map(|t| self.open(t)).transpose()?,
                expires_at: parse_opt_dt(r.try_get("expires_at").map_err(db_err)?)?,
            },
            metadata: parse_json(&get_str(r, "metadata")?)?,
            created_at: parse_dt(&get_str(r, "created_at")?)?,
            updated_at: parse_dt(&get_str(r, "updated_at")?)?,
        })
    }

    fn row_to_subscription(&self, r: &SqliteRow) -> CoreResult<WebhookSubscription> {
        Ok(WebhookSubscription {
            id: parse_uuid(&get_str(r, "id")?)?,
            user_id: UserId(parse_uuid(&get_str(r, "user_id")?)?),
            integration_id: IntegrationId(parse_uuid(&get_str(r, "integration_id")?)?),
            provider: parse_provider(&get_str(r, "provider")?)?,
            webhook_id: r.try_get("webhook_id").map_err(db_err)?,
            webhook_url: r.try_get("webhook_url").map_err(db_err)?,
            secret: self.open(get_str(r, "secret")?)?,
            events: parse_json(&get_str(r, "events")?)?,
            is_active: r.try_get::<i64, _>("is_active").map_err(db_err)? != 0,
            verified_at: parse_opt_dt(r.try_get("verified_at").map_err(db_err)?)?,
            last_received_at: parse_opt_dt(r.try_get("last_received_at").map_err(db_err)?)?,
            delivery_count: get_u64(r, "delivery_count")?,
            error_count: get_u64(r, "error_count")? as u32,
            last_error: r.try_get("last_error").map_err(db_err)?,
            last_error_at: parse_opt_dt(r.try_get("last_error_at").map_err(db_err)?)?,
            created_at: parse_dt(&get_str(r, "created_at")?)?,
            updated_at: parse_dt(&get_str(r, "updated_at")?)?,
        })
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS integrations (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    access_token TEXT NOT NULL,
    refresh_token TEXT,
    expires_at TEXT,
    metadata TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (user_id, provider)
);

CREATE TABLE IF NOT EXISTS integration_sync_state (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    integration_id TEXT NOT NULL UNIQUE,
    provider TEXT NOT NULL,
    status TEXT NOT NULL,
    last_sync_at TEXT,
    next_sync_at TEXT,
    last_successful_sync_at TEXT,
    cursor TEXT,
    last_item_id TEXT,
    last_item_timestamp TEXT,
    error_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    last_error_at TEXT,
    total_items_synced INTEGER NOT NULL DEFAULT 0,
    items_synced_this_run INTEGER NOT NULL DEFAULT 0,
    sync_started_at TEXT,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS sync_state_user_idx ON integration_sync_state(user_id);
CREATE INDEX IF NOT EXISTS sync_state_due_idx ON integration_sync_state(status, next_sync_at);

CREATE TABLE IF NOT EXISTS ingested_items (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    integration_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    source_id TEXT NOT NULL,
    source_hash TEXT NOT NULL,
    source_url TEXT,
    item_type TEXT NOT NULL,
    title TEXT,
    content TEXT NOT NULL,
    capture_id TEXT,
    memory_ids TEXT NOT NULL,
    task_ids TEXT NOT NULL,
    status TEXT NOT NULL,
    processed_at TEXT,
    error TEXT,
    raw_data TEXT,
    metadata TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (integration_id, source_id)
);

CREATE TABLE IF NOT EXISTS webhook_subscriptions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    integration_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    webhook_id TEXT,
    webhook_url TEXT,
    secret TEXT NOT NULL,
    events TEXT NOT NULL,
    is_active INTEGER NOT NULL,
    verified_at TEXT,
    last_received_at TEXT,
    delivery_count INTEGER NOT NULL DEFAULT 0,
    error_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    last_error_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (integration_id, provider)
);

CREATE INDEX IF NOT EXISTS webhook_subscriptions_provider_idx
    ON webhook_subscriptions(provider, webhook_id);

CREATE TABLE IF NOT EXISTS captures (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    integration_id TEXT NOT NULL,
    ingested_item_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    item_type TEXT NOT NULL,
    title TEXT,
    content TEXT NOT NULL,
    source_url TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    integration_id TEXT NOT NULL,
    ingested_item_id TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    integration_id TEXT NOT NULL,
    ingested_item_id TEXT NOT NULL,
    title TEXT NOT NULL,
    source_url TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS captures_user_idx ON captures(user_id, created_at);
CREATE INDEX IF NOT EXISTS memories_user_idx ON memories(user_id, created_at);
CREATE INDEX IF NOT EXISTS tasks_user_idx ON tasks(user_id, created_at);
CREATE UNIQUE INDEX IF NOT EXISTS captures_item_idx ON captures(ingested_item_id);
CREATE INDEX IF NOT EXISTS memories_item_idx ON memories(ingested_item_id);
CREATE INDEX IF NOT EXISTS tasks_item_idx ON tasks(ingested_item_id);
"#;

const SYNC_STATE_COLUMNS: &str = "id, user_id, integration_id, provider, status, last_sync_at, \
     next_sync_at, last_successful_sync_at, cursor, last_item_id, last_item_timestamp, \
     error_count, last_error, last_error_at, total_items_synced, items_synced_this_run, \
     sync_started_at, updated_at";

const ITEM_COLUMNS: &str = "id, user_id, integration_id, provider, source_id, source_hash, \
     source_url, item_type, title, content, capture_id, memory_ids, task_ids, status, \
     processed_at, error, raw_data, metadata, created_at, updated_at";

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, integration_id, provider, webhook_id, \
     webhook_url, secret, events, is_active, verified_at, last_received_at, delivery_count, \
     error_count, last_error, last_error_at, created_at, updated_at";

fn db_err(e: sqlx::Error) -> CoreError {
    CoreError::backend("sqlite_sync_store", e)
}

pub(crate) fn fmt_dt(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_dt(s: &str) -> CoreResult<DateTime<Utc>> {
    s.parse::<DateTime<Utc>>()
        .map_err(|e| CoreError::BackendMessage(format!("invalid stored timestamp {s:?}: {e}")))
}

fn parse_opt_dt(s: Option<String>) -> CoreResult<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_dt).transpose()
}

fn parse_uuid(s: &str) -> CoreResult<Uuid> {
    Uuid::parse_str(s)
        .map_err(|e| CoreError::BackendMessage(format!("invalid stored uuid {s:?}: {e}")))
}

fn parse_provider(s: &str) -> CoreResult<ProviderId> {
    ProviderId::parse_str(s)
        .ok_or_else(|| CoreError::BackendMessage(format!("unknown stored provider {s:?}")))
}

fn parse_json<T: DeserializeOwned>(s: &str) -> CoreResult<T> {
    serde_json::from_str(s).map_err(|e| CoreError::backend("deserialize stored json", e))
}

fn to_json<T: serde::Serialize>(v: &T) -> CoreResult<String> {
    serde_json::to_string(v).map_err(|e| CoreError::backend("serialize json column", e))
}

fn get_str(r: &SqliteRow, col: &str) -> CoreResult<String> {
    r.try_get::<String, _>(col).map_err(db_err)
}

fn get_u64(r: &SqliteRow, col: &str) -> CoreResult<u64> {
    Ok(r.try_get::<i64, _>(col).map_err(db_err)?.max(0) as u64)
}

fn row_to_sync_state(r: &SqliteRow) -> CoreResult<SyncState> {
    let status = get_str(r, "status")?;
    Ok(SyncState {
        id: parse_uuid(&get_str(r, "id")?)?,
        user_id: UserId(parse_uuid(&get_str(r, "user_id")?)?),
        integration_id: IntegrationId(parse_uuid(&get_str(r, "integration_id")?)?),
        provider: parse_provider(&get_str(r, "provider")?)?,
        status: SyncStatus::parse_str(&status)
            .ok_or_else(|| CoreError::BackendMessage(format!("unknown sync status {status:?}")))?,
        cursor: r.try_get("cursor").map_err(db_err)?,
        last_item_id: r.try_get("last_item_id").map_err(db_err)?,
        last_item_timestamp: parse_opt_dt(r.try_get("last_item_timestamp").map_err(db_err)?)?,
        last_sync_at: parse_opt_dt(r.try_get("last_sync_at").map_err(db_err)?)?,
        last_successful_sync_at: parse_opt_dt(
            r.try_get("last_successful_sync_at").map_err(db_err)?,
        )?,
        next_sync_at: parse_opt_dt(r.try_get("next_sync_at").map_err(db_err)?)?,
        error_count: get_u64(r, "error_count")? as u32,
        last_error: r.try_get("last_error").map_err(db_err)?,
        last_error_at: parse_opt_dt(r.try_get("last_error_at").map_err(db_err)?)?,
        total_items_synced: get_u64(r, "total_items_synced")?,
        items_synced_this_run: get_u64(r, "items_synced_this_run")?,
        sync_started_at: parse_opt_dt(r.try_get("sync_started_at").map_err(db_err)?)?,
        updated_at: parse_dt(&get_str(r, "updated_at")?)?,
    })
}

fn row_to_ingested_item(r: &SqliteRow) -> CoreResult<IngestedItem> {
    let item_type = get_str(r, "item_type")?;
    let status = get_str(r, "status")?;
    let capture_id: Option<String> = r.try_get("capture_id").map_err(db_err)?;
    let raw_data: Option<String> = r.try_get("raw_data").map_err(db_err)?;
    Ok(IngestedItem {
        id: parse_uuid(&get_str(r, "id")?)?,
        user_id: UserId(parse_uuid(&get_str(r, "user_id")?)?),
        integration_id: IntegrationId(parse_uuid(&get_str(r, "integration_id")?)?),
        provider: parse_provider(&get_str(r, "provider")?)?,
        source_id: get_str(r, "source_id")?,
        source_hash: get_str(r, "source_hash")?,
        source_url: r.try_get("source_url").map_err(db_err)?,
        item_type: ItemType::parse_str(&item_type)
            .ok_or_else(|| CoreError::BackendMessage(format!("unknown item type {item_type:?}")))?,
        title: r.try_get("title").map_err(db_err)?,
        content: get_str(r, "content")?,
        capture_id: capture_id.as_deref().map(parse_uuid).transpose()?,
        memory_ids: parse_json(&get_str(r, "memory_ids")?)?,
        task_ids: parse_json(&get_str(r, "task_ids")?)?,
        status: IngestedItemStatus::parse_str(&status)
            .ok_or_else(|| CoreError::BackendMessage(format!("unknown item status {status:?}")))?,
        processed_at: parse_opt_dt(r.try_get("processed_at").map_err(db_err)?)?,
        error: r.try_get("error").map_err(db_err)?,
        raw_data: raw_data.as_deref().map(parse_json).transpose()?,
        metadata: parse_json(&get_str(r, "metadata")?)?,
        created_at: parse_dt(&get_str(r, "created_at")?)?,
        updated_at: parse_dt(&get_str(r, "updated_at")?)?,
    })
}

fn advance_parts(advance: Option<&CursorAdvance>) -> (Option<String>, Option<String>) {
    match advance {
        Some(a) => (
            Some(fmt_dt(a.last_item_timestamp)),
            Some(a.last_item_id.clone()),
        ),
        None => (None, None),
    }
}

#[async_trait]
impl SyncStore for SqliteSyncStore {
    #[tracing::instrument(level = "debug", skip(self, integration), fields(provider = %integration.provider))]
    async fn upsert_integration(&self, integration: &Integration) -> CoreResult<Integration> {
        sqlx::query(
            "INSERT INTO integrations
               (id, user_id, provider, access_token, refresh_token, expires_at, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(user_id, provider) DO UPDATE SET
               access_token = excluded.access_token,
               refresh_token = excluded.refresh_token,
               expires_at = excluded.expires_at,
               metadata = excluded.metadata,
               updated_at = excluded.updated_at",
        )
        .bind(integration.id.to_string())
        .bind(integration.user_id.to_string())
        .bind(integration.provider.as_str())
        .bind(self.seal(&integration.tokens.access_token)?)
        .bind(
            integration
                .tokens
                .refresh_token
                .as_deref()
                .map(|t| self.seal(t))
                .transpose()?,
        )
        .bind(integration.tokens.expires_at.map(fmt_dt))
        .bind(to_json(&integration.metadata)?)
        .bind(fmt_dt(integration.created_at))
        .bind(fmt_dt(integration.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        self.get_integration(integration.user_id, integration.provider)
            .await?
            .ok_or_else(|| CoreError::BackendMessage("integration vanished after upsert".into()))
    }

    async fn get_integration(
        &self,
        user_id: UserId,
        provider: ProviderId,
    ) -> CoreResult<Option<Integration>> {
        let row = sqlx::query("SELECT * FROM integrations WHERE user_id = ?1 AND provider = ?2")
            .bind(user_id.to_string())
            .bind(provider.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| self.row_to_integration(&r)).transpose()
    }

    async fn get_integration_by_id(&self, id: IntegrationId) -> CoreResult<Option<Integration>> {
        let row = sqlx::query("SELECT * FROM integrations WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| self.row_to_integration(&r)).transpose()
    }

    async fn list_integrations(&self, user_id: UserId) -> CoreResult<Vec<Integration>> {
        let rows = sqlx::query("SELECT * FROM integrations WHERE user_id = ?1 ORDER BY provider")
            .bind(user_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(|r| self.row_to_integration(r)).collect()
    }

    #[tracing::instrument(level = "debug", skip(self, tokens))]
    async fn update_tokens(
        &self,
        id: IntegrationId,
        tokens: &TokenSet,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        let res = sqlx::query(
            "UPDATE integrations
             SET access_token = ?2, refresh_token = ?3, expires_at = ?4, updated_at = ?5
             WHERE id = ?1",
        )
        .bind(id.to_string())
        .bind(self.seal(&tokens.access_token)?)
        .bind(tokens.refresh_token.as_deref().map(|t| self.seal(t)).transpose()?)
        .bind(tokens.expires_at.map(fmt_dt))
        .bind(fmt_dt(now))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if res.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("integration '{id}' not found")));
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete_integration(&self, id: IntegrationId) -> CoreResult<()> {
        let id = id.to_string();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for sql in [
            "DELETE FROM ingested_items WHERE integration_id = ?1",
            "DELETE FROM webhook_subscriptions WHERE integration_id = ?1",
            "DELETE FROM integration_sync_state WHERE integration_id = ?1",
            "DELETE FROM integrations WHERE id = ?1",
        ] {
            sqlx::query(sql)
                .bind(&id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, integration), fields(integration_id = %integration.id))]
    async fn ensure_sync_state(
        &self,
        integration: &Integration,
        now: DateTime<Utc>,
    ) -> CoreResult<SyncState> {
        let s = SyncState::new_pending(integration, now);
        sqlx::query(
            "INSERT INTO integration_sync_state
               (id, user_id, integration_id, provider, status, next_sync_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(integration_id) DO NOTHING",
        )
        .bind(s.id.to_string())
        .bind(s.user_id.to_string())
        .bind(s.integration_id.to_string())
        .bind(s.provider.as_str())
        .bind(s.status.as_str())
        .bind(s.next_sync_at.map(fmt_dt))
        .bind(fmt_dt(s.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        self.get_sync_state(integration.id)
            .await?
            .ok_or_else(|| CoreError::BackendMessage("sync state vanished after insert".into()))
    }

    async fn get_sync_state(&self, integration_id: IntegrationId) -> CoreResult<Option<SyncState>> {
        let row = sqlx::query(&format!(
            "SELECT {SYNC_STATE_COLUMNS} FROM integration_sync_state WHERE integration_id = ?1"
        ))
        .bind(integration_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| row_to_sync_state(&r)).transpose()
    }

    async fn list_sync_states(&self, user_id: UserId) -> CoreResult<Vec<SyncState>> {
        let rows = sqlx::query(&format!(
            "SELECT {SYNC_STATE_COLUMNS} FROM integration_sync_state WHERE user_id = ?1 ORDER BY provider"
        ))
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_sync_state).collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn try_start_sync(
        &self,
        integration_id: IntegrationId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> CoreResult<bool> {
        let res = sqlx::query(
            "UPDATE integration_sync_state
             SET status = 'syncing', sync_started_at = ?2, items_synced_this_run = 0, updated_at = ?2
             WHERE integration_id = ?1
               AND (status NOT IN ('syncing', 'paused')
                    OR (status = 'syncing' AND (sync_started_at IS NULL OR sync_started_at < ?3)))",
        )
        .bind(integration_id.to_string())
        .bind(fmt_dt(now))
        .bind(fmt_dt(stale_before))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(res.rows_affected() == 1)
    }

    #[tracing::instrument(level = "debug", skip(self, completion))]
    async fn complete_sync(
        &self,
        integration_id: IntegrationId,
        completion: &SyncCompletion,
    ) -> CoreResult<()> {
        let (ts, item_id) = advance_parts(completion.advance.as_ref());
        let res = sqlx::query(
            "UPDATE integration_sync_state SET
               status = 'completed',
               sync_started_at = NULL,
               last_sync_at = ?2,
               last_successful_sync_at = ?2,
               updated_at = ?2,
               next_sync_at = ?3,
               cursor = CASE WHEN ?4 = 1 THEN ?5 ELSE COALESCE(?5, cursor) END,
               last_item_id = CASE
                 WHEN ?6 IS NOT NULL AND (?4 = 1 OR last_item_timestamp IS NULL OR ?6 > last_item_timestamp)
                 THEN ?7 ELSE last_item_id END,
               last_item_timestamp = CASE
                 WHEN ?6 IS NOT NULL AND (?4 = 1 OR last_item_timestamp IS NULL OR ?6 > last_item_timestamp)
                 THEN ?6 ELSE last_item_timestamp END,
               error_count = 0,
               total_items_synced = total_items_synced + ?8,
               items_synced_this_run = ?8
             WHERE integration_id = ?1 AND status = 'syncing' AND sync_started_at = ?9",
        )
        .bind(integration_id.to_string())
        .bind(fmt_dt(completion.finished_at))
        .bind(completion.next_sync_at.map(fmt_dt))
        .bind(completion.full_sync)
        .bind(completion.cursor.as_deref())
        .bind(ts)
        .bind(item_id)
        .bind(completion.items_synced as i64)
        .bind(fmt_dt(completion.started_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if res.rows_affected() == 0 {
            tracing::warn!(
                %integration_id,
                "sync lease lost or taken over before completion; state not updated"
            );
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, failure))]
    async fn fail_sync(
        &self,
        integration_id: IntegrationId,
        failure: &SyncFailure,
    ) -> CoreResult<()> {
        let (ts, item_id) = advance_parts(failure.advance.as_ref());
        let res = sqlx::query(
            "UPDATE integration_sync_state SET
               status = 'failed',
               sync_started_at = NULL,
               last_sync_at = ?2,
               last_error_at = ?2,
               updated_at = ?2,
               last_error = ?3,
               error_count = error_count + 1,
               next_sync_at = ?4,
               last_item_id = CASE
                 WHEN ?5 IS NOT NULL AND (last_item_timestamp IS NULL OR ?5 > last_item_timestamp)
                 THEN ?6 ELSE last_item_id END,
               last_item_timestamp = CASE
                 WHEN ?5 IS NOT NULL AND (last_item_timestamp IS NULL OR ?5 > last_item_timestamp)
                 THEN ?5 ELSE last_item_timestamp END,
               total_items_synced = total_items_synced + ?7,
               items_synced_this_run = ?7
             WHERE integration_id = ?1 AND status = 'syncing' AND sync_started_at = ?8",
        )
        .bind(integration_id.to_string())
        .bind(fmt_dt(failure.failed_at))
        .bind(&failure.error)
        .bind(failure.next_sync_at.map(fmt_dt))
        .bind(ts)
        .bind(item_id)
        .bind(failure.items_synced as i64)
        .bind(fmt_dt(failure.started_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if res.rows_affected() == 0 {
            tracing::warn!(
                %integration_id,
                "sync lease lost or taken over before failure was recorded"
            );
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn record_sync_error(
        &self,
        integration_id: IntegrationId,
        error: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<bool> {
        let res = sqlx::query(
            "UPDATE integration_sync_state SET
               status = CASE WHEN status = 'paused' THEN 'paused' ELSE 'failed' END,
               error_count = error_count + 1,
               last_error = ?2,
               last_error_at = ?3,
               updated_at = ?3
             WHERE integration_id = ?1 AND status <> 'syncing'",
        )
        .bind(integration_id.to_string())
        .bind(error)
        .bind(fmt_dt(now))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(res.rows_affected() == 1)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn set_paused(
        &self,
        integration_id: IntegrationId,
        paused: bool,
        now: DateTime<Utc>,
    ) -> CoreResult<bool> {
        let sql = if paused {
            "UPDATE integration_sync_state SET status = 'paused', updated_at = ?2
             WHERE integration_id = ?1 AND status NOT IN ('syncing', 'paused')"
        } else {
            "UPDATE integration_sync_state SET status = 'pending', next_sync_at = ?2, updated_at = ?2
             WHERE integration_id = ?1 AND status = 'paused'"
        };
        let res = sqlx::query(sql)
            .bind(integration_id.to_string())
            .bind(fmt_dt(now))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(res.rows_affected() == 1)
    }

    #[tracing::instrument(level = "debug", skip(self, advance))]
    async fn record_webhook_progress(
        &self,
        integration_id: IntegrationId,
        created: u64,
        advance: Option<&CursorAdvance>,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        let (ts, item_id) = advance_parts(advance);
        sqlx::query(
            "UPDATE integration_sync_state SET
               total_items_synced = total_items_synced + ?2,
               last_item_id = CASE
                 WHEN ?3 IS NOT NULL AND (last_item_timestamp IS NULL OR ?3 > last_item_timestamp)
                 THEN ?4 ELSE last_item_id END,
               last_item_timestamp = CASE
                 WHEN ?3 IS NOT NULL AND (last_item_timestamp IS NULL OR ?3 > last_item_timestamp)
                 THEN ?3 ELSE last_item_timestamp END,
               updated_at = ?5
             WHERE integration_id = ?1",
        )
        .bind(integration_id.to_string())
        .bind(created as i64)
        .bind(ts)
        .bind(item_id)
        .bind(fmt_dt(now))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_due_sync_states(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> CoreResult<Vec<SyncState>> {
        let rows = sqlx::query(&format!(
            "SELECT {SYNC_STATE_COLUMNS} FROM integration_sync_state
             WHERE (status NOT IN ('syncing', 'paused') AND next_sync_at IS NOT NULL AND next_sync_at <= ?1)
                OR (status = 'syncing' AND (sync_started_at IS NULL OR sync_started_at < ?2))
             ORDER BY next_sync_at
             LIMIT ?3"
        ))
        .bind(fmt_dt(now))
        .bind(fmt_dt(stale_before))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_sync_state).collect()
    }

    #[tracing::instrument(level = "debug", skip(self, item), fields(source_id = %item.source_id))]
    async fn upsert_ingested_item(&self, item: &IngestedItem) -> CoreResult<UpsertOutcome> {
        // Failed rows are re-admitted even with an unchanged hash so the pipeline is retried.
        // Such a retry keeps the previous error until it settles, which is how it is told apart
        // from a content change in RETURNING.
        let returned: Option<(String, bool)> = sqlx::query_as(
            "INSERT INTO ingested_items
               (id, user_id, integration_id, provider, source_id, source_hash, source_url, item_type,
                title, content, capture_id, memory_ids, task_ids, status, processed_at, error,
                raw_data, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
             ON CONFLICT(integration_id, source_id) DO UPDATE SET
               source_hash = excluded.source_hash,
               source_url = excluded.source_url,
               item_type = excluded.item_type,
               title = excluded.title,
               content = excluded.content,
               status = 'pending',
               error = CASE WHEN ingested_items.source_hash = excluded.source_hash
                 THEN ingested_items.error ELSE NULL END,
               raw_data = excluded.raw_data,
               metadata = excluded.metadata,
               updated_at = excluded.updated_at
             WHERE ingested_items.source_hash <> excluded.source_hash
                OR ingested_items.status = 'failed'
             RETURNING id, error IS NOT NULL",
        )
        .bind(item.id.to_string())
        .bind(item.user_id.to_string())
        .bind(item.integration_id.to_string())
        .bind(item.provider.as_str())
        .bind(&item.source_id)
        .bind(&item.source_hash)
        .bind(item.source_url.as_deref())
        .bind(item.item_type.as_str())
        .bind(item.title.as_deref())
        .bind(&item.content)
        .bind(item.capture_id.map(|id| id.to_string()))
        .bind(to_json(&item.memory_ids)?)
        .bind(to_json(&item.task_ids)?)
        .bind(item.status.as_str())
        .bind(item.processed_at.map(fmt_dt))
        .bind(item.error.as_deref())
        .bind(item.raw_data.as_ref().map(to_json).transpose()?)
        .bind(to_json(&item.metadata)?)
        .bind(fmt_dt(item.created_at))
        .bind(fmt_dt(item.updated_at))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match returned {
            Some((id, retried)) => {
                let id = parse_uuid(&id)?;
                if id == item.id {
                    Ok(UpsertOutcome::Created(id))
                } else if retried {
                    Ok(UpsertOutcome::Retried(id))
                } else {
                    Ok(UpsertOutcome::Updated(id))
                }
            }
            None => {
                let existing = self
                    .get_ingested_item(item.integration_id, &item.source_id)
                    .await?
                    .ok_or_else(|| {
                        CoreError::BackendMessage(format!(
                            "ingested item '{}' neither inserted nor found",
                            item.source_id
                        ))
                    })?;
                Ok(UpsertOutcome::Unchanged(existing.id))
            }
        }
    }

    async fn get_ingested_item(
        &self,
        integration_id: IntegrationId,
        source_id: &str,
    ) -> CoreResult<Option<IngestedItem>> {
        let row = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM ingested_items WHERE integration_id = ?1 AND source_id = ?2"
        ))
        .bind(integration_id.to_string())
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| row_to_ingested_item(&r)).transpose()
    }

    async fn count_ingested_items(&self, integration_id: IntegrationId) -> CoreResult<u64> {
        let n: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM ingested_items WHERE integration_id = ?1")
                .bind(integration_id.to_string())
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(n.max(0) as u64)
    }

    #[tracing::instrument(level = "debug", skip(self, output))]
    async fn mark_item_processed(
        &self,
        id: Uuid,
        output: &PipelineOutput,
        status: IngestedItemStatus,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        sqlx::query(
            "UPDATE ingested_items SET
               capture_id = ?2, memory_ids = ?3, task_ids = ?4, status = ?5,
               processed_at = ?6, error = NULL, updated_at = ?6
             WHERE id = ?1",
        )
        .bind(id.to_string())
        .bind(output.capture_id.map(|c| c.to_string()))
        .bind(to_json(&output.memory_ids)?)
        .bind(to_json(&output.task_ids)?)
        .bind(status.as_str())
        .bind(fmt_dt(now))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn mark_item_failed(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> CoreResult<()> {
        sqlx::query(
            "UPDATE ingested_items SET status = 'failed', error = ?2, updated_at = ?3 WHERE id = ?1",
        )
        .bind(id.to_string())
        .bind(error)
        .bind(fmt_dt(now))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, sub), fields(provider = %sub.provider))]
    async fn upsert_webhook_subscription(&self, sub: &WebhookSubscription) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO webhook_subscriptions
               (id, user_id, integration_id, provider, webhook_id, webhook_url, secret, events,
                is_active, verified_at, last_received_at, delivery_count, error_count, last_error,
                last_error_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
             ON CONFLICT(integration_id, provider) DO UPDATE SET
               webhook_id = excluded.webhook_id,
               webhook_url = excluded.webhook_url,
               secret = excluded.secret,
               events = excluded.events,
               is_active = excluded.is_active,
               updated_at = excluded.updated_at",
        )
        .bind(sub.id.to_string())
        .bind(sub.user_id.to_string())
        .bind(sub.integration_id.to_string())
        .bind(sub.provider.as_str())
        .bind(sub.webhook_id.as_deref())
        .bind(sub.webhook_url.as_deref())
        .bind(self.seal(&sub.secret)?)
        .bind(to_json(&sub.events)?)
        .bind(sub.is_active)
        .bind(sub.verified_at.map(fmt_dt))
        .bind(sub.last_received_at.map(fmt_dt))
        .bind(sub.delivery_count as i64)
        .bind(sub.error_count as i64)
        .bind(sub.last_error.as_deref())
        .bind(sub.last_error_at.map(fmt_dt))
        .bind(fmt_dt(sub.created_at))
        .bind(fmt_dt(sub.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_webhook_subscription(
        &self,
        integration_id: IntegrationId,
    ) -> CoreResult<Option<WebhookSubscription>> {
        let row = sqlx::query(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM webhook_subscriptions WHERE integration_id = ?1"
        ))
        .bind(integration_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| self.row_to_subscription(&r)).transpose()
    }

    async fn list_active_webhook_subscriptions(
        &self,
        provider: ProviderId,
        webhook_id: Option<&str>,
    ) -> CoreResult<Vec<WebhookSubscription>> {
        let rows = sqlx::query(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM webhook_subscriptions
             WHERE provider = ?1 AND is_active = 1 AND (?2 IS NULL OR webhook_id = ?2)
             ORDER BY created_at"
        ))
        .bind(provider.as_str())
        .bind(webhook_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(|r| self.row_to_subscription(r)).collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn record_webhook_delivery(
        &self,
        id: Uuid,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        sqlx::query(
            "UPDATE webhook_subscriptions SET
               last_received_at = ?2,
               verified_at = COALESCE(verified_at, ?2),
               delivery_count = delivery_count + 1,
               error_count = error_count + CASE WHEN ?3 IS NULL THEN 0 ELSE 1 END,
               last_error = COALESCE(?3, last_error),
               last_error_at = CASE WHEN ?3 IS NULL THEN last_error_at ELSE ?2 END,
               updated_at = ?2
             WHERE id = ?1",
        )
        .bind(id.to_string())
        .bind(fmt_dt(now))
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl RecordSink for SqliteSyncStore {
    #[tracing::instrument(level = "debug", skip_all, fields(ingested_item_id = %records.ingested_item_id))]
    async fn replace_item_records(&self, records: &ItemRecords) -> CoreResult<()> {
        let item_id = records.ingested_item_id.to_string();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for table in ["captures", "memories", "tasks"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE ingested_item_id = ?1"))
                .bind(&item_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        let c = &records.capture;
        sqlx::query(
            "INSERT INTO captures
               (id, user_id, integration_id, ingested_item_id, provider, item_type, title, content, source_url, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(c.id.to_string())
        .bind(c.user_id.to_string())
        .bind(c.integration_id.to_string())
        .bind(&item_id)
        .bind(c.provider.as_str())
        .bind(c.item_type.as_str())
        .bind(c.title.as_deref())
        .bind(&c.content)
        .bind(c.source_url.as_deref())
        .bind(fmt_dt(c.created_at))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        for m in &records.memories {
            sqlx::query(
                "INSERT INTO memories (id, user_id, integration_id, ingested_item_id, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(m.id.to_string())
            .bind(m.user_id.to_string())
            .bind(m.integration_id.to_string())
            .bind(&item_id)
            .bind(&m.content)
            .bind(fmt_dt(m.created_at))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        for t in &records.tasks {
            sqlx::query(
                "INSERT INTO tasks (id, user_id, integration_id, ingested_item_id, title, source_url, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .bind(t.id.to_string())
            .bind(t.user_id.to_string())
            .bind(t.integration_id.to_string())
            .bind(&item_id)
            .bind(&t.title)
            .bind(t.source_url.as_deref())
            .bind(fmt_dt(t.created_at))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn list_captures(&self, user_id: UserId) -> CoreResult<Vec<CaptureRecord>> {
        let rows = sqlx::query("SELECT * FROM captures WHERE user_id = ?1 ORDER BY created_at")
            .bind(user_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter()
            .map(|r| {
                let item_type = get_str(r, "item_type")?;
                Ok(CaptureRecord {
                    id: parse_uuid(&get_str(r, "id")?)?,
                    user_id: UserId(parse_uuid(&get_str(r, "user_id")?)?),
                    integration_id: IntegrationId(parse_uuid(&get_str(r, "integration_id")?)?),
                    ingested_item_id: parse_uuid(&get_str(r, "ingested_item_id")?)?,
                    provider: parse_provider(&get_str(r, "provider")?)?,
                    item_type: ItemType::parse_str(&item_type).ok_or_else(|| {
                        CoreError::BackendMessage(format!("unknown item type {item_type:?}"))
                    })?,
                    title: r.try_get("title").map_err(db_err)?,
                    content: get_str(r, "content")?,
                    source_url: r.try_get("source_url").map_err(db_err)?,
                    created_at: parse_dt(&get_str(r, "created_at")?)?,
                })
            })
            .collect()
    }

    async fn list_memories(&self, user_id: UserId) -> CoreResult<Vec<MemoryRecord>> {
        let rows = sqlx::query("SELECT * FROM memories WHERE user_id = ?1 ORDER BY created_at")
            .bind(user_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter()
            .map(|r| {
                Ok(MemoryRecord {
                    id: parse_uuid(&get_str(r, "id")?)?,
                    user_id: UserId(parse_uuid(&get_str(r, "user_id")?)?),
                    integration_id: IntegrationId(parse_uuid(&get_str(r, "integration_id")?)?),
                    ingested_item_id: parse_uuid(&get_str(r, "ingested_item_id")?)?,
                    content: get_str(r, "content")?,
                    created_at: parse_dt(&get_str(r, "created_at")?)?,
                })
            })
            .collect()
    }

    async fn list_tasks(&self, user_id: UserId) -> CoreResult<Vec<TaskRecord>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE user_id = ?1 ORDER BY created_at")
            .bind(user_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter()
            .map(|r| {
                Ok(TaskRecord {
                    id: parse_uuid(&get_str(r, "id")?)?,
                    user_id: UserId(parse_uuid(&get_str(r, "user_id")?)?),
                    integration_id: IntegrationId(parse_uuid(&get_str(r, "integration_id")?)?),
                    ingested_item_id: parse_uuid(&get_str(r, "ingested_item_id")?)?,
                    title: get_str(r, "title")?,
                    source_url: r.try_get("source_url").map_err(db_err)?,
                    created_at: parse_dt(&get_str(r, "created_at")?)?,
                })
            })
            .collect()
    }
}
