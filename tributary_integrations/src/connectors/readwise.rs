//! Readwise connector.
//!
//! Pulls books and highlights from the Readwise v2 export API with an access token.
//! Each book becomes one `document` item plus one `highlight` item per highlight
//! (`highlight_<id>`, memories requested). Incremental sync filters on `updatedAfter`.
//!
//! Custom metadata keys: `category`, `source` (documents); `color`, `location_type`
//! (highlights).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::instrument;
use tributary_core::sync::http::{http_client, pace, read_json, send_with_retry, RetryPolicy};
use tributary_core::{
    AuthMethod, Error, ItemDetails, ItemType, ProcessingHints, ProviderAdapter,
    ProviderDefinition, ProviderFeatures, ProviderId, Result, StandardIngestItem, SyncBatch,
    SyncContext, SyncMethod, SyncOptions, TokenSet,
};

use super::shared::{page_size, PageCursor};

const DEFAULT_API_BASE: &str = "https://readwise.io";
/// Readwise asks clients to stay under 20 export requests per minute.
const DEFAULT_PAGE_DELAY: Duration = Duration::from_secs(3);
const MAX_BATCH: usize = 1000;

#[derive(Debug, Deserialize)]
struct ExportPage {
    #[serde(default)]
    results: Vec<ExportBook>,
    #[serde(rename = "nextPageCursor", default)]
    next_page_cursor: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct ExportBook {
    user_book_id: i64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    readable_title: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    document_note: Option<String>,
    #[serde(default)]
    readwise_url: Option<String>,
    #[serde(default)]
    source_url: Option<String>,
    #[serde(default)]
    book_tags: Vec<Tag>,
    #[serde(default)]
    highlights: Vec<ExportHighlight>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
struct Tag {
    name: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
struct ExportHighlight {
    id: i64,
    text: String,
    #[serde(default)]
    note: Option<String>,
    #[serde(default)]
    location: Option<i64>,
    #[serde(default)]
    location_type: Option<String>,
    #[serde(default)]
    color: Option<String>,
    #[serde(default)]
    highlighted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    readwise_url: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    tags: Vec<Tag>,
    #[serde(default)]
    is_deleted: bool,
}

pub struct ReadwiseConnector {
    client: Client,
    api_base: String,
    page_delay: Duration,
    retry: RetryPolicy,
    definition: ProviderDefinition,
}

impl ReadwiseConnector {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            api_base: DEFAULT_API_BASE.to_string(),
            page_delay: DEFAULT_PAGE_DELAY,
            retry: RetryPolicy::default(),
            definition: ProviderDefinition {
                id: ProviderId::Readwise,
                name: "Readwise",
                auth_method: AuthMethod::ApiKey,
                item_types: vec![ItemType::Document, ItemType::Highlight],
                sync_method: SyncMethod::Pull,
                default_sync_interval_secs: Some(6 * 60 * 60),
                features: ProviderFeatures {
                    realtime: false,
                    bidirectional: false,
                    incremental_sync: true,
                    webhooks: false,
                },
                webhook_signature_header: None,
                webhook_events: vec![],
            },
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn fetch_page(
        &self,
        token: &str,
        cursor: &PageCursor,
    ) -> Result<ExportPage> {
        let url = format!("{}/api/v2/export/", self.api_base);
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(after) = cursor.updated_after {
            query.push(("updatedAfter", after.to_rfc3339()));
        }
        if let Some(page) = &cursor.page {
            query.push(("pageCursor", page.clone()));
        }
        let resp = send_with_retry(ProviderId::Readwise, &self.retry, || {
            self.client
                .get(&url)
                .header(reqwest::header::AUTHORIZATION, format!("Token {token}"))
                .query(&query)
        })
        .await?;
        read_json(ProviderId::Readwise, resp).await
    }

    fn book_items(book: &ExportBook) -> Result<Vec<StandardIngestItem>> {
        let title = book
            .readable_title
            .clone()
            .or_else(|| book.title.clone())
            .unwrap_or_else(|| format!("Book {}", book.user_book_id));
        let book_tags: Vec<String> = book.book_tags.iter().map(|t| t.name.clone()).collect();

        let body = book
            .summary
            .clone()
            .or_else(|| book.document_note.clone())
            .unwrap_or_default();
        let mut document = StandardIngestItem::new(
            ProviderId::Readwise,
            format!("book_{}", book.user_book_id),
            ItemType::Document,
            body,
        )?
        .with_title(title.clone())
        .with_url(book.readwise_url.clone().or_else(|| book.source_url.clone()))
        .with_author(book.author.clone())
        .with_tags(book_tags);
        if let Some(category) = &book.category {
            document = document.with_custom("category", serde_json::json!(category));
        }
        if let Some(source) = &book.source {
            document = document.with_custom("source", serde_json::json!(source));
        }

        let mut out = Vec::with_capacity(book.highlights.len() + 1);
        out.push(document);
        for h in book.highlights.iter().filter(|h| !h.is_deleted) {
            let mut item = StandardIngestItem::new(
                ProviderId::Readwise,
                format!("highlight_{}", h.id),
                ItemType::Highlight,
                h.text.clone(),
            )?
            .with_title(title.clone())
            .with_url(h.readwise_url.clone().or_else(|| h.url.clone()))
            .with_author(book.author.clone())
            .with_tags(h.tags.iter().map(|t| t.name.clone()).collect())
            .with_details(ItemDetails::Highlight {
                book_title: Some(title.clone()),
                book_author: book.author.clone(),
                location: h.location,
                note: h.note.clone().filter(|n| !n.trim().is_empty()),
            })
            .with_hints(ProcessingHints {
                extract_tasks: false,
                extract_memories: true,
            })
            .with_raw(serde_json::to_value(h).unwrap_or_default());
            if let Some(ts) = h.updated_at.or(h.highlighted_at) {
                item = item.with_timestamp(ts);
            }
            if let Some(color) = &h.color {
                item = item.with_custom("color", serde_json::json!(color));
            }
            if let Some(lt) = &h.location_type {
                item = item.with_custom("location_type", serde_json::json!(lt));
            }
            out.push(item);
        }
        Ok(out)
    }
}

fn cursor_to_string(v: serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) if s.is_empty() => None,
        serde_json::Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

#[async_trait]
impl ProviderAdapter for ReadwiseConnector {
    fn definition(&self) -> &ProviderDefinition {
        &self.definition
    }

    #[instrument(level = "debug", skip(self, tokens))]
    async fn validate_connection(&self, tokens: &TokenSet) -> Result<bool> {
        let url = format!("{}/api/v2/auth/", self.api_base);
        let resp = self
            .client
            .get(&url)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Token {}", tokens.access_token),
            )
            .send()
            .await
            .map_err(|e| Error::provider_api(ProviderId::Readwise, None, e.to_string()))?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(false),
            s => Err(Error::provider_api(
                ProviderId::Readwise,
                Some(s.as_u16()),
                "unexpected auth check response",
            )),
        }
    }

    #[instrument(level = "info", skip(self, ctx, options))]
    async fn sync(&self, ctx: &SyncContext, options: &SyncOptions) -> Result<SyncBatch> {
        let started_at = Utc::now();
        let limit = page_size(options, MAX_BATCH);
        let resume = PageCursor::resume(options);
        let mut cursor = resume.clone();
        let mut items = Vec::new();
        let mut first = true;

        loop {
            if !first {
                pace(self.page_delay).await;
            }
            first = false;

            let page = self.fetch_page(&ctx.tokens.access_token, &cursor).await?;
            for book in &page.results {
                items.extend(Self::book_items(book)?);
            }
            let next = page.next_page_cursor.and_then(cursor_to_string);
            cursor = resume.next(next, started_at);
            if cursor.page.is_none() || items.len() >= limit {
                break;
            }
        }

        tracing::debug!(items = items.len(), "readwise export fetched");
        Ok(SyncBatch {
            items,
            has_more: cursor.page.is_some(),
            next_cursor: Some(cursor.encode()),
        })
    }
}
