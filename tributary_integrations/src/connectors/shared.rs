//! Helpers shared by connectors: the page/watermark cursor and OAuth2 token exchange.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tributary_core::sync::http::{read_json, send_with_retry, RetryPolicy};
use tributary_core::{Error, ProviderId, Result, SyncOptions, TokenSet};

/// Opaque sync cursor: the provider's page token while paging, a watermark once exhausted.
///
/// The `updated_after` filter is carried inside the cursor so every page of one listing is
/// requested with the same filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_after: Option<DateTime<Utc>>,
}

impl PageCursor {
    /// Resume point for a run. Unparseable cursors start over from `options.since`.
    pub fn resume(options: &SyncOptions) -> Self {
        let decoded = options
            .cursor
            .as_deref()
            .and_then(|raw| match serde_json::from_str::<PageCursor>(raw) {
                Ok(c) => Some(c),
                Err(e) => {
                    tracing::debug!(error = %e, "ignoring unreadable cursor");
                    None
                }
            })
            .unwrap_or_default();
        if decoded.page.is_none() && decoded.updated_after.is_none() {
            return PageCursor {
                page: None,
                updated_after: options.since,
            };
        }
        decoded
    }

    /// Cursor to persist after a batch: the next page, or the watermark `started_at`.
    pub fn next(&self, page: Option<String>, started_at: DateTime<Utc>) -> PageCursor {
        match page {
            Some(page) => PageCursor {
                page: Some(page),
                updated_after: self.updated_after,
            },
            None => PageCursor {
                page: None,
                updated_after: Some(started_at),
            },
        }
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Batch size requested from the provider, clamped to its page maximum.
pub fn page_size(options: &SyncOptions, max: usize) -> usize {
    options.limit.unwrap_or(max).clamp(1, max)
}

/// Registered OAuth2 application credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct OAuthApp {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

impl std::fmt::Debug for OAuthApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthApp")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// POST a form to an OAuth2 token endpoint and decode the token set.
///
/// Error bodies (including GitHub's 200-with-`error`) surface as `ProviderApi`.
#[tracing::instrument(level = "debug", skip(client, form))]
pub async fn token_request(
    client: &reqwest::Client,
    provider: ProviderId,
    token_url: &str,
    form: &[(&str, &str)],
) -> Result<TokenSet> {
    let resp = send_with_retry(provider, &RetryPolicy::default(), || {
        client
            .post(token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(form)
    })
    .await?;
    let body: TokenResponse = read_json(provider, resp).await?;
    if let Some(err) = body.error {
        let message = match body.error_description {
            Some(desc) => format!("{err}: {desc}"),
            None => err,
        };
        return Err(Error::provider_api(provider, None, message));
    }
    let access_token = body
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::provider_api(provider, None, "token response without access_token"))?;
    Ok(TokenSet {
        access_token,
        refresh_token: body.refresh_token,
        expires_at: body
            .expires_in
            .map(|secs| Utc::now() + ChronoDuration::seconds(secs)),
    })
}

/// Map an OAuth app that is not configured to a caller error.
pub fn require_app(app: Option<&OAuthApp>, provider: ProviderId) -> Result<&OAuthApp> {
    app.ok_or_else(|| {
        Error::InvalidInput(format!("oauth client for {provider} is not configured"))
    })
}
