//! Shared HTTP plumbing for provider adapters: client construction, retry with backoff, paging
//! delays and response decoding.

use crate::models::ProviderId;
use crate::{Error, Result};
use reqwest::header::RETRY_AFTER;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Per-request timeout applied to every provider client.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// No sleeping between attempts.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.min(31);
        let delay = self.base_delay.saturating_mul(1u32 << shift);
        delay.min(self.max_delay)
    }
}

pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(DEFAULT_REQUEST_TIMEOUT)
        .user_agent(concat!("tributary/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::backend("build http client", e))
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Send a request, retrying 429/5xx responses and transport failures with exponential backoff.
///
/// `build` is called once per attempt. `Retry-After` (seconds) overrides the computed delay, capped
/// at `policy.max_delay`. Exhausted or non-retryable failures become `Error::ProviderApi`.
#[tracing::instrument(level = "debug", skip(policy, build))]
pub async fn send_with_retry<F>(
    provider: ProviderId,
    policy: &RetryPolicy,
    build: F,
) -> Result<Response>
where
    F: Fn() -> RequestBuilder + Send + Sync,
{
    let mut attempt = 0u32;
    loop {
        match build().send().await {
            Ok(resp) if resp.status().is_success() => return Ok(resp),
            Ok(resp) => {
                let status = resp.status();
                if is_retryable_status(status) && attempt < policy.max_retries {
                    let retry_after = parse_retry_after(
                        resp.headers()
                            .get(RETRY_AFTER)
                            .and_then(|v| v.to_str().ok()),
                    );
                    let delay = retry_after
                        .map(|d| d.min(policy.max_delay))
                        .unwrap_or_else(|| policy.backoff(attempt));
                    tracing::warn!(%provider, status = status.as_u16(), attempt, ?delay, "retrying provider request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                let body = resp.text().await.unwrap_or_default();
                let mut message: String = body.chars().take(MAX_ERROR_BODY).collect();
                if message.trim().is_empty() {
                    message = status
                        .canonical_reason()
                        .unwrap_or("request failed")
                        .to_string();
                }
                return Err(Error::provider_api(provider, Some(status.as_u16()), message));
            }
            Err(e) => {
                let transient = e.is_timeout() || e.is_connect() || e.is_request();
                if transient && attempt < policy.max_retries {
                    let delay = policy.backoff(attempt);
                    tracing::warn!(%provider, error = %e, attempt, ?delay, "retrying provider request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                return Err(Error::provider_api(provider, None, e.to_string()));
            }
        }
    }
}

/// Decode a JSON response body, mapping failures to `ProviderApi`.
pub async fn read_json<T: DeserializeOwned>(provider: ProviderId, resp: Response) -> Result<T> {
    let status = resp.status().as_u16();
    resp.json::<T>()
        .await
        .map_err(|e| Error::provider_api(provider, Some(status), format!("invalid response body: {e}")))
}

/// Provider rate-limit delay between internal pages.
pub async fn pace(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}
