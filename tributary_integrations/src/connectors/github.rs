//! GitHub connector.
//!
//! Pulls issues and pull requests from the GitHub REST API v3 and receives `issues`,
//! `pull_request` and `issue_comment` webhooks. Incremental sync uses `since` (issues updated at or
//! after) with page-number paging. OAuth tokens do not expire, so refresh is unsupported.
//!
//! Items are keyed `<owner/repo>#<number>` so pulled and pushed copies of the same issue dedup
//! against each other; comments are keyed `<owner/repo>#<number>/comment_<id>`.
//!
//! Custom metadata keys: `comments`, `action` (webhook items only).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::Client;
use serde::Deserialize;
use tracing::instrument;
use tributary_core::sync::http::{http_client, read_json, send_with_retry, RetryPolicy};
use tributary_core::{
    AccountInfo, AuthMethod, Error, ItemDetails, ItemType, ProcessingHints, ProviderAdapter,
    ProviderDefinition, ProviderFeatures, ProviderId, Result, StandardIngestItem, SyncBatch,
    SyncContext, SyncMethod, SyncOptions, TokenSet, WebhookRegistration, WebhookRequest,
};

use super::shared::{page_size, require_app, token_request, OAuthApp, PageCursor};

const DEFAULT_API_BASE: &str = "https://api.github.com";
const DEFAULT_OAUTH_BASE: &str = "https://github.com";
const SCOPES: &str = "repo read:user admin:repo_hook";
const MAX_BATCH: usize = 100;
const WEBHOOK_EVENTS: [&str; 3] = ["issues", "pull_request", "issue_comment"];

#[derive(Debug, Deserialize, Clone, serde::Serialize)]
struct GithubUser {
    login: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize, Clone, serde::Serialize)]
struct GithubLabel {
    name: String,
}

#[derive(Debug, Deserialize, Clone, serde::Serialize)]
struct GithubRepo {
    full_name: String,
}

/// Issues and pull requests share this shape; the issues listing marks PRs with `pull_request`.
#[derive(Debug, Deserialize, Clone, serde::Serialize)]
struct GithubIssueLike {
    id: u64,
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    state: Option<String>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    html_url: Option<String>,
    #[serde(default)]
    user: Option<GithubUser>,
    #[serde(default)]
    assignee: Option<GithubUser>,
    #[serde(default)]
    labels: Vec<GithubLabel>,
    #[serde(default)]
    comments: Option<u64>,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
    #[serde(default)]
    repository: Option<GithubRepo>,
}

#[derive(Debug, Deserialize, Clone, serde::Serialize)]
struct GithubComment {
    id: u64,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    html_url: Option<String>,
    #[serde(default)]
    user: Option<GithubUser>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    issue: Option<GithubIssueLike>,
    #[serde(default)]
    pull_request: Option<GithubIssueLike>,
    #[serde(default)]
    comment: Option<GithubComment>,
    #[serde(default)]
    repository: Option<GithubRepo>,
}

#[derive(Debug, Deserialize)]
struct CreatedHook {
    id: u64,
}

pub struct GithubConnector {
    client: Client,
    app: Option<OAuthApp>,
    api_base: String,
    oauth_base: String,
    retry: RetryPolicy,
    definition: ProviderDefinition,
}

impl GithubConnector {
    pub fn new(app: Option<OAuthApp>) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            app,
            api_base: DEFAULT_API_BASE.to_string(),
            oauth_base: DEFAULT_OAUTH_BASE.to_string(),
            retry: RetryPolicy::default(),
            definition: ProviderDefinition {
                id: ProviderId::Github,
                name: "GitHub",
                auth_method: AuthMethod::Oauth2,
                item_types: vec![ItemType::Issue, ItemType::PullRequest, ItemType::Comment],
                sync_method: SyncMethod::Pull,
                default_sync_interval_secs: Some(30 * 60),
                features: ProviderFeatures {
                    realtime: true,
                    bidirectional: false,
                    incremental_sync: true,
                    webhooks: true,
                },
                webhook_signature_header: Some("x-hub-signature-256"),
                webhook_events: WEBHOOK_EVENTS.to_vec(),
            },
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_oauth_base(mut self, oauth_base: impl Into<String>) -> Self {
        self.oauth_base = oauth_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn headers(token: &str) -> Result<HeaderMap> {
        let mut h = HeaderMap::new();
        h.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        h.insert(
            "x-github-api-version",
            HeaderValue::from_static("2022-11-28"),
        );
        let auth = format!("Bearer {token}");
        h.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth)
                .map_err(|e| Error::backend("invalid github auth header", e))?,
        );
        Ok(h)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        token: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let headers = Self::headers(token)?;
        let url = format!("{}{}", self.api_base, path);
        let resp = send_with_retry(ProviderId::Github, &self.retry, || {
            self.client.get(&url).headers(headers.clone()).query(query)
        })
        .await?;
        read_json(ProviderId::Github, resp).await
    }

    fn issue_item(
        repo: &str,
        issue: &GithubIssueLike,
        pull_request: bool,
    ) -> Result<StandardIngestItem> {
        let identifier = format!("{repo}#{}", issue.number);
        let item_type = if pull_request || issue.pull_request.is_some() {
            ItemType::PullRequest
        } else {
            ItemType::Issue
        };
        let labels: Vec<String> = issue.labels.iter().map(|l| l.name.clone()).collect();

        let mut item = StandardIngestItem::new(
            ProviderId::Github,
            identifier.clone(),
            item_type,
            issue.body.clone().unwrap_or_default(),
        )?
        .with_title(issue.title.clone())
        .with_url(issue.html_url.clone())
        .with_author(issue.user.as_ref().map(|u| u.login.clone()))
        .with_tags(labels.clone())
        .with_timestamp(issue.updated_at)
        .with_details(ItemDetails::Issue {
            identifier,
            state: issue.state.clone(),
            assignee: issue.assignee.as_ref().map(|u| u.login.clone()),
            labels,
            repository: Some(repo.to_string()),
        })
        .with_hints(ProcessingHints {
            extract_tasks: true,
            extract_memories: false,
        })
        .with_raw(serde_json::to_value(issue).unwrap_or_default());
        if let Some(comments) = issue.comments {
            item = item.with_custom("comments", serde_json::json!(comments));
        }
        Ok(item)
    }

    fn comment_item(
        repo: &str,
        issue: &GithubIssueLike,
        comment: &GithubComment,
    ) -> Result<StandardIngestItem> {
        Ok(StandardIngestItem::new(
            ProviderId::Github,
            format!("{repo}#{}/comment_{}", issue.number, comment.id),
            ItemType::Comment,
            comment.body.clone().unwrap_or_default(),
        )?
        .with_title(format!("Comment on {repo}#{}: {}", issue.number, issue.title))
        .with_url(comment.html_url.clone())
        .with_author(comment.user.as_ref().map(|u| u.login.clone()))
        .with_timestamp(comment.updated_at)
        .with_hints(ProcessingHints {
            extract_tasks: true,
            extract_memories: false,
        })
        .with_raw(serde_json::to_value(comment).unwrap_or_default()))
    }
}

fn new_webhook_secret() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

#[async_trait]
impl ProviderAdapter for GithubConnector {
    fn definition(&self) -> &ProviderDefinition {
        &self.definition
    }

    fn authorization_url(&self, state: &str) -> Result<String> {
        let app = require_app(self.app.as_ref(), ProviderId::Github)?;
        let url = url::Url::parse_with_params(
            &format!("{}/login/oauth/authorize", self.oauth_base),
            &[
                ("client_id", app.client_id.as_str()),
                ("redirect_uri", app.redirect_uri.as_str()),
                ("scope", SCOPES),
                ("state", state),
            ],
        )
        .map_err(|e| Error::backend("build github auth url", e))?;
        Ok(url.to_string())
    }

    #[instrument(level = "info", skip(self, code))]
    async fn exchange_code_for_tokens(&self, code: &str) -> Result<TokenSet> {
        let app = require_app(self.app.as_ref(), ProviderId::Github)?;
        token_request(
            &self.client,
            ProviderId::Github,
            &format!("{}/login/oauth/access_token", self.oauth_base),
            &[
                ("code", code),
                ("client_id", &app.client_id),
                ("client_secret", &app.client_secret),
                ("redirect_uri", &app.redirect_uri),
            ],
        )
        .await
    }

    #[instrument(level = "debug", skip(self, tokens))]
    async fn validate_connection(&self, tokens: &TokenSet) -> Result<bool> {
        match self
            .get_json::<GithubUser>(&tokens.access_token, "/user", &[])
            .await
        {
            Ok(_) => Ok(true),
            Err(Error::ProviderApi {
                status: Some(401), ..
            }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[instrument(level = "debug", skip(self, tokens))]
    async fn account_info(&self, tokens: &TokenSet) -> Result<AccountInfo> {
        let user: GithubUser = self.get_json(&tokens.access_token, "/user", &[]).await?;
        Ok(AccountInfo {
            account_name: Some(user.name.unwrap_or_else(|| user.login.clone())),
            account_email: user.email,
            extra: serde_json::json!({ "login": user.login }),
        })
    }

    #[instrument(level = "info", skip(self, ctx, options))]
    async fn sync(&self, ctx: &SyncContext, options: &SyncOptions) -> Result<SyncBatch> {
        let started_at = Utc::now();
        let cursor = PageCursor::resume(options);
        let per_page = page_size(options, MAX_BATCH);
        let page_no: u32 = cursor
            .page
            .as_deref()
            .and_then(|p| p.parse().ok())
            .unwrap_or(1);
        let repo = ctx.metadata_str("repo");

        let mut query = vec![
            ("state", "all".to_string()),
            ("sort", "updated".to_string()),
            ("direction", "asc".to_string()),
            ("per_page", per_page.to_string()),
            ("page", page_no.to_string()),
        ];
        if let Some(since) = cursor.updated_after {
            query.push(("since", since.to_rfc3339()));
        }
        let path = match repo {
            Some(r) => format!("/repos/{r}/issues"),
            None => {
                query.push(("filter", "all".to_string()));
                "/issues".to_string()
            }
        };

        let issues: Vec<GithubIssueLike> = self
            .get_json(&ctx.tokens.access_token, &path, &query)
            .await?;

        let mut items = Vec::with_capacity(issues.len());
        for issue in &issues {
            let full_name = repo
                .map(str::to_string)
                .or_else(|| issue.repository.as_ref().map(|r| r.full_name.clone()));
            let Some(full_name) = full_name else {
                tracing::debug!(issue_id = issue.id, "issue without repository skipped");
                continue;
            };
            items.push(Self::issue_item(&full_name, issue, false)?);
        }

        let next_page = (issues.len() >= per_page).then(|| (page_no + 1).to_string());
        let next = cursor.next(next_page, started_at);
        Ok(SyncBatch {
            items,
            has_more: next.page.is_some(),
            next_cursor: Some(next.encode()),
        })
    }

    fn webhook_event(&self, request: &WebhookRequest) -> Option<String> {
        request.header("x-github-event").map(str::to_string)
    }

    fn webhook_id(&self, request: &WebhookRequest) -> Option<String> {
        request.header("x-github-hook-id").map(str::to_string)
    }

    #[instrument(level = "debug", skip(self, _ctx, request))]
    async fn handle_webhook(
        &self,
        _ctx: &SyncContext,
        request: &WebhookRequest,
        event: &str,
    ) -> Result<Vec<StandardIngestItem>> {
        let payload: WebhookPayload = serde_json::from_slice(&request.body)
            .map_err(|e| Error::InvalidInput(format!("invalid github webhook payload: {e}")))?;
        let repo = payload
            .repository
            .as_ref()
            .map(|r| r.full_name.clone())
            .ok_or_else(|| Error::InvalidInput("github webhook without repository".to_string()))?;
        let action = payload.action.clone().unwrap_or_default();

        let item = match (event, &payload) {
            (
                "issues",
                WebhookPayload {
                    issue: Some(issue), ..
                },
            ) => Self::issue_item(&repo, issue, false)?,
            (
                "pull_request",
                WebhookPayload {
                    pull_request: Some(pr),
                    ..
                },
            ) => Self::issue_item(&repo, pr, true)?,
            (
                "issue_comment",
                WebhookPayload {
                    issue: Some(issue),
                    comment: Some(comment),
                    ..
                },
            ) => {
                if action == "deleted" {
                    return Ok(vec![]);
                }
                Self::comment_item(&repo, issue, comment)?
            }
            _ => {
                return Err(Error::InvalidInput(format!(
                    "github {event} webhook is missing its object"
                )))
            }
        };
        Ok(vec![item.with_custom("action", serde_json::json!(action))])
    }

    #[instrument(level = "info", skip(self, tokens, metadata))]
    async fn register_webhook(
        &self,
        tokens: &TokenSet,
        metadata: &serde_json::Value,
        callback_url: &str,
    ) -> Result<Option<WebhookRegistration>> {
        let Some(repo) = metadata
            .get("repo")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
        else {
            return Ok(None);
        };
        let secret = new_webhook_secret();
        let body = serde_json::json!({
            "name": "web",
            "active": true,
            "events": WEBHOOK_EVENTS,
            "config": {
                "url": callback_url,
                "content_type": "json",
                "secret": secret,
                "insecure_ssl": "0",
            },
        });
        let headers = Self::headers(&tokens.access_token)?;
        let url = format!("{}/repos/{repo}/hooks", self.api_base);
        let resp = send_with_retry(ProviderId::Github, &self.retry, || {
            self.client.post(&url).headers(headers.clone()).json(&body)
        })
        .await?;
        let hook: CreatedHook = read_json(ProviderId::Github, resp).await?;
        Ok(Some(WebhookRegistration {
            webhook_id: Some(hook.id.to_string()),
            webhook_url: Some(callback_url.to_string()),
            secret,
            events: WEBHOOK_EVENTS.iter().map(|e| e.to_string()).collect(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::test_server::serve;
    use axum::extract::{Form, Query};
    use axum::http::{HeaderMap as AxumHeaders, StatusCode as HttpStatus};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tributary_core::sync::hashing::sign_hmac_sha256;
    use tributary_core::{IntegrationId, UserId};

    fn ctx(token: &str, metadata: serde_json::Value) -> SyncContext {
        SyncContext {
            user_id: UserId(IntegrationId::new().0),
            integration_id: IntegrationId::new(),
            provider: ProviderId::Github,
            tokens: TokenSet::api_key(token),
            metadata,
        }
    }

    fn authorized(headers: &AxumHeaders) -> bool {
        headers.get("authorization").and_then(|v| v.to_str().ok()) == Some("Bearer gh-token")
    }

    fn issue_json(number: u64, updated: &str, pr: bool) -> serde_json::Value {
        let mut v = serde_json::json!({
            "id": 1000 + number,
            "number": number,
            "title": format!("Issue {number}"),
            "body": "- [ ] write docs",
            "state": "open",
            "updated_at": updated,
            "html_url": format!("https://github.com/octo/hello/issues/{number}"),
            "user": {"login": "octocat"},
            "labels": [{"name": "bug"}],
            "comments": 2
        });
        if pr {
            v["pull_request"] = serde_json::json!({ "url": "x" });
        }
        v
    }

    async fn issues(
        headers: AxumHeaders,
        Query(q): Query<HashMap<String, String>>,
    ) -> (HttpStatus, Json<serde_json::Value>) {
        if !authorized(&headers) {
            return (HttpStatus::UNAUTHORIZED, Json(serde_json::json!({"message": "Bad credentials"})));
        }
        let body = match q.get("page").map(String::as_str) {
            Some("1") => serde_json::json!([
                issue_json(1, "2024-01-01T00:00:00Z", false),
                issue_json(2, "2024-01-02T00:00:00Z", true),
            ]),
            _ => serde_json::json!([issue_json(3, "2024-01-03T00:00:00Z", false)]),
        };
        (HttpStatus::OK, Json(body))
    }

    async fn user(headers: AxumHeaders) -> (HttpStatus, Json<serde_json::Value>) {
        if !authorized(&headers) {
            return (HttpStatus::UNAUTHORIZED, Json(serde_json::json!({})));
        }
        (
            HttpStatus::OK,
            Json(serde_json::json!({"login": "octocat", "name": "The Octocat", "email": null})),
        )
    }

    async fn access_token(Form(form): Form<HashMap<String, String>>) -> Json<serde_json::Value> {
        // GitHub reports bad codes with a 200 and an `error` field.
        if form.get("code").map(String::as_str) == Some("good") {
            Json(serde_json::json!({"access_token": "gh-token", "token_type": "bearer"}))
        } else {
            Json(serde_json::json!({"error": "bad_verification_code"}))
        }
    }

    async fn connector(hooks: Arc<Mutex<Vec<serde_json::Value>>>) -> GithubConnector {
        let base = serve(
            Router::new()
                .route("/repos/octo/hello/issues", get(issues))
                .route(
                    "/repos/octo/hello/hooks",
                    post(move |Json(body): Json<serde_json::Value>| {
                        let hooks = hooks.clone();
                        async move {
                            hooks.lock().unwrap().push(body);
                            (HttpStatus::CREATED, Json(serde_json::json!({"id": 4242})))
                        }
                    }),
                )
                .route("/user", get(user))
                .route("/login/oauth/access_token", post(access_token)),
        )
        .await;
        GithubConnector::new(Some(OAuthApp {
            client_id: "gh-cid".into(),
            client_secret: "gh-secret".into(),
            redirect_uri: "https://app.example/cb".into(),
        }))
        .unwrap()
        .with_api_base(base.clone())
        .with_oauth_base(base)
        .with_retry_policy(RetryPolicy::immediate(0))
    }

    #[tokio::test]
    async fn pulls_issues_and_prs_by_page() {
        let c = connector(Arc::default()).await;
        let meta = serde_json::json!({"repo": "octo/hello"});
        let opts = SyncOptions {
            limit: Some(2),
            ..SyncOptions::default()
        };
        let batch = c.sync(&ctx("gh-token", meta.clone()), &opts).await.unwrap();
        assert!(batch.has_more);
        assert_eq!(batch.items.len(), 2);
        assert_eq!(batch.items[0].source_id, "octo/hello#1");
        assert_eq!(batch.items[0].item_type, ItemType::Issue);
        assert_eq!(batch.items[1].item_type, ItemType::PullRequest);
        assert!(batch.items[0].processing_hints.extract_tasks);
        match &batch.items[0].metadata.details {
            Some(ItemDetails::Issue { identifier, labels, repository, .. }) => {
                assert_eq!(identifier, "octo/hello#1");
                assert_eq!(labels, &vec!["bug".to_string()]);
                assert_eq!(repository.as_deref(), Some("octo/hello"));
            }
            other => panic!("unexpected details: {other:?}"),
        }

        let opts = SyncOptions {
            limit: Some(2),
            cursor: batch.next_cursor,
            ..SyncOptions::default()
        };
        let batch = c.sync(&ctx("gh-token", meta), &opts).await.unwrap();
        assert!(!batch.has_more);
        assert_eq!(batch.items[0].source_id, "octo/hello#3");
    }

    #[tokio::test]
    async fn oauth_exchange_and_account() {
        let c = connector(Arc::default()).await;
        let url = c.authorization_url("xyz").unwrap();
        assert!(url.contains("/login/oauth/authorize"));
        assert!(url.contains("state=xyz"));

        let tokens = c.exchange_code_for_tokens("good").await.unwrap();
        assert_eq!(tokens.access_token, "gh-token");
        assert_eq!(tokens.expires_at, None);
        assert!(c.exchange_code_for_tokens("stale").await.is_err());
        assert!(matches!(
            c.refresh_access_token("anything").await,
            Err(Error::TokenRefresh { .. })
        ));

        assert!(c.validate_connection(&tokens).await.unwrap());
        assert!(!c.validate_connection(&TokenSet::api_key("nope")).await.unwrap());
        let account = c.account_info(&tokens).await.unwrap();
        assert_eq!(account.account_name.as_deref(), Some("The Octocat"));
        assert_eq!(account.extra["login"], "octocat");
    }

    #[tokio::test]
    async fn registers_repository_webhook() {
        let hooks: Arc<Mutex<Vec<serde_json::Value>>> = Arc::default();
        let c = connector(hooks.clone()).await;
        let tokens = TokenSet::api_key("gh-token");

        let none = c
            .register_webhook(&tokens, &serde_json::json!({}), "https://cb")
            .await
            .unwrap();
        assert!(none.is_none());

        let reg = c
            .register_webhook(
                &tokens,
                &serde_json::json!({"repo": "octo/hello"}),
                "https://hooks.example/webhooks/github",
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reg.webhook_id.as_deref(), Some("4242"));
        assert_eq!(reg.secret.len(), 64);

        let sent = hooks.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["config"]["secret"], reg.secret.as_str());
        assert_eq!(sent[0]["config"]["url"], "https://hooks.example/webhooks/github");
    }

    #[tokio::test]
    async fn webhook_issue_and_comment_deliveries() {
        let c = GithubConnector::new(None).unwrap();
        let body = serde_json::json!({
            "action": "opened",
            "issue": issue_json(7, "2024-02-01T00:00:00Z", false),
            "repository": {"full_name": "octo/hello"}
        })
        .to_string();
        let req = WebhookRequest::new(body.clone())
            .with_header("X-GitHub-Event", "issues")
            .with_header("X-GitHub-Hook-ID", "4242")
            .with_header("X-Hub-Signature-256", format!("sha256={}", sign_hmac_sha256("s3cret", body.as_bytes())));

        assert!(c.verify_webhook("s3cret", &req));
        assert!(!c.verify_webhook("other", &req));
        assert_eq!(c.webhook_event(&req).as_deref(), Some("issues"));
        assert_eq!(c.webhook_id(&req).as_deref(), Some("4242"));

        let items = c
            .handle_webhook(&ctx("t", serde_json::json!({})), &req, "issues")
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].source_id, "octo/hello#7");
        assert_eq!(items[0].metadata.custom["action"], "opened");

        let comment = serde_json::json!({
            "action": "created",
            "issue": issue_json(7, "2024-02-01T00:00:00Z", false),
            "comment": {
                "id": 99,
                "body": "TODO: add a regression test",
                "user": {"login": "hubot"},
                "updated_at": "2024-02-02T00:00:00Z"
            },
            "repository": {"full_name": "octo/hello"}
        })
        .to_string();
        let req = WebhookRequest::new(comment);
        let items = c
            .handle_webhook(&ctx("t", serde_json::json!({})), &req, "issue_comment")
            .await
            .unwrap();
        assert_eq!(items[0].source_id, "octo/hello#7/comment_99");
        assert_eq!(items[0].item_type, ItemType::Comment);
        assert_eq!(items[0].metadata.author.as_deref(), Some("hubot"));

        let broken = WebhookRequest::new(r#"{"action":"opened","repository":{"full_name":"a/b"}}"#);
        assert!(matches!(
            c.handle_webhook(&ctx("t", serde_json::json!({})), &broken, "issues").await,
            Err(Error::InvalidInput(_))
        ));
    }
}
