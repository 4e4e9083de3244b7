//! Linear connector.
//!
//! API-key access to the Linear GraphQL API. Pulls issues ordered by `updatedAt` (optionally
//! scoped to `metadata.team_id`) with relay-style paging, and receives `Issue` / `Comment`
//! webhooks signed with `Linear-Signature`. Webhooks are created by the user in Linear's settings
//! and recorded with their signing secret; deliveries are routed by `webhookId`.
//!
//! Custom metadata keys: `priority`, `team`, `action` (webhook items only).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::instrument;
use tributary_core::sync::http::{http_client, read_json, send_with_retry, RetryPolicy};
use tributary_core::{
    AccountInfo, AuthMethod, Error, ItemDetails, ItemType, ProcessingHints, ProviderAdapter,
    ProviderDefinition, ProviderFeatures, ProviderId, Result, StandardIngestItem, SyncBatch,
    SyncContext, SyncMethod, SyncOptions, TokenSet, WebhookRequest,
};

use super::shared::{page_size, PageCursor};

const DEFAULT_API_BASE: &str = "https://api.linear.app/graphql";
const MAX_BATCH: usize = 100;

const ISSUES_QUERY: &str = r#"
query Issues($first: Int!, $after: String, $filter: IssueFilter) {
  issues(first: $first, after: $after, filter: $filter, orderBy: updatedAt) {
    nodes {
      id identifier title description url priority updatedAt
      state { name }
      assignee { name }
      creator { name }
      team { key }
      labels { nodes { name } }
    }
    pageInfo { hasNextPage endCursor }
  }
}
"#;

const VIEWER_QUERY: &str = "query { viewer { id name email } organization { name urlKey } }";

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: serde::de::DeserializeOwned"))]
struct GraphqlResponse<T> {
    #[serde(default)]
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct IssuesData {
    issues: IssuesConnection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssuesConnection {
    #[serde(default)]
    nodes: Vec<LinearIssue>,
    page_info: PageInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    #[serde(default)]
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize, serde::Serialize, Clone)]
struct Named {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize, serde::Serialize, Clone)]
struct TeamRef {
    key: String,
}

/// The issues query returns labels as a connection; webhook payloads send a plain list.
#[derive(Debug, Deserialize, serde::Serialize, Clone)]
#[serde(untagged)]
enum Labels {
    Connection { nodes: Vec<Named> },
    List(Vec<Named>),
}

impl Labels {
    fn names(&self) -> Vec<String> {
        let nodes = match self {
            Labels::Connection { nodes } => nodes,
            Labels::List(nodes) => nodes,
        };
        nodes.iter().filter_map(|n| n.name.clone()).collect()
    }
}

#[derive(Debug, Deserialize, serde::Serialize, Clone)]
#[serde(rename_all = "camelCase")]
struct LinearIssue {
    id: String,
    identifier: String,
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    priority: Option<f64>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    state: Option<Named>,
    #[serde(default)]
    assignee: Option<Named>,
    #[serde(default)]
    creator: Option<Named>,
    #[serde(default)]
    team: Option<TeamRef>,
    #[serde(default)]
    labels: Option<Labels>,
}

#[derive(Debug, Deserialize, serde::Serialize, Clone)]
#[serde(rename_all = "camelCase")]
struct IssueRef {
    #[serde(default)]
    identifier: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize, serde::Serialize, Clone)]
#[serde(rename_all = "camelCase")]
struct LinearComment {
    id: String,
    body: String,
    #[serde(default)]
    url: Option<String>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    user: Option<Named>,
    #[serde(default)]
    issue: Option<IssueRef>,
}

#[derive(Debug, Deserialize)]
struct ViewerData {
    viewer: Viewer,
    #[serde(default)]
    organization: Option<Organization>,
}

#[derive(Debug, Deserialize)]
struct Viewer {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Organization {
    name: String,
    #[serde(default)]
    url_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookEnvelope {
    #[serde(default)]
    action: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
}

pub struct LinearConnector {
    client: Client,
    api_base: String,
    retry: RetryPolicy,
    definition: ProviderDefinition,
}

impl LinearConnector {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            api_base: DEFAULT_API_BASE.to_string(),
            retry: RetryPolicy::default(),
            definition: ProviderDefinition {
                id: ProviderId::Linear,
                name: "Linear",
                auth_method: AuthMethod::ApiKey,
                item_types: vec![ItemType::Issue, ItemType::Comment],
                sync_method: SyncMethod::Pull,
                default_sync_interval_secs: Some(15 * 60),
                features: ProviderFeatures {
                    realtime: true,
                    bidirectional: false,
                    incremental_sync: true,
                    webhooks: true,
                },
                webhook_signature_header: Some("linear-signature"),
                webhook_events: vec!["Issue", "Comment"],
            },
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn graphql<T: DeserializeOwned>(
        &self,
        api_key: &str,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T> {
        let body = serde_json::json!({ "query": query, "variables": variables });
        let resp = send_with_retry(ProviderId::Linear, &self.retry, || {
            self.client
                .post(&self.api_base)
                .header(reqwest::header::AUTHORIZATION, api_key)
                .json(&body)
        })
        .await?;
        let parsed: GraphqlResponse<T> = read_json(ProviderId::Linear, resp).await?;
        if let Some(first) = parsed.errors.first() {
            return Err(Error::provider_api(
                ProviderId::Linear,
                None,
                first.message.clone(),
            ));
        }
        parsed
            .data
            .ok_or_else(|| Error::provider_api(ProviderId::Linear, None, "graphql response without data"))
    }

    fn issue_item(issue: &LinearIssue) -> Result<StandardIngestItem> {
        let labels = issue.labels.as_ref().map(Labels::names).unwrap_or_default();
        let mut item = StandardIngestItem::new(
            ProviderId::Linear,
            issue.id.clone(),
            ItemType::Issue,
            issue.description.clone().unwrap_or_default(),
        )?
        .with_title(format!("{}: {}", issue.identifier, issue.title))
        .with_url(issue.url.clone())
        .with_author(issue.creator.as_ref().and_then(|c| c.name.clone()))
        .with_tags(labels.clone())
        .with_timestamp(issue.updated_at)
        .with_details(ItemDetails::Issue {
            identifier: issue.identifier.clone(),
            state: issue.state.as_ref().and_then(|s| s.name.clone()),
            assignee: issue.assignee.as_ref().and_then(|a| a.name.clone()),
            labels,
            repository: None,
        })
        .with_hints(ProcessingHints {
            extract_tasks: true,
            extract_memories: false,
        })
        .with_raw(serde_json::to_value(issue).unwrap_or_default());
        if let Some(priority) = issue.priority {
            item = item.with_custom("priority", serde_json::json!(priority));
        }
        if let Some(team) = &issue.team {
            item = item.with_custom("team", serde_json::json!(team.key));
        }
        Ok(item)
    }

    fn comment_item(comment: &LinearComment) -> Result<StandardIngestItem> {
        let title = comment.issue.as_ref().map(|i| {
            format!(
                "Comment on {}",
                i.identifier
                    .clone()
                    .or_else(|| i.title.clone())
                    .unwrap_or_else(|| "issue".to_string())
            )
        });
        let mut item = StandardIngestItem::new(
            ProviderId::Linear,
            format!("comment_{}", comment.id),
            ItemType::Comment,
            comment.body.clone(),
        )?
        .with_url(comment.url.clone())
        .with_author(comment.user.as_ref().and_then(|u| u.name.clone()))
        .with_timestamp(comment.updated_at)
        .with_hints(ProcessingHints {
            extract_tasks: true,
            extract_memories: false,
        })
        .with_raw(serde_json::to_value(comment).unwrap_or_default());
        if let Some(title) = title {
            item = item.with_title(title);
        }
        Ok(item)
    }

    fn envelope(request: &WebhookRequest) -> Option<WebhookEnvelope> {
        serde_json::from_slice(&request.body).ok()
    }
}

#[async_trait]
impl ProviderAdapter for LinearConnector {
    fn definition(&self) -> &ProviderDefinition {
        &self.definition
    }

    #[instrument(level = "debug", skip(self, tokens))]
    async fn validate_connection(&self, tokens: &TokenSet) -> Result<bool> {
        match self
            .graphql::<ViewerData>(&tokens.access_token, VIEWER_QUERY, serde_json::json!({}))
            .await
        {
            Ok(_) => Ok(true),
            // Linear answers bad keys with 400/401 and an authentication error.
            Err(Error::ProviderApi {
                status: Some(400) | Some(401) | Some(403),
                ..
            }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[instrument(level = "debug", skip(self, tokens))]
    async fn account_info(&self, tokens: &TokenSet) -> Result<AccountInfo> {
        let data: ViewerData = self
            .graphql(&tokens.access_token, VIEWER_QUERY, serde_json::json!({}))
            .await?;
        Ok(AccountInfo {
            account_name: data.viewer.name,
            account_email: data.viewer.email,
            extra: serde_json::json!({
                "linear_user_id": data.viewer.id,
                "organization": data.organization.as_ref().map(|o| o.name.clone()),
                "organization_key": data.organization.and_then(|o| o.url_key),
            }),
        })
    }

    #[instrument(level = "info", skip(self, ctx, options))]
    async fn sync(&self, ctx: &SyncContext, options: &SyncOptions) -> Result<SyncBatch> {
        let started_at = Utc::now();
        let cursor = PageCursor::resume(options);

        let mut filter = serde_json::Map::new();
        if let Some(after) = cursor.updated_after {
            filter.insert(
                "updatedAt".into(),
                serde_json::json!({ "gt": after.to_rfc3339() }),
            );
        }
        if let Some(team) = ctx.metadata_str("team_id") {
            filter.insert("team".into(), serde_json::json!({ "id": { "eq": team } }));
        }
        let variables = serde_json::json!({
            "first": page_size(options, MAX_BATCH),
            "after": cursor.page,
            "filter": serde_json::Value::Object(filter),
        });

        let data: IssuesData = self
            .graphql(&ctx.tokens.access_token, ISSUES_QUERY, variables)
            .await?;
        let items = data
            .issues
            .nodes
            .iter()
            .map(Self::issue_item)
            .collect::<Result<Vec<_>>>()?;

        let page_info = data.issues.page_info;
        let next_page = if page_info.has_next_page {
            page_info.end_cursor
        } else {
            None
        };
        let next = cursor.next(next_page, started_at);
        Ok(SyncBatch {
            items,
            has_more: next.page.is_some(),
            next_cursor: Some(next.encode()),
        })
    }

    fn webhook_event(&self, request: &WebhookRequest) -> Option<String> {
        Self::envelope(request).and_then(|e| e.kind)
    }

    fn webhook_id(&self, request: &WebhookRequest) -> Option<String> {
        let body: serde_json::Value = serde_json::from_slice(&request.body).ok()?;
        body.get("webhookId")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    #[instrument(level = "debug", skip(self, _ctx, request))]
    async fn handle_webhook(
        &self,
        _ctx: &SyncContext,
        request: &WebhookRequest,
        event: &str,
    ) -> Result<Vec<StandardIngestItem>> {
        let envelope = Self::envelope(request)
            .ok_or_else(|| Error::InvalidInput("invalid linear webhook payload".to_string()))?;
        let action = envelope.action.unwrap_or_default();
        if action == "remove" {
            return Ok(vec![]);
        }
        let item = match event {
            "Issue" => {
                let issue: LinearIssue = serde_json::from_value(envelope.data)
                    .map_err(|e| Error::InvalidInput(format!("invalid linear issue: {e}")))?;
                Self::issue_item(&issue)?
            }
            "Comment" => {
                let comment: LinearComment = serde_json::from_value(envelope.data)
                    .map_err(|e| Error::InvalidInput(format!("invalid linear comment: {e}")))?;
                Self::comment_item(&comment)?
            }
            other => {
                return Err(Error::InvalidInput(format!(
                    "unsupported linear event {other}"
                )))
            }
        };
        Ok(vec![item.with_custom("action", serde_json::json!(action))])
    }
}
