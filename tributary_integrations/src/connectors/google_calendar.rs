//! Google Calendar connector.
//!
//! OAuth2 with offline access (refresh tokens). Pulls events from the selected calendar
//! (`metadata.calendar_id`, default `primary`) filtered by `updatedMin`, paging with `pageToken`.
//! Cancelled events are dropped.
//!
//! Custom metadata keys: `calendar_id`, `organizer`, `all_day`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::instrument;
use tributary_core::sync::http::{http_client, read_json, send_with_retry, RetryPolicy};
use tributary_core::{
    AccountInfo, AuthMethod, Error, ItemDetails, ItemType, ProcessingHints, ProviderAdapter,
    ProviderDefinition, ProviderFeatures, ProviderId, Result, StandardIngestItem, SyncBatch,
    SyncContext, SyncMethod, SyncOptions, TokenSet,
};

use super::shared::{page_size, require_app, token_request, OAuthApp, PageCursor};

const DEFAULT_API_BASE: &str = "https://www.googleapis.com";
const DEFAULT_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const SCOPE: &str = "https://www.googleapis.com/auth/calendar.readonly";
const MAX_BATCH: usize = 250;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsPage {
    #[serde(default)]
    items: Vec<GoogleEvent>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct GoogleEvent {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    html_link: Option<String>,
    #[serde(default)]
    updated: Option<DateTime<Utc>>,
    #[serde(default)]
    start: Option<EventTime>,
    #[serde(default)]
    end: Option<EventTime>,
    #[serde(default)]
    attendees: Vec<Attendee>,
    #[serde(default)]
    organizer: Option<Attendee>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct EventTime {
    #[serde(default)]
    date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    date: Option<NaiveDate>,
}

impl EventTime {
    fn instant(&self) -> Option<DateTime<Utc>> {
        self.date_time.or_else(|| {
            self.date
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|naive| naive.and_utc())
        })
    }
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct Attendee {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
}

impl Attendee {
    fn label(&self) -> Option<String> {
        self.display_name.clone().or_else(|| self.email.clone())
    }
}

#[derive(Debug, Deserialize)]
struct PrimaryCalendar {
    id: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(rename = "timeZone", default)]
    time_zone: Option<String>,
}

pub struct GoogleCalendarConnector {
    client: Client,
    app: Option<OAuthApp>,
    api_base: String,
    auth_url: String,
    token_url: String,
    retry: RetryPolicy,
    definition: ProviderDefinition,
}

impl GoogleCalendarConnector {
    pub fn new(app: Option<OAuthApp>) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            app,
            api_base: DEFAULT_API_BASE.to_string(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            retry: RetryPolicy::default(),
            definition: ProviderDefinition {
                id: ProviderId::GoogleCalendar,
                name: "Google Calendar",
                auth_method: AuthMethod::Oauth2,
                item_types: vec![ItemType::Event, ItemType::Meeting],
                sync_method: SyncMethod::Pull,
                default_sync_interval_secs: Some(15 * 60),
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

    pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        token: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}{}", self.api_base, path);
        let resp = send_with_retry(ProviderId::GoogleCalendar, &self.retry, || {
            self.client.get(&url).bearer_auth(token).query(query)
        })
        .await?;
        read_json(ProviderId::GoogleCalendar, resp).await
    }

    fn event_item(calendar_id: &str, ev: &GoogleEvent) -> Result<StandardIngestItem> {
        let title = ev
            .summary
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "(untitled event)".to_string());
        let description = ev.description.clone().unwrap_or_default();
        let attendees: Vec<String> = ev.attendees.iter().filter_map(Attendee::label).collect();
        let all_day = ev
            .start
            .as_ref()
            .is_some_and(|s| s.date_time.is_none() && s.date.is_some());
        // More than one attendee means it is a meeting rather than a personal block.
        let item_type = if attendees.len() > 1 {
            ItemType::Meeting
        } else {
            ItemType::Event
        };

        let mut item = StandardIngestItem::new(
            ProviderId::GoogleCalendar,
            format!("event_{}", ev.id),
            item_type,
            description.clone(),
        )?
        .with_title(title)
        .with_url(ev.html_link.clone())
        .with_author(ev.organizer.as_ref().and_then(Attendee::label))
        .with_details(ItemDetails::Event {
            start: ev.start.as_ref().and_then(EventTime::instant),
            end: ev.end.as_ref().and_then(EventTime::instant),
            attendees,
            location: ev.location.clone(),
            status: ev.status.clone(),
        })
        .with_hints(ProcessingHints {
            extract_tasks: false,
            extract_memories: !description.trim().is_empty(),
        })
        .with_custom("calendar_id", serde_json::json!(calendar_id))
        .with_custom("all_day", serde_json::json!(all_day))
        .with_raw(serde_json::to_value(ev).unwrap_or_default());
        if let Some(organizer) = ev.organizer.as_ref().and_then(|o| o.email.clone()) {
            item = item.with_custom("organizer", serde_json::json!(organizer));
        }
        if let Some(updated) = ev.updated {
            item = item.with_timestamp(updated);
        }
        Ok(item)
    }
}

#[async_trait]
impl ProviderAdapter for GoogleCalendarConnector {
    fn definition(&self) -> &ProviderDefinition {
        &self.definition
    }

    fn authorization_url(&self, state: &str) -> Result<String> {
        let app = require_app(self.app.as_ref(), ProviderId::GoogleCalendar)?;
        let url = url::Url::parse_with_params(
            &self.auth_url,
            &[
                ("client_id", app.client_id.as_str()),
                ("redirect_uri", app.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", SCOPE),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("include_granted_scopes", "true"),
                ("state", state),
            ],
        )
        .map_err(|e| Error::backend("build google auth url", e))?;
        Ok(url.to_string())
    }

    #[instrument(level = "info", skip(self, code))]
    async fn exchange_code_for_tokens(&self, code: &str) -> Result<TokenSet> {
        let app = require_app(self.app.as_ref(), ProviderId::GoogleCalendar)?;
        token_request(
            &self.client,
            ProviderId::GoogleCalendar,
            &self.token_url,
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", &app.client_id),
                ("client_secret", &app.client_secret),
                ("redirect_uri", &app.redirect_uri),
            ],
        )
        .await
    }

    #[instrument(level = "info", skip(self, refresh_token))]
    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenSet> {
        let app = require_app(self.app.as_ref(), ProviderId::GoogleCalendar)?;
        token_request(
            &self.client,
            ProviderId::GoogleCalendar,
            &self.token_url,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", &app.client_id),
                ("client_secret", &app.client_secret),
            ],
        )
        .await
        .map_err(|e| Error::token_refresh(ProviderId::GoogleCalendar, e.to_string()))
    }

    #[instrument(level = "debug", skip(self, tokens))]
    async fn validate_connection(&self, tokens: &TokenSet) -> Result<bool> {
        let res: Result<serde_json::Value> = self
            .get_json(
                &tokens.access_token,
                "/calendar/v3/users/me/calendarList",
                &[("maxResults", "1".to_string())],
            )
            .await;
        match res {
            Ok(_) => Ok(true),
            Err(Error::ProviderApi {
                status: Some(401) | Some(403),
                ..
            }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[instrument(level = "debug", skip(self, tokens))]
    async fn account_info(&self, tokens: &TokenSet) -> Result<AccountInfo> {
        let cal: PrimaryCalendar = self
            .get_json(&tokens.access_token, "/calendar/v3/calendars/primary", &[])
            .await?;
        Ok(AccountInfo {
            account_name: cal.summary,
            account_email: Some(cal.id),
            extra: serde_json::json!({ "time_zone": cal.time_zone }),
        })
    }

    #[instrument(level = "info", skip(self, ctx, options))]
    async fn sync(&self, ctx: &SyncContext, options: &SyncOptions) -> Result<SyncBatch> {
        let started_at = Utc::now();
        let calendar_id = ctx.metadata_str("calendar_id").unwrap_or("primary").to_string();
        let cursor = PageCursor::resume(options);

        let mut query = vec![
            ("maxResults", page_size(options, MAX_BATCH).to_string()),
            ("singleEvents", "true".to_string()),
            ("showDeleted", "false".to_string()),
            ("orderBy", "updated".to_string()),
        ];
        if let Some(after) = cursor.updated_after {
            query.push(("updatedMin", after.to_rfc3339()));
        }
        if let Some(page) = &cursor.page {
            query.push(("pageToken", page.clone()));
        }

        let path = format!(
            "/calendar/v3/calendars/{}/events",
            url::form_urlencoded::byte_serialize(calendar_id.as_bytes()).collect::<String>()
        );
        let page: EventsPage = self.get_json(&ctx.tokens.access_token, &path, &query).await?;

        let mut items = Vec::with_capacity(page.items.len());
        for ev in page
            .items
            .iter()
            .filter(|ev| ev.status.as_deref() != Some("cancelled"))
        {
            items.push(Self::event_item(&calendar_id, ev)?);
        }

        let next = cursor.next(page.next_page_token, started_at);
        Ok(SyncBatch {
            items,
            has_more: next.page.is_some(),
            next_cursor: Some(next.encode()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::test_server::serve;
    use axum::extract::{Form, Query};
    use axum::http::{HeaderMap, StatusCode as HttpStatus};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::HashMap;
    use tributary_core::{IntegrationId, UserId};

    fn app() -> OAuthApp {
        OAuthApp {
            client_id: "cid".into(),
            client_secret: "csecret".into(),
            redirect_uri: "https://app.example/oauth/google_calendar/callback".into(),
        }
    }

    fn ctx(token: &str) -> SyncContext {
        SyncContext {
            user_id: UserId(IntegrationId::new().0),
            integration_id: IntegrationId::new(),
            provider: ProviderId::GoogleCalendar,
            tokens: TokenSet {
                access_token: token.into(),
                refresh_token: Some("rt".into()),
                expires_at: None,
            },
            metadata: serde_json::json!({}),
        }
    }

    fn bearer(headers: &HeaderMap) -> Option<&str> {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
    }

    async fn token(Form(form): Form<HashMap<String, String>>) -> (HttpStatus, Json<serde_json::Value>) {
        match (form.get("grant_type").map(String::as_str), form.get("client_secret").map(String::as_str)) {
            (Some("authorization_code"), Some("csecret")) => (
                HttpStatus::OK,
                Json(serde_json::json!({
                    "access_token": "g-at", "refresh_token": "g-rt", "expires_in": 3599
                })),
            ),
            (Some("refresh_token"), _) if form.get("refresh_token").map(String::as_str) == Some("g-rt") => (
                HttpStatus::OK,
                Json(serde_json::json!({ "access_token": "g-at2", "expires_in": 3599 })),
            ),
            _ => (
                HttpStatus::BAD_REQUEST,
                Json(serde_json::json!({ "error": "invalid_grant" })),
            ),
        }
    }

    async fn events(
        headers: HeaderMap,
        Query(q): Query<HashMap<String, String>>,
    ) -> (HttpStatus, Json<serde_json::Value>) {
        if bearer(&headers) != Some("g-at") {
            return (HttpStatus::UNAUTHORIZED, Json(serde_json::json!({})));
        }
        assert_eq!(q.get("singleEvents").map(String::as_str), Some("true"));
        let body = match q.get("pageToken").map(String::as_str) {
            None => serde_json::json!({
                "nextPageToken": "tok2",
                "items": [{
                    "id": "e1",
                    "status": "confirmed",
                    "summary": "Planning",
                    "description": "Agree on Q3 goals",
                    "location": "Room 4",
                    "updated": "2024-06-01T09:00:00Z",
                    "start": {"dateTime": "2024-06-03T10:00:00Z"},
                    "end": {"dateTime": "2024-06-03T11:00:00Z"},
                    "attendees": [{"email": "a@example.com"}, {"email": "b@example.com", "displayName": "Bea"}],
                    "organizer": {"email": "a@example.com"}
                }, {
                    "id": "e2",
                    "status": "cancelled",
                    "updated": "2024-06-01T10:00:00Z"
                }]
            }),
            Some("tok2") => serde_json::json!({
                "items": [{
                    "id": "e3",
                    "summary": "Holiday",
                    "updated": "2024-06-02T09:00:00Z",
                    "start": {"date": "2024-07-04"},
                    "end": {"date": "2024-07-05"}
                }]
            }),
            Some(_) => return (HttpStatus::BAD_REQUEST, Json(serde_json::json!({}))),
        };
        (HttpStatus::OK, Json(body))
    }

    async fn primary(headers: HeaderMap) -> (HttpStatus, Json<serde_json::Value>) {
        if bearer(&headers) != Some("g-at") {
            return (HttpStatus::UNAUTHORIZED, Json(serde_json::json!({})));
        }
        (
            HttpStatus::OK,
            Json(serde_json::json!({ "id": "me@example.com", "summary": "Me", "timeZone": "UTC" })),
        )
    }

    async fn connector() -> GoogleCalendarConnector {
        let base = serve(
            Router::new()
                .route("/token", post(token))
                .route("/calendar/v3/calendars/primary/events", get(events))
                .route("/calendar/v3/calendars/primary", get(primary))
                .route("/calendar/v3/users/me/calendarList", get(primary)),
        )
        .await;
        GoogleCalendarConnector::new(Some(app()))
            .unwrap()
            .with_api_base(base.clone())
            .with_token_url(format!("{base}/token"))
            .with_retry_policy(RetryPolicy::immediate(0))
    }

    #[tokio::test]
    async fn authorization_url_requests_offline_access() {
        let c = GoogleCalendarConnector::new(Some(app())).unwrap();
        let url = url::Url::parse(&c.authorization_url("st-1").unwrap()).unwrap();
        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["client_id"], "cid");
        assert_eq!(params["access_type"], "offline");
        assert_eq!(params["state"], "st-1");
        assert_eq!(params["scope"], SCOPE);

        let unconfigured = GoogleCalendarConnector::new(None).unwrap();
        assert!(matches!(
            unconfigured.authorization_url("s"),
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn code_exchange_and_refresh() {
        let c = connector().await;
        let tokens = c.exchange_code_for_tokens("code-1").await.unwrap();
        assert_eq!(tokens.access_token, "g-at");
        assert_eq!(tokens.refresh_token.as_deref(), Some("g-rt"));
        assert!(tokens.expires_at.unwrap() > Utc::now());

        let refreshed = c.refresh_access_token("g-rt").await.unwrap();
        assert_eq!(refreshed.access_token, "g-at2");
        assert_eq!(refreshed.refresh_token, None);

        let err = c.refresh_access_token("revoked").await.unwrap_err();
        assert!(matches!(err, Error::TokenRefresh { .. }));
    }

    #[tokio::test]
    async fn events_page_and_resume() {
        let c = connector().await;
        let batch = c.sync(&ctx("g-at"), &SyncOptions::default()).await.unwrap();
        assert!(batch.has_more);
        assert_eq!(batch.items.len(), 1);

        let ev = &batch.items[0];
        assert_eq!(ev.source_id, "event_e1");
        assert_eq!(ev.item_type, ItemType::Meeting);
        assert_eq!(ev.title.as_deref(), Some("Planning"));
        assert!(ev.processing_hints.extract_memories);
        match &ev.metadata.details {
            Some(ItemDetails::Event { attendees, location, start, .. }) => {
                assert_eq!(attendees, &vec!["a@example.com".to_string(), "Bea".to_string()]);
                assert_eq!(location.as_deref(), Some("Room 4"));
                assert_eq!(*start, Some("2024-06-03T10:00:00Z".parse().unwrap()));
            }
            other => panic!("unexpected details: {other:?}"),
        }

        let opts = SyncOptions {
            cursor: batch.next_cursor,
            ..SyncOptions::default()
        };
        let batch = c.sync(&ctx("g-at"), &opts).await.unwrap();
        assert!(!batch.has_more);
        let holiday = &batch.items[0];
        assert_eq!(holiday.item_type, ItemType::Event);
        assert_eq!(holiday.metadata.custom["all_day"], serde_json::json!(true));
        assert!(!holiday.processing_hints.extract_memories);
    }

    #[tokio::test]
    async fn expired_token_fails_validation() {
        let c = connector().await;
        assert!(c.validate_connection(&TokenSet::api_key("g-at")).await.unwrap());
        assert!(!c.validate_connection(&TokenSet::api_key("old")).await.unwrap());

        let account = c.account_info(&TokenSet::api_key("g-at")).await.unwrap();
        assert_eq!(account.account_email.as_deref(), Some("me@example.com"));

        let err = c.sync(&ctx("old"), &SyncOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::ProviderApi { status: Some(401), .. }));
    }
}
