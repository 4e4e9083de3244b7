use crate::config::SyncConfig;
use crate::models::{IntegrationId, ProviderId};
use crate::store::traits::SyncStore;
use crate::sync::models::{CursorAdvance, StandardIngestItem, WebhookRequest, WebhookSubscription};
use crate::sync::processing::{ItemOutcome, ItemProcessor};
use crate::sync::registry::ProviderRegistry;
use crate::sync::traits::{ProviderAdapter, SyncContext};
use crate::{Error, Result};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookDisposition {
    Processed,
    Ignored,
}

/// Acknowledgement body returned to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookAck {
    pub status: WebhookDisposition,
    pub event: Option<String>,
    /// Subscriptions whose secret verified the delivery.
    pub subscriptions: usize,
    pub items_created: u64,
    pub items_updated: u64,
    pub items_retried: u64,
    pub items_skipped: u64,
    pub items_failed: u64,
}

impl WebhookAck {
    fn new(status: WebhookDisposition, event: Option<String>, subscriptions: usize) -> Self {
        Self {
            status,
            event,
            subscriptions,
            items_created: 0,
            items_updated: 0,
            items_retried: 0,
            items_skipped: 0,
            items_failed: 0,
        }
    }
}

/// Verifies inbound deliveries and feeds them through the same per-item path as pull sync.
pub struct WebhookReceiver {
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn SyncStore>,
    processor: ItemProcessor,
    max_payload_bytes: usize,
}

impl WebhookReceiver {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<dyn SyncStore>,
        processor: ItemProcessor,
        config: &SyncConfig,
    ) -> Self {
        Self {
            registry,
            store,
            processor,
            max_payload_bytes: config.max_webhook_payload_bytes,
        }
    }

    /// Subscriptions narrowed by the delivery's hook id, falling back to every active
    /// subscription for the provider when none carries that id.
    async fn candidates(
        &self,
        adapter: &dyn ProviderAdapter,
        request: &WebhookRequest,
    ) -> Result<Vec<WebhookSubscription>> {
        let provider = adapter.id();
        if let Some(hook_id) = adapter.webhook_id(request) {
            let subs = self
                .store
                .list_active_webhook_subscriptions(provider, Some(&hook_id))
                .await?;
            if !subs.is_empty() {
                return Ok(subs);
            }
        }
        self.store
            .list_active_webhook_subscriptions(provider, None)
            .await
    }

    /// Verify, route and ingest one delivery.
    ///
    /// Fails with `PayloadTooLarge` or `WebhookSignature` before touching any state.
    /// Unsupported events are acknowledged as ignored.
    #[tracing::instrument(level = "info", skip(self, request), fields(provider = %provider, bytes = request.body.len()))]
    pub async fn receive(&self, provider: ProviderId, request: WebhookRequest) -> Result<WebhookAck> {
        if request.body.len() > self.max_payload_bytes {
            return Err(Error::PayloadTooLarge);
        }
        let adapter = self.registry.get(provider)?;

        let verified: Vec<WebhookSubscription> = self
            .candidates(adapter.as_ref(), &request)
            .await?
            .into_iter()
            .filter(|sub| adapter.verify_webhook(&sub.secret, &request))
            .collect();
        if verified.is_empty() {
            tracing::warn!("webhook signature did not match any subscription");
            return Err(Error::WebhookSignature);
        }

        let event = adapter.webhook_event(&request);
        let supported = event
            .as_deref()
            .is_some_and(|e| adapter.definition().supports_event(e));
        let now = Utc::now();

        if !supported {
            for sub in &verified {
                self.store.record_webhook_delivery(sub.id, None, now).await?;
            }
            tracing::info!(event = ?event, "webhook event ignored");
            return Ok(WebhookAck::new(
                WebhookDisposition::Ignored,
                event,
                verified.len(),
            ));
        }
        let event = event.unwrap_or_default();

        let mut ack = WebhookAck::new(
            WebhookDisposition::Processed,
            Some(event.clone()),
            verified.len(),
        );
        for sub in &verified {
            let error = match self
                .deliver(adapter.as_ref(), sub.integration_id, &request, &event, &mut ack)
                .await
            {
                Ok(error) => error,
                Err(e) => Some(e.to_string()),
            };
            if let Some(ref message) = error {
                tracing::warn!(subscription_id = %sub.id, error = %message, "webhook delivery had errors");
            }
            self.store
                .record_webhook_delivery(sub.id, error.as_deref(), Utc::now())
                .await?;
        }
        tracing::info!(
            event = %event,
            created = ack.items_created,
            updated = ack.items_updated,
            retried = ack.items_retried,
            skipped = ack.items_skipped,
            failed = ack.items_failed,
            "webhook processed"
        );
        Ok(ack)
    }

    /// Transform and ingest for one integration. `Ok(Some(_))` carries the first item error.
    async fn deliver(
        &self,
        adapter: &dyn ProviderAdapter,
        integration_id: IntegrationId,
        request: &WebhookRequest,
        event: &str,
        ack: &mut WebhookAck,
    ) -> Result<Option<String>> {
        let integration = self
            .store
            .get_integration_by_id(integration_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("integration {integration_id}")))?;
        let ctx = SyncContext::from_integration(&integration);
        let items = adapter.handle_webhook(&ctx, request, event).await?;

        let mut first_error = None;
        let mut created = 0u64;
        let mut handled: Vec<&StandardIngestItem> = Vec::with_capacity(items.len());
        let mut failed: Vec<&StandardIngestItem> = Vec::new();
        for item in &items {
            match self.processor.process(&integration, item, false).await {
                Ok(ItemOutcome::Created) => {
                    created += 1;
                    ack.items_created += 1;
                }
                Ok(ItemOutcome::Updated) => ack.items_updated += 1,
                Ok(ItemOutcome::Retried) => ack.items_retried += 1,
                Ok(ItemOutcome::Unchanged) => ack.items_skipped += 1,
                Err(e) => {
                    ack.items_failed += 1;
                    first_error.get_or_insert_with(|| e.to_string());
                    failed.push(item);
                    continue;
                }
            }
            handled.push(item);
        }

        let advance = CursorAdvance::before_failures(handled, failed);
        if created > 0 || advance.is_some() {
            self.store
                .record_webhook_progress(integration.id, created, advance.as_ref(), Utc::now())
                .await?;
        }
        Ok(first_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserId;
    use crate::store::sqlite::SqliteSyncStore;
    use crate::sync::hashing::sign_hmac_sha256;
    use crate::sync::models::{Integration, SyncBatch, SyncOptions, TokenSet, WebhookRegistration};
    use crate::sync::engine::SyncOrchestrator;
    use crate::test_support::{
        note, store_with_integration, FailingPipeline, FakeAdapter, FAKE_EVENT_HEADER,
        FAKE_SIGNATURE_HEADER,
    };
    use chrono::TimeZone;
    use uuid::Uuid;

    const SECRET: &str = "whsec_test";

    async fn subscribe(store: &SqliteSyncStore, integ: &Integration, hook_id: Option<&str>, secret: &str) {
        let sub = WebhookSubscription::from_registration(
            integ,
            WebhookRegistration {
                webhook_id: hook_id.map(str::to_string),
                webhook_url: None,
                secret: secret.to_string(),
                events: vec!["item.created".into()],
            },
            Utc::now(),
        )
        .unwrap();
        store.upsert_webhook_subscription(&sub).await.unwrap();
    }

    fn signed(body: &str, secret: &str, event: &str) -> WebhookRequest {
        WebhookRequest::new(body.as_bytes().to_vec())
            .with_header(FAKE_SIGNATURE_HEADER, format!("sha256={}", sign_hmac_sha256(secret, body.as_bytes())))
            .with_header(FAKE_EVENT_HEADER, event)
    }

    fn receiver(store: Arc<SqliteSyncStore>, adapter: Arc<FakeAdapter>) -> WebhookReceiver {
        let registry = ProviderRegistry::builder().register(adapter).build().unwrap();
        let processor = ItemProcessor::new(store.clone(), Arc::new(FailingPipeline::default()));
        WebhookReceiver::new(Arc::new(registry), store, processor, &SyncConfig::default())
    }

    const BODY: &str = r#"{"hook_id":"hook-1","items":[{"id":"a","content":"hello","ts":"2024-05-01T03:00:00Z"}]}"#;

    #[tokio::test]
    async fn verified_delivery_is_ingested() {
        let (store, integ) =
            store_with_integration(ProviderId::Github, TokenSet::api_key("gh")).await;
        subscribe(&store, &integ, Some("hook-1"), SECRET).await;
        let rx = receiver(store.clone(), Arc::new(FakeAdapter::new(ProviderId::Github)));

        let ack = rx
            .receive(ProviderId::Github, signed(BODY, SECRET, "item.created"))
            .await
            .unwrap();
        assert_eq!(ack.status, WebhookDisposition::Processed);
        assert_eq!(ack.items_created, 1);

        // Redelivery is deduplicated.
        let ack = rx
            .receive(ProviderId::Github, signed(BODY, SECRET, "item.created"))
            .await
            .unwrap();
        assert_eq!(ack.items_skipped, 1);
        assert_eq!(store.count_ingested_items(integ.id).await.unwrap(), 1);

        let st = store.get_sync_state(integ.id).await.unwrap().unwrap();
        assert_eq!(st.total_items_synced, 1);
        assert_eq!(
            st.last_item_timestamp,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap())
        );

        let sub = store.get_webhook_subscription(integ.id).await.unwrap().unwrap();
        assert_eq!(sub.delivery_count, 2);
        assert!(sub.verified_at.is_some());
        assert_eq!(sub.error_count, 0);
    }

    #[tokio::test]
    async fn bad_signature_touches_nothing() {
        let (store, integ) =
            store_with_integration(ProviderId::Github, TokenSet::api_key("gh")).await;
        subscribe(&store, &integ, Some("hook-1"), SECRET).await;
        let rx = receiver(store.clone(), Arc::new(FakeAdapter::new(ProviderId::Github)));

        let err = rx
            .receive(ProviderId::Github, signed(BODY, "wrong", "item.created"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WebhookSignature));
        let unsigned = WebhookRequest::new(BODY.as_bytes().to_vec());
        assert!(matches!(
            rx.receive(ProviderId::Github, unsigned).await,
            Err(Error::WebhookSignature)
        ));

        assert_eq!(store.count_ingested_items(integ.id).await.unwrap(), 0);
        let sub = store.get_webhook_subscription(integ.id).await.unwrap().unwrap();
        assert_eq!(sub.delivery_count, 0);
        assert!(sub.last_received_at.is_none());
    }

    #[tokio::test]
    async fn unsupported_event_is_acknowledged_and_ignored() {
        let (store, integ) =
            store_with_integration(ProviderId::Github, TokenSet::api_key("gh")).await;
        subscribe(&store, &integ, None, SECRET).await;
        let rx = receiver(store.clone(), Arc::new(FakeAdapter::new(ProviderId::Github)));

        let ack = rx
            .receive(ProviderId::Github, signed(BODY, SECRET, "repo.starred"))
            .await
            .unwrap();
        assert_eq!(ack.status, WebhookDisposition::Ignored);
        assert_eq!(store.count_ingested_items(integ.id).await.unwrap(), 0);
        let sub = store.get_webhook_subscription(integ.id).await.unwrap().unwrap();
        assert!(sub.last_received_at.is_some());
    }

    #[tokio::test]
    async fn failed_delivery_item_holds_back_the_watermark() {
        let (store, integ) =
            store_with_integration(ProviderId::Github, TokenSet::api_key("gh")).await;
        subscribe(&store, &integ, Some("hook-1"), SECRET).await;
        let registry = ProviderRegistry::builder()
            .register(Arc::new(FakeAdapter::new(ProviderId::Github)))
            .build()
            .unwrap();
        let processor = ItemProcessor::new(
            store.clone(),
            Arc::new(FailingPipeline::failing_on(&["b"])),
        );
        let rx =
            WebhookReceiver::new(Arc::new(registry), store.clone(), processor, &SyncConfig::default());

        let body = r#"{"hook_id":"hook-1","items":[
            {"id":"a","content":"one","ts":"2024-05-01T01:00:00Z"},
            {"id":"b","content":"two","ts":"2024-05-01T02:00:00Z"},
            {"id":"c","content":"three","ts":"2024-05-01T03:00:00Z"}]}"#;
        let ack = rx
            .receive(ProviderId::Github, signed(body, SECRET, "item.created"))
            .await
            .unwrap();
        assert_eq!((ack.items_created, ack.items_failed), (2, 1));

        let st = store.get_sync_state(integ.id).await.unwrap().unwrap();
        assert_eq!(st.last_item_id.as_deref(), Some("a"));
        assert_eq!(
            st.last_item_timestamp,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 1, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected() {
        let (store, _) =
            store_with_integration(ProviderId::Github, TokenSet::api_key("gh")).await;
        let registry = ProviderRegistry::builder()
            .register(Arc::new(FakeAdapter::new(ProviderId::Github)))
            .build()
            .unwrap();
        let processor = ItemProcessor::new(store.clone(), Arc::new(FailingPipeline::default()));
        let config = SyncConfig {
            max_webhook_payload_bytes: 8,
            ..SyncConfig::default()
        };
        let rx = WebhookReceiver::new(Arc::new(registry), store, processor, &config);
        assert!(matches!(
            rx.receive(ProviderId::Github, signed(BODY, SECRET, "item.created")).await,
            Err(Error::PayloadTooLarge)
        ));
    }

    #[tokio::test]
    async fn malformed_payload_counts_as_subscription_error() {
        let (store, integ) =
            store_with_integration(ProviderId::Github, TokenSet::api_key("gh")).await;
        subscribe(&store, &integ, None, SECRET).await;
        let rx = receiver(store.clone(), Arc::new(FakeAdapter::new(ProviderId::Github)));

        let ack = rx
            .receive(ProviderId::Github, signed(r#"{"nothing":1}"#, SECRET, "item.created"))
            .await
            .unwrap();
        assert_eq!(ack.items_created, 0);
        let sub = store.get_webhook_subscription(integ.id).await.unwrap().unwrap();
        assert_eq!(sub.error_count, 1);
        assert!(sub.last_error.unwrap().contains("missing items"));
        let st = store.get_sync_state(integ.id).await.unwrap().unwrap();
        assert_eq!(st.error_count, 0);
    }

    #[tokio::test]
    async fn delivery_routes_to_the_matching_secret() {
        let (store, alice) =
            store_with_integration(ProviderId::Github, TokenSet::api_key("gh")).await;
        let bob = Integration::new(
            UserId(Uuid::new_v4()),
            ProviderId::Github,
            TokenSet::api_key("gh2"),
            serde_json::json!({}),
            None,
        )
        .unwrap();
        let bob = store.upsert_integration(&bob).await.unwrap();
        store.ensure_sync_state(&bob, Utc::now()).await.unwrap();
        subscribe(&store, &alice, None, "alice-secret").await;
        subscribe(&store, &bob, None, "bob-secret").await;
        let rx = receiver(store.clone(), Arc::new(FakeAdapter::new(ProviderId::Github)));

        let ack = rx
            .receive(ProviderId::Github, signed(BODY, "bob-secret", "item.created"))
            .await
            .unwrap();
        assert_eq!(ack.subscriptions, 1);
        assert_eq!(store.count_ingested_items(bob.id).await.unwrap(), 1);
        assert_eq!(store.count_ingested_items(alice.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn webhook_then_pull_does_not_duplicate() {
        let (store, integ) =
            store_with_integration(ProviderId::Github, TokenSet::api_key("gh")).await;
        subscribe(&store, &integ, Some("hook-1"), SECRET).await;
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap();
        let adapter = Arc::new(FakeAdapter::new(ProviderId::Github).with_batch(SyncBatch {
            items: vec![note(ProviderId::Github, "a", "hello", Some(ts)).unwrap()],
            next_cursor: None,
            has_more: false,
        }));
        let rx = receiver(store.clone(), adapter.clone());
        rx.receive(ProviderId::Github, signed(BODY, SECRET, "item.created"))
            .await
            .unwrap();

        let registry = ProviderRegistry::builder().register(adapter).build().unwrap();
        let orch = SyncOrchestrator::new(
            Arc::new(registry),
            store.clone(),
            Arc::new(FailingPipeline::default()),
            SyncConfig::default(),
        );
        let r = orch
            .sync_integration(integ.user_id, ProviderId::Github, SyncOptions::default())
            .await
            .unwrap();
        assert_eq!((r.items_created, r.items_skipped), (0, 1));
        assert_eq!(store.count_ingested_items(integ.id).await.unwrap(), 1);
    }
}
