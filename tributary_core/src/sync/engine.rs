use crate::config::SyncConfig;
use crate::models::{ProviderId, UserId};
use crate::o11y::redaction::RedactionPolicy;
use crate::store::traits::{SyncFailure, SyncStore};
use crate::sync::models::{
    CursorAdvance, Integration, StandardIngestItem, SyncCompletion, SyncItemError, SyncOptions,
    SyncResult, SyncState, SyncStatus, SyncStatusView,
};
use crate::sync::processing::{ItemOutcome, ItemProcessor};
use crate::sync::registry::ProviderRegistry;
use crate::sync::traits::{IngestionPipeline, ProviderAdapter, SyncContext};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;

/// Per-provider outcome of `sync_all_integrations`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderSyncOutcome {
    pub provider: ProviderId,
    pub result: Option<SyncResult>,
    pub error: Option<String>,
}

/// Drives pull-sync runs: credentials, the `syncing` lease, adapter fetch, item dispatch and
/// state bookkeeping.
pub struct SyncOrchestrator {
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn SyncStore>,
    processor: ItemProcessor,
    config: SyncConfig,
}

pub(crate) fn chrono_duration(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Items handled by a run, before the completion/failure write.
#[derive(Default)]
struct RunTally {
    result: SyncResult,
    advance: Option<CursorAdvance>,
}

impl RunTally {
    fn items_synced(&self) -> u64 {
        self.result.items_created + self.result.items_updated + self.result.items_retried
    }
}

impl SyncOrchestrator {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<dyn SyncStore>,
        pipeline: Arc<dyn IngestionPipeline>,
        config: SyncConfig,
    ) -> Self {
        let processor = ItemProcessor::new(store.clone(), pipeline);
        Self {
            registry,
            store,
            processor,
            config,
        }
    }

    pub fn with_redaction(mut self, redaction: RedactionPolicy) -> Self {
        self.processor = self.processor.with_redaction(redaction);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// The per-item path shared with the webhook receiver.
    pub fn processor(&self) -> &ItemProcessor {
        &self.processor
    }

    async fn connected(&self, user_id: UserId, provider: ProviderId) -> Result<Integration> {
        self.store
            .get_integration(user_id, provider)
            .await?
            .ok_or(Error::NotConnected(provider))
    }

    /// Run one bounded sync for (user, provider).
    ///
    /// Returns `SyncInProgress`/`SyncPaused` without side effects when the lease cannot be
    /// taken. Item-level failures are reported in the result; run-level failures are persisted
    /// on the sync state and returned as errors.
    #[tracing::instrument(level = "info", skip(self, options), fields(user_id = %user_id, provider = %provider))]
    pub async fn sync_integration(
        &self,
        user_id: UserId,
        provider: ProviderId,
        options: SyncOptions,
    ) -> Result<SyncResult> {
        let adapter = self.registry.get(provider)?;
        let mut integration = self.connected(user_id, provider).await?;
        let now = Utc::now();

        let state = self.store.ensure_sync_state(&integration, now).await?;
        if state.status == SyncStatus::Paused {
            return Err(Error::SyncPaused(provider));
        }

        if integration.needs_refresh(chrono_duration(self.config.refresh_buffer), now) {
            self.refresh_tokens(adapter.as_ref(), &mut integration, now)
                .await?;
        }

        let stale_before = now - chrono_duration(self.config.stale_sync_after);
        if !self
            .store
            .try_start_sync(integration.id, now, stale_before)
            .await?
        {
            let current = self.store.get_sync_state(integration.id).await?;
            return Err(match current.map(|s| s.status) {
                Some(SyncStatus::Paused) => Error::SyncPaused(provider),
                _ => Error::SyncInProgress(provider),
            });
        }

        // Re-read under the lease so seeding sees the latest completed run.
        let state = self
            .store
            .get_sync_state(integration.id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("sync state for {}", integration.id)))?;
        let options = self.seed_options(options, &state);
        let limit = options.limit.unwrap_or(self.config.default_batch_limit);

        let mut tally = RunTally::default();
        match self
            .run(adapter.as_ref(), &integration, &options, &mut tally)
            .await
        {
            Ok(next_cursor) => {
                let finished_at = Utc::now();
                // Dry runs record the run but leave progress markers untouched.
                let persist_progress = !options.dry_run;
                let completion = SyncCompletion {
                    cursor: next_cursor.filter(|_| persist_progress),
                    advance: tally.advance.clone().filter(|_| persist_progress),
                    items_synced: if persist_progress { tally.items_synced() } else { 0 },
                    full_sync: options.full_sync && persist_progress,
                    next_sync_at: adapter
                        .definition()
                        .default_sync_interval()
                        .map(|i| finished_at + i),
                    started_at: now,
                    finished_at,
                };
                self.store.complete_sync(integration.id, &completion).await?;
                let mut result = tally.result;
                result.success = true;
                result.has_more = result.has_more || result.items_processed >= limit as u64;
                tracing::info!(
                    processed = result.items_processed,
                    created = result.items_created,
                    updated = result.items_updated,
                    retried = result.items_retried,
                    skipped = result.items_skipped,
                    failed = result.items_failed,
                    has_more = result.has_more,
                    "sync completed"
                );
                Ok(result)
            }
            Err(err) => {
                let failed_at = Utc::now();
                let backoff = chrono::Duration::milliseconds(
                    self.config.retry_backoff_ms(state.error_count) as i64,
                );
                let failure = SyncFailure {
                    error: err.to_string(),
                    advance: tally.advance.clone(),
                    items_synced: tally.items_synced(),
                    next_sync_at: adapter
                        .definition()
                        .default_sync_interval()
                        .map(|_| failed_at + backoff),
                    started_at: now,
                    failed_at,
                };
                if let Err(store_err) = self.store.fail_sync(integration.id, &failure).await {
                    tracing::error!(error = %store_err, "failed to persist sync failure");
                }
                tracing::warn!(
                    error = %err,
                    processed = tally.result.items_processed,
                    "sync failed"
                );
                Err(err)
            }
        }
    }

    async fn refresh_tokens(
        &self,
        adapter: &dyn ProviderAdapter,
        integration: &mut Integration,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let provider = integration.provider;
        let Some(refresh_token) = integration.tokens.refresh_token.clone() else {
            return Ok(());
        };
        match adapter.refresh_access_token(&refresh_token).await {
            Ok(mut tokens) => {
                if tokens.refresh_token.is_none() {
                    tokens.refresh_token = Some(refresh_token);
                }
                self.store
                    .update_tokens(integration.id, &tokens, now)
                    .await?;
                integration.tokens = tokens;
                tracing::info!(%provider, "access token refreshed");
                Ok(())
            }
            Err(err) => {
                let err = match err {
                    Error::TokenRefresh { .. } => err,
                    other => Error::token_refresh(provider, other.to_string()),
                };
                let message = err.to_string();
                if !self
                    .store
                    .record_sync_error(integration.id, &message, now)
                    .await?
                {
                    tracing::debug!(%provider, "run in progress; refresh failure not recorded");
                }
                tracing::warn!(%provider, error = %message, "token refresh failed");
                Err(err)
            }
        }
    }

    fn seed_options(&self, mut options: SyncOptions, state: &SyncState) -> SyncOptions {
        if !options.full_sync {
            if options.cursor.is_none() {
                options.cursor = state.cursor.clone();
            }
            if options.since.is_none() {
                options.since = state.last_item_timestamp.or(state.last_successful_sync_at);
            }
        }
        if options.limit.is_none() {
            options.limit = Some(self.config.default_batch_limit);
        }
        options
    }

    /// Fetch and process one batch under the run deadline. Returns the adapter's next cursor.
    async fn run(
        &self,
        adapter: &dyn ProviderAdapter,
        integration: &Integration,
        options: &SyncOptions,
        tally: &mut RunTally,
    ) -> Result<Option<String>> {
        let started = Instant::now();
        let deadline = started + self.config.run_timeout;
        let ctx = SyncContext::from_integration(integration);

        let batch = tokio::time::timeout_at(deadline, adapter.sync(&ctx, options))
            .await
            .map_err(|_| Error::DeadlineExceeded(self.config.run_timeout))??;
        tracing::debug!(
            items = batch.items.len(),
            has_more = batch.has_more,
            "batch fetched"
        );

        let mut handled: Vec<&StandardIngestItem> = Vec::with_capacity(batch.items.len());
        let mut failed: Vec<&StandardIngestItem> = Vec::new();
        for item in &batch.items {
            if Instant::now() >= deadline {
                tally.advance = CursorAdvance::before_failures(handled, failed);
                return Err(Error::DeadlineExceeded(self.config.run_timeout));
            }
            tally.result.items_processed += 1;
            match self
                .processor
                .process(integration, item, options.dry_run)
                .await
            {
                Ok(ItemOutcome::Created) => tally.result.items_created += 1,
                Ok(ItemOutcome::Updated) => tally.result.items_updated += 1,
                Ok(ItemOutcome::Retried) => tally.result.items_retried += 1,
                Ok(ItemOutcome::Unchanged) => tally.result.items_skipped += 1,
                Err(err) => {
                    tally.result.items_failed += 1;
                    tally.result.errors.push(SyncItemError {
                        source_id: Some(item.source_id.clone()),
                        message: err.to_string(),
                        recoverable: true,
                    });
                    failed.push(item);
                    continue;
                }
            }
            handled.push(item);
        }

        tally.advance = CursorAdvance::before_failures(handled, failed);
        tally.result.has_more = batch.has_more;
        Ok(batch.next_cursor)
    }

    /// Sync every connected, registered, non-paused provider for the user concurrently.
    #[tracing::instrument(level = "info", skip(self), fields(user_id = %user_id))]
    pub async fn sync_all_integrations(&self, user_id: UserId) -> Result<Vec<ProviderSyncOutcome>> {
        let integrations = self.store.list_integrations(user_id).await?;
        let mut providers = Vec::new();
        for integration in integrations {
            if !self.registry.contains(integration.provider) {
                tracing::debug!(provider = %integration.provider, "skipping unregistered provider");
                continue;
            }
            let state = self.store.get_sync_state(integration.id).await?;
            if matches!(state, Some(ref s) if s.status == SyncStatus::Paused) {
                continue;
            }
            providers.push(integration.provider);
        }

        let runs = providers.into_iter().map(|provider| async move {
            match self
                .sync_integration(user_id, provider, SyncOptions::default())
                .await
            {
                Ok(result) => ProviderSyncOutcome {
                    provider,
                    result: Some(result),
                    error: None,
                },
                Err(err) => ProviderSyncOutcome {
                    provider,
                    result: None,
                    error: Some(err.to_string()),
                },
            }
        });
        Ok(join_all(runs).await)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn sync_status(&self, user_id: UserId, provider: ProviderId) -> Result<SyncStatusView> {
        let integration = self.connected(user_id, provider).await?;
        let state = self
            .store
            .ensure_sync_state(&integration, Utc::now())
            .await?;
        Ok(SyncStatusView {
            provider,
            integration_id: integration.id,
            state,
            definition: self.registry.definition(provider).cloned(),
        })
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn list_sync_statuses(&self, user_id: UserId) -> Result<Vec<SyncStatusView>> {
        let states = self.store.list_sync_states(user_id).await?;
        Ok(states
            .into_iter()
            .map(|state| SyncStatusView {
                provider: state.provider,
                integration_id: state.integration_id,
                definition: self.registry.definition(state.provider).cloned(),
                state,
            })
            .collect())
    }

    /// Pause or resume scheduling for one integration. Pausing during a run is rejected.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn set_paused(
        &self,
        user_id: UserId,
        provider: ProviderId,
        paused: bool,
    ) -> Result<SyncState> {
        let integration = self.connected(user_id, provider).await?;
        let now = Utc::now();
        self.store.ensure_sync_state(&integration, now).await?;
        let changed = self.store.set_paused(integration.id, paused, now).await?;
        let state = self
            .store
            .get_sync_state(integration.id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("sync state for {}", integration.id)))?;
        if !changed && paused && state.status == SyncStatus::Syncing {
            return Err(Error::SyncInProgress(provider));
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IntegrationId;
    use crate::store::sqlite::SqliteSyncStore;
    use crate::sync::models::{IngestedItemStatus, SyncBatch, TokenSet};
    use crate::sync::pipeline::RecordingPipeline;
    use crate::test_support::{note, store_with_integration, FailingPipeline, FakeAdapter};
    use chrono::TimeZone;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, 0, 0).unwrap()
    }

    fn batch(items: Vec<StandardIngestItem>) -> SyncBatch {
        SyncBatch {
            items,
            next_cursor: None,
            has_more: false,
        }
    }

    fn orchestrator(
        store: Arc<SqliteSyncStore>,
        adapter: Arc<FakeAdapter>,
        pipeline: Arc<dyn IngestionPipeline>,
    ) -> SyncOrchestrator {
        let registry = ProviderRegistry::builder().register(adapter).build().unwrap();
        SyncOrchestrator::new(Arc::new(registry), store, pipeline, SyncConfig::default())
    }

    async fn state(store: &SqliteSyncStore, id: IntegrationId) -> SyncState {
        store.get_sync_state(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn readwise_highlight_is_ingested_once() {
        let (store, integ) =
            store_with_integration(ProviderId::Readwise, TokenSet::api_key("rw")).await;
        let highlight = || note(ProviderId::Readwise, "highlight_42", "Great insight", Some(ts(1))).unwrap();
        let adapter = Arc::new(
            FakeAdapter::new(ProviderId::Readwise)
                .with_batch(batch(vec![highlight()]))
                .with_batch(batch(vec![highlight()])),
        );
        let orch = orchestrator(
            store.clone(),
            adapter.clone(),
            Arc::new(RecordingPipeline::new(store.clone())),
        );

        let first = orch
            .sync_integration(integ.user_id, ProviderId::Readwise, SyncOptions::default())
            .await
            .unwrap();
        assert!(first.success);
        assert_eq!(first.items_created, 1);
        let row = store
            .get_ingested_item(integ.id, "highlight_42")
            .await
            .unwrap()
            .unwrap();
        assert!(row.capture_id.is_some());
        assert_eq!(row.status, IngestedItemStatus::Processed);

        let second = orch
            .sync_integration(integ.user_id, ProviderId::Readwise, SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(
            (second.items_created, second.items_updated, second.items_skipped),
            (0, 0, 1)
        );
        assert_eq!(store.count_ingested_items(integ.id).await.unwrap(), 1);

        let st = state(&store, integ.id).await;
        assert_eq!(st.status, SyncStatus::Completed);
        assert_eq!(st.total_items_synced, 1);
        assert_eq!(st.items_synced_this_run, 0);
        assert!(st.next_sync_at.is_some());
    }

    #[tokio::test]
    async fn changed_content_counts_as_updated() {
        let (store, integ) =
            store_with_integration(ProviderId::Readwise, TokenSet::api_key("rw")).await;
        let adapter = Arc::new(
            FakeAdapter::new(ProviderId::Readwise)
                .with_batch(batch(vec![note(ProviderId::Readwise, "a", "v1", None).unwrap()]))
                .with_batch(batch(vec![note(ProviderId::Readwise, "a", "v2", None).unwrap()])),
        );
        let orch = orchestrator(store.clone(), adapter, Arc::new(FailingPipeline::default()));

        orch.sync_integration(integ.user_id, ProviderId::Readwise, SyncOptions::default())
            .await
            .unwrap();
        let r = orch
            .sync_integration(integ.user_id, ProviderId::Readwise, SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(r.items_updated, 1);
        assert_eq!(store.count_ingested_items(integ.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_runs_are_mutually_exclusive() {
        let (store, integ) =
            store_with_integration(ProviderId::Github, TokenSet::api_key("gh")).await;
        let adapter = Arc::new(
            FakeAdapter::new(ProviderId::Github).with_sync_delay(Duration::from_millis(200)),
        );
        let orch = orchestrator(store.clone(), adapter.clone(), Arc::new(FailingPipeline::default()));

        let (a, b) = tokio::join!(
            orch.sync_integration(integ.user_id, ProviderId::Github, SyncOptions::default()),
            orch.sync_integration(integ.user_id, ProviderId::Github, SyncOptions::default()),
        );
        let oks = [a.is_ok(), b.is_ok()].iter().filter(|x| **x).count();
        assert_eq!(oks, 1);
        let err = a.err().or(b.err()).unwrap();
        assert!(matches!(err, Error::SyncInProgress(ProviderId::Github)));
        assert_eq!(adapter.sync_count(), 1);
    }

    #[tokio::test]
    async fn item_timestamp_never_regresses() {
        let (store, integ) =
            store_with_integration(ProviderId::Readwise, TokenSet::api_key("rw")).await;
        let adapter = Arc::new(
            FakeAdapter::new(ProviderId::Readwise)
                .with_batch(SyncBatch {
                    items: vec![
                        note(ProviderId::Readwise, "a", "1", Some(ts(1))).unwrap(),
                        note(ProviderId::Readwise, "c", "3", Some(ts(3))).unwrap(),
                        note(ProviderId::Readwise, "b", "2", Some(ts(2))).unwrap(),
                    ],
                    next_cursor: Some("page-2".into()),
                    has_more: false,
                })
                .with_batch(batch(vec![
                    note(ProviderId::Readwise, "old", "0", Some(ts(0))).unwrap(),
                ])),
        );
        let orch = orchestrator(store.clone(), adapter.clone(), Arc::new(FailingPipeline::default()));

        orch.sync_integration(integ.user_id, ProviderId::Readwise, SyncOptions::default())
            .await
            .unwrap();
        let st = state(&store, integ.id).await;
        assert_eq!(st.last_item_timestamp, Some(ts(3)));
        assert_eq!(st.last_item_id.as_deref(), Some("c"));
        assert_eq!(st.cursor.as_deref(), Some("page-2"));

        orch.sync_integration(integ.user_id, ProviderId::Readwise, SyncOptions::default())
            .await
            .unwrap();
        let opts = adapter.last_options().unwrap();
        assert_eq!(opts.cursor.as_deref(), Some("page-2"));
        assert_eq!(opts.since, Some(ts(3)));
        assert_eq!(opts.limit, Some(100));

        let st = state(&store, integ.id).await;
        assert_eq!(st.last_item_timestamp, Some(ts(3)));
        assert_eq!(st.cursor.as_deref(), Some("page-2"));
    }

    #[tokio::test]
    async fn full_sync_starts_over() {
        let (store, integ) =
            store_with_integration(ProviderId::Readwise, TokenSet::api_key("rw")).await;
        let adapter = Arc::new(
            FakeAdapter::new(ProviderId::Readwise)
                .with_batch(SyncBatch {
                    items: vec![note(ProviderId::Readwise, "b", "2", Some(ts(5))).unwrap()],
                    next_cursor: Some("late".into()),
                    has_more: false,
                })
                .with_batch(batch(vec![
                    note(ProviderId::Readwise, "a", "1", Some(ts(1))).unwrap(),
                ])),
        );
        let orch = orchestrator(store.clone(), adapter.clone(), Arc::new(FailingPipeline::default()));
        orch.sync_integration(integ.user_id, ProviderId::Readwise, SyncOptions::default())
            .await
            .unwrap();

        let full = SyncOptions {
            full_sync: true,
            ..SyncOptions::default()
        };
        orch.sync_integration(integ.user_id, ProviderId::Readwise, full)
            .await
            .unwrap();
        let opts = adapter.last_options().unwrap();
        assert_eq!(opts.cursor, None);
        assert_eq!(opts.since, None);

        let st = state(&store, integ.id).await;
        assert_eq!(st.cursor, None);
        assert_eq!(st.last_item_timestamp, Some(ts(1)));
    }

    #[tokio::test]
    async fn item_failures_do_not_abort_the_run() {
        let (store, integ) =
            store_with_integration(ProviderId::Notion, TokenSet::api_key("n")).await;
        let items = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|id| note(ProviderId::Notion, id, id, None).unwrap())
            .collect();
        let adapter = Arc::new(FakeAdapter::new(ProviderId::Notion).with_batch(batch(items)));
        let orch = orchestrator(
            store.clone(),
            adapter,
            Arc::new(FailingPipeline::failing_on(&["b", "d"])),
        );

        let r = orch
            .sync_integration(integ.user_id, ProviderId::Notion, SyncOptions::default())
            .await
            .unwrap();
        assert!(r.success);
        assert_eq!(r.items_processed, 5);
        assert_eq!(r.items_failed, 2);
        assert_eq!(r.items_created, 3);
        assert_eq!(r.errors.len(), 2);
        assert!(r.errors.iter().all(|e| e.recoverable));
        assert_eq!(r.errors[0].source_id.as_deref(), Some("b"));
        assert_eq!(state(&store, integ.id).await.status, SyncStatus::Completed);
    }

    #[tokio::test]
    async fn failed_items_are_retried_on_the_next_run() {
        let (store, integ) =
            store_with_integration(ProviderId::Notion, TokenSet::api_key("n")).await;
        let item = || note(ProviderId::Notion, "a", "x", None).unwrap();
        let adapter = Arc::new(
            FakeAdapter::new(ProviderId::Notion)
                .with_batch(batch(vec![item()]))
                .with_batch(batch(vec![item()])),
        );
        let pipeline = Arc::new(FailingPipeline::failing_on(&["a"]));
        let orch = orchestrator(store.clone(), adapter, pipeline.clone());

        for _ in 0..2 {
            let r = orch
                .sync_integration(integ.user_id, ProviderId::Notion, SyncOptions::default())
                .await
                .unwrap();
            assert_eq!(r.items_failed, 1);
        }
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_item_holds_back_the_watermark() {
        let (store, integ) =
            store_with_integration(ProviderId::Readwise, TokenSet::api_key("rw")).await;
        let items = vec![
            note(ProviderId::Readwise, "a", "a", Some(ts(1))).unwrap(),
            note(ProviderId::Readwise, "b", "b", Some(ts(2))).unwrap(),
            note(ProviderId::Readwise, "c", "c", Some(ts(3))).unwrap(),
        ];
        let adapter = Arc::new(FakeAdapter::new(ProviderId::Readwise).with_batch(batch(items)));
        let orch = orchestrator(
            store.clone(),
            adapter.clone(),
            Arc::new(FailingPipeline::failing_on(&["b"])),
        );

        let r = orch
            .sync_integration(integ.user_id, ProviderId::Readwise, SyncOptions::default())
            .await
            .unwrap();
        assert_eq!((r.items_created, r.items_failed), (2, 1));
        let st = state(&store, integ.id).await;
        assert_eq!(st.last_item_id.as_deref(), Some("a"));
        assert_eq!(st.last_item_timestamp, Some(ts(1)));

        orch.sync_integration(integ.user_id, ProviderId::Readwise, SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(adapter.last_options().unwrap().since, Some(ts(1)));
    }

    #[tokio::test]
    async fn expiring_token_is_refreshed_before_fetch() {
        let tokens = TokenSet {
            access_token: "old".into(),
            refresh_token: Some("rt".into()),
            expires_at: Some(Utc::now() + chrono::Duration::minutes(1)),
        };
        let (store, integ) = store_with_integration(ProviderId::GoogleCalendar, tokens).await;
        let adapter = Arc::new(FakeAdapter::new(ProviderId::GoogleCalendar).with_refresh(TokenSet {
            access_token: "new".into(),
            refresh_token: None,
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
        }));
        let orch = orchestrator(store.clone(), adapter.clone(), Arc::new(FailingPipeline::default()));

        orch.sync_integration(integ.user_id, ProviderId::GoogleCalendar, SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(adapter.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.sync_calls.lock().unwrap()[0].1, "new");

        let stored = store
            .get_integration(integ.user_id, ProviderId::GoogleCalendar)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.tokens.access_token, "new");
        assert_eq!(stored.tokens.refresh_token.as_deref(), Some("rt"));

        // Fresh token: no second refresh.
        orch.sync_integration(integ.user_id, ProviderId::GoogleCalendar, SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(adapter.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_refresh_token_fails_without_fetching() {
        let tokens = TokenSet {
            access_token: "old".into(),
            refresh_token: Some("revoked".into()),
            expires_at: Some(Utc::now() - chrono::Duration::minutes(1)),
        };
        let (store, integ) = store_with_integration(ProviderId::GoogleCalendar, tokens).await;
        let adapter = Arc::new(FakeAdapter::new(ProviderId::GoogleCalendar));
        let orch = orchestrator(store.clone(), adapter.clone(), Arc::new(FailingPipeline::default()));

        let err = orch
            .sync_integration(integ.user_id, ProviderId::GoogleCalendar, SyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TokenRefresh { .. }));
        assert_eq!(adapter.sync_count(), 0);
        assert_eq!(store.count_ingested_items(integ.id).await.unwrap(), 0);

        let st = state(&store, integ.id).await;
        assert_eq!(st.status, SyncStatus::Failed);
        assert_eq!(st.error_count, 1);
        assert!(st.last_error.unwrap().contains("invalid_grant"));
    }

    #[tokio::test]
    async fn provider_failure_is_persisted_and_recovers() {
        let (store, integ) =
            store_with_integration(ProviderId::Linear, TokenSet::api_key("lin")).await;
        let adapter = Arc::new(
            FakeAdapter::new(ProviderId::Linear)
                .with_failure(502)
                .with_batch(batch(vec![note(ProviderId::Linear, "x", "y", None).unwrap()])),
        );
        let orch = orchestrator(store.clone(), adapter, Arc::new(FailingPipeline::default()));

        let err = orch
            .sync_integration(integ.user_id, ProviderId::Linear, SyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProviderApi { status: Some(502), .. }));
        let st = state(&store, integ.id).await;
        assert_eq!(st.status, SyncStatus::Failed);
        assert_eq!(st.error_count, 1);
        assert!(st.last_error_at.is_some());
        assert!(st.next_sync_at.unwrap() > Utc::now());

        let r = orch
            .sync_integration(integ.user_id, ProviderId::Linear, SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(r.items_created, 1);
        let st = state(&store, integ.id).await;
        assert_eq!(st.status, SyncStatus::Completed);
        assert_eq!(st.error_count, 0);
    }

    #[tokio::test]
    async fn slow_adapter_hits_the_deadline() {
        let (store, integ) =
            store_with_integration(ProviderId::Github, TokenSet::api_key("gh")).await;
        let adapter = Arc::new(
            FakeAdapter::new(ProviderId::Github).with_sync_delay(Duration::from_millis(300)),
        );
        let registry = ProviderRegistry::builder().register(adapter).build().unwrap();
        let config = SyncConfig {
            run_timeout: Duration::from_millis(50),
            ..SyncConfig::default()
        };
        let orch = SyncOrchestrator::new(
            Arc::new(registry),
            store.clone(),
            Arc::new(FailingPipeline::default()),
            config,
        );

        let err = orch
            .sync_integration(integ.user_id, ProviderId::Github, SyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded(_)));
        assert_eq!(state(&store, integ.id).await.status, SyncStatus::Failed);
    }

    #[tokio::test]
    async fn has_more_when_limit_reached() {
        let (store, integ) =
            store_with_integration(ProviderId::Readwise, TokenSet::api_key("rw")).await;
        let items = (0..2)
            .map(|i| note(ProviderId::Readwise, &format!("h{i}"), "x", None).unwrap())
            .collect();
        let adapter = Arc::new(FakeAdapter::new(ProviderId::Readwise).with_batch(batch(items)));
        let orch = orchestrator(store.clone(), adapter, Arc::new(FailingPipeline::default()));

        let r = orch
            .sync_integration(
                integ.user_id,
                ProviderId::Readwise,
                SyncOptions {
                    limit: Some(2),
                    ..SyncOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(r.has_more);
    }

    #[tokio::test]
    async fn dry_run_leaves_ledger_untouched() {
        let (store, integ) =
            store_with_integration(ProviderId::Readwise, TokenSet::api_key("rw")).await;
        let adapter = Arc::new(
            FakeAdapter::new(ProviderId::Readwise)
                .with_batch(batch(vec![note(ProviderId::Readwise, "a", "x", None).unwrap()])),
        );
        let orch = orchestrator(store.clone(), adapter, Arc::new(FailingPipeline::default()));
        let r = orch
            .sync_integration(
                integ.user_id,
                ProviderId::Readwise,
                SyncOptions {
                    dry_run: true,
                    ..SyncOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(r.items_created, 1);
        assert_eq!(store.count_ingested_items(integ.id).await.unwrap(), 0);
        let st = store.get_sync_state(integ.id).await.unwrap().unwrap();
        assert_eq!(st.status, SyncStatus::Completed);
        assert_eq!(st.total_items_synced, 0);
        assert!(st.last_item_id.is_none());
    }

    #[tokio::test]
    async fn paused_integration_is_not_synced() {
        let (store, integ) =
            store_with_integration(ProviderId::Readwise, TokenSet::api_key("rw")).await;
        let adapter = Arc::new(FakeAdapter::new(ProviderId::Readwise));
        let orch = orchestrator(store.clone(), adapter.clone(), Arc::new(FailingPipeline::default()));

        let st = orch
            .set_paused(integ.user_id, ProviderId::Readwise, true)
            .await
            .unwrap();
        assert_eq!(st.status, SyncStatus::Paused);
        let err = orch
            .sync_integration(integ.user_id, ProviderId::Readwise, SyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SyncPaused(_)));

        let all = orch.sync_all_integrations(integ.user_id).await.unwrap();
        assert!(all.is_empty());
        assert_eq!(adapter.sync_count(), 0);

        let st = orch
            .set_paused(integ.user_id, ProviderId::Readwise, false)
            .await
            .unwrap();
        assert_eq!(st.status, SyncStatus::Pending);
        let all = orch.sync_all_integrations(integ.user_id).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].result.as_ref().unwrap().success);
    }

    #[tokio::test]
    async fn sync_all_isolates_providers() {
        let (store, integ) =
            store_with_integration(ProviderId::Readwise, TokenSet::api_key("rw")).await;
        let linear = Integration::new(
            integ.user_id,
            ProviderId::Linear,
            TokenSet::api_key("lin"),
            serde_json::json!({}),
            None,
        )
        .unwrap();
        store.upsert_integration(&linear).await.unwrap();

        let registry = ProviderRegistry::builder()
            .register(Arc::new(
                FakeAdapter::new(ProviderId::Readwise)
                    .with_batch(batch(vec![note(ProviderId::Readwise, "a", "x", None).unwrap()])),
            ))
            .register(Arc::new(FakeAdapter::new(ProviderId::Linear).with_failure(500)))
            .build()
            .unwrap();
        let orch = SyncOrchestrator::new(
            Arc::new(registry),
            store.clone(),
            Arc::new(FailingPipeline::default()),
            SyncConfig::default(),
        );

        let all = orch.sync_all_integrations(integ.user_id).await.unwrap();
        assert_eq!(all.len(), 2);
        let readwise = all.iter().find(|o| o.provider == ProviderId::Readwise).unwrap();
        assert_eq!(readwise.result.as_ref().unwrap().items_created, 1);
        let lin = all.iter().find(|o| o.provider == ProviderId::Linear).unwrap();
        assert!(lin.error.as_ref().unwrap().contains("500"));

        let statuses = orch.list_sync_statuses(integ.user_id).await.unwrap();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.definition.is_some()));
    }

    #[tokio::test]
    async fn unknown_or_unconnected_provider() {
        let (store, integ) =
            store_with_integration(ProviderId::Readwise, TokenSet::api_key("rw")).await;
        let orch = orchestrator(
            store,
            Arc::new(FakeAdapter::new(ProviderId::Github)),
            Arc::new(FailingPipeline::default()),
        );
        assert!(matches!(
            orch.sync_integration(integ.user_id, ProviderId::Stripe, SyncOptions::default())
                .await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            orch.sync_integration(integ.user_id, ProviderId::Github, SyncOptions::default())
                .await,
            Err(Error::NotConnected(ProviderId::Github))
        ));
        assert!(matches!(
            orch.sync_status(integ.user_id, ProviderId::Github).await,
            Err(Error::NotConnected(_))
        ));
    }
}
