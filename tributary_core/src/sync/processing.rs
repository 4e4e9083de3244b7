use crate::o11y::redaction::RedactionPolicy;
use crate::store::traits::SyncStore;
use crate::sync::hashing::content_hash;
use crate::sync::models::{
    IngestedItem, IngestedItemStatus, Integration, StandardIngestItem, UpsertOutcome,
};
use crate::sync::traits::{IngestionPipeline, PipelineContext};
use crate::{Error, Result};
use chrono::Utc;
use std::sync::Arc;

/// How one item was classified against the ledger.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Created,
    Updated,
    /// Unchanged content whose earlier pipeline run failed, processed again.
    Retried,
    Unchanged,
}

/// Shared per-item path for pull sync and webhook deliveries: hash, dedup upsert, pipeline.
#[derive(Clone)]
pub struct ItemProcessor {
    store: Arc<dyn SyncStore>,
    pipeline: Arc<dyn IngestionPipeline>,
    redaction: RedactionPolicy,
}

impl ItemProcessor {
    pub fn new(store: Arc<dyn SyncStore>, pipeline: Arc<dyn IngestionPipeline>) -> Self {
        Self {
            store,
            pipeline,
            redaction: RedactionPolicy::default(),
        }
    }

    pub fn with_redaction(mut self, redaction: RedactionPolicy) -> Self {
        self.redaction = redaction;
        self
    }

    /// Any failure comes back as `Error::ItemProcessing` so callers can isolate it.
    #[tracing::instrument(
        level = "debug",
        skip(self, integration, item),
        fields(integration_id = %integration.id, source_id = %item.source_id)
    )]
    pub async fn process(
        &self,
        integration: &Integration,
        item: &StandardIngestItem,
        dry_run: bool,
    ) -> Result<ItemOutcome> {
        self.process_inner(integration, item, dry_run)
            .await
            .map_err(|e| match e {
                Error::ItemProcessing { .. } => e,
                other => Error::ItemProcessing {
                    source_id: item.source_id.clone(),
                    message: other.to_string(),
                },
            })
    }

    async fn process_inner(
        &self,
        integration: &Integration,
        item: &StandardIngestItem,
        dry_run: bool,
    ) -> Result<ItemOutcome> {
        if item.source_provider != integration.provider {
            return Err(Error::InvalidInput(format!(
                "item from {} delivered to a {} integration",
                item.source_provider, integration.provider
            )));
        }

        let hash = content_hash(item);

        if dry_run {
            let existing = self
                .store
                .get_ingested_item(integration.id, &item.source_id)
                .await?;
            return Ok(match existing {
                None => ItemOutcome::Created,
                Some(row) if row.source_hash != hash => ItemOutcome::Updated,
                Some(row) if row.status == IngestedItemStatus::Failed => ItemOutcome::Retried,
                Some(_) => ItemOutcome::Unchanged,
            });
        }

        let now = Utc::now();
        let mut row = IngestedItem::from_item(integration, item, hash, now);
        row.raw_data = row.raw_data.map(|raw| self.redaction.redacted(raw));

        let (id, outcome) = match self.store.upsert_ingested_item(&row).await? {
            UpsertOutcome::Unchanged(_) => return Ok(ItemOutcome::Unchanged),
            UpsertOutcome::Created(id) => (id, ItemOutcome::Created),
            UpsertOutcome::Updated(id) => (id, ItemOutcome::Updated),
            UpsertOutcome::Retried(id) => (id, ItemOutcome::Retried),
        };

        let ctx = PipelineContext {
            user_id: integration.user_id,
            integration_id: integration.id,
            ingested_item_id: id,
        };
        match self.pipeline.process(&ctx, item).await {
            Ok(output) => {
                let status = if item.processing_hints.any() {
                    IngestedItemStatus::Processed
                } else {
                    IngestedItemStatus::Skipped
                };
                self.store
                    .mark_item_processed(id, &output, status, Utc::now())
                    .await?;
                Ok(outcome)
            }
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(error = %message, "ingestion pipeline failed");
                self.store
                    .mark_item_failed(id, &message, Utc::now())
                    .await?;
                Err(Error::ItemProcessing {
                    source_id: item.source_id.clone(),
                    message,
                })
            }
        }
    }
}
