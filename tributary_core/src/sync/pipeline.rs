//! Default ingestion pipeline: turns normalized items into captures, memories and tasks.

use crate::store::traits::{CaptureRecord, ItemRecords, MemoryRecord, RecordSink, TaskRecord};
use crate::sync::models::{PipelineOutput, StandardIngestItem};
use crate::sync::traits::{IngestionPipeline, PipelineContext};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

const TASK_PREFIXES: &[&str] = &["- [ ]", "* [ ]", "TODO:", "TODO "];

pub struct RecordingPipeline {
    sink: Arc<dyn RecordSink>,
}

impl RecordingPipeline {
    pub fn new(sink: Arc<dyn RecordSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl IngestionPipeline for RecordingPipeline {
    #[tracing::instrument(level = "debug", skip_all, fields(source_id = %item.source_id))]
    async fn process(
        &self,
        ctx: &PipelineContext,
        item: &StandardIngestItem,
    ) -> Result<PipelineOutput> {
        let hints = item.processing_hints;
        if !hints.any() {
            return Ok(PipelineOutput::default());
        }
        let now = Utc::now();

        let capture = CaptureRecord {
            id: Uuid::new_v4(),
            user_id: ctx.user_id,
            integration_id: ctx.integration_id,
            ingested_item_id: ctx.ingested_item_id,
            provider: item.source_provider,
            item_type: item.item_type,
            title: item.title.clone(),
            content: item.content.clone(),
            source_url: item.source_url.clone(),
            created_at: now,
        };

        let memories: Vec<MemoryRecord> = memory_text(item)
            .filter(|_| hints.extract_memories)
            .map(|content| MemoryRecord {
                id: Uuid::new_v4(),
                user_id: ctx.user_id,
                integration_id: ctx.integration_id,
                ingested_item_id: ctx.ingested_item_id,
                content,
                created_at: now,
            })
            .into_iter()
            .collect();

        let mut titles = Vec::new();
        if hints.extract_tasks {
            titles = extract_task_lines(&item.content);
            if titles.is_empty() && item.item_type.is_actionable() {
                if let Some(title) = item.title.as_deref().map(str::trim).filter(|t| !t.is_empty())
                {
                    titles.push(title.to_string());
                }
            }
        }
        let tasks: Vec<TaskRecord> = titles
            .into_iter()
            .map(|title| TaskRecord {
                id: Uuid::new_v4(),
                user_id: ctx.user_id,
                integration_id: ctx.integration_id,
                ingested_item_id: ctx.ingested_item_id,
                title,
                source_url: item.source_url.clone(),
                created_at: now,
            })
            .collect();

        let records = ItemRecords {
            ingested_item_id: ctx.ingested_item_id,
            capture,
            memories,
            tasks,
        };
        // Replaces anything a failed or superseded attempt left for this item.
        self.sink.replace_item_records(&records).await?;

        let out = PipelineOutput {
            capture_id: Some(records.capture.id),
            memory_ids: records.memories.iter().map(|m| m.id).collect(),
            task_ids: records.tasks.iter().map(|t| t.id).collect(),
        };
        tracing::debug!(
            memories = out.memory_ids.len(),
            tasks = out.task_ids.len(),
            "item recorded"
        );
        Ok(out)
    }
}

/// Summary when present, else the first non-empty paragraph of the content.
fn memory_text(item: &StandardIngestItem) -> Option<String> {
    if let Some(summary) = item.summary.as_deref().map(str::trim) {
        if !summary.is_empty() {
            return Some(summary.to_string());
        }
    }
    item.content
        .replace("\r\n", "\n")
        .split("\n\n")
        .map(str::trim)
        .find(|p| !p.is_empty())
        .map(str::to_string)
}

/// Checklist and TODO lines, in order, without duplicates.
pub fn extract_task_lines(content: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        let Some(rest) = TASK_PREFIXES.iter().find_map(|p| line.strip_prefix(p)) else {
            continue;
        };
        let rest = rest.trim();
        if !rest.is_empty() && !out.iter().any(|t| t == rest) {
            out.push(rest.to_string());
        }
    }
    out
}
