use crate::store::traits::SyncStore;
use crate::sync::engine::{chrono_duration, SyncOrchestrator};
use crate::sync::models::{SyncOptions, SyncState};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;

/// Background trigger for integrations whose `next_sync_at` has passed.
///
/// Paused and in-flight integrations are never picked, except `syncing` leases older than
/// `stale_sync_after`, which are taken over.
pub struct SyncScheduler {
    orchestrator: Arc<SyncOrchestrator>,
    store: Arc<dyn SyncStore>,
    poll_interval: Duration,
    batch_size: usize,
}

impl SyncScheduler {
    #[tracing::instrument(level = "debug", skip(orchestrator, store))]
    pub fn new(
        orchestrator: Arc<SyncOrchestrator>,
        store: Arc<dyn SyncStore>,
        poll_interval: Duration,
        batch_size: usize,
    ) -> Result<Self> {
        if poll_interval.is_zero() {
            return Err(Error::InvalidInput("poll_interval must be > 0".to_string()));
        }
        if batch_size == 0 {
            return Err(Error::InvalidInput("batch_size must be > 0".to_string()));
        }
        Ok(Self {
            orchestrator,
            store,
            poll_interval,
            batch_size,
        })
    }

    /// Scheduler configured from the orchestrator's `SyncConfig`.
    pub fn from_config(orchestrator: Arc<SyncOrchestrator>, store: Arc<dyn SyncStore>) -> Result<Self> {
        let cfg = orchestrator.config().clone();
        Self::new(
            orchestrator,
            store,
            cfg.scheduler_poll_interval,
            cfg.scheduler_batch_size,
        )
    }

    /// Run the scheduler loop until the task is cancelled.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn run_loop(&self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.tick(Utc::now()).await {
                tracing::warn!(error = %e, "sync scheduler tick failed");
            }
        }
    }

    /// Trigger every due integration once. Returns how many runs completed successfully.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let stale_before = now - chrono_duration(self.orchestrator.config().stale_sync_after);
        let due = self
            .store
            .list_due_sync_states(now, stale_before, self.batch_size)
            .await?;
        let registry = self.orchestrator.registry();
        let runnable: Vec<SyncState> = due
            .into_iter()
            .filter(|s| registry.contains(s.provider))
            .collect();
        if runnable.is_empty() {
            return Ok(0);
        }
        tracing::debug!(due = runnable.len(), "triggering scheduled syncs");

        let runs = runnable.iter().map(|state| async move {
            let res = self
                .orchestrator
                .sync_integration(state.user_id, state.provider, SyncOptions::default())
                .await;
            match res {
                Ok(_) => true,
                Err(Error::SyncInProgress(_)) | Err(Error::SyncPaused(_)) => {
                    tracing::debug!(provider = %state.provider, "scheduled sync skipped");
                    false
                }
                Err(e) => {
                    tracing::warn!(
                        provider = %state.provider,
                        integration_id = %state.integration_id,
                        error = %e,
                        "scheduled sync failed"
                    );
                    false
                }
            }
        });
        let ok = join_all(runs).await.into_iter().filter(|ok| *ok).count();
        Ok(ok)
    }
}
