use crate::{Error, Result};
use std::time::Duration;

/// Tunables for the sync orchestrator, scheduler and webhook receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Access tokens expiring within this window are refreshed before a run.
    pub refresh_buffer: Duration,
    /// Upper bound on one run (adapter fetch plus item processing).
    pub run_timeout: Duration,
    /// A `syncing` lease older than this may be taken over by a new run.
    pub stale_sync_after: Duration,
    /// Batch size passed to adapters when the caller sets no limit.
    pub default_batch_limit: usize,
    pub max_webhook_payload_bytes: usize,
    pub scheduler_poll_interval: Duration,
    pub scheduler_batch_size: usize,
    /// Failed runs are rescheduled with exponential backoff between these bounds.
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            refresh_buffer: Duration::from_secs(5 * 60),
            run_timeout: Duration::from_secs(10 * 60),
            stale_sync_after: Duration::from_secs(30 * 60),
            default_batch_limit: 100,
            max_webhook_payload_bytes: 1_000_000,
            scheduler_poll_interval: Duration::from_secs(30),
            scheduler_batch_size: 50,
            retry_backoff_base_ms: 60_000,
            retry_backoff_max_ms: 6 * 60 * 60 * 1_000,
        }
    }
}

impl SyncConfig {
    /// Read overrides from `TRIBUTARY_*` env vars, falling back to defaults.
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        let cfg = Self {
            refresh_buffer: env_secs("TRIBUTARY_REFRESH_BUFFER_SECS")?.unwrap_or(d.refresh_buffer),
            run_timeout: env_secs("TRIBUTARY_RUN_TIMEOUT_SECS")?.unwrap_or(d.run_timeout),
            stale_sync_after: env_secs("TRIBUTARY_STALE_SYNC_AFTER_SECS")?
                .unwrap_or(d.stale_sync_after),
            default_batch_limit: env_parse("TRIBUTARY_DEFAULT_BATCH_LIMIT")?
                .unwrap_or(d.default_batch_limit),
            max_webhook_payload_bytes: env_parse("TRIBUTARY_MAX_WEBHOOK_PAYLOAD_BYTES")?
                .unwrap_or(d.max_webhook_payload_bytes),
            scheduler_poll_interval: env_parse::<u64>("TRIBUTARY_SCHEDULER_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(d.scheduler_poll_interval),
            scheduler_batch_size: env_parse("TRIBUTARY_SCHEDULER_BATCH_SIZE")?
                .unwrap_or(d.scheduler_batch_size),
            retry_backoff_base_ms: env_parse("TRIBUTARY_RETRY_BACKOFF_BASE_MS")?
                .unwrap_or(d.retry_backoff_base_ms),
            retry_backoff_max_ms: env_parse("TRIBUTARY_RETRY_BACKOFF_MAX_MS")?
                .unwrap_or(d.retry_backoff_max_ms),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.run_timeout.is_zero() {
            return Err(Error::InvalidInput("run_timeout must be > 0".to_string()));
        }
        if self.stale_sync_after <= self.run_timeout {
            return Err(Error::InvalidInput(
                "stale_sync_after must exceed run_timeout".to_string(),
            ));
        }
        if self.default_batch_limit == 0 {
            return Err(Error::InvalidInput(
                "default_batch_limit must be > 0".to_string(),
            ));
        }
        if self.max_webhook_payload_bytes == 0 {
            return Err(Error::InvalidInput(
                "max_webhook_payload_bytes must be > 0".to_string(),
            ));
        }
        if self.scheduler_poll_interval.is_zero() {
            return Err(Error::InvalidInput(
                "scheduler_poll_interval must be > 0".to_string(),
            ));
        }
        if self.scheduler_batch_size == 0 {
            return Err(Error::InvalidInput(
                "scheduler_batch_size must be > 0".to_string(),
            ));
        }
        if self.retry_backoff_base_ms == 0 {
            return Err(Error::InvalidInput(
                "retry_backoff_base_ms must be > 0".to_string(),
            ));
        }
        if self.retry_backoff_max_ms < self.retry_backoff_base_ms {
            return Err(Error::InvalidInput(
                "retry_backoff_max_ms must be >= retry_backoff_base_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay before the next scheduled attempt after `error_count` consecutive failures.
    #[tracing::instrument(level = "debug")]
    pub fn retry_backoff_ms(&self, error_count: u32) -> u64 {
        // Exponential backoff: base * 2^error_count, capped.
        let shift = error_count.min(63);
        let exp = 1u128 << shift;
        let ms = (self.retry_backoff_base_ms as u128).saturating_mul(exp);
        (ms.min(self.retry_backoff_max_ms as u128)) as u64
    }
}

/// Parse an optional env var; blank values count as unset.
pub fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::InvalidInput(format!("{name} has an invalid value: {v:?}"))),
        _ => Ok(None),
    }
}

fn env_secs(name: &str) -> Result<Option<Duration>> {
    Ok(env_parse::<u64>(name)?.map(Duration::from_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        SyncConfig::default().validate().unwrap();
    }

    #[test]
    fn stale_lease_must_outlive_run_timeout() {
        let cfg = SyncConfig {
            stale_sync_after: Duration::from_secs(60),
            run_timeout: Duration::from_secs(60),
            ..SyncConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn retry_backoff_grows_and_caps() {
        let cfg = SyncConfig {
            retry_backoff_base_ms: 1_000,
            retry_backoff_max_ms: 10_000,
            ..SyncConfig::default()
        };
        assert_eq!(cfg.retry_backoff_ms(0), 1_000);
        assert_eq!(cfg.retry_backoff_ms(1), 2_000);
        assert_eq!(cfg.retry_backoff_ms(3), 8_000);
        assert_eq!(cfg.retry_backoff_ms(4), 10_000);
        assert_eq!(cfg.retry_backoff_ms(200), 10_000);
    }
}
