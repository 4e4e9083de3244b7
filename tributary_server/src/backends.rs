use crate::server::AppState;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tributary_core::o11y::redaction::RedactionPolicy;
use tributary_core::{
    Error as CoreError, ProviderRegistry, Result as CoreResult, SqliteSyncStore, SyncConfig,
    TokenCipher,
};
use tributary_integrations::IntegrationsConfig;

/// Process-level settings for `tributary serve` and the one-shot commands.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Holds `tributary.db` and, unless `TRIBUTARY_MASTER_KEY` is set, `master.key`.
    pub data_dir: PathBuf,
    /// Externally reachable base URL; enables automatic webhook registration.
    pub public_url: Option<String>,
    pub scheduler_enabled: bool,
}

impl ServerConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            public_url: None,
            scheduler_enabled: true,
        }
    }

    pub fn with_public_url(mut self, url: Option<String>) -> Self {
        self.public_url = url.filter(|u| !u.trim().is_empty());
        self
    }

    pub fn with_scheduler(mut self, enabled: bool) -> Self {
        self.scheduler_enabled = enabled;
        self
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("tributary.db")
    }
}

/// Token cipher from `TRIBUTARY_MASTER_KEY` (64 hex chars), else a key file in the data dir.
#[tracing::instrument(level = "debug")]
pub fn load_cipher(data_dir: &Path) -> CoreResult<TokenCipher> {
    if let Ok(hex_key) = std::env::var("TRIBUTARY_MASTER_KEY") {
        if !hex_key.trim().is_empty() {
            return TokenCipher::from_hex(hex_key.trim());
        }
    }
    let key_path = data_dir.join("master.key");
    let key = TokenCipher::generate_or_load_key(&key_path)
        .map_err(|e| CoreError::backend(format!("load {}", key_path.display()), e))?;
    Ok(TokenCipher::new(&key))
}

/// Open (and migrate) the SQLite store under `data_dir` with token encryption enabled.
#[tracing::instrument(level = "info", skip_all, fields(data_dir = %data_dir.display()))]
pub async fn open_store(data_dir: &Path) -> CoreResult<SqliteSyncStore> {
    tokio::fs::create_dir_all(data_dir)
        .await
        .map_err(|e| CoreError::backend(format!("create {}", data_dir.display()), e))?;
    let cipher = load_cipher(data_dir)?;
    let store = SqliteSyncStore::new(data_dir.join("tributary.db"))
        .await?
        .with_cipher(cipher);
    Ok(store)
}

/// Provider registry from the environment's OAuth credentials.
#[tracing::instrument(level = "debug")]
pub fn build_registry() -> CoreResult<ProviderRegistry> {
    let cfg = IntegrationsConfig::from_env()?;
    tributary_integrations::bootstrap_registry(&cfg)
}

/// Wire the store, registry and sync services for `cfg`.
#[tracing::instrument(level = "info", skip_all)]
pub async fn build_state(cfg: &ServerConfig, redaction: RedactionPolicy) -> CoreResult<AppState> {
    let sync_config = SyncConfig::from_env()?;
    let registry = Arc::new(build_registry()?);
    let store = Arc::new(open_store(&cfg.data_dir).await?);
    tracing::info!(
        providers = registry.len(),
        db = %cfg.db_path().display(),
        "backends ready"
    );
    Ok(AppState::new(
        registry,
        store,
        sync_config,
        redaction,
        cfg.public_url.clone(),
    ))
}
