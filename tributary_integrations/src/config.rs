use crate::connectors::shared::OAuthApp;
use std::time::Duration;
use tributary_core::config::env_parse;
use tributary_core::{Error, ProviderId, Result};

/// Client id/secret of a registered OAuth application.
#[derive(Clone, PartialEq, Eq)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for OAuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthClient")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}

/// Provider credentials and adapter tunables.
///
/// OAuth providers without client credentials are still registered; connecting them fails with
/// `InvalidInput` until credentials are configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrationsConfig {
    /// Frontend origin receiving OAuth redirects at `/integrations/<provider>/callback`.
    pub oauth_redirect_base: String,
    pub google: Option<OAuthClient>,
    pub github: Option<OAuthClient>,
    pub readwise_page_delay: Duration,
}

impl Default for IntegrationsConfig {
    fn default() -> Self {
        Self {
            oauth_redirect_base: "http://localhost:3000".to_string(),
            google: None,
            github: None,
            readwise_page_delay: Duration::from_secs(3),
        }
    }
}

impl IntegrationsConfig {
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        let cfg = Self {
            oauth_redirect_base: env_parse::<String>("TRIBUTARY_OAUTH_REDIRECT_BASE")?
                .unwrap_or(d.oauth_redirect_base),
            google: oauth_client_from_env("TRIBUTARY_GOOGLE_CLIENT_ID", "TRIBUTARY_GOOGLE_CLIENT_SECRET")?,
            github: oauth_client_from_env("TRIBUTARY_GITHUB_CLIENT_ID", "TRIBUTARY_GITHUB_CLIENT_SECRET")?,
            readwise_page_delay: env_parse::<u64>("TRIBUTARY_READWISE_PAGE_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(d.readwise_page_delay),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        let base = url::Url::parse(&self.oauth_redirect_base).map_err(|e| {
            Error::InvalidInput(format!("oauth_redirect_base is not a valid url: {e}"))
        })?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(Error::InvalidInput(
                "oauth_redirect_base must be http(s)".to_string(),
            ));
        }
        Ok(())
    }

    /// Redirect URI registered with the provider's OAuth app.
    pub fn redirect_uri(&self, provider: ProviderId) -> String {
        format!(
            "{}/integrations/{provider}/callback",
            self.oauth_redirect_base.trim_end_matches('/')
        )
    }

    pub fn oauth_app(&self, provider: ProviderId) -> Option<OAuthApp> {
        let client = match provider {
            ProviderId::GoogleCalendar => self.google.as_ref(),
            ProviderId::Github => self.github.as_ref(),
            _ => None,
        }?;
        Some(OAuthApp {
            client_id: client.client_id.clone(),
            client_secret: client.client_secret.clone(),
            redirect_uri: self.redirect_uri(provider),
        })
    }
}

fn oauth_client_from_env(id_var: &str, secret_var: &str) -> Result<Option<OAuthClient>> {
    match (
        env_parse::<String>(id_var)?,
        env_parse::<String>(secret_var)?,
    ) {
        (Some(client_id), Some(client_secret)) => Ok(Some(OAuthClient {
            client_id,
            client_secret,
        })),
        (None, None) => Ok(None),
        _ => Err(Error::InvalidInput(format!(
            "{id_var} and {secret_var} must be set together"
        ))),
    }
}
