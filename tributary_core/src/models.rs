use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdParseError {
    #[error("invalid uuid: {0}")]
    InvalidUuid(String),
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

/// End-user identifier (authenticated upstream).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for UserId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for UserId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = Uuid::parse_str(s).map_err(|_| IdParseError::InvalidUuid(s.to_string()))?;
        Ok(Self(id))
    }
}

/// Identifier of a connected (user, provider) integration.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntegrationId(pub Uuid);

impl IntegrationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for IntegrationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IntegrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for IntegrationId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for IntegrationId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = Uuid::parse_str(s).map_err(|_| IdParseError::InvalidUuid(s.to_string()))?;
        Ok(Self(id))
    }
}

/// Stable provider identifier.
///
/// The string form is persisted and used in URLs. Values are append-only: adding a provider
/// appends a variant, existing strings are never renamed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    // Notes & reading
    Readwise,
    Notion,
    Evernote,
    Obsidian,
    Pocket,
    Raindrop,
    // Calendars & meetings
    GoogleCalendar,
    OutlookCalendar,
    Calendly,
    Zoom,
    Fireflies,
    Otter,
    Granola,
    // Chat & mail
    Slack,
    Discord,
    Telegram,
    MicrosoftTeams,
    Gmail,
    // Payments
    Stripe,
    Paypal,
    LemonSqueezy,
    // Dev tooling & tasks
    Github,
    Gitlab,
    Linear,
    Jira,
    Asana,
    Todoist,
    Trello,
    Clickup,
    // Misc
    Spotify,
    Strava,
}

impl ProviderId {
    pub const ALL: [ProviderId; 31] = [
        ProviderId::Readwise,
        ProviderId::Notion,
        ProviderId::Evernote,
        ProviderId::Obsidian,
        ProviderId::Pocket,
        ProviderId::Raindrop,
        ProviderId::GoogleCalendar,
        ProviderId::OutlookCalendar,
        ProviderId::Calendly,
        ProviderId::Zoom,
        ProviderId::Fireflies,
        ProviderId::Otter,
        ProviderId::Granola,
        ProviderId::Slack,
        ProviderId::Discord,
        ProviderId::Telegram,
        ProviderId::MicrosoftTeams,
        ProviderId::Gmail,
        ProviderId::Stripe,
        ProviderId::Paypal,
        ProviderId::LemonSqueezy,
        ProviderId::Github,
        ProviderId::Gitlab,
        ProviderId::Linear,
        ProviderId::Jira,
        ProviderId::Asana,
        ProviderId::Todoist,
        ProviderId::Trello,
        ProviderId::Clickup,
        ProviderId::Spotify,
        ProviderId::Strava,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Readwise => "readwise",
            ProviderId::Notion => "notion",
            ProviderId::Evernote => "evernote",
            ProviderId::Obsidian => "obsidian",
            ProviderId::Pocket => "pocket",
            ProviderId::Raindrop => "raindrop",
            ProviderId::GoogleCalendar => "google_calendar",
            ProviderId::OutlookCalendar => "outlook_calendar",
            ProviderId::Calendly => "calendly",
            ProviderId::Zoom => "zoom",
            ProviderId::Fireflies => "fireflies",
            ProviderId::Otter => "otter",
            ProviderId::Granola => "granola",
            ProviderId::Slack => "slack",
            ProviderId::Discord => "discord",
            ProviderId::Telegram => "telegram",
            ProviderId::MicrosoftTeams => "microsoft_teams",
            ProviderId::Gmail => "gmail",
            ProviderId::Stripe => "stripe",
            ProviderId::Paypal => "paypal",
            ProviderId::LemonSqueezy => "lemon_squeezy",
            ProviderId::Github => "github",
            ProviderId::Gitlab => "gitlab",
            ProviderId::Linear => "linear",
            ProviderId::Jira => "jira",
            ProviderId::Asana => "asana",
            ProviderId::Todoist => "todoist",
            ProviderId::Trello => "trello",
            ProviderId::Clickup => "clickup",
            ProviderId::Spotify => "spotify",
            ProviderId::Strava => "strava",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.as_str() == s)
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_str(s).ok_or_else(|| IdParseError::UnknownProvider(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_strings_match_serde_names() {
        for p in ProviderId::ALL {
            let json = serde_json::to_value(p).unwrap();
            assert_eq!(json, serde_json::Value::String(p.as_str().to_string()));
            assert_eq!(ProviderId::from_str(p.as_str()).unwrap(), p);
        }
    }

    #[test]
    fn provider_strings_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for p in ProviderId::ALL {
            assert!(seen.insert(p.as_str()), "duplicate provider id {p}");
        }
    }

    #[test]
    fn unknown_provider_is_rejected() {
        assert_eq!(
            ProviderId::from_str("myspace"),
            Err(IdParseError::UnknownProvider("myspace".to_string()))
        );
    }
}
