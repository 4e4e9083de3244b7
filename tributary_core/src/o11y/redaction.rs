use regex::Regex;

const REDACTED: &str = "[REDACTED]";

/// Scrubs credentials out of provider payloads before they are persisted.
#[derive(Clone, Default)]
pub struct RedactionPolicy {
    extra: Vec<Regex>,
}

impl RedactionPolicy {
    #[tracing::instrument(level = "debug")]
    pub fn new(extra_patterns: Vec<String>) -> crate::Result<Self> {
        let mut extra = Vec::with_capacity(extra_patterns.len());
        for p in extra_patterns {
            let re = Regex::new(&p).map_err(|e| {
                crate::Error::InvalidInput(format!("invalid redaction regex {p:?}: {e}"))
            })?;
            extra.push(re);
        }
        Ok(Self { extra })
    }

    /// Redact sensitive keys and secret-looking strings in place.
    pub fn redact(&self, v: &mut serde_json::Value) {
        redact_value(&self.extra, v);
    }

    pub fn redacted(&self, mut v: serde_json::Value) -> serde_json::Value {
        self.redact(&mut v);
        v
    }
}

fn redact_value(extra: &[Regex], v: &mut serde_json::Value) {
    match v {
        serde_json::Value::Null => {}
        serde_json::Value::Bool(_) => {}
        serde_json::Value::Number(_) => {}
        serde_json::Value::String(s) => {
            if looks_like_secret(s) || extra.iter().any(|re| re.is_match(s)) {
                *s = REDACTED.to_string();
            }
        }
        serde_json::Value::Array(a) => {
            for e in a {
                redact_value(extra, e);
            }
        }
        serde_json::Value::Object(o) => {
            for (k, v) in o.iter_mut() {
                if is_sensitive_key(k) || extra.iter().any(|re| re.is_match(k)) {
                    *v = serde_json::Value::String(REDACTED.to_string());
                } else {
                    redact_value(extra, v);
                }
            }
        }
    }
}

fn is_sensitive_key(k: &str) -> bool {
    let k = k.to_ascii_lowercase();
    // `*_tokens` counters (e.g. usage stats) are not credentials.
    if k.ends_with("_count") {
        return false;
    }
    k.contains("authorization")
        || k.contains("password")
        || k.contains("passwd")
        || k.contains("secret")
        || k == "token"
        || k.ends_with("_token")
        || k.ends_with("token_id")
        || k.contains("api_key")
        || k.contains("apikey")
        || k.contains("cookie")
        || k.contains("private_key")
        || k.contains("signature")
}

fn looks_like_secret(s: &str) -> bool {
    let s = s.trim();
    if s.len() < 12 {
        return false;
    }
    let lower = s.to_ascii_lowercase();
    lower.starts_with("bearer ")
        || lower.starts_with("basic ")
        || lower.starts_with("sk-")
        || lower.starts_with("sk_live_")
        || lower.starts_with("ghp_")
        || lower.starts_with("gho_")
        || lower.starts_with("lin_api_")
        || lower.starts_with("xox")
}
