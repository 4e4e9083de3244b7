use crate::sync::models::StandardIngestItem;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Stable SHA-256 (hex) over the semantically relevant parts of an item.
///
/// Whitespace-only differences in title/content, CRLF line endings and tag order do not change
/// the hash. Timestamps, URLs and raw payloads are excluded.
pub fn content_hash(item: &StandardIngestItem) -> String {
    let mut tags: Vec<&str> = item.metadata.tags.iter().map(|t| t.trim()).collect();
    tags.sort_unstable();
    tags.dedup();

    // serde_json maps are ordered by key, so this serialization is canonical.
    let canonical = serde_json::json!({
        "type": item.item_type.as_str(),
        "title": item.title.as_deref().map(str::trim),
        "content": normalize_content(&item.content),
        "summary": item.summary.as_deref().map(str::trim),
        "tags": tags,
        "details": item.metadata.details,
    });

    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn normalize_content(s: &str) -> String {
    s.replace("\r\n", "\n").trim().to_string()
}

/// Hex HMAC-SHA256 of `body`.
pub fn sign_hmac_sha256(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a hex signature, raw or `sha256=`-prefixed.
pub fn verify_hmac_sha256(secret: &str, body: &[u8], signature: &str) -> bool {
    let sig = signature.trim();
    let sig = sig.strip_prefix("sha256=").unwrap_or(sig);
    let Ok(expected) = hex::decode(sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
