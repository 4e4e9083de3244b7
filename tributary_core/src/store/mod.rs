//! Durable state: integrations, sync state, the ingested-item ledger, webhook subscriptions
//! and pipeline output. SQLite via sqlx; tokens optionally sealed with AES-256-GCM.

pub mod secrets;
pub mod sqlite;
pub mod traits;
