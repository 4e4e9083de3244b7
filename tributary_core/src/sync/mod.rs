//! External-data sync engine.
//!
//! - Provider adapters (`traits::ProviderAdapter`) pull batches or transform webhook deliveries
//!   into `StandardIngestItem`s
//! - `processing::ItemProcessor` dedups items against the ingested-item ledger by content hash
//!   and dispatches new or changed ones to the `IngestionPipeline`
//! - `engine::SyncOrchestrator` drives pull runs under a persisted `syncing` lease
//! - `webhook::WebhookReceiver` verifies deliveries and feeds the same per-item path

pub mod connections;
pub mod engine;
pub mod hashing;
pub mod http;
pub mod models;
pub mod pipeline;
pub mod processing;
pub mod registry;
pub mod schedule;
pub mod traits;
pub mod webhook;
