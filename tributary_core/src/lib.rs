//! Tributary core library: models, the provider adapter contract and the sync engine.

pub mod config;
pub mod error;
pub mod models;
pub mod o11y;
pub mod store;
pub mod sync;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::SyncConfig;
pub use error::{Error, Result};
pub use models::{IntegrationId, ProviderId, UserId};
pub use store::secrets::TokenCipher;
pub use store::sqlite::SqliteSyncStore;
pub use store::traits::{
    CaptureRecord, ItemRecords, MemoryRecord, RecordSink, SyncFailure, SyncStore, TaskRecord,
};
pub use sync::connections::{AuthorizationRequest, ConnectionService};
pub use sync::engine::{ProviderSyncOutcome, SyncOrchestrator};
pub use sync::models::{
    AccountInfo, AuthMethod, CursorAdvance, IngestedItem, IngestedItemStatus, Integration,
    ItemDetails, ItemMetadata, ItemType, PipelineOutput, ProcessingHints, ProviderDefinition,
    ProviderFeatures, StandardIngestItem, SyncBatch, SyncItemError, SyncMethod, SyncOptions,
    SyncResult, SyncState, SyncStatus, SyncStatusView, TokenSet, WebhookRegistration,
    WebhookRequest, WebhookSubscription,
};
pub use sync::pipeline::RecordingPipeline;
pub use sync::processing::{ItemOutcome, ItemProcessor};
pub use sync::registry::{ProviderRegistry, ProviderRegistryBuilder};
pub use sync::schedule::SyncScheduler;
pub use sync::traits::{IngestionPipeline, PipelineContext, ProviderAdapter, SyncContext};
pub use sync::webhook::{WebhookAck, WebhookDisposition, WebhookReceiver};
