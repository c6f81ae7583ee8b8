//! # Ingestion pipeline and materialized views
//!
//! Flow:
//! 1. `TopicReader` pages and `StreamSubscriber` pushes feed one mpsc channel
//! 2. `IngestCore` decodes each message (`MessageDecoder`, with the
//!    `RecognitionClassifier` for recognition payloads), tracks watermarks
//!    and health, and calls `SignalStore::add`
//! 3. `SignalStore` folds events into order-independent views: capped trust,
//!    bonded contacts, the recognition catalog and profile snapshots
//! 4. `IngestionOrchestrator` owns the lifecycle and the health surface
//!
//! Nothing is persisted. The store and watermarks are rebuilt by replaying
//! the ledger on boot, which is why every step is idempotent.
//!
//! ## Module Organization
//!
//! - `types` - SignalEvent and its enums
//! - `decoder` / `classifier` - payload normalization and recognition shapes
//! - `store` - SignalStore and the quarantine queue
//! - `trust` / `contacts` / `recognition` - derived views
//! - `ingestion` - the single ingestion point
//! - `orchestrator` - lifecycle and health
//! - `sync_state` / `metrics` - health tracking and structured events
//! - `scheduler` - clocks, poll cadence and background tasks
//! - `config` - environment-driven settings

pub mod classifier;
pub mod config;
pub mod contacts;
pub mod decoder;
pub mod ingestion;
pub mod metrics;
pub mod orchestrator;
pub mod recognition;
pub mod scheduler;
pub mod store;
pub mod sync_state;
pub mod trust;
pub mod types;

pub use config::{PipelineConfig, TopicConfig};
pub use orchestrator::{HealthSnapshot, IngestionOrchestrator, OrchestratorError, OrchestratorState};
pub use store::SignalStore;
pub use types::{Scope, SignalEvent, SignalType};
