//! Streaming ingestion of data-export archives into a persistent store.
//!
//! # Architecture
//!
//! - `manifest.rs` - Manifest sources, unavailable-manifest policy, path filter
//! - `watchdog.rs` - Per-entry silence timer
//! - `task.rs` - Ordered per-entry write pipelines and their queue
//! - `coordinator.rs` - Phase state machine tying archive, filter and store together
//! - `summary.rs` - Run summary and per-entry failure records
//! - `config.rs` - Layered configuration

pub use config::{CONFIG_FILE, ENV_PREFIX, IngestConfig, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
pub use coordinator::{IngestCoordinator, IngestPhase};
pub use error::{Error, ErrorKind, IngestFailure, Result};
pub use manifest::{
    DirectoryManifests, ManifestDocument, ManifestError, ManifestFilter, ManifestPolicy,
    ManifestSource, StaticManifests,
};
pub use summary::{EntryFailure, FailureRecord, IngestionSummary};
pub use task::{EntryWriteQueue, TaskReport, TaskState, WriteTask};
pub use watchdog::{Stall, StallWatchdog};

mod config;
mod coordinator;
mod error;
mod manifest;
mod summary;
mod task;
mod watchdog;
