//! Error types for siphon-ingest.
//!
//! Only batch-fatal conditions are errors. Problems with a single entry are
//! recorded in the summary as [`EntryFailure`](crate::EntryFailure) values.

use serde::Serialize;
use siphon_archive as archive;
use siphon_store as store;

use crate::coordinator::IngestPhase;
use crate::summary::IngestionSummary;

/// Recognizable category of a fatal error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    ArchiveCorrupt,
    ManifestUnavailable,
    RootDeletionGuard,
    StorageInconsistent,
    Storage,
    Config,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("archive is corrupt: {0}")]
    ArchiveCorrupt(#[source] archive::Error),

    #[error("manifest for platform '{platform}' is unavailable: {reason}")]
    ManifestUnavailable { platform: String, reason: String },

    #[error(transparent)]
    RootDeletionGuard(store::Error),

    #[error(
        "{} verified file(s) missing from the working directory: {}",
        .missing.len(),
        .missing.join(", ")
    )]
    StorageInconsistent { missing: Vec<String> },

    #[error("storage error: {0}")]
    Storage(#[source] store::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to load configuration: {0}")]
    Figment(#[from] figment::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ArchiveCorrupt(_) => ErrorKind::ArchiveCorrupt,
            Error::ManifestUnavailable { .. } => ErrorKind::ManifestUnavailable,
            Error::RootDeletionGuard(_) => ErrorKind::RootDeletionGuard,
            Error::StorageInconsistent { .. } => ErrorKind::StorageInconsistent,
            Error::Storage(_) => ErrorKind::Storage,
            Error::Config(_) | Error::Figment(_) => ErrorKind::Config,
        }
    }
}

impl From<store::Error> for Error {
    fn from(e: store::Error) -> Self {
        if e.is_guard() {
            Error::RootDeletionGuard(e)
        } else {
            Error::Storage(e)
        }
    }
}

impl From<archive::Error> for Error {
    fn from(e: archive::Error) -> Self {
        Error::ArchiveCorrupt(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A fatal error together with everything accumulated before it.
#[derive(Debug, thiserror::Error)]
#[error("ingestion failed while {phase}")]
pub struct IngestFailure {
    #[source]
    pub error: Error,
    /// Phase that was active when the error surfaced.
    pub phase: IngestPhase,
    pub partial: IngestionSummary,
}

impl IngestFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}
