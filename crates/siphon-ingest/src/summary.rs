use serde::Serialize;
use tracing::{info, warn};

/// Why a single accepted entry did not end up on disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryFailure {
    #[error("write failed: {message}")]
    WriteFailed { message: String },

    #[error("stalled after {bytes_written} bytes in {chunks} chunks ({silence_ms} ms without progress)")]
    Stalled {
        bytes_written: u64,
        chunks: u64,
        silence_ms: u64,
    },

    #[error("size check failed: sent {expected} bytes, found {actual} on disk")]
    VerificationFailed { expected: u64, actual: u64 },

    #[error("entry name cannot be stored: {message}")]
    InvalidName { message: String },

    #[error("target '{target}' was already written by an earlier entry")]
    DuplicateTarget { target: String },

    #[error("payload ended after {bytes_written} bytes without a final chunk")]
    Truncated { bytes_written: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    /// Archive path of the entry.
    pub path: String,
    pub reason: EntryFailure,
}

/// Outcome of one ingestion run.
///
/// Once every write task has settled, `accepted == written + failed`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IngestionSummary {
    pub platform: String,
    pub scanned: u64,
    pub accepted: u64,
    pub written: u64,
    pub failed: u64,
    pub bytes_written: u64,
    pub failures: Vec<FailureRecord>,
    /// Flattened names of the files that were written and verified, sorted.
    pub verified_files: Vec<String>,
    pub warnings: Vec<String>,
}

impl IngestionSummary {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            ..Self::default()
        }
    }

    pub fn record_written(&mut self, bytes: u64) {
        self.written += 1;
        self.bytes_written += bytes;
    }

    pub fn record_failure(&mut self, path: impl Into<String>, reason: EntryFailure) {
        let path = path.into();
        warn!(entry = %path, %reason, "entry failed");
        self.failed += 1;
        self.failures.push(FailureRecord { path, reason });
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    pub(crate) fn log(&self) {
        info!(
            platform = %self.platform,
            scanned = self.scanned,
            accepted = self.accepted,
            written = self.written,
            failed = self.failed,
            bytes = self.bytes_written,
            warnings = self.warnings.len(),
            "ingestion finished"
        );
    }
}
