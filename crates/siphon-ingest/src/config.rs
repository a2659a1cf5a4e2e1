use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use siphon_store::split_store_path;

use crate::error::{Error, Result};
use crate::manifest::ManifestPolicy;

pub const CONFIG_FILE: &str = "siphon.toml";
pub const ENV_PREFIX: &str = "SIPHON_";

pub const MIN_CHUNK_SIZE: usize = 1024;
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Settings for one ingestion session.
///
/// Layered as defaults, then `siphon.toml`, then `SIPHON_*` environment
/// variables.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Directory that backs the persistent store.
    pub store_root: PathBuf,
    /// Scratch directory for ingested files, relative to the store root.
    pub working_dir: String,
    /// Store-relative directories or files that ingestion cleanup must never delete.
    /// The store root itself is always protected.
    pub protected_paths: Vec<String>,
    /// Directory holding `<platform>.json` manifests.
    pub manifest_dir: PathBuf,
    /// Archive read size in bytes.
    pub chunk_size: usize,
    /// Silence, in milliseconds, after which an entry's write is abandoned.
    pub stall_timeout_ms: u64,
    pub manifest_policy: ManifestPolicy,
    /// Empty the working directory before streaming starts.
    pub clear_before_ingest: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            store_root: PathBuf::from("siphon-store"),
            working_dir: "ingest/bronze".to_string(),
            protected_paths: vec!["db".to_string()],
            manifest_dir: PathBuf::from("manifests"),
            chunk_size: siphon_archive::DEFAULT_CHUNK_SIZE,
            stall_timeout_ms: 10_000,
            manifest_policy: ManifestPolicy::AcceptAll,
            clear_before_ingest: false,
        }
    }
}

impl IngestConfig {
    /// Provider chain used by [`load`](Self::load). `file` defaults to
    /// `siphon.toml` in the current directory; a missing file is skipped.
    pub fn figment(file: Option<&Path>) -> Figment {
        let file = file.unwrap_or(Path::new(CONFIG_FILE));
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    pub fn load(file: Option<&Path>) -> Result<Self> {
        let config: Self = Self::figment(file).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(Error::Config(format!(
                "chunk_size must be between {MIN_CHUNK_SIZE} and {MAX_CHUNK_SIZE} bytes, got {}",
                self.chunk_size
            )));
        }
        if self.stall_timeout_ms == 0 {
            return Err(Error::Config("stall_timeout_ms must be positive".into()));
        }
        for path in std::iter::once(&self.working_dir).chain(&self.protected_paths) {
            split_store_path(path).map_err(|e| Error::Config(e.to_string()))?;
        }
        Ok(())
    }

    pub fn stall_window(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    #[must_use]
    pub fn store_root(mut self, store_root: impl Into<PathBuf>) -> Self {
        self.store_root = store_root.into();
        self
    }

    #[must_use]
    pub fn working_dir(mut self, working_dir: impl Into<String>) -> Self {
        self.working_dir = working_dir.into();
        self
    }

    #[must_use]
    pub fn protected_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protected_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn manifest_dir(mut self, manifest_dir: impl Into<PathBuf>) -> Self {
        self.manifest_dir = manifest_dir.into();
        self
    }

    #[must_use]
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    #[must_use]
    pub fn stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn manifest_policy(mut self, policy: ManifestPolicy) -> Self {
        self.manifest_policy = policy;
        self
    }

    #[must_use]
    pub fn clear_before_ingest(mut self, clear: bool) -> Self {
        self.clear_before_ingest = clear;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_are_valid() {
        let config = IngestConfig::default();
        config.validate().unwrap();
        assert_eq!(config.stall_window(), Duration::from_secs(10));
        assert_eq!(config.working_dir, "ingest/bronze");
    }

    #[test]
    fn file_then_environment_override_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                CONFIG_FILE,
                r#"
                    working_dir = "ingest/silver"
                    chunk_size = 4096
                    manifest_policy = "reject"
                "#,
            )?;
            jail.set_env("SIPHON_STALL_TIMEOUT_MS", "2500");
            jail.set_env("SIPHON_CHUNK_SIZE", "8192");

            let config = IngestConfig::load(None).unwrap();
            assert_eq!(config.working_dir, "ingest/silver");
            assert_eq!(config.chunk_size, 8192);
            assert_eq!(config.stall_timeout_ms, 2500);
            assert_eq!(config.manifest_policy, ManifestPolicy::Reject);
            assert_eq!(config.protected_paths, vec!["db".to_string()]);
            Ok(())
        });
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let too_small = IngestConfig::default().chunk_size(16);
        assert!(matches!(too_small.validate(), Err(Error::Config(_))));

        let no_timeout = IngestConfig::default().stall_timeout(Duration::ZERO);
        assert!(matches!(no_timeout.validate(), Err(Error::Config(_))));

        let escaping = IngestConfig::default().working_dir("ingest/../..");
        assert!(matches!(escaping.validate(), Err(Error::Config(_))));
    }
}
