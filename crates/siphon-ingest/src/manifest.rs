//! Platform manifests: which archive paths are worth keeping.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Parsed manifest as returned by a [`ManifestSource`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestDocument {
    pub paths: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("no manifest for platform '{0}'")]
    NotFound(String),

    #[error("invalid platform id '{0}'")]
    InvalidPlatform(String),

    #[error("failed to read manifest: {0}")]
    Io(#[from] io::Error),

    #[error("malformed manifest: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Where manifests come from.
pub trait ManifestSource: Send + Sync {
    fn fetch(
        &self,
        platform: &str,
    ) -> impl Future<Output = std::result::Result<ManifestDocument, ManifestError>> + Send;
}

/// What to do when a platform's manifest cannot be loaded or is empty.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManifestPolicy {
    /// Keep every entry and record a warning.
    #[default]
    AcceptAll,
    /// Refuse to ingest.
    Reject,
}

/// Reads `<dir>/<platform>.json` documents of the form `{"paths": [...]}`.
#[derive(Clone, Debug)]
pub struct DirectoryManifests {
    dir: PathBuf,
}

impl DirectoryManifests {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

fn valid_platform(platform: &str) -> bool {
    !platform.is_empty()
        && platform
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl ManifestSource for DirectoryManifests {
    async fn fetch(&self, platform: &str) -> std::result::Result<ManifestDocument, ManifestError> {
        if !valid_platform(platform) {
            return Err(ManifestError::InvalidPlatform(platform.to_string()));
        }
        let path = self.dir.join(format!("{platform}.json"));
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ManifestError::NotFound(platform.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&raw)?)
    }
}

/// Manifests held in memory.
#[derive(Clone, Debug, Default)]
pub struct StaticManifests {
    platforms: HashMap<String, Vec<String>>,
}

impl StaticManifests {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with<I, S>(mut self, platform: impl Into<String>, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.platforms
            .insert(platform.into(), paths.into_iter().map(Into::into).collect());
        self
    }
}

impl ManifestSource for StaticManifests {
    async fn fetch(&self, platform: &str) -> std::result::Result<ManifestDocument, ManifestError> {
        self.platforms
            .get(platform)
            .map(|paths| ManifestDocument {
                paths: paths.clone(),
            })
            .ok_or_else(|| ManifestError::NotFound(platform.to_string()))
    }
}

/// Separator-insensitive, case-insensitive suffix matcher over manifest paths.
///
/// A pattern matches a path when it equals the whole path or a trailing run of
/// whole path segments: `devices/list.json` matches
/// `acme-export/devices/list.json` but not `acme-export/mydevices/list.json`.
/// A filter without patterns accepts everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ManifestFilter {
    patterns: Vec<String>,
}

fn normalize(path: &str) -> String {
    let path = path.replace('\\', "/").to_lowercase();
    let mut rest = path.as_str();
    loop {
        if let Some(stripped) = rest.strip_prefix("./") {
            rest = stripped;
        } else if let Some(stripped) = rest.strip_prefix('/') {
            rest = stripped;
        } else {
            break;
        }
    }
    rest.to_string()
}

impl ManifestFilter {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut patterns: Vec<String> = paths
            .into_iter()
            .map(|p| normalize(p.as_ref()))
            .filter(|p| !p.is_empty())
            .collect();
        patterns.sort();
        patterns.dedup();
        Self { patterns }
    }

    pub fn accept_all() -> Self {
        Self::default()
    }

    pub fn is_accept_all(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Fetch and compile the manifest for `platform`.
    ///
    /// An unavailable or empty manifest either degrades to accept-all, in
    /// which case the returned warning describes why, or fails with
    /// [`Error::ManifestUnavailable`], depending on `policy`.
    pub async fn load<M: ManifestSource>(
        source: &M,
        platform: &str,
        policy: ManifestPolicy,
    ) -> Result<(Self, Option<String>)> {
        let reason = match source.fetch(platform).await {
            Ok(doc) => {
                let filter = Self::new(&doc.paths);
                if !filter.is_empty() {
                    debug!(platform, patterns = filter.len(), "manifest loaded");
                    return Ok((filter, None));
                }
                "manifest lists no paths".to_string()
            }
            Err(e) => e.to_string(),
        };

        match policy {
            ManifestPolicy::AcceptAll => {
                let warning =
                    format!("manifest for '{platform}' unavailable ({reason}); accepting all entries");
                warn!(platform, %reason, "falling back to accept-all");
                Ok((Self::accept_all(), Some(warning)))
            }
            ManifestPolicy::Reject => Err(Error::ManifestUnavailable {
                platform: platform.to_string(),
                reason,
            }),
        }
    }

    pub fn is_whitelisted(&self, path: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        let path = normalize(path);
        self.patterns.iter().any(|pattern| {
            path == *pattern
                || (path.len() > pattern.len()
                    && path.ends_with(pattern.as_str())
                    && path.as_bytes()[path.len() - pattern.len() - 1] == b'/')
        })
    }
}
