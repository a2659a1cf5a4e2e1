//! Configured directory layout and the guard in front of recursive deletes.
//!
//! Recursive deletes only happen through [`DirHandle::remove_tree`], which
//! takes a [`RemovalPermit`]. The only way to get one is
//! [`StorageResolver::authorize`], which compares node identities (not path
//! strings) against the store root, every configured protected location and
//! every directory that contains one.

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::handle::{DirHandle, NodeId};

/// Split a configured relative path into directory names.
///
/// Both separators are accepted; empty and `.` segments are dropped. `..` is
/// rejected outright rather than resolved.
pub fn split_store_path(path: &str) -> Result<Vec<&str>> {
    let mut segments = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                return Err(Error::InvalidPath {
                    path: path.to_string(),
                    reason: "parent segments are not allowed",
                });
            }
            s if s.contains('\0') => {
                return Err(Error::InvalidPath {
                    path: path.to_string(),
                    reason: "contains a null byte",
                });
            }
            s => segments.push(s),
        }
    }
    Ok(segments)
}

/// Walk `path` below `root`, creating each missing segment when `create` is set.
pub async fn resolve_path<D: DirHandle>(root: &D, path: &str, create: bool) -> Result<D> {
    let mut dir = root.clone();
    for segment in split_store_path(path)? {
        dir = dir.get_directory(segment, create).await?;
    }
    Ok(dir)
}

/// Proof that the child directory `name` of `parent` passed the
/// protected-location check. Consumed by [`DirHandle::remove_tree`].
///
/// Cannot be constructed outside this module.
#[derive(Debug)]
pub struct RemovalPermit<D> {
    parent: D,
    name: String,
    dir: D,
}

impl<D> RemovalPermit<D> {
    pub fn parent(&self) -> &D {
        &self.parent
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn directory(&self) -> &D {
        &self.dir
    }
}

#[derive(Debug, Clone)]
enum Guarded {
    Dir(NodeId),
    /// Files have no identity of their own; they are pinned by parent and name.
    File { parent: NodeId, name: String },
}

#[derive(Debug, Clone)]
struct Protected {
    label: String,
    node: Guarded,
    /// Directories that contain the location, root first.
    ancestors: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub struct StorageResolver<D: DirHandle> {
    root: D,
    working: D,
    protected: Vec<Protected>,
}

/// Resolve a protected path to what it names, or `None` when nothing is
/// there yet.
async fn resolve_protected<D: DirHandle>(root: &D, path: &str) -> Result<Option<Protected>> {
    let segments = split_store_path(path)?;
    let Some((last, parents)) = segments.split_last() else {
        return Ok(Some(Protected {
            label: path.to_string(),
            node: Guarded::Dir(root.id().clone()),
            ancestors: Vec::new(),
        }));
    };

    let mut dir = root.clone();
    let mut ancestors = vec![root.id().clone()];
    for segment in parents {
        dir = match dir.get_directory(segment, false).await {
            Ok(child) => child,
            Err(e) if e.is_not_found() || matches!(e, Error::NotADirectory { .. }) => {
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        ancestors.push(dir.id().clone());
    }

    let node = match dir.get_directory(last, false).await {
        Ok(child) => Guarded::Dir(child.id().clone()),
        Err(Error::NotADirectory { .. }) => {
            dir.get_file(last, false).await?;
            Guarded::File {
                parent: dir.id().clone(),
                name: (*last).to_string(),
            }
        }
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e),
    };
    Ok(Some(Protected {
        label: path.to_string(),
        node,
        ancestors,
    }))
}

impl<D: DirHandle> StorageResolver<D> {
    /// Resolve the working directory (created on demand) and record the
    /// identities of the root and of every protected path that exists.
    /// Protected paths may name directories or files.
    ///
    /// Fails with [`Error::RootDeletionGuard`] if the working directory is
    /// the root or one of the protected locations.
    pub async fn open(root: D, working_dir: &str, protected_paths: &[String]) -> Result<Self> {
        let working = resolve_path(&root, working_dir, true).await?;

        let mut protected = vec![Protected {
            label: "/".to_string(),
            node: Guarded::Dir(root.id().clone()),
            ancestors: Vec::new(),
        }];
        for path in protected_paths {
            match resolve_protected(&root, path).await? {
                Some(location) => protected.push(location),
                None => debug!(path = %path, "protected path does not exist yet"),
            }
        }

        let resolver = Self {
            root,
            working,
            protected,
        };
        if let Some(hit) = resolver.protected_dir(resolver.working.id()) {
            warn!(working_dir, protected = %hit.label, "working directory aliases a protected location");
            return Err(Error::RootDeletionGuard {
                target: working_dir.to_string(),
                protected: hit.label.clone(),
            });
        }
        debug!(working_dir, protected = resolver.protected.len(), "storage layout resolved");
        Ok(resolver)
    }

    /// The store root, which is also the long-lived database location.
    pub fn root(&self) -> &D {
        &self.root
    }

    /// Scratch directory that ingestion writes into.
    pub fn working_directory(&self) -> &D {
        &self.working
    }

    pub fn is_protected(&self, dir: &D) -> bool {
        self.protected_dir(dir.id()).is_some()
    }

    fn protected_dir(&self, id: &NodeId) -> Option<&Protected> {
        self.protected
            .iter()
            .find(|p| matches!(&p.node, Guarded::Dir(node) if node == id))
    }

    fn protected_file(&self, parent: &NodeId, name: &str) -> Option<&Protected> {
        self.protected.iter().find(|p| {
            matches!(&p.node, Guarded::File { parent: p_parent, name: p_name }
                if p_parent == parent && p_name.as_str() == name)
        })
    }

    /// A protected location the recursive removal of `id` would take with it.
    fn endangered_by(&self, id: &NodeId) -> Option<&Protected> {
        self.protected_dir(id)
            .or_else(|| self.protected.iter().find(|p| p.ancestors.contains(id)))
    }

    fn refuse(&self, target: &str, hit: &Protected) -> Error {
        warn!(entry = target, protected = %hit.label, "blocked delete of a protected location");
        Error::RootDeletionGuard {
            target: target.to_string(),
            protected: hit.label.clone(),
        }
    }

    /// Permit the recursive removal of the child directory `name` of
    /// `parent`, unless it is or contains a protected location.
    pub async fn authorize(&self, parent: &D, name: &str) -> Result<RemovalPermit<D>> {
        let dir = parent.get_directory(name, false).await?;
        if let Some(hit) = self.endangered_by(dir.id()) {
            return Err(self.refuse(name, hit));
        }
        Ok(RemovalPermit {
            parent: parent.clone(),
            name: name.to_string(),
            dir,
        })
    }

    /// Remove everything inside `dir`, keeping `dir` itself. Child
    /// directories are authorized individually and protected files are
    /// refused. Returns the number of removed entries.
    pub async fn purge(&self, dir: &D) -> Result<usize> {
        if let Some(hit) = self.protected_dir(dir.id()) {
            return Err(self.refuse(dir.name(), hit));
        }
        let mut removed = 0;
        for name in dir.entries().await? {
            match dir.get_directory(&name, false).await {
                Ok(_) => {
                    let permit = self.authorize(dir, &name).await?;
                    D::remove_tree(permit).await?;
                }
                Err(Error::NotADirectory { .. }) => {
                    if let Some(hit) = self.protected_file(dir.id(), &name) {
                        return Err(self.refuse(&name, hit));
                    }
                    dir.remove_entry(&name).await?;
                }
                Err(e) => return Err(e),
            }
            removed += 1;
        }
        debug!(dir = %dir.name(), removed, "purged directory");
        Ok(removed)
    }

    /// Recursively delete the child directory `name` of `parent`.
    pub async fn remove_directory(&self, parent: &D, name: &str) -> Result<()> {
        let permit = self.authorize(parent, name).await?;
        D::remove_tree(permit).await
    }

    /// Empty the working directory through the guard.
    pub async fn clear_working_directory(&self) -> Result<usize> {
        self.purge(&self.working).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDir;

    #[test]
    fn store_paths_split_on_both_separators() {
        assert_eq!(split_store_path("ingest/bronze").unwrap(), vec!["ingest", "bronze"]);
        assert_eq!(split_store_path("\\ingest\\.\\bronze/").unwrap(), vec!["ingest", "bronze"]);
        assert!(split_store_path("").unwrap().is_empty());
        assert!(split_store_path("ingest/../..").is_err());
    }

    #[tokio::test]
    async fn working_directory_is_created_and_distinct_from_root() {
        let root = MemoryDir::new();
        let resolver = StorageResolver::open(root.clone(), "ingest/bronze", &[]).await.unwrap();

        assert_ne!(resolver.working_directory().id(), root.id());
        let ingest = root.get_directory("ingest", false).await.unwrap();
        assert_eq!(ingest.entries().await.unwrap(), vec!["bronze"]);
    }

    #[tokio::test]
    async fn root_as_working_directory_is_refused() {
        for path in ["", ".", "/", "./"] {
            let err = StorageResolver::open(MemoryDir::new(), path, &[]).await.unwrap_err();
            assert!(err.is_guard(), "{path:?} should alias the root");
        }
    }

    #[tokio::test]
    async fn protected_path_as_working_directory_is_refused() {
        let root = MemoryDir::new();
        let err = StorageResolver::open(root, "db", &["db".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RootDeletionGuard { ref protected, .. } if protected == "db"));
    }

    #[tokio::test]
    async fn purge_refuses_root_and_leaves_it_untouched() {
        let root = MemoryDir::new();
        root.get_file("timeline.db", true).await.unwrap();
        let resolver = StorageResolver::open(root.clone(), "ingest", &[]).await.unwrap();
        let before = root.entries().await.unwrap();

        let err = resolver.purge(resolver.root()).await.unwrap_err();
        assert!(err.is_guard());
        assert_eq!(root.entries().await.unwrap(), before);
    }

    #[tokio::test]
    async fn purge_stops_at_nested_protected_dirs() {
        let root = MemoryDir::new();
        let working = resolve_path(&root, "ingest", true).await.unwrap();
        working.get_file("a.json", true).await.unwrap();
        working.get_directory("keep", true).await.unwrap();
        let resolver = StorageResolver::open(root, "ingest", &["ingest/keep".to_string()])
            .await
            .unwrap();

        let err = resolver.clear_working_directory().await.unwrap_err();
        assert!(err.is_guard());
        assert_eq!(working.entries().await.unwrap(), vec!["keep"]);
    }

    #[tokio::test]
    async fn directories_holding_a_protected_location_are_not_removed() {
        let root = MemoryDir::new();
        let deep = resolve_path(&root, "ingest/cache/keep", true).await.unwrap();
        deep.get_file("index", true).await.unwrap();
        let resolver = StorageResolver::open(root.clone(), "ingest", &["ingest/cache/keep".to_string()])
            .await
            .unwrap();

        let err = resolver.remove_directory(&root, "ingest").await.unwrap_err();
        assert!(err.is_guard());
        let err = resolver.clear_working_directory().await.unwrap_err();
        assert!(matches!(err, Error::RootDeletionGuard { ref target, .. } if target == "cache"));
        assert_eq!(deep.entries().await.unwrap(), vec!["index"]);
    }

    #[tokio::test]
    async fn protected_files_are_accepted_and_spared() {
        let root = MemoryDir::new();
        root.get_file("forensics.db", true).await.unwrap();
        let working = resolve_path(&root, "ingest", true).await.unwrap();
        working.get_file("a.json", true).await.unwrap();
        working.get_file("keep.db", true).await.unwrap();

        let protected = [
            "forensics.db".to_string(),
            "ingest/keep.db".to_string(),
            "missing/file.db".to_string(),
        ];
        let resolver = StorageResolver::open(root.clone(), "ingest", &protected)
            .await
            .unwrap();

        let err = resolver.clear_working_directory().await.unwrap_err();
        assert!(matches!(err, Error::RootDeletionGuard { ref protected, .. } if protected == "ingest/keep.db"));
        assert_eq!(working.entries().await.unwrap(), vec!["keep.db"]);
        assert_eq!(root.entries().await.unwrap(), vec!["forensics.db", "ingest"]);
    }

    #[tokio::test]
    async fn file_protected_path_cannot_be_the_working_directory() {
        let root = MemoryDir::new();
        root.get_file("forensics.db", true).await.unwrap();
        let err = StorageResolver::open(root, "forensics.db", &["forensics.db".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotADirectory { .. }));
    }

    #[tokio::test]
    async fn clear_working_directory_removes_files_and_directories() {
        let root = MemoryDir::new();
        let resolver = StorageResolver::open(root.clone(), "ingest", &[]).await.unwrap();
        let working = resolver.working_directory().clone();
        working.get_file("a.json", true).await.unwrap();
        working.get_directory("nested", true).await.unwrap().get_file("b", true).await.unwrap();

        assert_eq!(resolver.clear_working_directory().await.unwrap(), 2);
        assert!(working.entries().await.unwrap().is_empty());
        assert_eq!(root.entries().await.unwrap(), vec!["ingest"]);
    }
}
