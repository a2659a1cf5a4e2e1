//! Handle traits shared by every store backend.
//!
//! The shape mirrors an origin-private file system: directories hand out
//! child directories and files by name, files hand out writables, and a
//! writable only becomes durable once it is closed.

use std::future::Future;
use std::path::PathBuf;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::resolver::RemovalPermit;

/// Identity of a directory node, independent of the name it was reached by.
///
/// Two handles with equal ids refer to the same underlying directory even
/// when they were obtained through different paths (symlinks, renames,
/// separately resolved configuration).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum NodeId {
    Inode { dev: u64, ino: u64 },
    Path(PathBuf),
    Memory(u64),
}

pub trait DirHandle: Clone + Send + Sync + 'static {
    type File: FileHandle;

    fn id(&self) -> &NodeId;

    fn name(&self) -> &str;

    /// Open the child directory `name`, creating it when `create` is set.
    ///
    /// Creating a directory that already exists is not an error.
    fn get_directory(&self, name: &str, create: bool) -> impl Future<Output = Result<Self>> + Send;

    /// Open the child file `name`, creating an empty file when `create` is set.
    fn get_file(&self, name: &str, create: bool) -> impl Future<Output = Result<Self::File>> + Send;

    /// Names of all direct children, sorted.
    fn entries(&self) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Remove the file or empty directory `name`. A populated directory
    /// fails with [`Error::NotEmpty`].
    fn remove_entry(&self, name: &str) -> impl Future<Output = Result<()>> + Send;

    /// Delete the directory a permit was issued for, with everything in it.
    ///
    /// Permits only come from [`StorageResolver::authorize`](crate::StorageResolver::authorize).
    /// The default walks the tree with [`remove_entry`](Self::remove_entry),
    /// deepest directories first.
    fn remove_tree(permit: RemovalPermit<Self>) -> impl Future<Output = Result<()>> + Send {
        async move {
            let mut pending = vec![permit.directory().clone()];
            while let Some(dir) = pending.last().cloned() {
                let mut populated = Vec::new();
                for name in dir.entries().await? {
                    let child = match dir.get_directory(&name, false).await {
                        Ok(child) => child,
                        Err(Error::NotADirectory { .. }) => {
                            dir.remove_entry(&name).await?;
                            continue;
                        }
                        Err(e) => return Err(e),
                    };
                    if child.entries().await?.is_empty() {
                        dir.remove_entry(&name).await?;
                    } else {
                        populated.push(child);
                    }
                }
                if populated.is_empty() {
                    pending.pop();
                } else {
                    pending.extend(populated);
                }
            }
            permit.parent().remove_entry(permit.name()).await
        }
    }
}

pub trait FileHandle: Send + Sync + 'static {
    type Writer: Writable;

    fn name(&self) -> &str;

    /// Open a writable that replaces the file's contents (create-or-truncate).
    fn create_writable(&self) -> impl Future<Output = Result<Self::Writer>> + Send;

    /// Current on-disk size in bytes.
    fn size(&self) -> impl Future<Output = Result<u64>> + Send;
}

pub trait Writable: Send + 'static {
    fn write(&mut self, bytes: Bytes) -> impl Future<Output = Result<()>> + Send;

    fn close(self) -> impl Future<Output = Result<()>> + Send;
}

/// Check that `name` addresses exactly one child of a directory.
pub fn validate_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(Error::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}
