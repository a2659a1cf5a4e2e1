//! Local filesystem backend built on `tokio::fs`.

use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result, from_io};
use crate::handle::{DirHandle, FileHandle, NodeId, Writable, validate_name};
use crate::resolver::RemovalPermit;

#[derive(Clone, Debug)]
pub struct FsDir {
    path: PathBuf,
    name: String,
    id: NodeId,
}

impl FsDir {
    /// Open `path` as a store root, creating it (and its parents) if needed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| from_io(&path, e))?;
        Self::existing(path).await
    }

    async fn existing(path: PathBuf) -> Result<Self> {
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| from_io(&path, e))?;
        if !meta.is_dir() {
            return Err(Error::NotADirectory {
                name: path.display().to_string(),
            });
        }
        let id = node_id(&path, &meta).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self { path, name, id })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn child(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.path.join(name))
    }
}

#[cfg(unix)]
async fn node_id(_path: &Path, meta: &Metadata) -> Result<NodeId> {
    use std::os::unix::fs::MetadataExt;
    Ok(NodeId::Inode {
        dev: meta.dev(),
        ino: meta.ino(),
    })
}

#[cfg(not(unix))]
async fn node_id(path: &Path, _meta: &Metadata) -> Result<NodeId> {
    tokio::fs::canonicalize(path)
        .await
        .map(NodeId::Path)
        .map_err(|e| from_io(path, e))
}

impl DirHandle for FsDir {
    type File = FsFile;

    fn id(&self) -> &NodeId {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn get_directory(&self, name: &str, create: bool) -> Result<Self> {
        let child = self.child(name)?;
        if create {
            match tokio::fs::create_dir(&child).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(from_io(&child, e)),
            }
        }
        Self::existing(child).await
    }

    async fn get_file(&self, name: &str, create: bool) -> Result<FsFile> {
        let child = self.child(name)?;
        if create {
            // Opened without truncation: only `create_writable` replaces contents.
            tokio::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&child)
                .await
                .map_err(|e| from_io(&child, e))?;
        }
        let meta = tokio::fs::metadata(&child)
            .await
            .map_err(|e| from_io(&child, e))?;
        if !meta.is_file() {
            return Err(Error::NotAFile {
                name: name.to_string(),
            });
        }
        Ok(FsFile {
            path: child,
            name: name.to_string(),
        })
    }

    async fn entries(&self) -> Result<Vec<String>> {
        let mut dir = tokio::fs::read_dir(&self.path)
            .await
            .map_err(|e| from_io(&self.path, e))?;
        let mut names = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|e| from_io(&self.path, e))? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn remove_entry(&self, name: &str) -> Result<()> {
        let child = self.child(name)?;
        // symlink_metadata: a link is removed as a link, never followed.
        let meta = tokio::fs::symlink_metadata(&child)
            .await
            .map_err(|e| from_io(&child, e))?;
        let result = if meta.is_dir() {
            tokio::fs::remove_dir(&child).await
        } else {
            tokio::fs::remove_file(&child).await
        };
        result.map_err(|e| from_io(&child, e))
    }

    async fn remove_tree(permit: RemovalPermit<Self>) -> Result<()> {
        // remove_dir_all unlinks symlinks instead of descending into them.
        let child = permit.parent().child(permit.name())?;
        tokio::fs::remove_dir_all(&child)
            .await
            .map_err(|e| from_io(&child, e))
    }
}

#[derive(Clone, Debug)]
pub struct FsFile {
    path: PathBuf,
    name: String,
}

impl FsFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FileHandle for FsFile {
    type Writer = FsWritable;

    fn name(&self) -> &str {
        &self.name
    }

    async fn create_writable(&self) -> Result<FsWritable> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .await
            .map_err(|e| from_io(&self.path, e))?;
        Ok(FsWritable {
            file,
            path: self.path.clone(),
        })
    }

    async fn size(&self) -> Result<u64> {
        tokio::fs::metadata(&self.path)
            .await
            .map(|m| m.len())
            .map_err(|e| from_io(&self.path, e))
    }
}

#[derive(Debug)]
pub struct FsWritable {
    file: tokio::fs::File,
    path: PathBuf,
}

impl Writable for FsWritable {
    async fn write(&mut self, bytes: Bytes) -> Result<()> {
        self.file
            .write_all(&bytes)
            .await
            .map_err(|e| from_io(&self.path, e))
    }

    async fn close(mut self) -> Result<()> {
        self.file.flush().await.map_err(|e| from_io(&self.path, e))?;
        self.file
            .sync_data()
            .await
            .map_err(|e| from_io(&self.path, e))
    }
}
