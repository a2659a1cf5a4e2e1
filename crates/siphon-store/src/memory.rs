//! In-memory backend.
//!
//! Writables follow swap-file semantics: bytes are buffered and replace the
//! file's contents only when the writable is closed. A writable dropped
//! without `close` leaves the previous contents untouched.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::handle::{DirHandle, FileHandle, NodeId, Writable, validate_name};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct DirNode {
    id: NodeId,
    name: String,
    children: Mutex<BTreeMap<String, Node>>,
}

#[derive(Clone, Debug)]
enum Node {
    Dir(Arc<DirNode>),
    File(Arc<FileNode>),
}

#[derive(Debug, Default)]
struct FileNode {
    data: Mutex<Vec<u8>>,
}

#[derive(Clone, Debug)]
pub struct MemoryDir {
    node: Arc<DirNode>,
    ids: Arc<AtomicU64>,
}

impl Default for MemoryDir {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDir {
    /// Create an empty store and return its root.
    pub fn new() -> Self {
        Self {
            node: Arc::new(DirNode {
                id: NodeId::Memory(0),
                name: "/".to_string(),
                children: Mutex::new(BTreeMap::new()),
            }),
            ids: Arc::new(AtomicU64::new(1)),
        }
    }

    fn wrap(&self, node: Arc<DirNode>) -> Self {
        Self {
            node,
            ids: Arc::clone(&self.ids),
        }
    }
}

impl DirHandle for MemoryDir {
    type File = MemoryFile;

    fn id(&self) -> &NodeId {
        &self.node.id
    }

    fn name(&self) -> &str {
        &self.node.name
    }

    async fn get_directory(&self, name: &str, create: bool) -> Result<Self> {
        validate_name(name)?;
        let mut children = lock(&self.node.children);
        match children.get(name).cloned() {
            Some(Node::Dir(dir)) => Ok(self.wrap(dir)),
            Some(Node::File(_)) => Err(Error::NotADirectory {
                name: name.to_string(),
            }),
            None if !create => Err(Error::NotFound {
                name: name.to_string(),
            }),
            None => {
                let dir = Arc::new(DirNode {
                    id: NodeId::Memory(self.ids.fetch_add(1, Ordering::Relaxed)),
                    name: name.to_string(),
                    children: Mutex::new(BTreeMap::new()),
                });
                children.insert(name.to_string(), Node::Dir(Arc::clone(&dir)));
                Ok(self.wrap(dir))
            }
        }
    }

    async fn get_file(&self, name: &str, create: bool) -> Result<MemoryFile> {
        validate_name(name)?;
        let mut children = lock(&self.node.children);
        let node = match children.get(name).cloned() {
            Some(Node::File(file)) => file,
            Some(Node::Dir(_)) => {
                return Err(Error::NotAFile {
                    name: name.to_string(),
                });
            }
            None if !create => {
                return Err(Error::NotFound {
                    name: name.to_string(),
                });
            }
            None => {
                let file = Arc::new(FileNode::default());
                children.insert(name.to_string(), Node::File(Arc::clone(&file)));
                file
            }
        };
        Ok(MemoryFile {
            name: name.to_string(),
            node,
        })
    }

    async fn entries(&self) -> Result<Vec<String>> {
        Ok(lock(&self.node.children).keys().cloned().collect())
    }

    async fn remove_entry(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let mut children = lock(&self.node.children);
        let populated = match children.get(name) {
            None => {
                return Err(Error::NotFound {
                    name: name.to_string(),
                });
            }
            Some(Node::Dir(dir)) => !lock(&dir.children).is_empty(),
            Some(Node::File(_)) => false,
        };
        if populated {
            return Err(Error::NotEmpty {
                name: name.to_string(),
            });
        }
        children.remove(name);
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct MemoryFile {
    name: String,
    node: Arc<FileNode>,
}

impl MemoryFile {
    /// Snapshot of the committed contents.
    pub fn contents(&self) -> Vec<u8> {
        lock(&self.node.data).clone()
    }
}

impl FileHandle for MemoryFile {
    type Writer = MemoryWritable;

    fn name(&self) -> &str {
        &self.name
    }

    async fn create_writable(&self) -> Result<MemoryWritable> {
        Ok(MemoryWritable {
            node: Arc::clone(&self.node),
            buffer: Vec::new(),
        })
    }

    async fn size(&self) -> Result<u64> {
        Ok(lock(&self.node.data).len() as u64)
    }
}

#[derive(Debug)]
pub struct MemoryWritable {
    node: Arc<FileNode>,
    buffer: Vec<u8>,
}

impl Writable for MemoryWritable {
    async fn write(&mut self, bytes: Bytes) -> Result<()> {
        self.buffer.extend_from_slice(&bytes);
        Ok(())
    }

    async fn close(self) -> Result<()> {
        *lock(&self.node.data) = self.buffer;
        Ok(())
    }
}
