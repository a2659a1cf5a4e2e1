//! Hierarchical byte store used as the ingestion target.
//!
//! # Architecture
//!
//! - `handle.rs` - Directory, file and writable traits plus node identity
//! - `fs.rs` - Local filesystem backend
//! - `memory.rs` - In-memory backend
//! - `resolver.rs` - Configured layout and the recursive-delete guard

pub use error::{Error, Result, from_io};
pub use fs::{FsDir, FsFile, FsWritable};
pub use handle::{DirHandle, FileHandle, NodeId, Writable, validate_name};
pub use memory::{MemoryDir, MemoryFile, MemoryWritable};
pub use resolver::{RemovalPermit, StorageResolver, resolve_path, split_store_path};

mod error;
mod fs;
mod handle;
mod memory;
mod resolver;
