//! Forward-only ZIP reading for large exports.
//!
//! # Architecture
//!
//! - `reader.rs` - Bounded buffered reads with lookahead for the decoder
//! - `decode.rs` - Blocking decoder: the `zip` crate for entries it can stream,
//!   local framing for data-descriptor, encrypted and unsupported entries
//! - `stream.rs` - `ZipStream`, the async `EntrySource` over the decoder thread
//! - `entry.rs` - Entry metadata, payload chunks and the `EntrySource` seam
//! - `sanitize.rs` - Flattening archive paths into single file names

pub use entry::{ArchiveEntry, Chunk, EntrySource, is_directory_name};
pub use error::{Error, Result};
pub use reader::{ArchiveStreamReader, DEFAULT_CHUNK_SIZE, ReadProgress};
pub use sanitize::{FLAT_SEPARATOR, flatten_entry_name};
pub use stream::ZipStream;

mod decode;
pub mod entry;
mod error;
mod reader;
mod sanitize;
mod stream;
