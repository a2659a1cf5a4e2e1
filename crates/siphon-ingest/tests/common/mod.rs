#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::io::{self, Cursor, Write};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use siphon_archive::{ArchiveEntry, Chunk, EntrySource};
use siphon_ingest::{IngestConfig, StaticManifests};
use siphon_store::{
    DirHandle, Error, FileHandle, MemoryDir, MemoryFile, MemoryWritable, NodeId, Result, Writable,
};
use tokio::io::{AsyncRead, ReadBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const LOGIN: &str = "acme-export/events/login.json";
pub const IGNORED: &str = "acme-export/other/ignored.json";
pub const DEVICES: &str = "acme-export/devices/list.json";
pub const EMPTY_DIR: &str = "acme-export/empty/";

pub const LOGIN_TARGET: &str = "acme-export___events___login.json";
pub const DEVICES_TARGET: &str = "acme-export___devices___list.json";

pub fn acme_manifests() -> StaticManifests {
    StaticManifests::new().with("acme", ["events/login.json", "devices/list.json"])
}

pub fn config() -> IngestConfig {
    IngestConfig::default()
        .working_dir("ingest/bronze")
        .stall_timeout(Duration::from_secs(10))
}

pub fn login_payload() -> Vec<u8> {
    "{\"ts\":1700000000,\"event\":\"login\"}\n"
        .repeat(4000)
        .into_bytes()
}

pub fn devices_payload() -> Vec<u8> {
    br#"[{"id":"phone"},{"id":"laptop"}]"#.to_vec()
}

/// Build a ZIP in memory. `None` payloads become directory entries.
pub fn zip_archive(entries: &[(&str, Option<&[u8]>)]) -> Vec<u8> {
    build_archive(entries, CompressionMethod::Deflated)
}

/// Like [`zip_archive`], without compression, so payload bytes sit at
/// predictable offsets.
pub fn stored_archive(entries: &[(&str, Option<&[u8]>)]) -> Vec<u8> {
    build_archive(entries, CompressionMethod::Stored)
}

fn build_archive(entries: &[(&str, Option<&[u8]>)], method: CompressionMethod) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(method);
    for (name, payload) in entries {
        match payload {
            None => writer.add_directory(*name, options).unwrap(),
            Some(payload) => {
                writer.start_file(*name, options).unwrap();
                writer.write_all(payload).unwrap();
            }
        }
    }
    writer.finish().unwrap().into_inner()
}

pub fn acme_archive() -> Vec<u8> {
    let login = login_payload();
    let devices = devices_payload();
    zip_archive(&[
        (LOGIN, Some(login.as_slice())),
        (IGNORED, Some(&b"{\"ignored\":true}"[..])),
        (DEVICES, Some(devices.as_slice())),
        (EMPTY_DIR, None),
    ])
}

pub async fn working_dir(root: &MemoryDir) -> MemoryDir {
    root.get_directory("ingest", false)
        .await
        .unwrap()
        .get_directory("bronze", false)
        .await
        .unwrap()
}

/// Async reader that yields `data` and then never produces another byte.
pub struct HungReader {
    data: Vec<u8>,
    pos: usize,
}

impl HungReader {
    pub fn new(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
            pos: 0,
        }
    }
}

impl AsyncRead for HungReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos >= self.data.len() {
            return Poll::Pending;
        }
        let n = buf.remaining().min(self.data.len() - self.pos);
        let start = self.pos;
        buf.put_slice(&self.data[start..start + n]);
        self.pos += n;
        Poll::Ready(Ok(()))
    }
}

// --- scripted archive source ---

enum Step {
    Entry { name: String, chunks: Vec<Bytes>, stall_after: Option<usize> },
    Corrupt,
}

/// An [`EntrySource`] that replays a fixed script, optionally going silent
/// mid-entry or failing like a corrupt archive.
#[derive(Default)]
pub struct ScriptedSource {
    steps: VecDeque<Step>,
    current: Option<(Vec<Bytes>, Option<usize>, usize, bool)>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn file(mut self, name: &str, payload: &[u8], chunk_size: usize) -> Self {
        let mut chunks: Vec<Bytes> = payload
            .chunks(chunk_size)
            .map(Bytes::copy_from_slice)
            .collect();
        if chunks.is_empty() {
            chunks.push(Bytes::new());
        }
        self.steps.push_back(Step::Entry {
            name: name.to_string(),
            chunks,
            stall_after: None,
        });
        self
    }

    #[must_use]
    pub fn directory(mut self, name: &str) -> Self {
        self.steps.push_back(Step::Entry {
            name: name.to_string(),
            chunks: Vec::new(),
            stall_after: None,
        });
        self
    }

    /// An entry that delivers `first` and then never produces another chunk.
    #[must_use]
    pub fn stalling(mut self, name: &str, first: &[u8]) -> Self {
        self.steps.push_back(Step::Entry {
            name: name.to_string(),
            chunks: vec![Bytes::copy_from_slice(first), Bytes::from_static(b"never")],
            stall_after: Some(1),
        });
        self
    }

    #[must_use]
    pub fn corrupt(mut self) -> Self {
        self.steps.push_back(Step::Corrupt);
        self
    }
}

impl EntrySource for ScriptedSource {
    async fn next_entry(&mut self) -> siphon_archive::Result<Option<ArchiveEntry>> {
        match self.steps.pop_front() {
            None => {
                self.current = None;
                Ok(None)
            }
            Some(Step::Corrupt) => Err(siphon_archive::Error::BadSignature {
                signature: 0xdead_beef,
                offset: 0,
            }),
            Some(Step::Entry {
                name,
                chunks,
                stall_after,
            }) => {
                let entry = ArchiveEntry::new(
                    name,
                    Some(chunks.iter().map(|c| c.len() as u64).sum()),
                );
                self.current = Some((chunks, stall_after, 0, entry.is_directory));
                Ok(Some(entry))
            }
        }
    }

    async fn next_chunk(&mut self) -> siphon_archive::Result<Option<Chunk>> {
        let Some((chunks, stall_after, next, is_directory)) = self.current.as_mut() else {
            return Ok(None);
        };
        if *is_directory || *next >= chunks.len() {
            return Ok(None);
        }
        if *stall_after == Some(*next) {
            return std::future::pending().await;
        }
        let index = *next;
        *next += 1;
        Ok(Some(Chunk::new(chunks[index].clone(), index + 1 == chunks.len())))
    }
}

// --- fault-injecting store ---

#[derive(Debug, Default)]
pub struct Faults {
    /// Creating these files fails.
    pub fail_open: HashSet<String>,
    /// Writers for these files silently drop the last byte of every write.
    pub short_write: HashSet<String>,
    /// Writes to these files never complete.
    pub hang_write: HashSet<String>,
    /// These names never show up in directory listings.
    pub hidden: HashSet<String>,
}

impl Faults {
    pub fn fail_open(mut self, name: &str) -> Self {
        self.fail_open.insert(name.to_string());
        self
    }

    pub fn short_write(mut self, name: &str) -> Self {
        self.short_write.insert(name.to_string());
        self
    }

    pub fn hang_write(mut self, name: &str) -> Self {
        self.hang_write.insert(name.to_string());
        self
    }

    pub fn hidden(mut self, name: &str) -> Self {
        self.hidden.insert(name.to_string());
        self
    }
}

/// [`MemoryDir`] wrapper that misbehaves for selected file names.
#[derive(Clone, Debug)]
pub struct FaultyDir {
    inner: MemoryDir,
    faults: Arc<Faults>,
}

impl FaultyDir {
    pub fn new(inner: MemoryDir, faults: Faults) -> Self {
        Self {
            inner,
            faults: Arc::new(faults),
        }
    }
}

impl DirHandle for FaultyDir {
    type File = FaultyFile;

    fn id(&self) -> &NodeId {
        self.inner.id()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get_directory(&self, name: &str, create: bool) -> Result<Self> {
        Ok(Self {
            inner: self.inner.get_directory(name, create).await?,
            faults: Arc::clone(&self.faults),
        })
    }

    async fn get_file(&self, name: &str, create: bool) -> Result<FaultyFile> {
        if create && self.faults.fail_open.contains(name) {
            return Err(Error::Io {
                path: PathBuf::from(name),
                source: io::Error::other("no space left on device"),
            });
        }
        Ok(FaultyFile {
            inner: self.inner.get_file(name, create).await?,
            short: self.faults.short_write.contains(name),
            hang: self.faults.hang_write.contains(name),
        })
    }

    async fn entries(&self) -> Result<Vec<String>> {
        let mut names = self.inner.entries().await?;
        names.retain(|n| !self.faults.hidden.contains(n));
        Ok(names)
    }

    async fn remove_entry(&self, name: &str) -> Result<()> {
        self.inner.remove_entry(name).await
    }
}

pub struct FaultyFile {
    inner: MemoryFile,
    short: bool,
    hang: bool,
}

impl FileHandle for FaultyFile {
    type Writer = FaultyWriter;

    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn create_writable(&self) -> Result<FaultyWriter> {
        Ok(FaultyWriter {
            inner: self.inner.create_writable().await?,
            short: self.short,
            hang: self.hang,
        })
    }

    async fn size(&self) -> Result<u64> {
        self.inner.size().await
    }
}

pub struct FaultyWriter {
    inner: MemoryWritable,
    short: bool,
    hang: bool,
}

impl Writable for FaultyWriter {
    async fn write(&mut self, bytes: Bytes) -> Result<()> {
        if self.hang {
            return std::future::pending().await;
        }
        if self.short && !bytes.is_empty() {
            return self.inner.write(bytes.slice(..bytes.len() - 1)).await;
        }
        self.inner.write(bytes).await
    }

    async fn close(self) -> Result<()> {
        self.inner.close().await
    }
}
