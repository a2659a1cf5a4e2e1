//! Async facade over the blocking decoder.
//!
//! The central directory sits at the end of the archive, so a forward-only
//! reader cannot use it. Entries are discovered from their local headers by
//! [`crate::decode`] on a blocking thread fed through [`SyncIoBridge`], and
//! each `next_entry`/`next_chunk` call is one request to that thread.

use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};
use tokio_util::io::SyncIoBridge;
use tracing::trace;

use crate::decode::{Decoder, Reply, Request, serve};
use crate::entry::{ArchiveEntry, Chunk, EntrySource};
use crate::error::{Error, Result};
use crate::reader::{ArchiveStreamReader, DEFAULT_CHUNK_SIZE, ReadProgress, closable};

/// Channel pair to a running decoder thread.
struct Link {
    requests: mpsc::UnboundedSender<Request>,
    replies: mpsc::Receiver<Result<Reply>>,
    /// Request whose reply has not been received yet.
    outstanding: Option<Request>,
    /// Dropping this fails the decoder's reads, which frees the thread even
    /// when the source never produces another byte.
    _close: oneshot::Sender<()>,
}

impl Link {
    fn spawn<R>(inner: R, chunk_size: usize, progress: ReadProgress) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (source, close) = closable(inner, progress);
        let (requests, mut request_rx) = mpsc::unbounded_channel();
        let (reply_tx, replies) = mpsc::channel(1);
        let bridge = SyncIoBridge::new(source);
        tokio::task::spawn_blocking(move || {
            let decoder = Decoder::new(ArchiveStreamReader::with_chunk_size(bridge, chunk_size));
            serve(decoder, &mut request_rx, &reply_tx, chunk_size);
        });
        trace!(chunk_size, "archive decoder started");
        Self {
            requests,
            replies,
            outstanding: None,
            _close: close,
        }
    }

    async fn receive(&mut self) -> Result<Reply> {
        let reply = self.replies.recv().await.ok_or(Error::DecoderStopped)?;
        self.outstanding = None;
        reply
    }

    async fn ask(&mut self, request: Request) -> Result<Reply> {
        // A dropped call left its reply behind. It answers a repeat of the
        // same request; anything else discards it.
        if let Some(previous) = self.outstanding {
            let stale = self.receive().await?;
            if previous == request {
                return Ok(stale);
            }
        }
        self.requests
            .send(request)
            .map_err(|_| Error::DecoderStopped)?;
        self.outstanding = Some(request);
        self.receive().await
    }
}

enum State<R> {
    Idle(R),
    Running(Link),
    Stopped,
}

/// Streaming ZIP decoder over any async byte source.
///
/// Decoding runs on a blocking thread started by the first `next_entry`, so
/// the stream must be polled inside a tokio runtime. Payloads come in pieces
/// of at most the chunk size. Each payload is checked against its CRC-32 and
/// declared size when its end is read. Dropping the stream stops the thread.
pub struct ZipStream<R> {
    state: State<R>,
    chunk_size: usize,
    progress: ReadProgress,
}

impl<R: AsyncRead + Unpin + Send + 'static> ZipStream<R> {
    pub fn new(inner: R) -> Self {
        Self::with_chunk_size(inner, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(inner: R, chunk_size: usize) -> Self {
        Self {
            state: State::Idle(inner),
            chunk_size: chunk_size.max(1),
            progress: ReadProgress::default(),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn link(&mut self) -> Result<&mut Link> {
        if matches!(self.state, State::Idle(_)) {
            if let State::Idle(inner) = std::mem::replace(&mut self.state, State::Stopped) {
                let link = Link::spawn(inner, self.chunk_size, self.progress.clone());
                self.state = State::Running(link);
            }
        }
        match &mut self.state {
            State::Running(link) => Ok(link),
            _ => Err(Error::DecoderStopped),
        }
    }

    async fn ask(&mut self, request: Request) -> Result<Reply> {
        let reply = self.link()?.ask(request).await;
        if reply.is_err() {
            self.state = State::Stopped;
        }
        reply
    }
}

impl<R: AsyncRead + Unpin + Send + 'static> EntrySource for ZipStream<R> {
    async fn next_entry(&mut self) -> Result<Option<ArchiveEntry>> {
        match self.ask(Request::NextEntry).await? {
            Reply::Entry(entry) => Ok(entry),
            Reply::Chunk(_) => Err(Error::DecoderStopped),
        }
    }

    async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if matches!(self.state, State::Idle(_)) {
            return Ok(None);
        }
        match self.ask(Request::NextChunk).await? {
            Reply::Chunk(chunk) => Ok(chunk),
            Reply::Entry(_) => Err(Error::DecoderStopped),
        }
    }

    fn progress(&self) -> Option<ReadProgress> {
        Some(self.progress.clone())
    }
}
