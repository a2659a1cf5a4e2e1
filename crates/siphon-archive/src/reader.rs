use std::future::Future;
use std::io::{self, BufRead, Read};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::oneshot;

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Pulls archive bytes from a blocking reader in fixed-size reads.
///
/// Only bytes not yet consumed by the decoder are kept, so a multi-gigabyte
/// archive is read with a working set of a few chunks. [`peek`](Self::peek)
/// lets the decoder look at a header before deciding who parses it.
pub struct ArchiveStreamReader<R> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
    chunk_size: usize,
    offset: u64,
}

impl<R: Read> ArchiveStreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_chunk_size(inner, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(inner: R, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            inner,
            buf: Vec::with_capacity(chunk_size),
            pos: 0,
            chunk_size,
            offset: 0,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Archive offset of the next unconsumed byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Issue one read of up to `chunk_size` bytes. Returns `0` at end of input.
    fn fill_more(&mut self) -> io::Result<usize> {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        let start = self.buf.len();
        self.buf.resize(start + self.chunk_size, 0);
        let read = loop {
            match self.inner.read(&mut self.buf[start..]) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };
        let n = match read {
            Ok(n) => n,
            Err(e) => {
                self.buf.truncate(start);
                return Err(e);
            }
        };
        self.buf.truncate(start + n);
        Ok(n)
    }

    /// Buffered bytes, reading until at least `n` are available or the input
    /// ends. The slice may be longer than `n`.
    pub fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.buf.len() - self.pos < n {
            if self.fill_more()? == 0 {
                break;
            }
        }
        Ok(&self.buf[self.pos..])
    }

    pub fn is_eof(&mut self) -> io::Result<bool> {
        Ok(self.peek(1)?.is_empty())
    }
}

impl<R: Read> BufRead for ArchiveStreamReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.pos == self.buf.len() {
            self.fill_more()?;
        }
        Ok(&self.buf[self.pos..])
    }

    fn consume(&mut self, amt: usize) {
        let amt = amt.min(self.buf.len() - self.pos);
        self.pos += amt;
        self.offset += amt as u64;
    }
}

impl<R: Read> Read for ArchiveStreamReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

/// Bytes pulled from an archive source so far. Clones share the count.
#[derive(Clone, Debug, Default)]
pub struct ReadProgress(Arc<AtomicU64>);

impl ReadProgress {
    pub fn bytes(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn add(&self, n: usize) {
        self.0.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Async source that fails every pending and future read once the paired
/// sender is dropped. Releases a decoder blocked on a silent source.
pub(crate) struct Closable<R> {
    inner: R,
    open: oneshot::Receiver<()>,
    progress: ReadProgress,
}

pub(crate) fn closable<R>(inner: R, progress: ReadProgress) -> (Closable<R>, oneshot::Sender<()>) {
    let (tx, open) = oneshot::channel();
    (
        Closable {
            inner,
            open,
            progress,
        },
        tx,
    )
}

impl<R: AsyncRead + Unpin> AsyncRead for Closable<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if Pin::new(&mut self.open).poll(cx).is_ready() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "archive stream closed",
            )));
        }
        let before = buf.filled().len();
        let polled = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = polled {
            self.progress.add(buf.filled().len() - before);
        }
        polled
    }
}
