use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Instant, Sleep, sleep};

/// A write made no progress for a whole silence window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("no progress for {window:?} after {chunks} chunks ({bytes} bytes)")]
pub struct Stall {
    pub window: Duration,
    pub chunks: u64,
    pub bytes: u64,
}

/// Per-entry silence timer.
///
/// The deadline moves forward every time a chunk arrives. Any future awaited
/// through [`watch`](Self::watch), whether it waits for the next chunk or for
/// storage, is abandoned once the deadline passes.
#[derive(Debug)]
pub struct StallWatchdog {
    window: Duration,
    deadline: Pin<Box<Sleep>>,
    chunks: u64,
    bytes: u64,
}

impl StallWatchdog {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: Box::pin(sleep(window)),
            chunks: 0,
            bytes: 0,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn chunks(&self) -> u64 {
        self.chunks
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn reset(&mut self) {
        self.deadline.as_mut().reset(Instant::now() + self.window);
    }

    pub fn record_chunk(&mut self, len: usize) {
        self.chunks += 1;
        self.bytes += len as u64;
        self.reset();
    }

    /// Await `fut` unless the deadline passes first. A future that is ready
    /// wins over an expired deadline.
    pub async fn watch<F: Future>(&mut self, fut: F) -> Result<F::Output, Stall> {
        let stall = Stall {
            window: self.window,
            chunks: self.chunks,
            bytes: self.bytes,
        };
        tokio::select! {
            biased;
            out = fut => Ok(out),
            () = &mut self.deadline => Err(stall),
        }
    }
}
