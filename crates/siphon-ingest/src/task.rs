//! One write pipeline per accepted entry.
//!
//! Chunks reach a task through an unbounded channel and are written strictly
//! in arrival order: chunk n+1 is not taken off the channel before chunk n's
//! write has completed. Memory held by a pipeline is therefore bounded only
//! by how many chunks the producer has emitted but storage has not yet
//! absorbed. There is no credit scheme; the coordinator yields after every
//! chunk so writers get to run, which keeps that backlog small in practice.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::Serialize;
use siphon_archive::Chunk;
use siphon_store::{DirHandle, FileHandle, Writable};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::summary::EntryFailure;
use crate::watchdog::{Stall, StallWatchdog};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TaskState {
    Pending,
    Writing,
    Verifying,
    Done,
    Failed,
    TimedOut,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed | TaskState::TimedOut)
    }
}

/// Terminal outcome of a [`WriteTask`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskReport {
    /// Archive path of the entry.
    pub entry: String,
    /// Flattened file name in the working directory.
    pub target: String,
    pub state: TaskState,
    pub bytes_written: u64,
    pub chunks: u64,
    pub failure: Option<EntryFailure>,
}

pub struct WriteTask<D: DirHandle> {
    entry: String,
    target: String,
    dir: D,
    chunks: UnboundedReceiver<Chunk>,
    window: Duration,
    state: TaskState,
    bytes_written: u64,
    received: u64,
    opened: bool,
}

impl<D: DirHandle> WriteTask<D> {
    pub fn new(
        entry: String,
        target: String,
        dir: D,
        window: Duration,
    ) -> (Self, UnboundedSender<Chunk>) {
        let (tx, rx) = unbounded_channel();
        let task = Self {
            entry,
            target,
            dir,
            chunks: rx,
            window,
            state: TaskState::Pending,
            bytes_written: 0,
            received: 0,
            opened: false,
        };
        (task, tx)
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Drive the task to a terminal state. Never panics on storage errors;
    /// every failure ends up in the report.
    pub async fn run(mut self) -> TaskReport {
        // The silence window starts when the task first runs, not when it
        // was queued.
        let mut watchdog = StallWatchdog::new(self.window);
        let failure = match self.write_all(&mut watchdog).await {
            Ok(()) => {
                self.state = TaskState::Done;
                debug!(entry = %self.entry, file = %self.target, bytes = self.bytes_written, "entry written");
                None
            }
            Err(failure) => {
                self.chunks.close();
                self.state = match failure {
                    EntryFailure::Stalled { .. } => TaskState::TimedOut,
                    _ => TaskState::Failed,
                };
                self.discard_partial().await;
                Some(failure)
            }
        };
        TaskReport {
            entry: self.entry,
            target: self.target,
            state: self.state,
            bytes_written: self.bytes_written,
            chunks: self.received,
            failure,
        }
    }

    async fn write_all(&mut self, watchdog: &mut StallWatchdog) -> Result<(), EntryFailure> {
        self.state = TaskState::Writing;

        let file = match watchdog.watch(self.dir.get_file(&self.target, true)).await {
            Ok(file) => file.map_err(write_failed)?,
            Err(stall) => return Err(self.stalled(stall)),
        };
        self.opened = true;
        let mut writer = match watchdog.watch(file.create_writable()).await {
            Ok(writer) => writer.map_err(write_failed)?,
            Err(stall) => return Err(self.stalled(stall)),
        };

        loop {
            let chunk = match watchdog.watch(self.chunks.recv()).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => {
                    return Err(EntryFailure::Truncated {
                        bytes_written: self.bytes_written,
                    });
                }
                Err(stall) => return Err(self.stalled(stall)),
            };
            watchdog.record_chunk(chunk.len());
            self.received += 1;

            let is_final = chunk.is_final;
            let len = chunk.len() as u64;
            if len > 0 {
                match watchdog.watch(writer.write(chunk.bytes)).await {
                    Ok(result) => result.map_err(write_failed)?,
                    Err(stall) => return Err(self.stalled(stall)),
                }
                self.bytes_written += len;
                trace!(entry = %self.entry, bytes = self.bytes_written, "chunk written");
            }
            if is_final {
                break;
            }
        }

        match watchdog.watch(writer.close()).await {
            Ok(result) => result.map_err(write_failed)?,
            Err(stall) => return Err(self.stalled(stall)),
        }

        self.state = TaskState::Verifying;
        let dir = &self.dir;
        let target = &self.target;
        let stat = async {
            match dir.get_file(target, false).await {
                Ok(file) => file.size().await,
                Err(e) => Err(e),
            }
        };
        let actual = match watchdog.watch(stat).await {
            Ok(size) => size.map_err(write_failed)?,
            Err(stall) => return Err(self.stalled(stall)),
        };
        if actual != self.bytes_written {
            return Err(EntryFailure::VerificationFailed {
                expected: self.bytes_written,
                actual,
            });
        }
        Ok(())
    }

    fn stalled(&self, stall: Stall) -> EntryFailure {
        EntryFailure::Stalled {
            bytes_written: self.bytes_written,
            chunks: stall.chunks,
            silence_ms: u64::try_from(stall.window.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Remove whatever a failed task left behind so the working directory
    /// only lists verified files. Bounded by the silence window.
    async fn discard_partial(&self) {
        if !self.opened {
            return;
        }
        let removal = self.dir.remove_entry(&self.target);
        match tokio::time::timeout(self.window, removal).await {
            Ok(Ok(())) => debug!(file = %self.target, "removed partial file"),
            Ok(Err(e)) if e.is_not_found() => {}
            Ok(Err(e)) => warn!(file = %self.target, error = %e, "could not remove partial file"),
            Err(_) => warn!(file = %self.target, "timed out removing partial file"),
        }
    }
}

fn write_failed(e: siphon_store::Error) -> EntryFailure {
    EntryFailure::WriteFailed {
        message: e.to_string(),
    }
}

/// All write tasks of one ingestion run.
pub struct EntryWriteQueue<D: DirHandle> {
    dir: D,
    window: Duration,
    tasks: JoinSet<TaskReport>,
    /// Target to entry, for tasks that have not reported yet.
    pending: HashMap<String, String>,
    claimed: HashSet<String>,
}

impl<D: DirHandle> EntryWriteQueue<D> {
    pub fn new(dir: D, window: Duration) -> Self {
        Self {
            dir,
            window,
            tasks: JoinSet::new(),
            pending: HashMap::new(),
            claimed: HashSet::new(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Start a write task for `entry` into `target` and return the sender its
    /// chunks go through. Each target can be claimed once per run.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        &mut self,
        entry: &str,
        target: String,
    ) -> Result<UnboundedSender<Chunk>, EntryFailure> {
        if !self.claimed.insert(target.clone()) {
            return Err(EntryFailure::DuplicateTarget { target });
        }
        let (task, tx) = WriteTask::new(
            entry.to_string(),
            target.clone(),
            self.dir.clone(),
            self.window,
        );
        self.pending.insert(target, entry.to_string());
        self.tasks.spawn(task.run());
        Ok(tx)
    }

    /// Reports of tasks that already finished, without waiting.
    pub fn reap(&mut self) -> Vec<TaskReport> {
        let mut reports = Vec::new();
        while let Some(joined) = self.tasks.try_join_next() {
            if let Some(report) = self.settle(joined) {
                reports.push(report);
            }
        }
        reports
    }

    /// Wait for every outstanding task. A task that panicked or was aborted
    /// is reported as a failed write.
    pub async fn drain(&mut self) -> Vec<TaskReport> {
        let mut reports = Vec::new();
        while let Some(joined) = self.tasks.join_next().await {
            if let Some(report) = self.settle(joined) {
                reports.push(report);
            }
        }
        for (target, entry) in self.pending.drain() {
            reports.push(TaskReport {
                entry,
                target,
                state: TaskState::Failed,
                bytes_written: 0,
                chunks: 0,
                failure: Some(EntryFailure::WriteFailed {
                    message: "write task ended without reporting".into(),
                }),
            });
        }
        reports
    }

    fn settle(&mut self, joined: Result<TaskReport, tokio::task::JoinError>) -> Option<TaskReport> {
        match joined {
            Ok(report) => {
                self.pending.remove(&report.target);
                Some(report)
            }
            Err(e) => {
                warn!(error = %e, "write task did not complete");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use siphon_store::MemoryDir;

    fn chunk(bytes: &'static [u8], is_final: bool) -> Chunk {
        Chunk::new(Bytes::from_static(bytes), is_final)
    }

    #[tokio::test]
    async fn chunks_are_written_in_order_and_verified() {
        let dir = MemoryDir::new();
        let (task, tx) = WriteTask::new("a/b.json".into(), "a___b.json".into(), dir.clone(), Duration::from_secs(5));
        assert_eq!(task.state(), TaskState::Pending);

        tx.send(chunk(b"{\"a\":", false)).unwrap();
        tx.send(chunk(b"", false)).unwrap();
        tx.send(chunk(b"1}", true)).unwrap();
        let report = task.run().await;

        assert_eq!(report.state, TaskState::Done);
        assert!(report.state.is_terminal());
        assert_eq!(report.failure, None);
        assert_eq!(report.bytes_written, 7);
        assert_eq!(report.chunks, 3);
        let file = dir.get_file("a___b.json", false).await.unwrap();
        assert_eq!(file.contents(), b"{\"a\":1}");
    }

    #[tokio::test]
    async fn closed_channel_without_final_chunk_is_truncation() {
        let dir = MemoryDir::new();
        let (task, tx) = WriteTask::new("x".into(), "x".into(), dir.clone(), Duration::from_secs(5));
        tx.send(chunk(b"partial", false)).unwrap();
        drop(tx);

        let report = task.run().await;
        assert_eq!(report.state, TaskState::Failed);
        assert_eq!(
            report.failure,
            Some(EntryFailure::Truncated { bytes_written: 7 })
        );
        assert!(dir.entries().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_producer_times_out() {
        let dir = MemoryDir::new();
        let (task, tx) = WriteTask::new("slow".into(), "slow".into(), dir.clone(), Duration::from_secs(10));
        tx.send(chunk(b"first", false)).unwrap();

        let report = task.run().await;
        assert_eq!(report.state, TaskState::TimedOut);
        assert_eq!(
            report.failure,
            Some(EntryFailure::Stalled {
                bytes_written: 5,
                chunks: 1,
                silence_ms: 10_000
            })
        );
        assert!(tx.is_closed());
        assert!(dir.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_targets_are_refused() {
        let mut queue = EntryWriteQueue::new(MemoryDir::new(), Duration::from_secs(5));
        let tx = queue.spawn("a/b", "a___b".into()).unwrap();
        assert!(matches!(
            queue.spawn("a\\b", "a___b".into()),
            Err(EntryFailure::DuplicateTarget { .. })
        ));

        tx.send(chunk(b"ok", true)).unwrap();
        let reports = queue.drain().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].state, TaskState::Done);
        assert_eq!(queue.in_flight(), 0);
    }
}
