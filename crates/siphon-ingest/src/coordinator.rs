use std::collections::HashSet;
use std::fmt;
use std::pin::pin;
use std::sync::Arc;

use serde::Serialize;
use siphon_archive::{ArchiveEntry, Chunk, EntrySource, ReadProgress, ZipStream, flatten_entry_name};
use siphon_store::{DirHandle, StorageResolver};
use tokio::io::AsyncRead;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::IngestConfig;
use crate::error::{Error, IngestFailure, Result};
use crate::manifest::{ManifestFilter, ManifestSource};
use crate::summary::{EntryFailure, IngestionSummary};
use crate::task::{EntryWriteQueue, TaskReport};
use crate::watchdog::{Stall, StallWatchdog};

/// Phases of an ingestion run.
///
/// Idle → Initializing → Streaming → Draining → Verifying → Done, with any
/// phase able to end in Failed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum IngestPhase {
    #[default]
    Idle,
    /// Resolving directories and loading the manifest.
    Initializing,
    /// Reading the archive and feeding write tasks.
    Streaming,
    /// Archive exhausted; waiting for every write task to settle.
    Draining,
    /// Cross-checking the working directory against the written entries.
    Verifying,
    Done,
    Failed,
}

impl fmt::Display for IngestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestPhase::Idle => write!(f, "idle"),
            IngestPhase::Initializing => write!(f, "initializing"),
            IngestPhase::Streaming => write!(f, "streaming"),
            IngestPhase::Draining => write!(f, "draining"),
            IngestPhase::Verifying => write!(f, "verifying"),
            IngestPhase::Done => write!(f, "done"),
            IngestPhase::Failed => write!(f, "failed"),
        }
    }
}

type PhaseCallback = Arc<dyn Fn(IngestPhase) + Send + Sync>;

/// Everything that lives for exactly one ingestion call.
struct IngestSession<D: DirHandle> {
    resolver: StorageResolver<D>,
    filter: ManifestFilter,
    /// Targets of entries whose write task reached `Done`.
    written: Vec<String>,
}

impl<D: DirHandle> IngestSession<D> {
    fn settle(&mut self, summary: &mut IngestionSummary, report: TaskReport) {
        match report.failure {
            None => {
                summary.record_written(report.bytes_written);
                self.written.push(report.target);
            }
            Some(failure) => summary.record_failure(report.entry, failure),
        }
    }
}

/// Drives one archive into the store.
///
/// Runs are not synchronized with each other: callers must not ingest into
/// the same store concurrently.
pub struct IngestCoordinator<D: DirHandle, M: ManifestSource> {
    root: D,
    manifests: M,
    config: IngestConfig,
    phase: IngestPhase,
    on_phase: Option<PhaseCallback>,
}

impl<D: DirHandle, M: ManifestSource> IngestCoordinator<D, M> {
    pub fn new(root: D, manifests: M, config: IngestConfig) -> Self {
        Self {
            root,
            manifests,
            config,
            phase: IngestPhase::Idle,
            on_phase: None,
        }
    }

    /// Invoke `callback` on every phase transition.
    #[must_use]
    pub fn on_phase(mut self, callback: impl Fn(IngestPhase) + Send + Sync + 'static) -> Self {
        self.on_phase = Some(Arc::new(callback));
        self
    }

    pub fn phase(&self) -> IngestPhase {
        self.phase
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    fn enter(&mut self, phase: IngestPhase) {
        info!(from = %self.phase, to = %phase, "phase");
        self.phase = phase;
        if let Some(callback) = &self.on_phase {
            callback(phase);
        }
    }

    fn fail(&mut self, error: Error, partial: IngestionSummary) -> IngestFailure {
        let phase = self.phase;
        self.enter(IngestPhase::Failed);
        IngestFailure {
            error,
            phase,
            partial,
        }
    }

    /// Ingest a ZIP archive read from `reader`. Decoding runs on a blocking
    /// thread, hence the `'static` bound.
    pub async fn ingest_archive<R>(
        &mut self,
        platform: &str,
        reader: R,
    ) -> std::result::Result<IngestionSummary, IngestFailure>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let source = ZipStream::with_chunk_size(reader, self.config.chunk_size);
        self.ingest(platform, source).await
    }

    /// Ingest every accepted entry of `source` into the working directory.
    ///
    /// Per-entry problems are recorded in the returned summary. Only
    /// batch-fatal conditions produce an [`IngestFailure`], which still
    /// carries the counts accumulated so far.
    #[instrument(skip_all, fields(platform = %platform))]
    pub async fn ingest<S: EntrySource>(
        &mut self,
        platform: &str,
        mut source: S,
    ) -> std::result::Result<IngestionSummary, IngestFailure> {
        let mut summary = IngestionSummary::new(platform);

        self.enter(IngestPhase::Initializing);
        let mut session = match self.initialize(platform, &mut summary).await {
            Ok(session) => session,
            Err(e) => return Err(self.fail(e, summary)),
        };

        self.enter(IngestPhase::Streaming);
        let mut queue = EntryWriteQueue::new(
            session.resolver.working_directory().clone(),
            self.config.stall_window(),
        );
        let watchdog = StallWatchdog::new(self.config.stall_window());
        let streamed = stream_entries(&mut source, watchdog, &mut session, &mut queue, &mut summary)
            .await;
        drop(source);

        match streamed {
            Ok(Streamed::Exhausted) => {}
            Ok(Streamed::Stalled(stall)) => {
                warn!(scanned = summary.scanned, %stall, "archive stream went silent");
                summary.warnings.push(format!(
                    "archive stream stalled after {} entries ({stall}); the rest was not read",
                    summary.scanned
                ));
            }
            Err(e) => {
                // Dropped senders end every in-flight task, which then removes
                // its partial file.
                for report in queue.drain().await {
                    session.settle(&mut summary, report);
                }
                return Err(self.fail(e, summary));
            }
        }

        self.enter(IngestPhase::Draining);
        debug!(in_flight = queue.in_flight(), "waiting for write tasks");
        for report in queue.drain().await {
            session.settle(&mut summary, report);
        }

        self.enter(IngestPhase::Verifying);
        if let Err(e) = verify(&mut session, &mut summary).await {
            return Err(self.fail(e, summary));
        }

        self.enter(IngestPhase::Done);
        summary.log();
        Ok(summary)
    }

    async fn initialize(
        &self,
        platform: &str,
        summary: &mut IngestionSummary,
    ) -> Result<IngestSession<D>> {
        self.config.validate()?;
        let resolver = StorageResolver::open(
            self.root.clone(),
            &self.config.working_dir,
            &self.config.protected_paths,
        )
        .await?;
        if self.config.clear_before_ingest {
            let removed = resolver.clear_working_directory().await?;
            debug!(removed, "cleared working directory");
        }

        let (filter, warning) =
            ManifestFilter::load(&self.manifests, platform, self.config.manifest_policy).await?;
        summary.warnings.extend(warning);

        Ok(IngestSession {
            resolver,
            filter,
            written: Vec::new(),
        })
    }

    /// Empty the working directory through the protected-location guard.
    /// Returns the number of removed entries.
    #[instrument(skip_all)]
    pub async fn clear_working_directory(&self) -> Result<usize> {
        self.config.validate()?;
        let resolver = StorageResolver::open(
            self.root.clone(),
            &self.config.working_dir,
            &self.config.protected_paths,
        )
        .await?;
        let removed = resolver.clear_working_directory().await?;
        info!(removed, "working directory cleared");
        Ok(removed)
    }
}

/// How the archive stopped yielding entries.
enum Streamed {
    Exhausted,
    /// The source went silent between entries. Entry-level stalls are
    /// handled by the write tasks.
    Stalled(Stall),
}

async fn stream_entries<S, D>(
    source: &mut S,
    mut watchdog: StallWatchdog,
    session: &mut IngestSession<D>,
    queue: &mut EntryWriteQueue<D>,
    summary: &mut IngestionSummary,
) -> Result<Streamed>
where
    S: EntrySource,
    D: DirHandle,
{
    let progress = source.progress();
    loop {
        let entry = match next_entry(source, &mut watchdog, progress.as_ref()).await {
            Ok(entry) => entry?,
            Err(stall) => return Ok(Streamed::Stalled(stall)),
        };
        let Some(entry) = entry else {
            break;
        };
        summary.scanned += 1;
        for report in queue.reap() {
            session.settle(summary, report);
        }

        let Some(tx) = admit(&entry, session, queue, summary) else {
            continue;
        };
        forward_chunks(source, &entry.name, tx).await?;
    }
    debug!(scanned = summary.scanned, accepted = summary.accepted, "archive exhausted");
    Ok(Streamed::Exhausted)
}

/// Advance the source under the silence window. Reading or skipping a long
/// payload counts as progress as long as the source reports bytes arriving.
async fn next_entry<S: EntrySource>(
    source: &mut S,
    watchdog: &mut StallWatchdog,
    progress: Option<&ReadProgress>,
) -> std::result::Result<siphon_archive::Result<Option<ArchiveEntry>>, Stall> {
    watchdog.reset();
    let mut seen = progress.map(ReadProgress::bytes);
    let mut next = pin!(source.next_entry());
    loop {
        match watchdog.watch(next.as_mut()).await {
            Ok(entry) => return Ok(entry),
            Err(stall) => {
                let now = progress.map(ReadProgress::bytes);
                if now == seen {
                    return Err(stall);
                }
                trace!(bytes = now, "source still reading");
                seen = now;
                watchdog.reset();
            }
        }
    }
}

/// Decide whether `entry` gets a write task, and start it if so.
fn admit<D: DirHandle>(
    entry: &ArchiveEntry,
    session: &IngestSession<D>,
    queue: &mut EntryWriteQueue<D>,
    summary: &mut IngestionSummary,
) -> Option<UnboundedSender<Chunk>> {
    if entry.is_directory {
        trace!(entry = %entry.name, "directory");
        return None;
    }
    if !session.filter.is_whitelisted(&entry.name) {
        trace!(entry = %entry.name, "not in manifest");
        return None;
    }
    summary.accepted += 1;

    let target = match flatten_entry_name(&entry.name) {
        Ok(target) => target,
        Err(e) => {
            let message = e.to_string();
            summary.record_failure(&entry.name, EntryFailure::InvalidName { message });
            return None;
        }
    };
    match queue.spawn(&entry.name, target) {
        Ok(tx) => Some(tx),
        Err(failure) => {
            summary.record_failure(&entry.name, failure);
            None
        }
    }
}

/// Hand the entry's chunks to its write task, one at a time. Stops early,
/// without error, if the task has given up.
async fn forward_chunks<S: EntrySource>(
    source: &mut S,
    entry: &str,
    tx: UnboundedSender<Chunk>,
) -> Result<()> {
    loop {
        let next = tokio::select! {
            biased;
            () = tx.closed() => {
                debug!(entry, "write task gave up; skipping rest of entry");
                return Ok(());
            }
            next = source.next_chunk() => next?,
        };
        let Some(chunk) = next else {
            return Ok(());
        };
        let is_final = chunk.is_final;
        if tx.send(chunk).is_err() || is_final {
            return Ok(());
        }
        tokio::task::yield_now().await;
    }
}

/// Every entry reported as written must be listed in the working directory.
async fn verify<D: DirHandle>(
    session: &mut IngestSession<D>,
    summary: &mut IngestionSummary,
) -> Result<()> {
    let listed: HashSet<String> = session
        .resolver
        .working_directory()
        .entries()
        .await?
        .into_iter()
        .collect();
    let missing: Vec<String> = session
        .written
        .iter()
        .filter(|target| !listed.contains(*target))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(Error::StorageInconsistent { missing });
    }

    let mut verified = std::mem::take(&mut session.written);
    verified.sort();
    debug!(files = verified.len(), "working directory verified");
    summary.verified_files = verified;
    Ok(())
}
