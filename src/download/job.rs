//! Download job model: identity, per-page state machine, options, events,
//! and the handle a host process drives a running job with.

use std::fmt;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::assembly::{AssemblyReport, Gap, OutputFormat};
use crate::manifest::CanonicalManifest;

use super::{OrchestratorError, PageFailure};

/// Deterministic job identity: the same source and ordered page targets
/// always map to the same id, so a re-submitted manifest resumes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Derives the id of `manifest`.
    #[must_use]
    pub fn for_manifest(manifest: &CanonicalManifest) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(manifest.source_id().as_bytes());
        for page in manifest.pages() {
            hasher.update([0u8]);
            hasher.update(page.target.locator().as_bytes());
        }
        let digest = hasher.finalize();
        Self(digest[..16].iter().map(|b| format!("{b:02x}")).collect())
    }

    /// Wraps an id read from storage or the command line.
    #[must_use]
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_ascii_lowercase())
    }

    /// The id as a hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of one page inside a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageState {
    /// Not yet started.
    Pending,
    /// A request is in flight.
    InFlight {
        /// Attempt number, 1-based.
        attempt: u32,
    },
    /// Waiting out a backoff delay before the next attempt.
    Retrying {
        /// Attempt that just failed.
        attempt: u32,
    },
    /// Bytes are stored.
    Completed,
    /// No further attempts will be made.
    PermanentlyFailed(PageFailure),
    /// The job was cancelled before the page completed.
    Cancelled,
}

impl PageState {
    /// Whether the page needs fetching on the next run.
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        !matches!(self, Self::Completed)
    }
}

/// Terminal (or current) status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Pages are still being fetched.
    Running,
    /// Every page completed.
    Completed,
    /// At least one page permanently failed; the artifact has gaps.
    Failed,
    /// Cancelled before completion; stored pages are kept for resume.
    Cancelled,
}

impl JobStatus {
    /// Stable storage label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parses a storage label.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Per-job settings supplied at submit time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    /// Requested page concurrency; `None` uses the engine default. The
    /// source's own cap still applies.
    pub concurrency: Option<usize>,
    /// Output document path.
    pub output: PathBuf,
    /// Output document format.
    pub format: OutputFormat,
    /// 1-based inclusive page selection.
    pub page_range: Option<RangeInclusive<usize>>,
    /// Invert page colors (negative microfilm scans).
    pub invert: bool,
}

impl JobOptions {
    /// PDF output at `output`, every page, default concurrency.
    #[must_use]
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            concurrency: None,
            output: output.into(),
            format: OutputFormat::Pdf,
            page_range: None,
            invert: false,
        }
    }

    /// Sets the requested concurrency.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Sets the output format.
    #[must_use]
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Restricts the job to a 1-based inclusive page range.
    #[must_use]
    pub fn with_page_range(mut self, range: RangeInclusive<usize>) -> Self {
        self.page_range = Some(range);
        self
    }

    /// Enables color inversion.
    #[must_use]
    pub fn with_invert(mut self, invert: bool) -> Self {
        self.invert = invert;
        self
    }
}

/// Progress notifications emitted while a job runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// A page's bytes were stored.
    PageCompleted {
        /// Page index.
        index: usize,
    },
    /// A page failed and will be retried after a backoff.
    PageRetrying {
        /// Page index.
        index: usize,
        /// Attempt that is about to start.
        attempt: u32,
    },
    /// A page permanently failed.
    PageFailed {
        /// Page index.
        index: usize,
        /// Classified reason.
        reason: PageFailure,
    },
    /// Aggregate progress after any page settles.
    JobProgress {
        /// Pages completed so far, including pages stored by earlier runs.
        completed: usize,
        /// Pages in the job.
        total: usize,
    },
    /// The job reached a terminal status. Always the last event.
    JobCompleted {
        /// Terminal status.
        status: JobStatus,
    },
}

/// Outcome of a finished job.
#[derive(Debug, Clone)]
pub struct JobReport {
    /// Job identity.
    pub job_id: JobId,
    /// Terminal status.
    pub status: JobStatus,
    /// Pages in the job.
    pub total_pages: usize,
    /// Pages with stored bytes.
    pub completed_pages: usize,
    /// Pages fetched by this run (excludes pages stored by earlier runs).
    pub fetched_this_run: usize,
    /// Permanently failed pages, ascending by index.
    pub failures: Vec<Gap>,
    /// Output document; `None` when the job was cancelled.
    pub output: Option<PathBuf>,
    /// Gap manifest written next to the output when any page failed.
    pub gaps_sidecar: Option<PathBuf>,
    /// Assembly statistics, when a document was written.
    pub assembly: Option<AssemblyReport>,
}

impl JobReport {
    /// Whether any page is missing from the output.
    #[must_use]
    pub fn has_gaps(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Per-job page bookkeeping. Each fetch task is the only writer of its own
/// index; transitions happen under the orchestrator's lock.
#[derive(Debug)]
pub(crate) struct DownloadJob {
    manifest: Arc<CanonicalManifest>,
    states: Vec<PageState>,
    attempts: Vec<u32>,
    concurrency_limit: usize,
    cancelled: bool,
}

impl DownloadJob {
    pub(crate) fn new(
        manifest: Arc<CanonicalManifest>,
        concurrency_limit: usize,
        already_completed: impl IntoIterator<Item = usize>,
    ) -> Self {
        let total = manifest.page_count();
        let mut states = vec![PageState::Pending; total];
        for index in already_completed {
            if let Some(state) = states.get_mut(index) {
                *state = PageState::Completed;
            }
        }
        Self {
            manifest,
            states,
            attempts: vec![0; total],
            concurrency_limit,
            cancelled: false,
        }
    }

    pub(crate) fn manifest(&self) -> &Arc<CanonicalManifest> {
        &self.manifest
    }

    pub(crate) fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    pub(crate) fn total(&self) -> usize {
        self.states.len()
    }

    pub(crate) fn pending(&self) -> Vec<usize> {
        self.indices(|state| matches!(state, PageState::Pending))
    }

    pub(crate) fn completed_count(&self) -> usize {
        self.indices(|state| matches!(state, PageState::Completed)).len()
    }

    pub(crate) fn state(&self, index: usize) -> Option<&PageState> {
        self.states.get(index)
    }

    pub(crate) fn attempts(&self, index: usize) -> u32 {
        self.attempts.get(index).copied().unwrap_or(0)
    }

    pub(crate) fn failures(&self) -> Vec<(usize, PageFailure)> {
        self.states
            .iter()
            .enumerate()
            .filter_map(|(index, state)| match state {
                PageState::PermanentlyFailed(reason) => Some((index, reason.clone())),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Starts an attempt. Returns false when the page must not be fetched
    /// (already completed, or the job is cancelled).
    pub(crate) fn begin_attempt(&mut self, index: usize, attempt: u32) -> bool {
        if self.cancelled {
            return false;
        }
        match self.states.get(index) {
            Some(PageState::Pending | PageState::Retrying { .. }) => {
                self.states[index] = PageState::InFlight { attempt };
                self.attempts[index] = attempt;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn mark_retrying(&mut self, index: usize, attempt: u32) {
        if let Some(state @ PageState::InFlight { .. }) = self.states.get_mut(index) {
            *state = PageState::Retrying { attempt };
        }
    }

    pub(crate) fn mark_completed(&mut self, index: usize) {
        if let Some(state) = self.states.get_mut(index) {
            *state = PageState::Completed;
        }
    }

    pub(crate) fn mark_failed(&mut self, index: usize, reason: PageFailure) {
        if let Some(state) = self.states.get_mut(index)
            && *state != PageState::Completed
        {
            *state = PageState::PermanentlyFailed(reason);
        }
    }

    /// Marks a page failed even when its bytes were stored, for pages the
    /// assembler could not use. Returns whether the page had counted as
    /// completed.
    pub(crate) fn reject_page(&mut self, index: usize, reason: PageFailure) -> bool {
        match self.states.get_mut(index) {
            Some(state @ PageState::Completed) => {
                *state = PageState::PermanentlyFailed(reason);
                true
            }
            Some(state) if !matches!(state, PageState::PermanentlyFailed(_)) => {
                *state = PageState::PermanentlyFailed(reason);
                false
            }
            _ => false,
        }
    }

    /// Moves every unfinished page to `Cancelled`.
    pub(crate) fn cancel(&mut self) {
        self.cancelled = true;
        for state in &mut self.states {
            if matches!(
                state,
                PageState::Pending | PageState::InFlight { .. } | PageState::Retrying { .. }
            ) {
                *state = PageState::Cancelled;
            }
        }
    }

    /// Terminal status given the current page states.
    pub(crate) fn terminal_status(&self) -> JobStatus {
        if self.cancelled {
            return JobStatus::Cancelled;
        }
        if self.states.iter().all(|s| *s == PageState::Completed) {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        }
    }

    fn indices(&self, predicate: impl Fn(&PageState) -> bool) -> Vec<usize> {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, state)| predicate(state))
            .map(|(index, _)| index)
            .collect()
    }
}

/// Events buffered per job before per-page notifications start being
/// dropped for a host that is not reading.
pub const EVENT_BUFFER: usize = 256;

/// Handle to a running job.
///
/// Events sit in a channel of [`EVENT_BUFFER`] slots. While it is full, page
/// and progress notifications are dropped; [`JobEvent::JobCompleted`] waits
/// for room, so a host must keep reading [`next_event`](Self::next_event)
/// or call [`wait`](Self::wait).
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    events: mpsc::Receiver<JobEvent>,
    cancel: CancellationToken,
    task: JoinHandle<Result<JobReport, OrchestratorError>>,
}

impl JobHandle {
    pub(crate) fn new(
        id: JobId,
        events: mpsc::Receiver<JobEvent>,
        cancel: CancellationToken,
        task: JoinHandle<Result<JobReport, OrchestratorError>>,
    ) -> Self {
        Self {
            id,
            events,
            cancel,
            task,
        }
    }

    /// Job identity, usable with `resume_job` after a restart.
    #[must_use]
    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// Next progress event; `None` once the job has finished and every
    /// event was consumed.
    pub async fn next_event(&mut self) -> Option<JobEvent> {
        self.events.recv().await
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this job; hosts can wire it to Ctrl-C.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the job to finish. Remaining events are dropped.
    ///
    /// # Errors
    ///
    /// Job-level failures: persistence, output stream, or a dead task.
    pub async fn wait(self) -> Result<JobReport, OrchestratorError> {
        let Self { id, events, task, .. } = self;
        drop(events);
        task.await.map_err(|e| OrchestratorError::Aborted {
            job_id: id.to_string(),
            reason: e.to_string(),
        })?
    }
}

/// Path of the gap sidecar written next to `output`.
#[must_use]
pub fn gaps_sidecar_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".gaps.json");
    PathBuf::from(name)
}
