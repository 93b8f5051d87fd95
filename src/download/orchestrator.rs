//! Job orchestration: bounded page fetching, retry, cancellation, resume,
//! and ordered assembly.
//!
//! Each job runs on its own task. Page fetches are spawned into a `JoinSet`
//! bounded by a per-job semaphore; per-host permits are shared across every
//! job of the orchestrator. Fetched bytes go to the [`PageStore`] first and
//! the assembler reads them back in index order on a blocking thread, so a
//! job never holds more than the in-flight pages in memory.
//!
//! A failing output stream stops the job: the assembler trips the job's
//! stop token, no further pages are spawned, and the partial file is removed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::assembly::{
    AssemblyError, AssemblyReport, Assembler, Gap, OutputFormat, PagePayload, PageResult,
    TransformChain, open_file_sink,
};
use crate::config::{EngineConfig, MAX_CONCURRENCY};
use crate::db::Database;
use crate::manifest::{CanonicalManifest, PageDescriptor};
use crate::source::lookup;

use super::job::DownloadJob;
use super::{
    EVENT_BUFFER, FailureType, FetchError, HostLimiter, JobEvent, JobHandle, JobId, JobOptions, JobReport,
    JobStatus, JobStore, OrchestratorError, PageClient, PageFailure, PageStore, PersistedJob,
    RateLimiter, RetryDecision, RetryPolicy, classify_error, gaps_sidecar_path, parse_retry_after,
};

/// Runs download jobs. Cheap to clone; clones share limiters and state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: EngineConfig,
    jobs: JobStore,
    pages: PageStore,
    rate_limiter: RateLimiter,
    host_limiter: HostLimiter,
    retry: RetryPolicy,
    running: DashMap<JobId, CancellationToken>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("concurrency", &self.inner.config.concurrency)
            .field("work_dir", &self.inner.config.work_dir)
            .field("running", &self.inner.running.len())
            .finish_non_exhaustive()
    }
}

/// Contents of `<output>.gaps.json`.
#[derive(Debug, Serialize)]
struct GapsSidecar<'a> {
    job_id: &'a JobId,
    display_name: &'a str,
    source_id: &'a str,
    total_pages: usize,
    missing_pages: usize,
    gaps: &'a [Gap],
}

impl Orchestrator {
    /// Creates an orchestrator persisting job state in `db`.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidOptions`] for an invalid config.
    pub fn new(config: EngineConfig, db: Database) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let inner = Inner {
            jobs: JobStore::new(db),
            pages: PageStore::new(&config.work_dir),
            rate_limiter: RateLimiter::new(config.request_spacing),
            host_limiter: HostLimiter::new(config.per_host_limit),
            retry: RetryPolicy::from_config(&config),
            running: DashMap::new(),
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Starts downloading `manifest`.
    ///
    /// A manifest already known to the state database (same source and
    /// page targets) continues from its stored pages.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::InvalidOptions`] for a bad page range or concurrency
    /// - [`OrchestratorError::AlreadyRunning`] when the same job is live
    /// - [`OrchestratorError::Persistence`] when the job record cannot be written
    #[instrument(skip(self, manifest, options), fields(source_id = manifest.source_id(), pages = manifest.page_count()))]
    pub async fn submit_job(
        &self,
        manifest: CanonicalManifest,
        options: JobOptions,
    ) -> Result<JobHandle, OrchestratorError> {
        let manifest = match &options.page_range {
            Some(range) => manifest.select_range(range)?,
            None => manifest,
        };
        manifest.validate()?;
        let concurrency = self.effective_concurrency(&manifest, options.concurrency)?;

        let job_id = JobId::for_manifest(&manifest);
        if self.inner.running.contains_key(&job_id) {
            return Err(OrchestratorError::AlreadyRunning(job_id.to_string()));
        }
        self.inner
            .jobs
            .upsert_running(&job_id, &manifest, &options)
            .await?;
        info!(job_id = %job_id, concurrency, "job submitted");
        self.start(job_id, Arc::new(manifest), options, concurrency)
    }

    /// Resumes a persisted job. Only pages without stored bytes are fetched.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::UnknownJob`] when no record exists
    /// - [`OrchestratorError::AlreadyRunning`] when the job is live
    /// - [`OrchestratorError::CorruptSnapshot`] when the record is unreadable
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn resume_job(&self, job_id: &JobId) -> Result<JobHandle, OrchestratorError> {
        if self.inner.running.contains_key(job_id) {
            return Err(OrchestratorError::AlreadyRunning(job_id.to_string()));
        }
        let Some(persisted) = self.inner.jobs.load(job_id).await? else {
            return Err(OrchestratorError::UnknownJob(job_id.to_string()));
        };
        let concurrency =
            self.effective_concurrency(&persisted.manifest, persisted.options.concurrency)?;
        self.inner
            .jobs
            .set_status(job_id, JobStatus::Running)
            .await?;
        info!(previous_status = %persisted.status, "job resumed");
        self.start(
            persisted.job_id,
            Arc::new(persisted.manifest),
            persisted.options,
            concurrency,
        )
    }

    /// Requests cancellation of a running job. Returns whether the job was
    /// running; cancelling twice is harmless.
    pub fn cancel_job(&self, job_id: &JobId) -> bool {
        match self.inner.running.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether `job_id` is running in this orchestrator.
    #[must_use]
    pub fn is_running(&self, job_id: &JobId) -> bool {
        self.inner.running.contains_key(job_id)
    }

    /// Every persisted job, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Persistence`] on database failure.
    pub async fn jobs(&self) -> Result<Vec<PersistedJob>, OrchestratorError> {
        self.inner.jobs.list().await
    }

    /// One persisted job.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Persistence`] on database failure.
    pub async fn job(&self, job_id: &JobId) -> Result<Option<PersistedJob>, OrchestratorError> {
        self.inner.jobs.load(job_id).await
    }

    /// Deletes a job's record and stored page bytes. The output document is
    /// left alone. Returns whether a record existed.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::AlreadyRunning`] when the job is live
    /// - [`OrchestratorError::Persistence`] / [`OrchestratorError::Io`]
    pub async fn forget_job(&self, job_id: &JobId) -> Result<bool, OrchestratorError> {
        if self.inner.running.contains_key(job_id) {
            return Err(OrchestratorError::AlreadyRunning(job_id.to_string()));
        }
        self.inner
            .pages
            .remove_job(job_id)
            .await
            .map_err(|source| OrchestratorError::Io {
                path: self.inner.pages.job_dir(job_id),
                source,
            })?;
        self.inner.jobs.delete(job_id).await
    }

    fn effective_concurrency(
        &self,
        manifest: &CanonicalManifest,
        requested: Option<usize>,
    ) -> Result<usize, OrchestratorError> {
        let requested = requested.unwrap_or(self.inner.config.concurrency);
        if !(1..=MAX_CONCURRENCY).contains(&requested) {
            return Err(OrchestratorError::InvalidOptions(format!(
                "concurrency {requested} outside 1..={MAX_CONCURRENCY}"
            )));
        }
        let cap = lookup(manifest.source_id())
            .and_then(|descriptor| descriptor.capabilities().max_concurrency)
            .unwrap_or(MAX_CONCURRENCY);
        Ok(requested.min(cap).max(1))
    }

    fn start(
        &self,
        job_id: JobId,
        manifest: Arc<CanonicalManifest>,
        options: JobOptions,
        concurrency: usize,
    ) -> Result<JobHandle, OrchestratorError> {
        let cancel = CancellationToken::new();
        match self.inner.running.entry(job_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(OrchestratorError::AlreadyRunning(job_id.to_string()));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(cancel.clone());
            }
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let inner = Arc::clone(&self.inner);
        let task_id = job_id.clone();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let result = run_job(
                &inner,
                &task_id,
                manifest,
                &options,
                concurrency,
                &events_tx,
                task_cancel,
            )
            .await;
            inner.running.remove(&task_id);
            if let Err(error) = &result {
                warn!(job_id = %task_id, %error, "job failed");
                if let Err(e) = inner.jobs.set_status(&task_id, JobStatus::Failed).await {
                    warn!(job_id = %task_id, error = %e, "failed to record job failure");
                }
                let _ = events_tx
                    .send(JobEvent::JobCompleted {
                        status: JobStatus::Failed,
                    })
                    .await;
            }
            result
        });
        Ok(JobHandle::new(job_id, events_rx, cancel, task))
    }
}

/// Shared context of one job's page tasks.
struct PageTask {
    inner: Arc<Inner>,
    job_id: JobId,
    job: Mutex<DownloadJob>,
    client: PageClient,
    events: mpsc::Sender<JobEvent>,
    results: mpsc::UnboundedSender<PageResult>,
    /// Stops fetching: user cancellation or a dead assembler.
    cancel: CancellationToken,
    fetched: AtomicUsize,
}

impl PageTask {
    fn emit(&self, event: JobEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events.try_send(event) {
            debug!(?event, "event buffer full; dropping event");
        }
    }

    /// Hands a settled page to the assembler. A closed channel means the
    /// assembler already failed, so the job stops.
    fn deliver(&self, result: PageResult) {
        if self.results.send(result).is_err() && !self.cancel.is_cancelled() {
            warn!(job_id = %self.job_id, "assembler stopped; halting page fetches");
            self.cancel.cancel();
        }
    }

    async fn progress(&self) {
        let (completed, total) = {
            let job = self.job.lock().await;
            (job.completed_count(), job.total())
        };
        self.emit(JobEvent::JobProgress { completed, total });
    }

    /// One fetch attempt: resolve the target, take the host permit and rate
    /// slot, fetch, and store.
    async fn attempt(&self, index: usize, page: &PageDescriptor) -> Result<(PathBuf, u64), FetchError> {
        let url = self.client.resolve_target(&page.target, &self.cancel).await?;

        let _host_permit = tokio::select! {
            () = self.cancel.cancelled() => return Err(FetchError::cancelled(&url)),
            permit = self.inner.host_limiter.acquire(&url) => {
                permit.map_err(|_| FetchError::cancelled(&url))?
            }
        };
        tokio::select! {
            () = self.cancel.cancelled() => return Err(FetchError::cancelled(&url)),
            () = self.inner.rate_limiter.acquire(&url) => {}
        }

        let bytes = self.client.fetch_url(&url, &self.cancel).await?;
        let path = self
            .inner
            .pages
            .write_page(&self.job_id, index, &bytes)
            .await?;
        Ok((path, bytes.len() as u64))
    }

    /// Server-mandated delay for 429 and 503 responses, recorded with the
    /// rate limiter so other tasks on the host wait too.
    async fn retry_after_delay(&self, error: &FetchError) -> Option<Duration> {
        let FetchError::HttpStatus {
            url,
            status: 429 | 503,
            retry_after: Some(header),
        } = error
        else {
            return None;
        };
        let delay = parse_retry_after(header)?;
        self.inner.rate_limiter.record_rate_limit(url, delay).await;
        debug!(url, retry_after = %header, delay_ms = delay.as_millis(), "using Retry-After header delay");
        Some(delay)
    }

    async fn complete(&self, index: usize, attempt: u32, path: PathBuf, byte_len: u64) {
        if let Err(e) = self
            .inner
            .jobs
            .record_page(&self.job_id, index, &path, byte_len)
            .await
        {
            // The bytes are still assembled; a later resume refetches the page.
            warn!(page_index = index, error = %e, "failed to record completed page");
        }
        self.job.lock().await.mark_completed(index);
        self.fetched.fetch_add(1, Ordering::Relaxed);
        self.deliver(PageResult::completed(index, PagePayload::Stored(path), attempt));
        self.emit(JobEvent::PageCompleted { index });
        self.progress().await;
    }

    async fn fail(&self, index: usize, attempt: u32, reason: PageFailure) {
        self.job.lock().await.mark_failed(index, reason.clone());
        self.deliver(PageResult::failed(index, reason.clone(), attempt));
        self.emit(JobEvent::PageFailed { index, reason });
        self.progress().await;
    }
}

/// Fetches one page with retry. Returns when the page settles or the job is
/// cancelled.
#[instrument(skip(task, page), fields(job_id = %task.job_id, page_index = index))]
async fn fetch_page(task: Arc<PageTask>, index: usize, page: PageDescriptor) {
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if !task.job.lock().await.begin_attempt(index, attempt) {
            return;
        }
        debug!(attempt, "attempting page fetch");

        let error = match task.attempt(index, &page).await {
            Ok((path, byte_len)) => {
                task.complete(index, attempt, path, byte_len).await;
                return;
            }
            Err(FetchError::Cancelled { .. }) => {
                debug!("page fetch cancelled");
                return;
            }
            Err(error) => error,
        };

        let failure_type = classify_error(&error);
        let retry_after = task.retry_after_delay(&error).await;

        match task.inner.retry.should_retry(failure_type, attempt) {
            RetryDecision::Retry {
                delay: backoff_delay,
                attempt: next_attempt,
            } => {
                let delay = retry_after.unwrap_or(backoff_delay);
                info!(
                    attempt = next_attempt,
                    max_attempts = task.inner.retry.max_attempts(),
                    delay_ms = delay.as_millis(),
                    using_retry_after = retry_after.is_some(),
                    error = %error,
                    "retrying page"
                );
                task.job.lock().await.mark_retrying(index, next_attempt);
                task.emit(JobEvent::PageRetrying {
                    index,
                    attempt: next_attempt,
                });
                tokio::select! {
                    () = task.cancel.cancelled() => return,
                    () = tokio::time::sleep(delay) => {}
                }
            }
            RetryDecision::DoNotRetry { reason } => {
                warn!(attempt, error = %error, %reason, "page permanently failed");
                task.fail(index, attempt, page_failure(&error, failure_type, attempt))
                    .await;
                return;
            }
        }
    }
}

fn page_failure(error: &FetchError, failure_type: FailureType, attempts: u32) -> PageFailure {
    if let FetchError::NotAnImage { .. } = error {
        return PageFailure::InvalidImage {
            message: error.to_string(),
        };
    }
    match failure_type {
        FailureType::GeoBlocked => PageFailure::GeoBlocked {
            status: error.status().unwrap_or(403),
        },
        FailureType::Transient | FailureType::RateLimited => PageFailure::TransientNetwork {
            attempts,
            message: error.to_string(),
        },
        FailureType::Permanent => PageFailure::PermanentFetch {
            status: error.status(),
            message: error.to_string(),
        },
    }
}

fn part_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

async fn discard_part(part: &Path) {
    if let Err(e) = tokio::fs::remove_file(part).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %part.display(), error = %e, "failed to remove partial output");
    }
}

/// Drives one job from stored-page recovery to the finished document.
#[allow(clippy::too_many_lines)]
#[instrument(skip_all, fields(job_id = %job_id, source_id = manifest.source_id()))]
async fn run_job(
    inner: &Arc<Inner>,
    job_id: &JobId,
    manifest: Arc<CanonicalManifest>,
    options: &JobOptions,
    concurrency: usize,
    events: &mpsc::Sender<JobEvent>,
    cancel: CancellationToken,
) -> Result<JobReport, OrchestratorError> {
    let total = manifest.page_count();
    let client = match lookup(manifest.source_id()) {
        Some(descriptor) => PageClient::for_source(&descriptor, &inner.config),
        None => PageClient::generic(manifest.source_id(), &inner.config),
    }
    .map_err(|reason| OrchestratorError::HttpClient {
        source_id: manifest.source_id().to_string(),
        reason,
    })?;

    // Pages stored by earlier runs, minus any whose bytes went missing.
    let mut stored = inner.jobs.completed_pages(job_id).await?;
    let mut missing = Vec::new();
    for (index, page) in &stored {
        if *index >= total || !PageStore::verify(&page.path, page.byte_len).await {
            missing.push(*index);
        }
    }
    for index in missing {
        warn!(page_index = index, "stored page missing or truncated; refetching");
        inner.jobs.forget_page(job_id, index).await?;
        stored.remove(&index);
    }
    let recovered = stored.len();

    // Fetching halts on user cancellation or when the assembler dies.
    let stop = cancel.child_token();

    // Assembly runs on a blocking thread fed in completion order.
    let output = options.output.clone();
    let part = part_path(&output);
    let (results_tx, mut results_rx) = mpsc::unbounded_channel::<PageResult>();
    let assembler_task = {
        let manifest = Arc::clone(&manifest);
        let part = part.clone();
        let stop = stop.clone();
        let format: OutputFormat = options.format;
        let chain = TransformChain::for_job(format, options.invert);
        tokio::task::spawn_blocking(move || -> Result<Assembler, AssemblyError> {
            let assembled = open_file_sink(format, &part, manifest.display_name()).and_then(|sink| {
                let mut assembler = Assembler::new(manifest, sink, chain);
                while let Some(result) = results_rx.blocking_recv() {
                    assembler.push(result)?;
                }
                Ok(assembler)
            });
            if let Err(error) = &assembled {
                warn!(%error, "assembly failed; stopping job");
                stop.cancel();
            }
            assembled
        })
    };
    for (index, page) in &stored {
        let _ = results_tx.send(PageResult::completed(
            *index,
            PagePayload::Stored(page.path.clone()),
            0,
        ));
    }

    let task = Arc::new(PageTask {
        inner: Arc::clone(inner),
        job_id: job_id.clone(),
        job: Mutex::new(DownloadJob::new(
            Arc::clone(&manifest),
            concurrency,
            stored.keys().copied(),
        )),
        client,
        events: events.clone(),
        results: results_tx,
        cancel: stop.clone(),
        fetched: AtomicUsize::new(0),
    });
    task.progress().await;

    let pending = task.job.lock().await.pending();
    info!(total, recovered, pending = pending.len(), concurrency, "fetching pages");

    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut tasks = JoinSet::new();
    for index in pending {
        let permit = tokio::select! {
            biased;
            () = stop.cancelled() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => permit,
        };
        let Ok(permit) = permit else { break };
        let Some(page) = manifest.page(index).cloned() else {
            continue;
        };
        let task = Arc::clone(&task);
        tasks.spawn(async move {
            let _permit = permit;
            fetch_page(task, index, page).await;
        });
    }

    loop {
        tokio::select! {
            biased;
            joined = tasks.join_next() => match joined {
                None => break,
                Some(Err(e)) => warn!(error = %e, "page task panicked"),
                Some(Ok(())) => {}
            },
            () = stop.cancelled() => break,
        }
    }
    if stop.is_cancelled() && !tasks.is_empty() {
        let grace = inner.config.cancel_grace;
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(grace_ms = grace.as_millis(), "page tasks outlived cancel grace; aborting");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }

    let Ok(task) = Arc::try_unwrap(task) else {
        return Err(OrchestratorError::Aborted {
            job_id: job_id.to_string(),
            reason: "page task context still shared after drain".to_string(),
        });
    };
    let fetched_this_run = task.fetched.load(Ordering::Relaxed);
    let mut job = task.job.into_inner();
    drop(task.results);

    let assembler = match assembler_task.await {
        Ok(Ok(assembler)) => assembler,
        Ok(Err(error)) => {
            discard_part(&part).await;
            return Err(error.into());
        }
        Err(e) => {
            discard_part(&part).await;
            return Err(OrchestratorError::Aborted {
                job_id: job_id.to_string(),
                reason: e.to_string(),
            });
        }
    };

    if cancel.is_cancelled() && !assembler.is_complete() {
        job.cancel();
        drop(assembler);
        discard_part(&part).await;
        inner.jobs.set_status(job_id, JobStatus::Cancelled).await?;
        let completed_pages = job.completed_count();
        info!(completed_pages, total, fetched_this_run, "job cancelled");
        let _ = events
            .send(JobEvent::JobCompleted {
                status: JobStatus::Cancelled,
            })
            .await;
        return Ok(JobReport {
            job_id: job_id.clone(),
            status: JobStatus::Cancelled,
            total_pages: total,
            completed_pages,
            fetched_this_run,
            failures: gaps(&manifest, &job),
            output: None,
            gaps_sidecar: None,
            assembly: None,
        });
    }

    let finished = tokio::task::spawn_blocking(move || assembler.finish())
        .await
        .map_err(|e| OrchestratorError::Aborted {
            job_id: job_id.to_string(),
            reason: e.to_string(),
        })
        .and_then(|report| report.map_err(OrchestratorError::from));
    let report: AssemblyReport = match finished {
        Ok(report) => report,
        Err(error) => {
            discard_part(&part).await;
            return Err(error);
        }
    };
    if let Err(source) = tokio::fs::rename(&part, &output).await {
        discard_part(&part).await;
        return Err(OrchestratorError::Io {
            path: output.clone(),
            source,
        });
    }

    // Stored pages the assembler could not read back or embed are missing
    // from the document too; forget them so a resume fetches them again.
    for gap in &report.gaps {
        if job.reject_page(gap.index, gap.reason.clone()) {
            warn!(page_index = gap.index, reason = %gap.reason, "stored page not usable; marked failed");
            inner.jobs.forget_page(job_id, gap.index).await?;
            if let Err(mpsc::error::TrySendError::Full(_)) = events.try_send(JobEvent::PageFailed {
                index: gap.index,
                reason: gap.reason.clone(),
            }) {
                debug!(page_index = gap.index, "event buffer full; dropping page failure event");
            }
        }
    }

    let failures = gaps(&manifest, &job);
    let sidecar = gaps_sidecar_path(&output);
    let gaps_sidecar = if failures.is_empty() {
        match tokio::fs::remove_file(&sidecar).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                warn!(path = %sidecar.display(), error = %e, "failed to remove stale gap manifest");
            }
            _ => {}
        }
        None
    } else {
        write_sidecar(&sidecar, job_id, &manifest, &failures).await?;
        Some(sidecar)
    };

    let status = job.terminal_status();
    inner.jobs.set_status(job_id, status).await?;
    info!(
        %status,
        pages_written = report.pages_written,
        gaps = failures.len(),
        fetched_this_run,
        bytes = report.bytes_written,
        output = %output.display(),
        "job finished"
    );
    let _ = events.send(JobEvent::JobCompleted { status }).await;

    Ok(JobReport {
        job_id: job_id.clone(),
        status,
        total_pages: total,
        completed_pages: job.completed_count(),
        fetched_this_run,
        failures,
        output: Some(output),
        gaps_sidecar,
        assembly: Some(report),
    })
}

fn gaps(manifest: &CanonicalManifest, job: &DownloadJob) -> Vec<Gap> {
    job.failures()
        .into_iter()
        .map(|(index, reason)| Gap {
            index,
            label: manifest.page(index).and_then(|page| page.label.clone()),
            reason,
        })
        .collect()
}

async fn write_sidecar(
    path: &Path,
    job_id: &JobId,
    manifest: &CanonicalManifest,
    gaps: &[Gap],
) -> Result<(), OrchestratorError> {
    let body = GapsSidecar {
        job_id,
        display_name: manifest.display_name(),
        source_id: manifest.source_id(),
        total_pages: manifest.page_count(),
        missing_pages: gaps.len(),
        gaps,
    };
    let json = serde_json::to_vec_pretty(&body).map_err(|e| OrchestratorError::Io {
        path: path.to_path_buf(),
        source: std::io::Error::other(e),
    })?;
    tokio::fs::write(path, json)
        .await
        .map_err(|source| OrchestratorError::Io {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::manifest::{ImageTarget, ManifestBuilder};

    async fn orchestrator(dir: &Path) -> Orchestrator {
        let db = Database::new_in_memory().await.unwrap();
        Orchestrator::new(EngineConfig::with_work_dir(dir.join("work")), db).unwrap()
    }

    fn manifest(source: &str, count: usize) -> CanonicalManifest {
        let mut builder = ManifestBuilder::new(source, "Codex");
        for n in 0..count {
            builder.push_page(ImageTarget::url(format!("http://127.0.0.1:9/{n}.jpg")), None);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_part_path_appends_suffix() {
        assert_eq!(part_path(Path::new("/out/book.pdf")), PathBuf::from("/out/book.pdf.part"));
    }

    #[tokio::test]
    async fn test_discard_part_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let part = dir.path().join("book.pdf.part");
        discard_part(&part).await;
        std::fs::write(&part, b"%PDF").unwrap();
        discard_part(&part).await;
        assert!(!part.exists());
    }

    #[test]
    fn test_page_failure_mapping() {
        let geo = FetchError::geo_blocked("u", "norwegian", 451);
        assert_eq!(
            page_failure(&geo, FailureType::GeoBlocked, 1),
            PageFailure::GeoBlocked { status: 451 }
        );
        let not_found = FetchError::http_status("u", 404);
        assert!(matches!(
            page_failure(&not_found, FailureType::Permanent, 1),
            PageFailure::PermanentFetch { status: Some(404), .. }
        ));
        let html = FetchError::not_an_image("u", "markup document");
        assert!(matches!(
            page_failure(&html, FailureType::Permanent, 1),
            PageFailure::InvalidImage { .. }
        ));
        let timeout = FetchError::timeout("u");
        assert!(matches!(
            page_failure(&timeout, FailureType::Transient, 3),
            PageFailure::TransientNetwork { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let db = Database::new_in_memory().await.unwrap();
        let config = EngineConfig {
            concurrency: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            Orchestrator::new(config, db),
            Err(OrchestratorError::InvalidOptions(_))
        ));
    }

    #[tokio::test]
    async fn test_effective_concurrency_respects_source_cap() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path()).await;
        let bdl = manifest("bdl", 2);
        assert_eq!(orchestrator.effective_concurrency(&bdl, Some(16)).unwrap(), 2);
        let generic = manifest("iiif", 2);
        assert_eq!(orchestrator.effective_concurrency(&generic, Some(16)).unwrap(), 16);
        assert_eq!(orchestrator.effective_concurrency(&generic, None).unwrap(), 4);
        assert!(orchestrator.effective_concurrency(&generic, Some(0)).is_err());
        assert!(orchestrator.effective_concurrency(&generic, Some(33)).is_err());
    }

    #[tokio::test]
    async fn test_submit_rejects_bad_page_range() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path()).await;
        let options = JobOptions::new(dir.path().join("out.pdf")).with_page_range(4..=9);
        let err = orchestrator
            .submit_job(manifest("iiif", 3), options)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidOptions(_)));
    }

    #[tokio::test]
    async fn test_resume_unknown_job() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path()).await;
        let err = orchestrator
            .resume_job(&JobId::from_string("deadbeef"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownJob(_)));
    }

    #[tokio::test]
    async fn test_cancel_unknown_job_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path()).await;
        let id = JobId::from_string("abc");
        assert!(!orchestrator.cancel_job(&id));
        assert!(!orchestrator.cancel_job(&id));
    }

    #[tokio::test]
    async fn test_forget_unknown_job() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(dir.path()).await;
        assert!(!orchestrator.forget_job(&JobId::from_string("abc")).await.unwrap());
    }
}
