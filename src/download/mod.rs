//! Page acquisition: fetching, retry/backoff, per-host throttling,
//! geo-block detection, cancellation, and resumable job state.
//!
//! # Example
//!
//! ```no_run
//! use manuscript_core::{Database, EngineConfig, JobEvent, JobOptions, Orchestrator};
//! # use manuscript_core::CanonicalManifest;
//!
//! # async fn example(manifest: CanonicalManifest) -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new_in_memory().await?;
//! let orchestrator = Orchestrator::new(EngineConfig::default(), db)?;
//! let mut handle = orchestrator
//!     .submit_job(manifest, JobOptions::new("codex.pdf"))
//!     .await?;
//! while let Some(event) = handle.next_event().await {
//!     if let JobEvent::JobProgress { completed, total } = event {
//!         println!("{completed}/{total}");
//!     }
//! }
//! let report = handle.wait().await?;
//! println!("{} gaps", report.failures.len());
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod host_limiter;
mod job;
mod orchestrator;
mod persistence;
pub mod rate_limiter;
mod retry;
mod store;

pub use client::PageClient;
pub use error::{FetchError, OrchestratorError, PageFailure};
pub use host_limiter::HostLimiter;
pub use job::{
    EVENT_BUFFER, JobEvent, JobHandle, JobId, JobOptions, JobReport, JobStatus, PageState,
    gaps_sidecar_path,
};
pub use orchestrator::Orchestrator;
pub use persistence::{JobStore, PersistedJob, StoredPage};
pub use rate_limiter::{RateLimiter, extract_domain, parse_retry_after};
pub use retry::{FailureType, RetryDecision, RetryPolicy, classify_error};
pub use store::PageStore;
