//! Engine configuration shared by the resolver and download stages.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Default number of pages fetched concurrently per job.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Hard ceiling on per-job concurrency.
pub const MAX_CONCURRENCY: usize = 32;

/// Default maximum attempts per page, including the first.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default HTTP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default per-request timeout for page images.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(120);

/// How long in-flight tasks get to observe a cancel before being aborted.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Default simultaneous requests to one host across all jobs.
pub const DEFAULT_PER_HOST_LIMIT: usize = 6;

/// Default cap on listing pages walked by paginated loaders.
pub const DEFAULT_MAX_LISTING_PAGES: usize = 200;

/// Invalid configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A numeric setting is outside its accepted range.
    #[error("invalid value for `{field}`: {value}. Expected range: {expected}")]
    OutOfRange {
        /// Setting name.
        field: &'static str,
        /// Offending value.
        value: String,
        /// Accepted range, human readable.
        expected: &'static str,
    },
}

/// Tunables for one [`Orchestrator`](crate::download::Orchestrator).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pages fetched concurrently per job unless the job asks for fewer.
    pub concurrency: usize,
    /// Simultaneous requests to a single host, shared by every job.
    pub per_host_limit: usize,
    /// Attempts per page including the first.
    pub max_attempts: u32,
    /// First backoff delay.
    pub backoff_base: Duration,
    /// Backoff ceiling.
    pub backoff_max: Duration,
    /// Minimum spacing between requests to one host; zero disables spacing.
    pub request_spacing: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Whole-request timeout for one page fetch.
    pub read_timeout: Duration,
    /// Grace period for in-flight fetches after cancel.
    pub cancel_grace: Duration,
    /// Directory holding downloaded page bytes, one subdirectory per job.
    pub work_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            per_host_limit: DEFAULT_PER_HOST_LIMIT,
            max_attempts: DEFAULT_MAX_RETRIES,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(32),
            request_spacing: Duration::ZERO,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            work_dir: std::env::temp_dir().join("manuscript-downloader"),
        }
    }
}

impl EngineConfig {
    /// Default configuration rooted at `work_dir`.
    #[must_use]
    pub fn with_work_dir(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            ..Self::default()
        }
    }

    /// Checks ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] for the first invalid setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_CONCURRENCY).contains(&self.concurrency) {
            return Err(out_of_range("concurrency", self.concurrency, "1..=32"));
        }
        if !(1..=64).contains(&self.per_host_limit) {
            return Err(out_of_range("per_host_limit", self.per_host_limit, "1..=64"));
        }
        if !(1..=10).contains(&self.max_attempts) {
            return Err(out_of_range("max_attempts", self.max_attempts, "1..=10"));
        }
        if self.read_timeout.is_zero() {
            return Err(out_of_range("read_timeout", 0, "> 0 seconds"));
        }
        if self.connect_timeout.is_zero() {
            return Err(out_of_range("connect_timeout", 0, "> 0 seconds"));
        }
        Ok(())
    }
}

fn out_of_range(field: &'static str, value: impl ToString, expected: &'static str) -> ConfigError {
    ConfigError::OutOfRange {
        field,
        value: value.to_string(),
        expected,
    }
}
