//! Error types for the download layer.
//!
//! [`FetchError`] describes one failed request for one page image.
//! [`PageFailure`] is the classified, user-facing outcome recorded against a
//! page once the retry policy gives up. [`OrchestratorError`] is reserved for
//! job-level failures: nothing could be persisted, or the output could not
//! be written.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::assembly::AssemblyError;
use crate::config::ConfigError;
use crate::db::DbError;
use crate::manifest::ManifestError;

/// Errors that can occur while fetching one page image.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error fetching {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout fetching {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response that is not a geo-block.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present.
        retry_after: Option<String>,
    },

    /// The response matched the source's geo-restriction signature.
    #[error(
        "[GEO] {source_id} refused {url} from this region (HTTP {status})\n  Suggestion: this library only serves these images inside its country; retrying will not help"
    )]
    GeoBlocked {
        /// The blocked URL.
        url: String,
        /// Source whose signature matched.
        source_id: String,
        /// HTTP status carrying the block.
        status: u16,
    },

    /// File system error while storing page bytes.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The page URL is malformed.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The server answered 2xx with no bytes.
    #[error("empty response body from {url}")]
    EmptyBody {
        /// The URL that returned nothing.
        url: String,
    },

    /// The server answered 2xx with a body that is not image data, such as
    /// an HTML login or error page.
    #[error("response from {url} is not an image ({detail})")]
    NotAnImage {
        /// The URL that returned the body.
        url: String,
        /// What the body looked like.
        detail: String,
    },

    /// The job was cancelled while the request was in flight.
    #[error("fetch of {url} cancelled")]
    Cancelled {
        /// The URL whose fetch was abandoned.
        url: String,
    },
}

impl FetchError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with a Retry-After header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a geo-block error.
    pub fn geo_blocked(url: impl Into<String>, source_id: impl Into<String>, status: u16) -> Self {
        Self::GeoBlocked {
            url: url.into(),
            source_id: source_id.into(),
            status,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates an error for a 2xx body that is not image data.
    pub fn not_an_image(url: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::NotAnImage {
            url: url.into(),
            detail: detail.into(),
        }
    }

    /// Creates a cancellation error.
    pub fn cancelled(url: impl Into<String>) -> Self {
        Self::Cancelled { url: url.into() }
    }

    /// HTTP status carried by the error, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } | Self::GeoBlocked { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Why a page ended up permanently failed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageFailure {
    /// The source refused the page from this region. Never retried.
    #[error("geo-blocked (HTTP {status})")]
    GeoBlocked {
        /// HTTP status carrying the block.
        status: u16,
    },

    /// Transient errors persisted through every allowed attempt.
    #[error("network error after {attempts} attempts: {message}")]
    TransientNetwork {
        /// Attempts made, including the first.
        attempts: u32,
        /// Last error seen.
        message: String,
    },

    /// A non-retryable failure such as 404.
    #[error("fetch failed: {message}")]
    PermanentFetch {
        /// HTTP status, when the failure was an HTTP response.
        status: Option<u16>,
        /// Error description.
        message: String,
    },

    /// The page arrived but its bytes could not be used as an image.
    #[error("unusable image: {message}")]
    InvalidImage {
        /// What was wrong with the bytes.
        message: String,
    },
}

impl PageFailure {
    /// Whether the failure is a geo-block.
    #[must_use]
    pub fn is_geo_blocked(&self) -> bool {
        matches!(self, Self::GeoBlocked { .. })
    }
}

/// Job-level failures.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The state database could not be read or written.
    #[error("job state persistence failed: {0}")]
    Persistence(#[from] sqlx::Error),

    /// The state database could not be opened.
    #[error(transparent)]
    Database(#[from] DbError),

    /// The output document could not be produced.
    #[error(transparent)]
    Assembly(#[from] AssemblyError),

    /// Job options or engine configuration are invalid.
    #[error("invalid job options: {0}\n  Suggestion: check the page range and concurrency values")]
    InvalidOptions(String),

    /// No persisted job has this id.
    #[error("no persisted job with id {0}\n  Suggestion: the job must be submitted again from its URL")]
    UnknownJob(String),

    /// A persisted manifest snapshot could not be decoded.
    #[error("persisted manifest for job {job_id} is unreadable: {reason}")]
    CorruptSnapshot {
        /// Job whose snapshot is unreadable.
        job_id: String,
        /// Decoder message.
        reason: String,
    },

    /// No HTTP client could be built for the job's source.
    #[error("cannot build HTTP client for {source_id}: {reason}")]
    HttpClient {
        /// Source the client was for.
        source_id: String,
        /// Builder message.
        reason: String,
    },

    /// Work directory could not be prepared.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The job is already running in this orchestrator.
    #[error("job {0} is already running")]
    AlreadyRunning(String),

    /// The job's driver task panicked or was aborted.
    #[error("job {job_id} stopped unexpectedly: {reason}")]
    Aborted {
        /// Job whose task died.
        job_id: String,
        /// Join error description.
        reason: String,
    },
}

impl From<ConfigError> for OrchestratorError {
    fn from(error: ConfigError) -> Self {
        Self::InvalidOptions(error.to_string())
    }
}

impl From<ManifestError> for OrchestratorError {
    fn from(error: ManifestError) -> Self {
        Self::InvalidOptions(error.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_timeout_display() {
        let error = FetchError::timeout("https://example.com/p1.jpg");
        assert!(error.to_string().contains("timeout"));
        assert!(error.to_string().contains("https://example.com/p1.jpg"));
    }

    #[test]
    fn test_fetch_error_http_status_display() {
        let error = FetchError::http_status("https://example.com/p1.jpg", 404);
        let msg = error.to_string();
        assert!(msg.contains("404"), "Expected '404' in: {msg}");
        assert_eq!(error.status(), Some(404));
    }

    #[test]
    fn test_fetch_error_geo_blocked_has_suggestion() {
        let error = FetchError::geo_blocked("https://api.nb.no/img/1", "norwegian", 451);
        let msg = error.to_string();
        assert!(msg.starts_with("[GEO]"), "Expected [GEO] prefix in: {msg}");
        assert!(msg.contains("norwegian"));
        assert!(msg.contains("Suggestion:"));
        assert_eq!(error.status(), Some(451));
    }

    #[test]
    fn test_fetch_error_io_display() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let error = FetchError::io(PathBuf::from("/tmp/page-00001.bin"), io_error);
        assert!(error.to_string().contains("/tmp/page-00001.bin"));
        assert_eq!(error.status(), None);
    }

    #[test]
    fn test_page_failure_serializes_with_kind_tag() {
        let json = serde_json::to_value(PageFailure::GeoBlocked { status: 403 }).unwrap();
        assert_eq!(json["kind"], "geo_blocked");
        assert_eq!(json["status"], 403);
    }

    #[test]
    fn test_page_failure_display() {
        let failure = PageFailure::TransientNetwork {
            attempts: 3,
            message: "HTTP 503".to_string(),
        };
        assert_eq!(failure.to_string(), "network error after 3 attempts: HTTP 503");
        assert!(!failure.is_geo_blocked());
    }

    #[test]
    fn test_not_an_image_display() {
        let error = FetchError::not_an_image("https://example.com/p2.jpg", "markup document");
        let msg = error.to_string();
        assert!(msg.contains("not an image"), "{msg}");
        assert!(msg.contains("markup document"), "{msg}");
        assert_eq!(error.status(), None);

        let json = serde_json::to_value(PageFailure::InvalidImage {
            message: "html".to_string(),
        })
        .unwrap();
        assert_eq!(json["kind"], "invalid_image");
    }

    #[test]
    fn test_unknown_job_has_suggestion() {
        let msg = OrchestratorError::UnknownJob("abc".to_string()).to_string();
        assert!(msg.contains("abc"));
        assert!(msg.contains("Suggestion:"));
    }
}
