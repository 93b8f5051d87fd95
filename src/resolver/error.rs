//! Error types for manifest resolution.
//!
//! Messages follow the What/Why/Fix pattern used across the project: the
//! rendered error names the URL, the reason, and a `Suggestion:` line when
//! the user can act on it.

use thiserror::Error;

use crate::manifest::ManifestError;

/// Errors that can occur while resolving a URL into a canonical manifest.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    /// No source descriptor accepts the URL.
    #[error("unsupported source for '{url}'\n  Suggestion: {suggestion}")]
    UnsupportedSource {
        /// The URL nobody claimed.
        url: String,
        /// How to fix the issue.
        suggestion: String,
    },

    /// Upstream data could not be turned into a valid manifest.
    #[error("could not parse manifest from {source_id} at '{url}': {reason}")]
    ManifestParse {
        /// Source whose loader failed.
        source_id: String,
        /// URL being resolved.
        url: String,
        /// What was wrong.
        reason: String,
    },

    /// The source answered with its known geo-restriction response.
    #[error(
        "[GEO] {source_id} refused '{url}' (HTTP {status}): content is region-restricted\n  Suggestion: access this library from an allowed region or through an institutional network"
    )]
    GeoBlocked {
        /// Source that refused.
        source_id: String,
        /// URL requested.
        url: String,
        /// HTTP status carrying the block.
        status: u16,
    },

    /// Transport failure or unexpected HTTP status while fetching manifest data.
    #[error("network error fetching '{url}': {reason}")]
    Network {
        /// URL requested.
        url: String,
        /// Failure description.
        reason: String,
        /// HTTP status when the server answered.
        status: Option<u16>,
    },

    /// Resolution was cancelled by the caller.
    #[error("resolution of '{url}' was cancelled")]
    Cancelled {
        /// URL being resolved.
        url: String,
    },

    /// Two descriptors claim the same URL shape. Raised at registration.
    #[error(
        "source '{id}' is shadowed by '{conflicting_id}' for sample URL '{sample_url}'\n  Suggestion: register the more specific source first or tighten its URL pattern"
    )]
    AmbiguousSource {
        /// Descriptor being registered.
        id: String,
        /// Earlier descriptor that already matches.
        conflicting_id: String,
        /// Sample URL that exposed the overlap.
        sample_url: String,
    },

    /// HTTP client construction failed for a source.
    #[error("could not build HTTP client for {source_id}: {reason}")]
    Client {
        /// Source whose client failed.
        source_id: String,
        /// Builder failure.
        reason: String,
    },

    /// Manifest cache failure.
    #[error("manifest cache error: {0}")]
    Cache(String),
}

impl ResolveError {
    /// Creates an `UnsupportedSource` error.
    #[must_use]
    pub fn unsupported(url: &str) -> Self {
        Self::UnsupportedSource {
            url: url.to_string(),
            suggestion: "Run `manuscript-downloader sources` to list supported libraries, or pass a IIIF manifest URL directly".to_string(),
        }
    }

    /// Creates a `ManifestParse` error.
    #[must_use]
    pub fn parse(source_id: &str, url: &str, reason: impl Into<String>) -> Self {
        Self::ManifestParse {
            source_id: source_id.to_string(),
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    /// Creates a `Network` error without a status.
    #[must_use]
    pub fn network(url: &str, reason: impl Into<String>) -> Self {
        Self::Network {
            url: url.to_string(),
            reason: reason.into(),
            status: None,
        }
    }

    /// Creates a `Network` error for an unexpected HTTP status.
    #[must_use]
    pub fn http_status(url: &str, status: u16) -> Self {
        Self::Network {
            url: url.to_string(),
            reason: format!("HTTP {status}"),
            status: Some(status),
        }
    }

    /// Creates a `GeoBlocked` error.
    #[must_use]
    pub fn geo_blocked(source_id: &str, url: &str, status: u16) -> Self {
        Self::GeoBlocked {
            source_id: source_id.to_string(),
            url: url.to_string(),
            status,
        }
    }

    /// Creates a `Cancelled` error.
    #[must_use]
    pub fn cancelled(url: &str) -> Self {
        Self::Cancelled {
            url: url.to_string(),
        }
    }

    /// Converts a manifest build failure into a parse error for `url`.
    #[must_use]
    pub fn from_manifest(error: &ManifestError, source_id: &str, url: &str) -> Self {
        Self::parse(source_id, url, error.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_display_has_suggestion() {
        let msg = ResolveError::unsupported("https://example.com/x").to_string();
        assert!(msg.contains("https://example.com/x"));
        assert!(msg.contains("Suggestion:"));
    }

    #[test]
    fn test_geo_blocked_display_is_distinct() {
        let msg = ResolveError::geo_blocked("norwegian", "https://api.nb.no/x", 403).to_string();
        assert!(msg.starts_with("[GEO]"), "{msg}");
        assert!(msg.contains("403"));
    }

    #[test]
    fn test_from_manifest_no_pages() {
        let error = ResolveError::from_manifest(
            &ManifestError::NoPages {
                source_id: "bdl".to_string(),
            },
            "bdl",
            "https://bdl/x",
        );
        assert!(matches!(error, ResolveError::ManifestParse { ref source_id, .. } if source_id == "bdl"));
        assert!(error.to_string().contains("no resolvable pages"));
    }

    #[test]
    fn test_http_status_keeps_status() {
        let error = ResolveError::http_status("https://x", 502);
        assert!(matches!(error, ResolveError::Network { status: Some(502), .. }));
    }
}
