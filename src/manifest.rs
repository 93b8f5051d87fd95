//! Canonical manifest model.
//!
//! Every loader, IIIF or pattern-based, produces a [`CanonicalManifest`]: a
//! display name, the source it came from, and the pages in manuscript order.
//! Manifests are only built through [`ManifestBuilder`], which assigns
//! contiguous indices and refuses to produce an empty page list.

use std::fmt;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Errors raised while building or validating a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    /// No page could be resolved from the upstream data.
    #[error("manifest for source '{source_id}' has no resolvable pages")]
    NoPages {
        /// Source that produced the empty manifest.
        source_id: String,
    },

    /// Page indices are not `0..N-1` in order.
    #[error("manifest page at position {position} has index {found}")]
    NonContiguous {
        /// Position in the page sequence.
        position: usize,
        /// Index recorded at that position.
        found: usize,
    },

    /// A requested page range does not fit the manifest.
    #[error("page range {start}-{end} is outside 1-{total}")]
    InvalidRange {
        /// First requested page (1-based).
        start: usize,
        /// Last requested page (1-based).
        end: usize,
        /// Page count of the manifest.
        total: usize,
    },
}

/// Where a page image lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageTarget {
    /// A directly fetchable image URL.
    Url {
        /// Absolute image URL, percent-encoding preserved as advertised.
        url: String,
    },
    /// A IIIF image service whose largest size is discovered at fetch time
    /// by probing `info.json`.
    IiifService {
        /// Service base URL without a trailing slash.
        service: String,
    },
}

impl ImageTarget {
    /// Creates a direct URL target.
    #[must_use]
    pub fn url(url: impl Into<String>) -> Self {
        Self::Url { url: url.into() }
    }

    /// Creates a deferred IIIF service target.
    #[must_use]
    pub fn iiif_service(service: impl Into<String>) -> Self {
        let service = service.into();
        Self::IiifService {
            service: service.trim_end_matches('/').to_string(),
        }
    }

    /// Returns the URL or service base, used for host routing and identity.
    #[must_use]
    pub fn locator(&self) -> &str {
        match self {
            Self::Url { url } => url,
            Self::IiifService { service } => service,
        }
    }
}

impl fmt::Display for ImageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url { url } => write!(f, "{url}"),
            Self::IiifService { service } => write!(f, "{service} (info.json)"),
        }
    }
}

/// One page of a manuscript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageDescriptor {
    /// Zero-based position in manuscript order.
    pub index: usize,
    /// Image location or deferred resolution rule.
    pub target: ImageTarget,
    /// Folio or page label when the source provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Normalized, ordered page list for one manuscript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalManifest {
    display_name: String,
    source_id: String,
    pages: Vec<PageDescriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
}

impl CanonicalManifest {
    /// Human-readable title.
    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Identifier of the source descriptor that produced this manifest.
    #[must_use]
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Pages in manuscript order.
    #[must_use]
    pub fn pages(&self) -> &[PageDescriptor] {
        &self.pages
    }

    /// Number of pages.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Page at `index`, if any.
    #[must_use]
    pub fn page(&self, index: usize) -> Option<&PageDescriptor> {
        self.pages.get(index)
    }

    /// Warnings recorded while normalizing upstream data (skipped canvases, count mismatches).
    #[must_use]
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Checks the index invariant. Used on manifests loaded from storage.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::NoPages`] for an empty manifest and
    /// [`ManifestError::NonContiguous`] when indices are not `0..N-1`.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.pages.is_empty() {
            return Err(ManifestError::NoPages {
                source_id: self.source_id.clone(),
            });
        }
        for (position, page) in self.pages.iter().enumerate() {
            if page.index != position {
                return Err(ManifestError::NonContiguous {
                    position,
                    found: page.index,
                });
            }
        }
        Ok(())
    }

    /// Returns a manifest restricted to the 1-based inclusive `range`,
    /// re-indexed from zero. Labels are preserved; pages without a label get
    /// their original page number so the selection stays traceable.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::InvalidRange`] when the range is empty or
    /// exceeds the page count.
    pub fn select_range(&self, range: &RangeInclusive<usize>) -> Result<Self, ManifestError> {
        let (start, end) = (*range.start(), *range.end());
        let total = self.pages.len();
        if start == 0 || start > end || end > total {
            return Err(ManifestError::InvalidRange { start, end, total });
        }

        let pages = self.pages[start - 1..end]
            .iter()
            .enumerate()
            .map(|(index, page)| PageDescriptor {
                index,
                target: page.target.clone(),
                label: page
                    .label
                    .clone()
                    .or_else(|| Some((page.index + 1).to_string())),
            })
            .collect();

        Ok(Self {
            display_name: format!("{} (pages {start}-{end})", self.display_name),
            source_id: self.source_id.clone(),
            pages,
            warnings: self.warnings.clone(),
        })
    }
}

/// Incremental builder that owns index assignment.
#[derive(Debug)]
pub struct ManifestBuilder {
    source_id: String,
    display_name: String,
    pages: Vec<PageDescriptor>,
    warnings: Vec<String>,
}

impl ManifestBuilder {
    /// Starts a manifest for `source_id`.
    #[must_use]
    pub fn new(source_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            display_name: display_name.into(),
            pages: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Replaces the display name (loaders often learn the title late).
    pub fn set_display_name(&mut self, display_name: impl Into<String>) {
        self.display_name = display_name.into();
    }

    /// Appends a page; its index is the current page count.
    pub fn push_page(&mut self, target: ImageTarget, label: Option<String>) -> &mut Self {
        let index = self.pages.len();
        self.pages.push(PageDescriptor {
            index,
            target,
            label: label.filter(|l| !l.trim().is_empty()),
        });
        self
    }

    /// Records a non-fatal normalization warning.
    pub fn warn(&mut self, message: impl Into<String>) -> &mut Self {
        let message = message.into();
        warn!(source_id = %self.source_id, warning = %message, "manifest warning");
        self.warnings.push(message);
        self
    }

    /// Number of pages pushed so far.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Finishes the manifest.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::NoPages`] when no page was pushed.
    pub fn build(self) -> Result<CanonicalManifest, ManifestError> {
        if self.pages.is_empty() {
            return Err(ManifestError::NoPages {
                source_id: self.source_id,
            });
        }
        let display_name = if self.display_name.trim().is_empty() {
            format!("{} manuscript", self.source_id)
        } else {
            self.display_name.trim().to_string()
        };
        Ok(CanonicalManifest {
            display_name,
            source_id: self.source_id,
            pages: self.pages,
            warnings: self.warnings,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample(count: usize) -> CanonicalManifest {
        let mut builder = ManifestBuilder::new("test", "Codex");
        for n in 0..count {
            builder.push_page(ImageTarget::url(format!("https://img.example/{n}.jpg")), None);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_builder_assigns_contiguous_indices() {
        let manifest = sample(4);
        let indices: Vec<usize> = manifest.pages().iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_builder_empty_is_error() {
        let result = ManifestBuilder::new("gallica", "Empty").build();
        assert_eq!(
            result.unwrap_err(),
            ManifestError::NoPages {
                source_id: "gallica".to_string()
            }
        );
    }

    #[test]
    fn test_builder_blank_display_name_falls_back_to_source() {
        let mut builder = ManifestBuilder::new("bdl", "   ");
        builder.push_page(ImageTarget::url("https://x/1.jpg"), Some(" ".to_string()));
        let manifest = builder.build().unwrap();
        assert_eq!(manifest.display_name(), "bdl manuscript");
        assert!(manifest.pages()[0].label.is_none());
    }

    #[test]
    fn test_validate_rejects_gaps_after_deserialization() {
        let json = r#"{"display_name":"X","source_id":"s","pages":[
            {"index":0,"target":{"kind":"url","url":"https://a/0.jpg"}},
            {"index":2,"target":{"kind":"url","url":"https://a/2.jpg"}}]}"#;
        let manifest: CanonicalManifest = serde_json::from_str(json).unwrap();
        assert_eq!(
            manifest.validate().unwrap_err(),
            ManifestError::NonContiguous {
                position: 1,
                found: 2
            }
        );
    }

    #[test]
    fn test_select_range_reindexes_and_keeps_page_numbers() {
        let manifest = sample(10);
        let selected = manifest.select_range(&(3..=5)).unwrap();
        assert_eq!(selected.page_count(), 3);
        assert!(selected.validate().is_ok());
        assert_eq!(
            selected.pages()[0].target,
            ImageTarget::url("https://img.example/2.jpg")
        );
        assert_eq!(selected.pages()[0].label.as_deref(), Some("3"));
    }

    #[test]
    fn test_select_range_out_of_bounds() {
        let manifest = sample(3);
        assert!(matches!(
            manifest.select_range(&(2..=4)),
            Err(ManifestError::InvalidRange { total: 3, .. })
        ));
        assert!(manifest.select_range(&(0..=1)).is_err());
    }

    #[test]
    fn test_iiif_service_target_trims_trailing_slash() {
        let target = ImageTarget::iiif_service("https://iiif.example/iiif/2/abc/");
        assert_eq!(target.locator(), "https://iiif.example/iiif/2/abc");
    }

    #[test]
    fn test_manifest_serde_round_trip_keeps_percent_encoding() {
        let mut builder = ManifestBuilder::new("iiif", "Enc");
        builder.push_page(
            ImageTarget::url("https://iiif.example/iiif/MS%2F12%3A3/full/full/0/default.jpg"),
            Some("f. 1r".to_string()),
        );
        let manifest = builder.build().unwrap();
        let json = serde_json::to_string(&manifest).unwrap();
        let back: CanonicalManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, manifest);
        assert!(json.contains("MS%2F12%3A3"));
    }
}
