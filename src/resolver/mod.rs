//! Manifest resolution: from a library URL to a [`CanonicalManifest`].
//!
//! # Architecture
//!
//! - [`Loader`] - Async trait every source implements (`probe` + `load`)
//! - [`ResolverRegistry`] - Ordered, first-match dispatch over loaders
//! - [`iiif`] - IIIF Presentation v2/v3 normalizer shared by IIIF sources
//! - Pattern-extraction loaders for sources without IIIF manifests
//!   ([`BdlLoader`], [`RomeLoader`], [`MorganLoader`], [`InternetCulturaleLoader`])
//! - [`ManifestCache`] - SQLite-backed cache of resolved manifests
//!
//! # Example
//!
//! ```no_run
//! use manuscript_core::resolver::{build_default_registry, ResolveContext};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = build_default_registry()?;
//! let ctx = ResolveContext::default();
//! let manifest = registry
//!     .resolve("https://www.e-rara.ch/zuz/content/titleinfo/8325160", &ctx)
//!     .await?;
//! println!("{}: {} pages", manifest.display_name(), manifest.page_count());
//! # Ok(())
//! # }
//! ```

mod bdl;
mod cache;
mod erara;
mod error;
mod gallica;
pub mod http_client;
pub mod iiif;
mod internet_culturale;
mod morgan;
mod norwegian;
mod registry;
mod rome;
pub(crate) mod utils;
mod vatican;

pub use bdl::BdlLoader;
pub use cache::{MANIFEST_CACHE_VERSION, ManifestCache};
pub use erara::EraraLoader;
pub use error::ResolveError;
pub use gallica::GallicaLoader;
pub use iiif::IiifLoader;
pub use internet_culturale::InternetCulturaleLoader;
pub use morgan::MorganLoader;
pub use norwegian::NorwegianLoader;
pub use registry::ResolverRegistry;
pub use rome::RomeLoader;
pub use vatican::VaticanLoader;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::DEFAULT_MAX_LISTING_PAGES;
use crate::manifest::CanonicalManifest;
use crate::source::SourceDescriptor;

/// Builds the registry with every source in the descriptor table, in table order.
///
/// # Errors
///
/// Returns [`ResolveError::Client`] if an HTTP client cannot be built, or
/// [`ResolveError::AmbiguousSource`] if the table order shadows a source.
pub fn build_default_registry() -> Result<ResolverRegistry, ResolveError> {
    let mut registry = ResolverRegistry::new();
    registry.register(Box::new(GallicaLoader::new()?))?;
    registry.register(Box::new(EraraLoader::new()?))?;
    registry.register(Box::new(VaticanLoader::new()?))?;
    registry.register(Box::new(NorwegianLoader::new()?))?;
    registry.register(Box::new(BdlLoader::new()?))?;
    registry.register(Box::new(RomeLoader::new()?))?;
    registry.register(Box::new(MorganLoader::new()?))?;
    registry.register(Box::new(InternetCulturaleLoader::new()?))?;
    registry.register(Box::new(IiifLoader::new()?))?;
    Ok(registry)
}

/// One resolution request. Created per user request and discarded afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRequest {
    /// Descriptor id that claimed the URL.
    pub source_id: String,
    /// URL as given by the user, trimmed.
    pub raw_url: String,
}

impl ManifestRequest {
    /// Creates a request.
    #[must_use]
    pub fn new(source_id: impl Into<String>, raw_url: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            raw_url: raw_url.into().trim().to_string(),
        }
    }
}

/// Context passed to loaders during resolution.
#[derive(Debug, Clone)]
pub struct ResolveContext {
    /// Cancels manifest and listing fetches.
    pub cancel: CancellationToken,
    /// Upper bound on listing pages a paginated loader may walk.
    pub max_listing_pages: usize,
}

impl ResolveContext {
    /// Creates a context with default limits and a fresh token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            max_listing_pages: DEFAULT_MAX_LISTING_PAGES,
        }
    }
}

impl Default for ResolveContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A per-source resolution strategy.
///
/// Each loader owns one [`SourceDescriptor`]; the registry matches URLs
/// against it and never needs to know how the loader works.
///
/// # Object Safety
///
/// This trait uses `async_trait` to support dynamic dispatch via
/// `Box<dyn Loader>`.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Descriptor this loader serves.
    fn descriptor(&self) -> &SourceDescriptor;

    /// Cheap structural check; no network access.
    fn probe(&self, url: &str) -> bool {
        self.descriptor().matches(url)
    }

    /// Fetches upstream data and extracts the canonical manifest.
    async fn load(
        &self,
        request: &ManifestRequest,
        ctx: &ResolveContext,
    ) -> Result<CanonicalManifest, ResolveError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_covers_table() {
        let registry = build_default_registry().unwrap();
        assert_eq!(registry.len(), crate::source::source_table().len());
    }

    #[test]
    fn test_manifest_request_trims_url() {
        let request = ManifestRequest::new("iiif", "  https://x/manifest.json\n");
        assert_eq!(request.raw_url, "https://x/manifest.json");
    }

    #[test]
    fn test_resolve_context_default() {
        let ctx = ResolveContext::default();
        assert_eq!(ctx.max_listing_pages, DEFAULT_MAX_LISTING_PAGES);
        assert!(!ctx.cancel.is_cancelled());
    }
}
