//! Loader registry with first-match dispatch.
//!
//! The [`ResolverRegistry`] holds loaders in registration order. A URL goes
//! to the first loader whose probe accepts it; ambiguity is rejected when a
//! loader is registered, never at resolution time.

use tracing::{debug, info};

use crate::manifest::CanonicalManifest;

use super::{Loader, ManifestRequest, ResolveContext, ResolveError};

/// An ordered collection of loaders.
pub struct ResolverRegistry {
    loaders: Vec<Box<dyn Loader>>,
}

impl ResolverRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            loaders: Vec::new(),
        }
    }

    /// Registers a loader behind every loader already present.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::AmbiguousSource`] when the id is already taken
    /// or when an earlier loader would claim one of the new loader's sample
    /// URLs, which would make the new source unreachable.
    #[tracing::instrument(skip(self, loader), fields(source_id = loader.descriptor().id()))]
    pub fn register(&mut self, loader: Box<dyn Loader>) -> Result<(), ResolveError> {
        let descriptor = loader.descriptor();
        for existing in &self.loaders {
            let existing_id = existing.descriptor().id();
            if existing_id == descriptor.id() {
                return Err(ResolveError::AmbiguousSource {
                    id: descriptor.id().to_string(),
                    conflicting_id: existing_id.to_string(),
                    sample_url: descriptor
                        .sample_urls()
                        .first()
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                });
            }
            if let Some(sample) = descriptor
                .sample_urls()
                .iter()
                .find(|sample| existing.probe(sample))
            {
                return Err(ResolveError::AmbiguousSource {
                    id: descriptor.id().to_string(),
                    conflicting_id: existing_id.to_string(),
                    sample_url: (*sample).to_string(),
                });
            }
        }

        debug!(name = descriptor.name(), strategy = descriptor.strategy().as_str(), "Registering loader");
        self.loaders.push(loader);
        Ok(())
    }

    /// Number of registered loaders.
    #[must_use]
    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    /// Returns true if no loaders are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }

    /// Returns the loader that would handle `url`.
    #[must_use]
    pub fn find_loader(&self, url: &str) -> Option<&dyn Loader> {
        let url = url.trim();
        self.loaders
            .iter()
            .find(|loader| loader.probe(url))
            .map(AsRef::as_ref)
    }

    /// Resolves `url` into a canonical manifest.
    ///
    /// Exactly one loader is consulted: the first whose probe matches.
    /// A failing loader is not followed by later ones.
    ///
    /// # Errors
    ///
    /// [`ResolveError::UnsupportedSource`] when no loader matches; otherwise
    /// whatever the chosen loader returns.
    #[tracing::instrument(skip(self, ctx))]
    pub async fn resolve(
        &self,
        url: &str,
        ctx: &ResolveContext,
    ) -> Result<CanonicalManifest, ResolveError> {
        let Some(loader) = self.find_loader(url) else {
            return Err(ResolveError::unsupported(url.trim()));
        };
        let source_id = loader.descriptor().id();
        let request = ManifestRequest::new(source_id, url);
        debug!(source_id, "Dispatching to loader");

        let manifest = loader.load(&request, ctx).await?;
        manifest
            .validate()
            .map_err(|e| ResolveError::from_manifest(&e, source_id, &request.raw_url))?;

        info!(
            source_id,
            pages = manifest.page_count(),
            warnings = manifest.warnings().len(),
            "Resolution successful"
        );
        Ok(manifest)
    }

    /// Iterates loaders in dispatch order.
    pub fn loaders(&self) -> impl Iterator<Item = &dyn Loader> {
        self.loaders.iter().map(AsRef::as_ref)
    }
}

impl std::fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&str> = self.loaders.iter().map(|l| l.descriptor().id()).collect();
        f.debug_struct("ResolverRegistry")
            .field("loader_count", &self.loaders.len())
            .field("loaders", &ids)
            .finish()
    }
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        Self::new()
    }
}
