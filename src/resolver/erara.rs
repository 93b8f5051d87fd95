//! e-rara loader: `/titleinfo/{id}` pages map onto the IIIF v2.0 endpoint.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;

use crate::manifest::CanonicalManifest;
use crate::source::SourceDescriptor;

use super::http_client::SourceHttp;
use super::iiif::load_manifest;
use super::utils::{compile_static_regex, first_capture, normalize_base_url, table_descriptor};
use super::{Loader, ManifestRequest, ResolveContext, ResolveError};

const DEFAULT_BASE_URL: &str = "https://www.e-rara.ch";

static TITLE_ID_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"/titleinfo/(\d+)"));

/// Loader for e-rara title pages.
pub struct EraraLoader {
    descriptor: Arc<SourceDescriptor>,
    http: SourceHttp,
    base_url: String,
}

impl EraraLoader {
    /// Creates a loader against the production host.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Client`] if client construction fails.
    pub fn new() -> Result<Self, ResolveError> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Creates a loader with a custom host (for tests).
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Client`] if client construction fails.
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, ResolveError> {
        let descriptor = table_descriptor("e-rara")?;
        Ok(Self {
            http: SourceHttp::new(&descriptor)?,
            descriptor,
            base_url: normalize_base_url(base_url),
        })
    }

    /// Maps a title page URL to its manifest URL.
    #[must_use]
    pub fn manifest_url(&self, url: &str) -> Option<String> {
        first_capture(url, &TITLE_ID_RE).map(|id| format!("{}/i3f/v20/{id}/manifest", self.base_url))
    }
}

impl std::fmt::Debug for EraraLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EraraLoader")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Loader for EraraLoader {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    #[tracing::instrument(skip(self, ctx), fields(source_id = "e-rara", url = %request.raw_url))]
    async fn load(
        &self,
        request: &ManifestRequest,
        ctx: &ResolveContext,
    ) -> Result<CanonicalManifest, ResolveError> {
        let manifest_url = self
            .manifest_url(&request.raw_url)
            .ok_or_else(|| ResolveError::parse("e-rara", &request.raw_url, "no title id in URL"))?;
        load_manifest(&self.http, self.descriptor.id(), &manifest_url, ctx).await
    }
}
