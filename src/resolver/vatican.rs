//! Vatican Library (DigiVatLib) loader.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;

use crate::manifest::CanonicalManifest;
use crate::source::SourceDescriptor;

use super::http_client::SourceHttp;
use super::iiif::load_manifest;
use super::utils::{compile_static_regex, normalize_base_url, table_descriptor};
use super::{Loader, ManifestRequest, ResolveContext, ResolveError};

const DEFAULT_BASE_URL: &str = "https://digi.vatlib.it";

static SHELFMARK_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"/(view|mss/detail)/([^/?#]+)"));

/// Loader for `digi.vatlib.it` viewer and detail pages.
pub struct VaticanLoader {
    descriptor: Arc<SourceDescriptor>,
    http: SourceHttp,
    base_url: String,
}

impl VaticanLoader {
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
        let descriptor = table_descriptor("vatican")?;
        Ok(Self {
            http: SourceHttp::new(&descriptor)?,
            descriptor,
            base_url: normalize_base_url(base_url),
        })
    }

    /// Maps a viewer URL to its manifest URL. Detail pages carry the bare
    /// shelfmark and get the `MSS_` prefix the viewer uses.
    #[must_use]
    pub fn manifest_url(&self, url: &str) -> Option<String> {
        let caps = SHELFMARK_RE.captures(url)?;
        let raw = caps.get(2)?.as_str();
        let shelfmark = if &caps[1] == "mss/detail" && !raw.starts_with("MSS_") {
            format!("MSS_{raw}")
        } else {
            raw.to_string()
        };
        Some(format!("{}/iiif/{shelfmark}/manifest.json", self.base_url))
    }
}

impl std::fmt::Debug for VaticanLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaticanLoader")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Loader for VaticanLoader {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    #[tracing::instrument(skip(self, ctx), fields(source_id = "vatican", url = %request.raw_url))]
    async fn load(
        &self,
        request: &ManifestRequest,
        ctx: &ResolveContext,
    ) -> Result<CanonicalManifest, ResolveError> {
        let manifest_url = self
            .manifest_url(&request.raw_url)
            .ok_or_else(|| ResolveError::parse("vatican", &request.raw_url, "no shelfmark in URL"))?;
        load_manifest(&self.http, self.descriptor.id(), &manifest_url, ctx).await
    }
}
