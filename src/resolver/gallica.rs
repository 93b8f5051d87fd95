//! Gallica (BnF) loader: ARK identifiers map onto the IIIF manifest endpoint.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;

use crate::manifest::CanonicalManifest;
use crate::source::SourceDescriptor;

use super::http_client::SourceHttp;
use super::iiif::load_manifest;
use super::utils::{compile_static_regex, first_capture, normalize_base_url, table_descriptor};
use super::{Loader, ManifestRequest, ResolveContext, ResolveError};

const DEFAULT_BASE_URL: &str = "https://gallica.bnf.fr";

static ARK_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"(?i)(ark:/\d+/[a-z0-9]+)"));

/// Loader for `gallica.bnf.fr/ark:/...` document URLs.
pub struct GallicaLoader {
    descriptor: Arc<SourceDescriptor>,
    http: SourceHttp,
    base_url: String,
}

impl GallicaLoader {
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
        let descriptor = table_descriptor("gallica")?;
        Ok(Self {
            http: SourceHttp::new(&descriptor)?,
            descriptor,
            base_url: normalize_base_url(base_url),
        })
    }

    /// Maps a document URL to its manifest URL.
    #[must_use]
    pub fn manifest_url(&self, url: &str) -> Option<String> {
        first_capture(url, &ARK_RE).map(|ark| format!("{}/iiif/{ark}/manifest.json", self.base_url))
    }
}

impl std::fmt::Debug for GallicaLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GallicaLoader")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Loader for GallicaLoader {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    #[tracing::instrument(skip(self, ctx), fields(source_id = "gallica", url = %request.raw_url))]
    async fn load(
        &self,
        request: &ManifestRequest,
        ctx: &ResolveContext,
    ) -> Result<CanonicalManifest, ResolveError> {
        let manifest_url = self
            .manifest_url(&request.raw_url)
            .ok_or_else(|| ResolveError::parse("gallica", &request.raw_url, "no ARK identifier in URL"))?;
        load_manifest(&self.http, self.descriptor.id(), &manifest_url, ctx).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_url_from_item_url() {
        let loader = GallicaLoader::new().unwrap();
        assert_eq!(
            loader
                .manifest_url("https://gallica.bnf.fr/ark:/12148/btv1b8449691v/f1.item")
                .unwrap(),
            "https://gallica.bnf.fr/iiif/ark:/12148/btv1b8449691v/manifest.json"
        );
    }

    #[test]
    fn test_manifest_url_with_custom_base() {
        let loader = GallicaLoader::with_base_url("http://127.0.0.1:9/").unwrap();
        assert_eq!(
            loader.manifest_url("https://gallica.bnf.fr/ark:/12148/btv1b10500001g.planchecontact").unwrap(),
            "http://127.0.0.1:9/iiif/ark:/12148/btv1b10500001g/manifest.json"
        );
    }

    #[test]
    fn test_manifest_url_without_ark() {
        let loader = GallicaLoader::new().unwrap();
        assert!(loader.manifest_url("https://gallica.bnf.fr/accueil").is_none());
    }
}
