//! National Library of Norway loader.
//!
//! Item pages on `nb.no` map onto the catalog API's v1 IIIF manifest, with
//! the v3 endpoint as a fallback. Content outside the public domain is only
//! served to Norwegian addresses; the API answers 403/451 elsewhere, which
//! surfaces as [`ResolveError::GeoBlocked`] and is never retried on v3.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::manifest::CanonicalManifest;
use crate::source::SourceDescriptor;

use super::http_client::SourceHttp;
use super::iiif::load_manifest;
use super::utils::{compile_static_regex, first_capture, normalize_base_url, table_descriptor};
use super::{Loader, ManifestRequest, ResolveContext, ResolveError};

const DEFAULT_API_BASE_URL: &str = "https://api.nb.no";

static ITEM_ID_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"(?i)/items/([a-f0-9]+)"));

/// Loader for `nb.no/items/{id}` URLs.
pub struct NorwegianLoader {
    descriptor: Arc<SourceDescriptor>,
    http: SourceHttp,
    api_base_url: String,
}

impl NorwegianLoader {
    /// Creates a loader against the production API.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Client`] if client construction fails.
    pub fn new() -> Result<Self, ResolveError> {
        Self::with_base_url(DEFAULT_API_BASE_URL)
    }

    /// Creates a loader with a custom API host (for tests).
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Client`] if client construction fails.
    pub fn with_base_url(api_base_url: impl Into<String>) -> Result<Self, ResolveError> {
        let descriptor = table_descriptor("norwegian")?;
        Ok(Self {
            http: SourceHttp::new(&descriptor)?,
            descriptor,
            api_base_url: normalize_base_url(api_base_url),
        })
    }

    /// Maps an item URL to its v1 manifest URL.
    #[must_use]
    pub fn manifest_url(&self, url: &str) -> Option<String> {
        first_capture(url, &ITEM_ID_RE)
            .map(|id| format!("{}/catalog/v1/iiif/{id}/manifest?profile=nbdigital", self.api_base_url))
    }

    fn fallback_manifest_url(&self, url: &str) -> Option<String> {
        first_capture(url, &ITEM_ID_RE)
            .map(|id| format!("{}/catalog/v3/iiif/{id}/manifest", self.api_base_url))
    }
}

impl std::fmt::Debug for NorwegianLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NorwegianLoader")
            .field("api_base_url", &self.api_base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Loader for NorwegianLoader {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    #[tracing::instrument(skip(self, ctx), fields(source_id = "norwegian", url = %request.raw_url))]
    async fn load(
        &self,
        request: &ManifestRequest,
        ctx: &ResolveContext,
    ) -> Result<CanonicalManifest, ResolveError> {
        let manifest_url = self
            .manifest_url(&request.raw_url)
            .ok_or_else(|| ResolveError::parse("norwegian", &request.raw_url, "no item id in URL"))?;
        match load_manifest(&self.http, self.descriptor.id(), &manifest_url, ctx).await {
            Err(ResolveError::Network { reason, .. }) => {
                debug!(reason = %reason, "v1 manifest unavailable; trying v3 endpoint");
                let fallback = self
                    .fallback_manifest_url(&request.raw_url)
                    .unwrap_or(manifest_url);
                load_manifest(&self.http, self.descriptor.id(), &fallback, ctx).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_url() {
        let loader = NorwegianLoader::with_base_url("http://127.0.0.1:9").unwrap();
        let url = loader
            .manifest_url("https://www.nb.no/items/a7e1a2b2c7f3?page=0")
            .unwrap();
        assert_eq!(
            url,
            "http://127.0.0.1:9/catalog/v1/iiif/a7e1a2b2c7f3/manifest?profile=nbdigital"
        );
        assert_eq!(
            loader.fallback_manifest_url("https://www.nb.no/items/a7e1a2b2c7f3").unwrap(),
            "http://127.0.0.1:9/catalog/v3/iiif/a7e1a2b2c7f3/manifest"
        );
    }
}
