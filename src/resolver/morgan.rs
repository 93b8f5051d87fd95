//! Morgan Library & Museum loader.
//!
//! Collection pages only show a window of thumbnails; the rest are behind
//! `?page=N`. The listing is walked until a page contributes no new facsimile
//! and every facsimile reference becomes the original-size JPEG under
//! `/sites/default/files/facsimile/{bbid}/{id}.jpg`.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::manifest::{CanonicalManifest, ImageTarget, ManifestBuilder};
use crate::source::SourceDescriptor;

use super::http_client::SourceHttp;
use super::utils::{
    compile_static_regex, first_capture, normalize_base_url, reconcile_page_count,
    table_descriptor, walk_paginated,
};
use super::{Loader, ManifestRequest, ResolveContext, ResolveError};

const DEFAULT_BASE_URL: &str = "https://www.themorgan.org";

static COLLECTION_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"/collection/([^/?#]+)(?:/(\d+))?"));
/// Matches both direct and image-style (`/styles/.../public/facsimile/...`) references.
static FACSIMILE_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"/facsimile/(\d+)/([^"'?/\s]+)\.jpg"#));
static PAGE_COUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?i)\b(\d+)\s+(?:pages|images|leaves)\b"));

/// Loader for `themorgan.org/collection/...` URLs.
pub struct MorganLoader {
    descriptor: Arc<SourceDescriptor>,
    http: SourceHttp,
    base_url: String,
}

impl MorganLoader {
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
        let descriptor = table_descriptor("morgan")?;
        Ok(Self {
            http: SourceHttp::new(&descriptor)?,
            descriptor,
            base_url: normalize_base_url(base_url),
        })
    }

    /// Thumbnail listing URL for a collection URL.
    #[must_use]
    pub fn listing_url(&self, url: &str) -> Option<String> {
        let caps = COLLECTION_RE.captures(url)?;
        let slug = caps.get(1)?.as_str();
        if slug.eq_ignore_ascii_case("thumbs") {
            return None;
        }
        Some(match caps.get(2) {
            Some(object) => format!("{}/collection/{slug}/{}/thumbs", self.base_url, object.as_str()),
            None => format!("{}/collection/{slug}/thumbs", self.base_url),
        })
    }

    fn image_url(&self, reference: &str) -> String {
        format!("{}/sites/default/files/facsimile/{reference}.jpg", self.base_url)
    }
}

impl std::fmt::Debug for MorganLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MorganLoader")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Loader for MorganLoader {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    #[tracing::instrument(skip(self, ctx), fields(source_id = "morgan", url = %request.raw_url))]
    async fn load(
        &self,
        request: &ManifestRequest,
        ctx: &ResolveContext,
    ) -> Result<CanonicalManifest, ResolveError> {
        let listing = self
            .listing_url(&request.raw_url)
            .ok_or_else(|| ResolveError::parse("morgan", &request.raw_url, "no collection slug in URL"))?;

        let first_page = self.http.get_text(&listing, ctx).await?;
        let claimed = first_capture(&first_page, &PAGE_COUNT_RE).and_then(|n| n.parse().ok());

        let http = &self.http;
        let listing_ref = listing.as_str();
        let references = walk_paginated(
            listing_ref,
            0,
            ctx,
            |page| {
                let cached = (page == 0).then(|| first_page.clone());
                async move {
                    match cached {
                        Some(body) => Ok(Some(body)),
                        None => {
                            http.get_text_optional(&format!("{listing_ref}?page={page}"), ctx)
                                .await
                        }
                    }
                }
            },
            extract_facsimiles,
        )
        .await?;
        debug!(facsimiles = references.len(), "walked Morgan listing");

        let mut builder = ManifestBuilder::new("morgan", display_name(&request.raw_url));
        let (_, warning) = reconcile_page_count(
            "morgan",
            claimed,
            references.len(),
            self.descriptor.capabilities().count_policy,
        );
        if let Some(warning) = warning {
            builder.warn(warning);
        }
        for reference in &references {
            let label = reference.rsplit('/').next().map(ToString::to_string);
            builder.push_page(ImageTarget::url(self.image_url(reference)), label);
        }
        builder
            .build()
            .map_err(|e| ResolveError::from_manifest(&e, "morgan", &request.raw_url))
    }
}

/// Extracts `{bbid}/{id}` facsimile references in document order.
#[must_use]
pub fn extract_facsimiles(html: &str) -> Vec<String> {
    FACSIMILE_RE
        .captures_iter(html)
        .map(|caps| format!("{}/{}", &caps[1], &caps[2]))
        .collect()
}

fn display_name(url: &str) -> String {
    let slug = first_capture(url, &COLLECTION_RE).unwrap_or_default();
    slug.split('-')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            chars
                .next()
                .map(|first| first.to_uppercase().chain(chars).collect::<String>())
                .unwrap_or_default()
        })
        .collect::<Vec<_>>()
        .join(" ")
}
