//! Biblioteca Digitale Lombarda loader.
//!
//! BDL has no IIIF manifests. Its bookreader JSON API lists one entry per
//! page view, and the same media id can appear several times (recto shown on
//! two spreads). Each distinct `idMediaServer` becomes one page served by the
//! library's Cantaloupe IIIF image server; the largest size is discovered at
//! download time through `info.json`.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::manifest::{CanonicalManifest, ImageTarget, ManifestBuilder};
use crate::source::SourceDescriptor;

use super::http_client::SourceHttp;
use super::utils::{compile_static_regex, first_capture, normalize_base_url, table_descriptor};
use super::{Loader, ManifestRequest, ResolveContext, ResolveError};

const DEFAULT_BASE_URL: &str = "https://www.bdl.servizirl.it";

static OBJECT_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?:BDL-OGGETTO-|cdOggetto=)(\d+)"));
static LIBRARY_PATH_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"(?i)[?&]path=([a-z]+)"));

/// Loader for BDL bookreader and catalog URLs.
pub struct BdlLoader {
    descriptor: Arc<SourceDescriptor>,
    http: SourceHttp,
    base_url: String,
}

impl BdlLoader {
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
        let descriptor = table_descriptor("bdl")?;
        Ok(Self {
            http: SourceHttp::new(&descriptor)?,
            descriptor,
            base_url: normalize_base_url(base_url),
        })
    }

    fn pages_api_url(&self, object_id: &str) -> String {
        format!("{}/bdl/public/rest/json/item/{object_id}/bookreader/pages", self.base_url)
    }

    fn default_image_server(&self) -> String {
        format!("{}/cantaloupe/", self.base_url)
    }
}

impl std::fmt::Debug for BdlLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BdlLoader")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Loader for BdlLoader {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    #[tracing::instrument(skip(self, ctx), fields(source_id = "bdl", url = %request.raw_url))]
    async fn load(
        &self,
        request: &ManifestRequest,
        ctx: &ResolveContext,
    ) -> Result<CanonicalManifest, ResolveError> {
        let url = &request.raw_url;
        let object_id = first_capture(url, &OBJECT_ID_RE)
            .ok_or_else(|| ResolveError::parse("bdl", url, "no object id in URL"))?;
        let api_url = self.pages_api_url(&object_id);
        let pages = self.http.get_json(&api_url, ctx).await?;

        let mut builder = ManifestBuilder::new("bdl", display_name(url, &object_id));
        extract_pages(&pages, &self.default_image_server(), &mut builder)
            .map_err(|reason| ResolveError::parse("bdl", &api_url, reason))?;
        builder
            .build()
            .map_err(|e| ResolveError::from_manifest(&e, "bdl", url))
    }
}

/// Pushes one page per distinct media id. Entries without a media id are
/// skipped with a warning.
///
/// # Errors
///
/// Returns a reason when the payload is not a JSON array.
pub fn extract_pages(
    pages: &Value,
    default_image_server: &str,
    builder: &mut ManifestBuilder,
) -> Result<(), String> {
    let entries = pages
        .as_array()
        .ok_or_else(|| "bookreader API did not return an array".to_string())?;

    let mut seen = HashSet::new();
    let mut duplicates = 0usize;
    for (position, entry) in entries.iter().enumerate() {
        let Some(media_id) = media_id(entry) else {
            builder.warn(format!("page entry {} has no media id; skipped", position + 1));
            continue;
        };
        if !seen.insert(media_id.clone()) {
            duplicates += 1;
            continue;
        }
        let server = entry
            .get("cantaloupeUrl")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(default_image_server);
        let server = server.trim_end_matches('/');
        let label = entry
            .get("label")
            .or_else(|| entry.get("nomeFile"))
            .and_then(Value::as_str)
            .map(ToString::to_string);
        builder.push_page(ImageTarget::iiif_service(format!("{server}/iiif/2/{media_id}")), label);
    }

    debug!(entries = entries.len(), duplicates, pages = builder.page_count(), "extracted BDL pages");
    Ok(())
}

fn media_id(entry: &Value) -> Option<String> {
    match entry.get("idMediaServer")? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn display_name(url: &str, object_id: &str) -> String {
    match first_capture(url, &LIBRARY_PATH_RE) {
        Some(code) => format!("BDL {} {object_id}", code.to_ascii_uppercase()),
        None => format!("BDL {object_id}"),
    }
}
