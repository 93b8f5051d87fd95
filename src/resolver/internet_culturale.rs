//! Internet Culturale loader.
//!
//! Viewer URLs carry an OAI identifier (`id=`) and the holding institution
//! (`teca=`). The `magparser` endpoint returns MAG XML listing every page;
//! `cacheman/web/` paths are the viewer-sized derivatives and are rewritten
//! to `cacheman/normal/` for full resolution.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::manifest::{CanonicalManifest, ImageTarget, ManifestBuilder};
use crate::source::SourceDescriptor;

use super::http_client::SourceHttp;
use super::utils::{
    compile_static_regex, decode_html_entities, first_capture, normalize_base_url, table_descriptor,
};
use super::{Loader, ManifestRequest, ResolveContext, ResolveError};

const DEFAULT_BASE_URL: &str = "https://www.internetculturale.it";

static OAI_ID_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"[?&]id=([^&#]+)"));
static TECA_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"[?&]teca=([^&#]+)"));
static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"(?s)<info key="Titolo">\s*<value>(.*?)</value>"#));
static PAGE_SRC_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#"<page[^>]+src="([^"]+)"[^>]*>"#));
/// Fallback for MAG variants that carry image paths outside `<page src>`.
static CACHEMAN_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r#""([^"]*cacheman[^"]*\.jpe?g)""#));

/// Loader for `internetculturale.it` viewer URLs.
pub struct InternetCulturaleLoader {
    descriptor: Arc<SourceDescriptor>,
    http: SourceHttp,
    base_url: String,
}

impl InternetCulturaleLoader {
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
        let descriptor = table_descriptor("internet-culturale")?;
        Ok(Self {
            http: SourceHttp::new(&descriptor)?,
            descriptor,
            base_url: normalize_base_url(base_url),
        })
    }

    fn magparser_url(&self, oai_id: &str, teca: &str) -> String {
        format!(
            "{}/jmms/magparser?id={}&teca={}&mode=all&fulltext=0",
            self.base_url,
            urlencoding::encode(oai_id),
            urlencoding::encode(teca)
        )
    }
}

impl std::fmt::Debug for InternetCulturaleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternetCulturaleLoader")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Loader for InternetCulturaleLoader {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    #[tracing::instrument(skip(self, ctx), fields(source_id = "internet-culturale", url = %request.raw_url))]
    async fn load(
        &self,
        request: &ManifestRequest,
        ctx: &ResolveContext,
    ) -> Result<CanonicalManifest, ResolveError> {
        let url = &request.raw_url;
        let oai_id = first_capture(url, &OAI_ID_RE)
            .map(|raw| percent_decode(&raw))
            .ok_or_else(|| ResolveError::parse("internet-culturale", url, "no OAI identifier in URL"))?;
        let teca = first_capture(url, &TECA_RE).map(|raw| percent_decode(&raw));

        let api_url = self.magparser_url(&oai_id, teca.as_deref().unwrap_or_default());
        let xml = self
            .http
            .get_text_with_headers(
                &api_url,
                &[
                    ("Accept", "text/xml, application/xml, */*; q=0.01"),
                    ("Referer", url.as_str()),
                    ("X-Requested-With", "XMLHttpRequest"),
                ],
                ctx,
            )
            .await?;
        if xml.trim().is_empty() {
            return Err(ResolveError::parse("internet-culturale", &api_url, "empty magparser response"));
        }

        let title = first_capture(&xml, &TITLE_RE)
            .map(|t| decode_html_entities(&t))
            .unwrap_or_else(|| oai_id.rsplit(':').next().unwrap_or(&oai_id).to_string());
        let display_name = match &teca {
            Some(teca) => format!("{title} ({teca})"),
            None => title,
        };

        let mut builder = ManifestBuilder::new("internet-culturale", display_name);
        for image in extract_page_urls(&xml, &format!("{}/jmms/", self.base_url)) {
            builder.push_page(ImageTarget::url(image), None);
        }
        debug!(pages = builder.page_count(), "parsed magparser XML");
        builder
            .build()
            .map_err(|e| ResolveError::from_manifest(&e, "internet-culturale", url))
    }
}

/// Extracts full-resolution page image URLs from magparser XML, first-seen order.
#[must_use]
pub fn extract_page_urls(xml: &str, jmms_base: &str) -> Vec<String> {
    let mut candidates: Vec<String> = PAGE_SRC_RE
        .captures_iter(xml)
        .map(|caps| caps[1].to_string())
        .collect();
    if candidates.is_empty() {
        candidates = CACHEMAN_RE
            .captures_iter(xml)
            .map(|caps| caps[1].to_string())
            .collect();
    }

    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|path| {
            let lower = path.to_ascii_lowercase();
            lower.contains(".jpg") || lower.contains(".jpeg")
        })
        .map(|path| {
            let path = decode_html_entities(&path).replace("cacheman/web/", "cacheman/normal/");
            if path.starts_with("http://") || path.starts_with("https://") {
                path
            } else {
                format!("{jmms_base}{}", path.trim_start_matches('/'))
            }
        })
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

fn percent_decode(raw: &str) -> String {
    urlencoding::decode(raw).map_or_else(|_| raw.to_string(), |s| s.into_owned())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const MAG: &str = r#"<?xml version="1.0"?>
<magparser>
  <bibinfo><info key="Titolo"> <value>Commedia</value></info></bibinfo>
  <pages>
    <page name="c. 1r" src="cacheman/web/Marciana/IT-VE0049/1/1.jpg" />
    <page name="c. 1v" src="cacheman/web/Marciana/IT-VE0049/1/2.jpg" />
    <page name="c. 1v" src="cacheman/web/Marciana/IT-VE0049/1/2.jpg" />
    <page name="c. 2r" src="https://cdn.example/cacheman/web/3.jpg" />
  </pages>
</magparser>"#;

    #[test]
    fn test_extract_page_urls_rewrites_and_dedups() {
        let urls = extract_page_urls(MAG, "https://www.internetculturale.it/jmms/");
        assert_eq!(
            urls,
            vec![
                "https://www.internetculturale.it/jmms/cacheman/normal/Marciana/IT-VE0049/1/1.jpg",
                "https://www.internetculturale.it/jmms/cacheman/normal/Marciana/IT-VE0049/1/2.jpg",
                "https://cdn.example/cacheman/normal/3.jpg",
            ]
        );
    }

    #[test]
    fn test_extract_page_urls_fallback_pattern() {
        let xml = r#"<img url="cacheman/web/a/1.jpg"/><img url="cacheman/web/a/2.jpg"/>"#;
        assert_eq!(extract_page_urls(xml, "https://x/jmms/").len(), 2);
    }

    #[test]
    fn test_extract_page_urls_none() {
        assert!(extract_page_urls("<magparser/>", "https://x/jmms/").is_empty());
    }

    #[test]
    fn test_magparser_url_encodes_params() {
        let loader = InternetCulturaleLoader::with_base_url("http://127.0.0.1:9").unwrap();
        assert_eq!(
            loader.magparser_url("oai:193.206.197.121:18:VE0049:CSTOR.240.8290", "marciana"),
            "http://127.0.0.1:9/jmms/magparser?id=oai%3A193.206.197.121%3A18%3AVE0049%3ACSTOR.240.8290&teca=marciana&mode=all&fulltext=0"
        );
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("oai%3Aabc"), "oai:abc");
    }
}
