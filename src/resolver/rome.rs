//! Biblioteca Nazionale Centrale di Roma loader.
//!
//! Page images follow a fixed `/img/.../{page}/original` template, so the
//! page set is discovered by checking that template: doubling until a page is
//! missing, then bisecting. The viewer page only contributes the title and a
//! page-count claim, which is cross-checked against the discovered count.

use std::future::Future;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

use crate::manifest::{CanonicalManifest, ImageTarget, ManifestBuilder};
use crate::source::{CountPolicy, SourceDescriptor};

use super::http_client::SourceHttp;
use super::utils::{
    compile_static_regex, decode_html_entities, first_capture, normalize_base_url,
    reconcile_page_count, table_descriptor,
};
use super::{Loader, ManifestRequest, ResolveContext, ResolveError};

const DEFAULT_BASE_URL: &str = "http://digitale.bnc.roma.sbn.it";

/// Upper bound on pages per manuscript, for discovery and for metadata claims.
pub const MAX_PAGES: u32 = 5000;

static ITEM_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r"/(manoscrittoantico|libroantico)/([^/?#]+)/([^/?#]+)/(\d+)")
});
static PAGE_COUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"(?i)\b(?:totalPages|numPages|pageCount)['"]?\s*[:=]\s*['"]?(\d+)"#)
});
static TITLE_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"(?is)<title>\s*(.*?)\s*</title>"));

/// Collection and shelfmark parsed from a viewer URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomeItem {
    /// `manoscrittoantico` or `libroantico`.
    pub collection: String,
    /// Manuscript identifier, repeated twice in every path.
    pub manuscript_id: String,
}

impl RomeItem {
    /// Parses a viewer URL.
    ///
    /// # Errors
    ///
    /// Returns a reason when the URL has no item path or the two id segments differ.
    pub fn parse(url: &str) -> Result<Self, String> {
        let caps = ITEM_RE
            .captures(url)
            .ok_or_else(|| "URL has no /{collection}/{id}/{id}/{page} path".to_string())?;
        if caps[2] != caps[3] {
            return Err(format!("inconsistent manuscript id ({} vs {})", &caps[2], &caps[3]));
        }
        Ok(Self {
            collection: caps[1].to_string(),
            manuscript_id: caps[2].to_string(),
        })
    }
}

/// Loader for the BNCR `tecadigitale` viewer.
pub struct RomeLoader {
    descriptor: Arc<SourceDescriptor>,
    http: SourceHttp,
    base_url: String,
}

impl RomeLoader {
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
        let descriptor = table_descriptor("rome")?;
        Ok(Self {
            http: SourceHttp::new(&descriptor)?,
            descriptor,
            base_url: normalize_base_url(base_url),
        })
    }

    fn viewer_url(&self, item: &RomeItem) -> String {
        format!(
            "{}/tecadigitale/{}/{id}/{id}/1",
            self.base_url,
            item.collection,
            id = item.manuscript_id
        )
    }

    fn image_url(&self, item: &RomeItem, page: u32) -> String {
        format!(
            "{}/tecadigitale/img/{}/{id}/{id}/{page}/original",
            self.base_url,
            item.collection,
            id = item.manuscript_id
        )
    }
}

impl std::fmt::Debug for RomeLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RomeLoader")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Loader for RomeLoader {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    #[tracing::instrument(skip(self, ctx), fields(source_id = "rome", url = %request.raw_url))]
    async fn load(
        &self,
        request: &ManifestRequest,
        ctx: &ResolveContext,
    ) -> Result<CanonicalManifest, ResolveError> {
        let item = RomeItem::parse(&request.raw_url)
            .map_err(|reason| ResolveError::parse("rome", &request.raw_url, reason))?;

        let viewer = match self.http.get_text(&self.viewer_url(&item), ctx).await {
            Ok(html) => scrape_viewer(&html),
            Err(error @ ResolveError::Cancelled { .. }) => return Err(error),
            Err(error) => {
                debug!(%error, "viewer page unavailable; relying on image checks alone");
                ScrapedViewer::default()
            }
        };

        let http = &self.http;
        let discovered = discover_page_count(MAX_PAGES, |page| {
            let url = self.image_url(&item, page);
            async move { http.exists(&url, ctx).await }
        })
        .await?;
        debug!(discovered, claimed = ?viewer.claimed_count, "page discovery finished");

        let mut builder = ManifestBuilder::new(
            "rome",
            viewer
                .title
                .clone()
                .unwrap_or_else(|| format!("Rome National Library - {}", item.manuscript_id)),
        );
        let pages = viewer.page_numbers(
            self.descriptor.capabilities().count_policy,
            discovered,
            &mut builder,
        );
        for page in pages {
            builder.push_page(ImageTarget::url(self.image_url(&item, page)), Some(page.to_string()));
        }
        builder
            .build()
            .map_err(|e| ResolveError::from_manifest(&e, "rome", &request.raw_url))
    }
}

/// Finds the highest page `n <= max` for which `exists(n)` holds, assuming
/// pages are contiguous from 1. Returns 0 when page 1 is missing.
///
/// Doubles from 1 until a check misses, then bisects between the last hit
/// and the first miss, so a manuscript of `n` pages costs about `2 log2 n`
/// requests.
///
/// # Errors
///
/// The first error returned by `exists`.
pub async fn discover_page_count<F, Fut>(max: u32, mut exists: F) -> Result<u32, ResolveError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<bool, ResolveError>>,
{
    if max == 0 || !exists(1).await? {
        return Ok(0);
    }
    let mut low: u32 = 1;
    let mut high = loop {
        let next = low.saturating_mul(2).min(max);
        if next == low {
            return Ok(low);
        }
        if exists(next).await? {
            low = next;
        } else {
            break next;
        }
    };
    while high - low > 1 {
        let mid = low + (high - low) / 2;
        if exists(mid).await? {
            low = mid;
        } else {
            high = mid;
        }
    }
    Ok(low)
}

/// What the viewer page reveals about the manuscript.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrapedViewer {
    /// Page count claimed by the viewer script, when present.
    pub claimed_count: Option<usize>,
    /// Page title, when present.
    pub title: Option<String>,
}

impl ScrapedViewer {
    /// Chooses the page numbers to synthesize from the discovered count and the
    /// viewer's claim. Counts above [`MAX_PAGES`] are clamped.
    pub fn page_numbers(
        &self,
        policy: CountPolicy,
        discovered: u32,
        builder: &mut ManifestBuilder,
    ) -> Vec<u32> {
        let limit = MAX_PAGES as usize;
        let claimed = self.claimed_count.map(|claimed| {
            if claimed > limit {
                warn!(claimed, limit, "viewer page count exceeds limit; clamping");
                builder.warn(format!(
                    "viewer claims {claimed} pages; only the first {limit} are considered"
                ));
            }
            claimed.min(limit)
        });
        let (count, warning) = reconcile_page_count("rome", claimed, discovered as usize, policy);
        if let Some(warning) = warning {
            builder.warn(warning);
        }
        let count = u32::try_from(count.min(limit)).unwrap_or(MAX_PAGES);
        (1..=count).collect()
    }
}

/// Extracts the claimed page count and title from viewer HTML.
#[must_use]
pub fn scrape_viewer(html: &str) -> ScrapedViewer {
    ScrapedViewer {
        claimed_count: first_capture(html, &PAGE_COUNT_RE).and_then(|n| n.parse().ok()),
        title: first_capture(html, &TITLE_RE).map(|t| decode_html_entities(&t)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn item() -> RomeItem {
        RomeItem::parse(
            "http://digitale.bnc.roma.sbn.it/tecadigitale/manoscrittoantico/BNCR_Ms_SESS_0062/BNCR_Ms_SESS_0062/1",
        )
        .unwrap()
    }

    /// Viewer markup with prev/next navigation links and a page-count claim.
    fn viewer_html(claim: &str) -> String {
        format!(
            r#"<html><head><title>Sessoriano 62 &amp; c.</title></head><body>
<script>{claim}</script>
<a class="prev" href="/tecadigitale/manoscrittoantico/BNCR_Ms_SESS_0062/BNCR_Ms_SESS_0062/1">&lt;</a>
<a class="next" href="/tecadigitale/manoscrittoantico/BNCR_Ms_SESS_0062/BNCR_Ms_SESS_0062/2">&gt;</a>
</body></html>"#
        )
    }

    async fn count_with(pages: u32, max: u32) -> (u32, usize) {
        let checks = Cell::new(0usize);
        let found = discover_page_count(max, |n| {
            checks.set(checks.get() + 1);
            async move { Ok(n <= pages) }
        })
        .await
        .unwrap();
        (found, checks.get())
    }

    #[test]
    fn test_parse_item() {
        let item = item();
        assert_eq!(item.collection, "manoscrittoantico");
        assert_eq!(item.manuscript_id, "BNCR_Ms_SESS_0062");
    }

    #[test]
    fn test_parse_item_inconsistent_ids() {
        assert!(RomeItem::parse("http://x/tecadigitale/libroantico/A/B/1").is_err());
    }

    #[test]
    fn test_scrape_viewer_claim_forms() {
        for claim in [
            "var totalPages = 300;",
            "var viewer = { totalPages: 300 };",
            r#"{"pageCount": "300"}"#,
        ] {
            let scraped = scrape_viewer(&viewer_html(claim));
            assert_eq!(scraped.claimed_count, Some(300), "{claim}");
            assert_eq!(scraped.title.as_deref(), Some("Sessoriano 62 & c."));
        }
    }

    #[test]
    fn test_navigation_links_do_not_limit_pages() {
        let scraped = scrape_viewer(&viewer_html("var totalPages = 300;"));
        let mut builder = ManifestBuilder::new("rome", "x");
        let pages = scraped.page_numbers(CountPolicy::PreferEnumerated, 300, &mut builder);
        assert_eq!(pages.len(), 300);
        assert_eq!(pages.first(), Some(&1));
        assert_eq!(pages.last(), Some(&300));
    }

    #[test]
    fn test_discovered_count_wins_over_stale_claim() {
        let scraped = scrape_viewer(&viewer_html("var totalPages = 40;"));
        let mut builder = ManifestBuilder::new("rome", "x");
        let pages = scraped.page_numbers(CountPolicy::PreferEnumerated, 37, &mut builder);
        assert_eq!(pages.len(), 37);
        builder.push_page(ImageTarget::url("u"), None);
        assert_eq!(builder.build().unwrap().warnings().len(), 1);
    }

    #[test]
    fn test_huge_claim_is_clamped() {
        let scraped = scrape_viewer(&viewer_html("totalPages: 4000000000"));
        assert_eq!(scraped.claimed_count, Some(4_000_000_000));
        let mut builder = ManifestBuilder::new("rome", "x");
        let pages = scraped.page_numbers(CountPolicy::PreferEnumerated, 0, &mut builder);
        assert_eq!(pages.len(), MAX_PAGES as usize);
    }

    #[test]
    fn test_nothing_found_yields_no_pages() {
        let scraped = scrape_viewer("<html>maintenance</html>");
        let mut builder = ManifestBuilder::new("rome", "x");
        assert!(scraped.page_numbers(CountPolicy::PreferEnumerated, 0, &mut builder).is_empty());
    }

    #[tokio::test]
    async fn test_discover_page_count() {
        assert_eq!(count_with(0, MAX_PAGES).await.0, 0);
        assert_eq!(count_with(1, MAX_PAGES).await.0, 1);
        assert_eq!(count_with(256, MAX_PAGES).await.0, 256);
        let (found, checks) = count_with(300, MAX_PAGES).await;
        assert_eq!(found, 300);
        assert!(checks <= 20, "{checks} requests");
    }

    #[tokio::test]
    async fn test_discover_page_count_stops_at_limit() {
        assert_eq!(count_with(u32::MAX, 100).await.0, 100);
        assert_eq!(count_with(100, 100).await.0, 100);
        assert_eq!(count_with(99, 100).await.0, 99);
    }

    #[tokio::test]
    async fn test_discover_page_count_propagates_errors() {
        let err = discover_page_count(10, |n| async move {
            if n == 1 {
                Ok(true)
            } else {
                Err(ResolveError::network("u", "HTTP 503"))
            }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ResolveError::Network { .. }));
    }

    #[test]
    fn test_image_url_template() {
        let loader = RomeLoader::with_base_url("http://127.0.0.1:9").unwrap();
        assert_eq!(
            loader.image_url(&item(), 7),
            "http://127.0.0.1:9/tecadigitale/img/manoscrittoantico/BNCR_Ms_SESS_0062/BNCR_Ms_SESS_0062/7/original"
        );
    }
}
