//! Shared utilities for loaders: static regexes, identifier enumeration,
//! page-count reconciliation, and paginated listing walks.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, warn};
use url::Url;

use crate::source::{self, CountPolicy, SourceDescriptor};

use super::{ResolveContext, ResolveError};

/// Compiles a regex at static init; panics on invalid pattern.
pub fn compile_static_regex(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid static regex '{pattern}': {e}"))
}

/// Fetches a descriptor from the source table for a loader constructor.
pub(crate) fn table_descriptor(id: &str) -> Result<Arc<SourceDescriptor>, ResolveError> {
    source::lookup(id).ok_or_else(|| ResolveError::Client {
        source_id: id.to_string(),
        reason: "source is missing from the descriptor table".to_string(),
    })
}

/// Trims a trailing slash so base URLs can be joined with `format!`.
pub(crate) fn normalize_base_url(base_url: impl Into<String>) -> String {
    base_url.into().trim_end_matches('/').to_string()
}

/// Resolves a possibly relative URL string against a base URL.
///
/// Returns the value as-is if it already starts with `http://` or `https://`;
/// normalizes `//...` to `https:...`; otherwise joins with `base_url`.
#[must_use]
pub fn absolutize_url(value: &str, base_url: &Url) -> Option<String> {
    if value.starts_with("http://") || value.starts_with("https://") {
        return Some(value.to_string());
    }
    if value.starts_with("//") {
        return Some(format!("https:{value}"));
    }
    base_url.join(value).ok().map(|url| url.to_string())
}

/// Returns the first capture group of `regex` in `text`, trimmed.
#[must_use]
pub fn first_capture(text: &str, regex: &Regex) -> Option<String> {
    regex
        .captures(text)
        .and_then(|caps| caps.get(1).map(|m| m.as_str().trim().to_string()))
        .filter(|value| !value.is_empty())
}

/// Returns every distinct capture-group-1 value in document order.
#[must_use]
pub fn unique_captures(text: &str, regex: &Regex) -> Vec<String> {
    let mut seen = HashSet::new();
    regex
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .filter(|value| seen.insert(value.clone()))
        .collect()
}

/// Decodes the handful of HTML entities that show up in catalog titles.
#[must_use]
pub fn decode_html_entities(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#039;", "'")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// Chooses a page count when scraped metadata and enumerated identifiers disagree.
///
/// Under [`CountPolicy::PreferEnumerated`] the enumerated count wins whenever it
/// is non-zero; metadata only fills in when enumeration found nothing. Under
/// [`CountPolicy::PreferMetadata`] a present, non-zero claim wins. Every
/// disagreement is logged and returned as a warning for the manifest.
#[must_use]
pub fn reconcile_page_count(
    source_id: &str,
    claimed: Option<usize>,
    enumerated: usize,
    policy: CountPolicy,
) -> (usize, Option<String>) {
    let Some(claimed) = claimed.filter(|c| *c > 0) else {
        return (enumerated, None);
    };
    if claimed == enumerated {
        return (enumerated, None);
    }

    let chosen = match policy {
        CountPolicy::PreferEnumerated if enumerated > 0 => enumerated,
        CountPolicy::PreferEnumerated | CountPolicy::PreferMetadata => claimed,
    };
    warn!(
        source_id,
        claimed,
        enumerated,
        chosen,
        "page-count metadata disagrees with enumerated identifiers"
    );
    (
        chosen,
        Some(format!(
            "page count metadata says {claimed} but {enumerated} page identifiers were found; using {chosen}"
        )),
    )
}

/// Walks a paginated listing until a pass yields no new identifiers.
///
/// `fetch(page)` returns the body of listing page `page` (starting at
/// `first_page`), or `None` when the listing has no such page. `extract`
/// pulls identifiers from one body. The walk stops on the first pass that
/// adds nothing new, on a missing page, or after `ctx.max_listing_pages`.
/// Identifiers keep first-seen order.
///
/// # Errors
///
/// Propagates fetch errors except on pages after the first, where a failure
/// ends the walk with what was collected so far. Returns
/// [`ResolveError::Cancelled`] when the context is cancelled between pages.
pub async fn walk_paginated<F, Fut, E>(
    listing_url: &str,
    first_page: usize,
    ctx: &ResolveContext,
    mut fetch: F,
    extract: E,
) -> Result<Vec<String>, ResolveError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<Option<String>, ResolveError>>,
    E: Fn(&str) -> Vec<String>,
{
    let mut seen = HashSet::new();
    let mut ordered = Vec::new();

    for page in first_page..first_page + ctx.max_listing_pages {
        if ctx.cancel.is_cancelled() {
            return Err(ResolveError::cancelled(listing_url));
        }

        let body = match fetch(page).await {
            Ok(Some(body)) => body,
            Ok(None) => break,
            Err(error @ (ResolveError::Cancelled { .. } | ResolveError::GeoBlocked { .. })) => {
                return Err(error);
            }
            Err(error) if page == first_page => return Err(error),
            Err(error) => {
                warn!(page, error = %error, "listing page failed; keeping identifiers found so far");
                break;
            }
        };

        let mut added = 0usize;
        for id in extract(&body) {
            if seen.insert(id.clone()) {
                ordered.push(id);
                added += 1;
            }
        }
        debug!(page, added, total = ordered.len(), "walked listing page");
        if added == 0 {
            break;
        }
    }

    Ok(ordered)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::LazyLock;

    static DIGITS_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"id-(\d+)"));

    #[test]
    fn test_absolutize_url_variants() {
        let base = Url::parse("https://www.themorgan.org/collection/x/thumbs").unwrap();
        assert_eq!(
            absolutize_url("/sites/a.jpg", &base).unwrap(),
            "https://www.themorgan.org/sites/a.jpg"
        );
        assert_eq!(
            absolutize_url("//cdn.example/a.jpg", &base).unwrap(),
            "https://cdn.example/a.jpg"
        );
        assert_eq!(
            absolutize_url("http://other/a.jpg", &base).unwrap(),
            "http://other/a.jpg"
        );
    }

    #[test]
    fn test_unique_captures_keeps_first_seen_order() {
        let ids = unique_captures("id-3 id-1 id-3 id-2 id-1", &DIGITS_RE);
        assert_eq!(ids, vec!["3", "1", "2"]);
    }

    #[test]
    fn test_first_capture_ignores_blank() {
        let re = compile_static_regex(r"<t>(.*?)</t>");
        assert_eq!(first_capture("<t>  </t>", &re), None);
        assert_eq!(first_capture("<t> Codex </t>", &re).as_deref(), Some("Codex"));
    }

    #[test]
    fn test_decode_html_entities() {
        assert_eq!(decode_html_entities("Tom &amp; Jerry &quot;x&quot;"), "Tom & Jerry \"x\"");
        assert_eq!(decode_html_entities("&amp;lt;"), "&lt;");
    }

    #[test]
    fn test_reconcile_enumerated_wins_on_mismatch() {
        let (count, warning) = reconcile_page_count("rome", Some(120), 118, CountPolicy::PreferEnumerated);
        assert_eq!(count, 118);
        assert!(warning.unwrap().contains("120"));
    }

    #[test]
    fn test_reconcile_metadata_fills_when_nothing_enumerated() {
        let (count, warning) = reconcile_page_count("rome", Some(40), 0, CountPolicy::PreferEnumerated);
        assert_eq!(count, 40);
        assert!(warning.is_some());
    }

    #[test]
    fn test_reconcile_prefer_metadata_policy() {
        let (count, _) = reconcile_page_count("x", Some(50), 45, CountPolicy::PreferMetadata);
        assert_eq!(count, 50);
    }

    #[test]
    fn test_reconcile_agreement_and_missing_claim() {
        assert_eq!(
            reconcile_page_count("x", Some(7), 7, CountPolicy::PreferEnumerated),
            (7, None)
        );
        assert_eq!(
            reconcile_page_count("x", None, 9, CountPolicy::PreferEnumerated),
            (9, None)
        );
        assert_eq!(
            reconcile_page_count("x", Some(0), 0, CountPolicy::PreferEnumerated),
            (0, None)
        );
    }

    #[tokio::test]
    async fn test_walk_paginated_stops_when_pass_adds_nothing() {
        let pages = ["id-1 id-2", "id-3", "id-3 id-1", "id-99"];
        let ctx = ResolveContext::default();
        let mut calls = 0usize;
        let ids = walk_paginated(
            "https://listing",
            0,
            &ctx,
            |page| {
                calls += 1;
                let body = pages.get(page).map(|s| (*s).to_string());
                async move { Ok(body) }
            },
            |body| unique_captures(body, &DIGITS_RE),
        )
        .await
        .unwrap();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(calls, 3, "third pass added nothing and must end the walk");
    }

    #[tokio::test]
    async fn test_walk_paginated_respects_page_cap() {
        let ctx = ResolveContext {
            max_listing_pages: 4,
            ..ResolveContext::default()
        };
        let ids = walk_paginated(
            "https://listing",
            1,
            &ctx,
            |page| async move { Ok(Some(format!("id-{page}"))) },
            |body| unique_captures(body, &DIGITS_RE),
        )
        .await
        .unwrap();
        assert_eq!(ids, vec!["1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_walk_paginated_first_page_error_propagates() {
        let ctx = ResolveContext::default();
        let result = walk_paginated(
            "https://listing",
            0,
            &ctx,
            |_| async { Err(ResolveError::http_status("https://listing", 500)) },
            |body| unique_captures(body, &DIGITS_RE),
        )
        .await;
        assert!(matches!(result, Err(ResolveError::Network { .. })));
    }

    #[tokio::test]
    async fn test_walk_paginated_later_error_keeps_partial() {
        let ctx = ResolveContext::default();
        let ids = walk_paginated(
            "https://listing",
            0,
            &ctx,
            |page| async move {
                if page == 0 {
                    Ok(Some("id-5".to_string()))
                } else {
                    Err(ResolveError::http_status("https://listing", 500))
                }
            },
            |body| unique_captures(body, &DIGITS_RE),
        )
        .await
        .unwrap();
        assert_eq!(ids, vec!["5"]);
    }

    #[tokio::test]
    async fn test_walk_paginated_cancelled() {
        let ctx = ResolveContext::default();
        ctx.cancel.cancel();
        let result = walk_paginated(
            "https://listing",
            0,
            &ctx,
            |_| async { Ok(Some("id-1".to_string())) },
            |body| unique_captures(body, &DIGITS_RE),
        )
        .await;
        assert!(matches!(result, Err(ResolveError::Cancelled { .. })));
    }
}
