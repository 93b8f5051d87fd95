//! IIIF Presentation manifest normalizer (v2 and v3).
//!
//! Detects the version by shape (`sequences` for v2, `items` for v3), emits
//! one page per canvas, and always asks for the largest image:
//!
//! 1. An image service on the canvas wins: `{service}/full/full/0/default.jpg`
//!    (v2) or `{service}/full/max/0/default.jpg` (Image API 3).
//! 2. Otherwise an advertised IIIF image URL has its size segment rewritten,
//!    leaving the rest of the string (percent-encoding included) untouched.
//! 3. Otherwise the canvas thumbnail, rewritten the same way.
//!
//! Canvases with none of the above are skipped with a manifest warning.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::manifest::{CanonicalManifest, ImageTarget, ManifestBuilder};
use crate::source::SourceDescriptor;

use super::http_client::SourceHttp;
use super::utils::{compile_static_regex, table_descriptor};
use super::{Loader, ManifestRequest, ResolveContext, ResolveError};

/// `{prefix}/{region}/{size}/{rotation}/{quality}.{format}[?query]`
static IIIF_IMAGE_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(
        r"^(?P<prefix>.+/)(?P<region>full|square|pct:[0-9.,]+|\d+,\d+,\d+,\d+)/(?P<size>[^/?#]+)/(?P<rotation>!?\d+(?:\.\d+)?)/(?P<quality>[A-Za-z]+)\.(?P<format>[A-Za-z0-9]+)(?P<query>\?[^#]*)?$",
    )
});

/// Presentation API generation of a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IiifVersion {
    /// Presentation 2.x (`sequences` / `canvases` / `images`).
    V2,
    /// Presentation 3.x (`items` / annotation pages / annotations).
    V3,
}

impl IiifVersion {
    /// Size keyword that requests the largest available image.
    fn full_size(self) -> &'static str {
        match self {
            Self::V2 => "full",
            Self::V3 => "max",
        }
    }
}

/// Detects the Presentation version from the manifest shape.
#[must_use]
pub fn detect_version(manifest: &Value) -> Option<IiifVersion> {
    if manifest.get("sequences").is_some_and(Value::is_array) {
        Some(IiifVersion::V2)
    } else if manifest.get("items").is_some_and(Value::is_array) {
        Some(IiifVersion::V3)
    } else {
        None
    }
}

/// Normalizes a IIIF manifest into a canonical manifest.
///
/// # Errors
///
/// Returns [`ResolveError::ManifestParse`] when the document is not a IIIF
/// manifest or yields no usable canvas.
pub fn normalize_manifest(
    manifest: &Value,
    source_id: &str,
    url: &str,
) -> Result<CanonicalManifest, ResolveError> {
    let Some(version) = detect_version(manifest) else {
        let reason = if manifest.get("manifests").is_some() || manifest.get("collections").is_some() {
            "document is a IIIF collection, not a manifest"
        } else {
            "document has neither `sequences` nor `items`"
        };
        return Err(ResolveError::parse(source_id, url, reason));
    };

    let mut builder = ManifestBuilder::new(source_id, manifest_title(manifest).unwrap_or_default());
    let canvases = canvases(manifest, version);
    if canvases.is_empty() {
        return Err(ResolveError::parse(source_id, url, "manifest lists no canvases"));
    }

    for (position, canvas) in canvases.iter().enumerate() {
        let label = canvas.get("label").and_then(label_text);
        match canvas_target(canvas, version) {
            Some(target) => {
                builder.push_page(target, label);
            }
            None => {
                builder.warn(format!(
                    "canvas {} ({}) has no image resource; skipped",
                    position + 1,
                    label.as_deref().unwrap_or("unlabelled")
                ));
            }
        }
    }

    debug!(
        source_id,
        version = ?version,
        canvases = canvases.len(),
        pages = builder.page_count(),
        "normalized IIIF manifest"
    );
    builder
        .build()
        .map_err(|e| ResolveError::from_manifest(&e, source_id, url))
}

/// Fetches `manifest_url` through `http` and normalizes it.
pub(crate) async fn load_manifest(
    http: &SourceHttp,
    source_id: &str,
    manifest_url: &str,
    ctx: &ResolveContext,
) -> Result<CanonicalManifest, ResolveError> {
    let json = http.get_json(manifest_url, ctx).await?;
    normalize_manifest(&json, source_id, manifest_url)
}

fn canvases(manifest: &Value, version: IiifVersion) -> Vec<&Value> {
    match version {
        IiifVersion::V2 => manifest
            .get("sequences")
            .and_then(Value::as_array)
            .and_then(|sequences| {
                sequences.iter().find_map(|sequence| {
                    sequence
                        .get("canvases")
                        .and_then(Value::as_array)
                        .filter(|c| !c.is_empty())
                })
            })
            .map(|c| c.iter().collect())
            .unwrap_or_default(),
        IiifVersion::V3 => manifest
            .get("items")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter(|item| item.get("type").and_then(Value::as_str).is_none_or(|t| t == "Canvas"))
                    .collect()
            })
            .unwrap_or_default(),
    }
}

fn canvas_target(canvas: &Value, version: IiifVersion) -> Option<ImageTarget> {
    let resource = match version {
        IiifVersion::V2 => canvas
            .get("images")
            .and_then(Value::as_array)
            .and_then(|images| images.first())
            .and_then(|annotation| annotation.get("resource")),
        IiifVersion::V3 => canvas
            .get("items")
            .and_then(Value::as_array)
            .and_then(|pages| pages.first())
            .and_then(|page| page.get("items"))
            .and_then(Value::as_array)
            .and_then(|annotations| annotations.first())
            .and_then(|annotation| annotation.get("body"))
            .map(first_of),
    };

    if let Some(resource) = resource {
        if let Some(url) = service_image_url(resource, version) {
            return Some(ImageTarget::url(url));
        }
        if let Some(id) = resource_id(resource) {
            return Some(ImageTarget::url(rewrite_to_full(&id, version)));
        }
    }

    canvas
        .get("thumbnail")
        .map(first_of)
        .and_then(|thumbnail| {
            service_image_url(thumbnail, version)
                .or_else(|| resource_id(thumbnail).map(|id| rewrite_to_full(&id, version)))
        })
        .map(ImageTarget::url)
}

/// Builds a full-size request from the first image service on `resource`.
fn service_image_url(resource: &Value, version: IiifVersion) -> Option<String> {
    let service = resource.get("service").map(first_of)?;
    let base = resource_id(service)?;
    let base = base.trim_end_matches('/');

    let service_type = service
        .get("type")
        .or_else(|| service.get("@type"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let profile = profile_text(service);

    if service_type == "ImageService3" || profile.contains("/image/3/") {
        return Some(format!("{base}/full/max/0/default.jpg"));
    }
    if profile.contains("/image/1/") {
        return Some(format!("{base}/full/full/0/native.jpg"));
    }
    let size = if service_type == "ImageService2" || profile.contains("/image/2/") {
        "full"
    } else {
        version.full_size()
    };
    Some(format!("{base}/full/{size}/0/default.jpg"))
}

/// Replaces the size segment of a IIIF Image API URL with the full-size
/// keyword. Non-IIIF URLs are returned unchanged.
#[must_use]
pub fn rewrite_to_full(url: &str, version: IiifVersion) -> String {
    let Some(caps) = IIIF_IMAGE_URL_RE.captures(url) else {
        return url.to_string();
    };
    let size = &caps["size"];
    if size == "full" || size == "max" {
        return url.to_string();
    }
    format!(
        "{}{}/{}/{}/{}.{}{}",
        &caps["prefix"],
        &caps["region"],
        version.full_size(),
        &caps["rotation"],
        &caps["quality"],
        &caps["format"],
        caps.name("query").map_or("", |m| m.as_str()),
    )
}

fn first_of(value: &Value) -> &Value {
    value.as_array().and_then(|a| a.first()).unwrap_or(value)
}

fn resource_id(value: &Value) -> Option<String> {
    let id = match value {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => map
            .get("@id")
            .or_else(|| map.get("id"))
            .and_then(Value::as_str),
        _ => None,
    }?;
    let id = id.trim();
    (!id.is_empty()).then(|| id.to_string())
}

fn profile_text(service: &Value) -> String {
    match service.get("profile") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

/// Extracts display text from a v2 label (string, `@value` object, array)
/// or a v3 language map, preferring English, then `none`.
#[must_use]
pub fn label_text(label: &Value) -> Option<String> {
    let text = match label {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.iter().find_map(label_text),
        Value::Object(map) => {
            if let Some(value) = map.get("@value") {
                label_text(value)
            } else {
                ["en", "none"]
                    .iter()
                    .find_map(|lang| map.get(*lang))
                    .or_else(|| map.values().next())
                    .and_then(label_text)
            }
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn manifest_title(manifest: &Value) -> Option<String> {
    if let Some(title) = manifest.get("label").and_then(label_text) {
        return Some(title);
    }
    manifest
        .get("metadata")
        .and_then(Value::as_array)?
        .iter()
        .find(|entry| {
            entry
                .get("label")
                .and_then(label_text)
                .is_some_and(|l| l.eq_ignore_ascii_case("title"))
        })
        .and_then(|entry| entry.get("value"))
        .and_then(label_text)
}

/// Generic loader for any URL that is itself a IIIF manifest.
#[derive(Debug)]
pub struct IiifLoader {
    descriptor: Arc<SourceDescriptor>,
    http: SourceHttp,
}

impl IiifLoader {
    /// Creates the generic loader from the `iiif` table entry.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Client`] if the HTTP client cannot be built.
    pub fn new() -> Result<Self, ResolveError> {
        let descriptor = table_descriptor("iiif")?;
        let http = SourceHttp::new(&descriptor)?;
        Ok(Self { descriptor, http })
    }
}

#[async_trait]
impl Loader for IiifLoader {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    #[tracing::instrument(skip(self, ctx), fields(url = %request.raw_url))]
    async fn load(
        &self,
        request: &ManifestRequest,
        ctx: &ResolveContext,
    ) -> Result<CanonicalManifest, ResolveError> {
        load_manifest(&self.http, self.descriptor.id(), &request.raw_url, ctx).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v2_canvas(id: &str, resource: Value) -> Value {
        json!({
            "@id": id,
            "@type": "sc:Canvas",
            "label": id,
            "images": [{ "@type": "oa:Annotation", "resource": resource }]
        })
    }

    #[test]
    fn test_detect_version() {
        assert_eq!(detect_version(&json!({"sequences": []})), Some(IiifVersion::V2));
        assert_eq!(detect_version(&json!({"items": []})), Some(IiifVersion::V3));
        assert_eq!(detect_version(&json!({"label": "x"})), None);
    }

    #[test]
    fn test_v2_prefers_service_over_resource() {
        let manifest = json!({
            "label": "Codex A",
            "sequences": [{ "canvases": [v2_canvas("c1", json!({
                "@id": "https://img.example/iiif/a/full/400,/0/default.jpg",
                "service": { "@id": "https://img.example/iiif/a/", "profile": "http://iiif.io/api/image/2/level1.json" }
            }))]}]
        });
        let manifest = normalize_manifest(&manifest, "iiif", "https://m").unwrap();
        assert_eq!(manifest.display_name(), "Codex A");
        assert_eq!(
            manifest.pages()[0].target,
            ImageTarget::url("https://img.example/iiif/a/full/full/0/default.jpg")
        );
    }

    #[test]
    fn test_v2_thumbnail_size_rewritten() {
        let manifest = json!({
            "sequences": [{ "canvases": [
                v2_canvas("c1", json!({"@id": "https://img.example/iiif/p1/full/200,/0/default.jpg"})),
                v2_canvas("c2", json!({"@id": "https://img.example/iiif/p2/full/!150,150/0/default.jpg"})),
                v2_canvas("c3", json!({"@id": "https://img.example/iiif/p3/full/pct:10/0/native.png?token=a"})),
            ]}]
        });
        let manifest = normalize_manifest(&manifest, "iiif", "https://m").unwrap();
        let urls: Vec<&str> = manifest.pages().iter().map(|p| p.target.locator()).collect();
        assert_eq!(
            urls,
            vec![
                "https://img.example/iiif/p1/full/full/0/default.jpg",
                "https://img.example/iiif/p2/full/full/0/default.jpg",
                "https://img.example/iiif/p3/full/full/0/native.png?token=a",
            ]
        );
    }

    #[test]
    fn test_percent_encoding_preserved() {
        let url = "https://img.example/iiif/ms%2F12%3Af1/full/300,/0/default.jpg";
        assert_eq!(
            rewrite_to_full(url, IiifVersion::V2),
            "https://img.example/iiif/ms%2F12%3Af1/full/full/0/default.jpg"
        );
        let service = json!({
            "sequences": [{ "canvases": [v2_canvas("c", json!({
                "@id": "x",
                "service": { "@id": "https://img.example/iiif/ms%2F12%3Af1" }
            }))]}]
        });
        let manifest = normalize_manifest(&service, "iiif", "https://m").unwrap();
        assert!(manifest.pages()[0].target.locator().contains("ms%2F12%3Af1"));
    }

    #[test]
    fn test_non_iiif_url_unchanged() {
        let url = "https://cdn.example/scans/0001.jpg";
        assert_eq!(rewrite_to_full(url, IiifVersion::V2), url);
    }

    #[test]
    fn test_v2_missing_canvas_resource_skipped_with_warning() {
        let manifest = json!({
            "sequences": [{ "canvases": [
                v2_canvas("c1", json!({"@id": "https://img/1.jpg"})),
                { "@id": "c2", "label": "f. 2r", "images": [] },
                v2_canvas("c3", json!({"@id": "https://img/3.jpg"})),
            ]}]
        });
        let manifest = normalize_manifest(&manifest, "iiif", "https://m").unwrap();
        assert_eq!(manifest.page_count(), 2);
        assert_eq!(manifest.pages()[1].index, 1);
        assert_eq!(manifest.warnings().len(), 1);
        assert!(manifest.warnings()[0].contains("f. 2r"));
    }

    #[test]
    fn test_v2_canvas_thumbnail_fallback() {
        let manifest = json!({
            "sequences": [{ "canvases": [{
                "@id": "c1",
                "thumbnail": { "@id": "https://img.example/iiif/t/full/90,/0/default.jpg" }
            }]}]
        });
        let manifest = normalize_manifest(&manifest, "iiif", "https://m").unwrap();
        assert_eq!(
            manifest.pages()[0].target.locator(),
            "https://img.example/iiif/t/full/full/0/default.jpg"
        );
    }

    #[test]
    fn test_v3_image_service3_uses_max() {
        let manifest = json!({
            "label": { "en": ["Book of Hours"] },
            "items": [{
                "id": "https://m/canvas/1",
                "type": "Canvas",
                "label": { "none": ["1r"] },
                "items": [{ "type": "AnnotationPage", "items": [{
                    "type": "Annotation",
                    "body": {
                        "id": "https://img.example/iiif3/p1/full/max/0/default.jpg",
                        "type": "Image",
                        "service": [{ "id": "https://img.example/iiif3/p1", "type": "ImageService3" }]
                    }
                }]}]
            }]
        });
        let manifest = normalize_manifest(&manifest, "iiif", "https://m").unwrap();
        assert_eq!(manifest.display_name(), "Book of Hours");
        assert_eq!(manifest.pages()[0].label.as_deref(), Some("1r"));
        assert_eq!(
            manifest.pages()[0].target.locator(),
            "https://img.example/iiif3/p1/full/max/0/default.jpg"
        );
    }

    #[test]
    fn test_v3_body_without_service_rewritten_to_max() {
        let manifest = json!({
            "items": [{
                "type": "Canvas",
                "items": [{ "items": [{ "body": { "id": "https://img/iiif/x/full/250,/0/default.jpg" } }]}]
            }]
        });
        let manifest = normalize_manifest(&manifest, "iiif", "https://m").unwrap();
        assert_eq!(manifest.pages()[0].target.locator(), "https://img/iiif/x/full/max/0/default.jpg");
    }

    #[test]
    fn test_collection_rejected() {
        let result = normalize_manifest(&json!({"manifests": []}), "iiif", "https://m");
        match result {
            Err(ResolveError::ManifestParse { reason, .. }) => assert!(reason.contains("collection")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_all_canvases_unusable_is_parse_error() {
        let manifest = json!({ "sequences": [{ "canvases": [{ "@id": "c1" }, { "@id": "c2" }] }] });
        let result = normalize_manifest(&manifest, "iiif", "https://m");
        assert!(matches!(result, Err(ResolveError::ManifestParse { .. })));
    }

    #[test]
    fn test_label_text_variants() {
        assert_eq!(label_text(&json!("  f. 1  ")).as_deref(), Some("f. 1"));
        assert_eq!(label_text(&json!([{"@value": "Titel", "@language": "de"}])).as_deref(), Some("Titel"));
        assert_eq!(label_text(&json!({"fr": ["Livre"]})).as_deref(), Some("Livre"));
        assert_eq!(label_text(&json!({"en": ["Book"], "fr": ["Livre"]})).as_deref(), Some("Book"));
        assert_eq!(label_text(&json!("")), None);
    }

    #[test]
    fn test_title_from_metadata() {
        let manifest = json!({
            "metadata": [{ "label": "Title", "value": "Psalter" }],
            "sequences": [{ "canvases": [v2_canvas("c1", json!({"@id": "https://img/1.jpg"}))] }]
        });
        let manifest = normalize_manifest(&manifest, "e-rara", "https://m").unwrap();
        assert_eq!(manifest.display_name(), "Psalter");
    }
}
