//! Page image fetcher.
//!
//! One [`PageClient`] per job, built from the job's source descriptor so
//! relaxed TLS and custom headers apply to image requests too. Bodies are
//! streamed chunk by chunk; every await races the job's cancellation token.

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::RETRY_AFTER;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::assembly::sniff_format;
use crate::config::EngineConfig;
use crate::manifest::ImageTarget;
use crate::resolver::http_client::build_source_http_client;
use crate::source::{GeoBlockSignature, SourceDescriptor};
use crate::user_agent;

use super::FetchError;

/// Fetches page images for one source.
#[derive(Clone)]
pub struct PageClient {
    client: Client,
    source_id: String,
    geo_block: Option<GeoBlockSignature>,
}

impl std::fmt::Debug for PageClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageClient")
            .field("source_id", &self.source_id)
            .field("geo_block", &self.geo_block.is_some())
            .finish_non_exhaustive()
    }
}

impl PageClient {
    /// Builds a client honouring `descriptor`'s capabilities and the
    /// configured timeouts.
    ///
    /// # Errors
    ///
    /// Returns the builder's message when construction fails.
    pub fn for_source(descriptor: &SourceDescriptor, config: &EngineConfig) -> Result<Self, String> {
        let client = build_source_http_client(
            descriptor.id(),
            &user_agent::default_download_user_agent(),
            descriptor.capabilities(),
            config.connect_timeout,
            config.read_timeout,
        )?;
        Ok(Self {
            client,
            source_id: descriptor.id().to_string(),
            geo_block: descriptor.capabilities().geo_block,
        })
    }

    /// Client for manifests whose source is not in the descriptor table
    /// (persisted jobs from an older table). Default capabilities apply.
    ///
    /// # Errors
    ///
    /// Returns the builder's message when construction fails.
    pub fn generic(source_id: &str, config: &EngineConfig) -> Result<Self, String> {
        let client = build_source_http_client(
            source_id,
            &user_agent::default_download_user_agent(),
            &crate::source::Capabilities::default(),
            config.connect_timeout,
            config.read_timeout,
        )?;
        Ok(Self {
            client,
            source_id: source_id.to_string(),
            geo_block: None,
        })
    }

    /// Source this client fetches for.
    #[must_use]
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Turns a page target into a concrete image URL. IIIF services are
    /// probed for their largest width; a failed probe degrades to `full/full`.
    ///
    /// # Errors
    ///
    /// Only [`FetchError::Cancelled`]; probe failures degrade instead.
    pub async fn resolve_target(
        &self,
        target: &ImageTarget,
        cancel: &CancellationToken,
    ) -> Result<String, FetchError> {
        match target {
            ImageTarget::Url { url } => Ok(url.clone()),
            ImageTarget::IiifService { service } => {
                let service = service.trim_end_matches('/');
                let info_url = format!("{service}/info.json");
                let probe = tokio::select! {
                    () = cancel.cancelled() => return Err(FetchError::cancelled(info_url)),
                    probe = self.probe_max_width(&info_url) => probe,
                };
                Ok(match probe {
                    Some(width) => format!("{service}/full/{width},/0/default.jpg"),
                    None => {
                        debug!(service, "info.json probe failed; requesting full/full");
                        format!("{service}/full/full/0/default.jpg")
                    }
                })
            }
        }
    }

    async fn probe_max_width(&self, info_url: &str) -> Option<u64> {
        let response = self.client.get(info_url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let info: Value = response.json().await.ok()?;
        max_width(&info)
    }

    /// Fetches a page target and returns the image bytes.
    ///
    /// # Errors
    ///
    /// See [`fetch_url`](Self::fetch_url).
    pub async fn fetch(
        &self,
        target: &ImageTarget,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, FetchError> {
        let url = self.resolve_target(target, cancel).await?;
        self.fetch_url(&url, cancel).await
    }

    /// GETs `url` and streams the body into memory.
    ///
    /// # Errors
    ///
    /// - [`FetchError::InvalidUrl`] for unparseable URLs
    /// - [`FetchError::GeoBlocked`] when the response matches the source's signature
    /// - [`FetchError::HttpStatus`] for other non-success responses
    /// - [`FetchError::Timeout`] / [`FetchError::Network`] for transport failures
    /// - [`FetchError::EmptyBody`] for a 2xx without bytes
    /// - [`FetchError::NotAnImage`] for a 2xx whose body is not image data
    /// - [`FetchError::Cancelled`] when `cancel` fires first
    #[instrument(skip(self, cancel), fields(source_id = %self.source_id))]
    pub async fn fetch_url(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, FetchError> {
        Url::parse(url).map_err(|_| FetchError::invalid_url(url))?;

        let response = tokio::select! {
            () = cancel.cancelled() => return Err(FetchError::cancelled(url)),
            sent = self.client.get(url).send() => sent.map_err(|e| transport_error(url, e))?,
        };

        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(self.error_response(url, status, response, cancel).await);
        }

        let mut bytes = Vec::with_capacity(
            response
                .content_length()
                .and_then(|len| usize::try_from(len).ok())
                .unwrap_or(0),
        );
        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                () = cancel.cancelled() => return Err(FetchError::cancelled(url)),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(chunk) => bytes.extend_from_slice(&chunk.map_err(|e| transport_error(url, e))?),
                None => break,
            }
        }

        if bytes.is_empty() {
            return Err(FetchError::EmptyBody { url: url.to_string() });
        }
        ensure_image(url, &bytes)?;
        debug!(url, bytes = bytes.len(), "page fetched");
        Ok(bytes)
    }

    async fn error_response(
        &self,
        url: &str,
        status: u16,
        response: reqwest::Response,
        cancel: &CancellationToken,
    ) -> FetchError {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);

        if let Some(signature) = &self.geo_block
            && signature.statuses.contains(&status)
        {
            let body = if signature.needs_body() {
                tokio::select! {
                    () = cancel.cancelled() => return FetchError::cancelled(url),
                    text = response.text() => text.unwrap_or_default(),
                }
            } else {
                String::new()
            };
            if signature.matches(status, &body) {
                warn!(url, status, source_id = %self.source_id, "geo-block signature matched");
                return FetchError::geo_blocked(url, self.source_id.clone(), status);
            }
        }
        FetchError::http_status_with_retry_after(url, status, retry_after)
    }
}

fn transport_error(url: &str, error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::timeout(url)
    } else {
        FetchError::network(url, error)
    }
}

/// Rejects bodies without a known image signature. Libraries answer
/// login walls and quota errors with `200 text/html`.
fn ensure_image(url: &str, bytes: &[u8]) -> Result<(), FetchError> {
    if sniff_format(bytes).is_some() {
        return Ok(());
    }
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(256)]);
    let detail = if head.trim_start().starts_with('<') {
        "markup document"
    } else {
        "unrecognised data"
    };
    warn!(url, bytes = bytes.len(), detail, "page body is not an image");
    Err(FetchError::not_an_image(url, detail))
}

/// Largest advertised width in an `info.json`: `maxWidth`, then `width`.
fn max_width(info: &Value) -> Option<u64> {
    info.get("maxWidth")
        .and_then(Value::as_u64)
        .or_else(|| info.get("width").and_then(Value::as_u64))
        .filter(|width| *width > 0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::source::lookup;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(source: &str) -> PageClient {
        PageClient::for_source(&lookup(source).unwrap(), &EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_max_width_prefers_max_width() {
        assert_eq!(max_width(&json!({"maxWidth": 2000, "width": 6000})), Some(2000));
        assert_eq!(max_width(&json!({"width": 6000})), Some(6000));
        assert_eq!(max_width(&json!({"width": 0})), None);
        assert_eq!(max_width(&json!({})), None);
    }

    #[tokio::test]
    async fn test_fetch_url_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/p1.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xFF, 0xD8, 0xFF, 0xD9]))
            .mount(&server)
            .await;
        let bytes = client("iiif")
            .fetch_url(&format!("{}/p1.jpg", server.uri()), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(bytes, vec![0xFF, 0xD8, 0xFF, 0xD9]);
    }

    #[tokio::test]
    async fn test_fetch_url_geo_block_for_norwegian_only() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        let url = format!("{}/img", server.uri());

        let err = client("norwegian")
            .fetch_url(&url, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::GeoBlocked { status: 403, .. }));

        let err = client("gallica")
            .fetch_url(&url, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 403, .. }));
    }

    #[tokio::test]
    async fn test_fetch_url_empty_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let err = client("iiif")
            .fetch_url(&format!("{}/empty", server.uri()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::EmptyBody { .. }));
    }

    #[tokio::test]
    async fn test_fetch_url_rejects_html_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string("<html>Access denied</html>"),
            )
            .mount(&server)
            .await;
        let err = client("iiif")
            .fetch_url(&format!("{}/p2.jpg", server.uri()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(
            matches!(&err, FetchError::NotAnImage { detail, .. } if detail == "markup document"),
            "got {err:?}"
        );
    }

    #[test]
    fn test_ensure_image_accepts_known_signatures() {
        assert!(ensure_image("u", &[0xFF, 0xD8, 0xFF, 0xE0]).is_ok());
        assert!(ensure_image("u", b"\x89PNG\r\n").is_ok());
        assert!(matches!(
            ensure_image("u", b"plain text"),
            Err(FetchError::NotAnImage { .. })
        ));
    }

    #[tokio::test]
    async fn test_fetch_url_cancelled() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![1, 2, 3])
                    .set_delay(std::time::Duration::from_secs(10)),
            )
            .mount(&server)
            .await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client("iiif")
            .fetch_url(&format!("{}/slow", server.uri()), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_fetch_url_invalid() {
        let err = client("iiif")
            .fetch_url("not a url", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn test_resolve_target_probes_info_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/iiif/2/1001/info.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"width": 4000, "maxWidth": 3000})))
            .mount(&server)
            .await;
        let target = ImageTarget::iiif_service(format!("{}/iiif/2/1001", server.uri()));
        let url = client("bdl")
            .resolve_target(&target, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(url, format!("{}/iiif/2/1001/full/3000,/0/default.jpg", server.uri()));
    }

    #[tokio::test]
    async fn test_resolve_target_probe_failure_degrades() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let target = ImageTarget::iiif_service(format!("{}/iiif/2/7/", server.uri()));
        let url = client("bdl")
            .resolve_target(&target, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(url, format!("{}/iiif/2/7/full/full/0/default.jpg", server.uri()));
    }
}
