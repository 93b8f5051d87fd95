//! Shared HTTP client construction policy and the manifest fetcher used by loaders.
//!
//! Every client is built from a source's [`Capabilities`]: relaxed TLS for
//! libraries with broken certificate chains, and default headers for sources
//! that check `Origin`/`Referer`. The same builder backs page downloads.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, ClientBuilder, Method, Proxy};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::source::{Capabilities, GeoBlockSignature, SourceDescriptor};
use crate::user_agent;

use super::{ResolveContext, ResolveError};

/// Connect timeout for manifest and listing requests.
pub const RESOLVER_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Whole-request timeout for manifest and listing requests.
pub const RESOLVER_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds an HTTP client honouring a source's capabilities.
///
/// Falls back to env-only proxy discovery when the platform proxy lookup
/// panics (seen in sandboxed CI on macOS).
///
/// # Errors
///
/// Returns the builder's error message when construction fails.
pub fn build_source_http_client(
    source_id: &str,
    user_agent: &str,
    capabilities: &Capabilities,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, String> {
    let attempt = |disable_system_proxy_lookup: bool| {
        catch_unwind(AssertUnwindSafe(|| {
            let mut builder =
                base_builder(user_agent, capabilities, connect_timeout, read_timeout);
            if disable_system_proxy_lookup {
                builder = apply_env_proxy_fallback(builder.no_proxy());
            }
            builder.build().map_err(|e| e.to_string())
        }))
    };

    match attempt(false) {
        Ok(result) => result,
        Err(_) => {
            warn!(
                source_id,
                "HTTP client hit system proxy panic; using env-proxy fallback builder"
            );
            attempt(true).unwrap_or_else(|_| {
                Err("HTTP client construction panicked while loading proxy settings".to_string())
            })
        }
    }
}

fn base_builder(
    user_agent: &str,
    capabilities: &Capabilities,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> ClientBuilder {
    let mut builder = Client::builder()
        .connect_timeout(connect_timeout)
        .timeout(read_timeout)
        .user_agent(user_agent)
        .gzip(true)
        .default_headers(default_headers(capabilities.custom_headers));
    if capabilities.relaxed_tls {
        builder = builder.danger_accept_invalid_certs(true);
    }
    builder
}

fn default_headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = name, "skipping invalid custom header"),
        }
    }
    headers
}

fn apply_env_proxy_fallback(mut builder: ClientBuilder) -> ClientBuilder {
    if let Some(proxy) = find_first_proxy_var(&["HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"])
        && let Ok(resolved) = Proxy::https(&proxy)
    {
        builder = builder.proxy(resolved);
    }
    if let Some(proxy) = find_first_proxy_var(&["HTTP_PROXY", "http_proxy", "ALL_PROXY", "all_proxy"])
        && let Ok(resolved) = Proxy::http(&proxy)
    {
        builder = builder.proxy(resolved);
    }
    builder
}

fn find_first_proxy_var(names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        std::env::var(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

/// Fetches manifest, API, and listing documents for one source.
#[derive(Clone)]
pub struct SourceHttp {
    client: Client,
    source_id: &'static str,
    geo_block: Option<GeoBlockSignature>,
}

impl std::fmt::Debug for SourceHttp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceHttp")
            .field("source_id", &self.source_id)
            .finish_non_exhaustive()
    }
}

impl SourceHttp {
    /// Builds a fetcher for `descriptor` with resolver timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Client`] when client construction fails.
    pub fn new(descriptor: &SourceDescriptor) -> Result<Self, ResolveError> {
        let client = build_source_http_client(
            descriptor.id(),
            &user_agent::default_resolver_user_agent(),
            descriptor.capabilities(),
            RESOLVER_CONNECT_TIMEOUT,
            RESOLVER_READ_TIMEOUT,
        )
        .map_err(|reason| ResolveError::Client {
            source_id: descriptor.id().to_string(),
            reason,
        })?;
        Ok(Self {
            client,
            source_id: descriptor.id(),
            geo_block: descriptor.capabilities().geo_block,
        })
    }

    /// GETs `url` and returns the body.
    ///
    /// # Errors
    ///
    /// [`ResolveError::GeoBlocked`] when the response matches the source's
    /// geo signature, [`ResolveError::Network`] for transport failures and
    /// non-success statuses, [`ResolveError::Cancelled`] on cancel.
    pub async fn get_text(&self, url: &str, ctx: &ResolveContext) -> Result<String, ResolveError> {
        self.get_text_with_headers(url, &[], ctx).await
    }

    /// Like [`get_text`](Self::get_text) with extra per-request headers.
    ///
    /// # Errors
    ///
    /// Same as [`get_text`](Self::get_text).
    #[instrument(skip(self, headers, ctx), fields(source_id = self.source_id))]
    pub async fn get_text_with_headers(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        ctx: &ResolveContext,
    ) -> Result<String, ResolveError> {
        let (status, body) = self.fetch(url, headers, ctx).await?;
        if !(200..300).contains(&status) {
            return Err(ResolveError::http_status(url, status));
        }
        Ok(body)
    }

    /// Like [`get_text`](Self::get_text) but maps 404/410 to `None`, for
    /// listings whose end is signalled by a missing page.
    ///
    /// # Errors
    ///
    /// Same as [`get_text`](Self::get_text) for every other failure.
    pub async fn get_text_optional(
        &self,
        url: &str,
        ctx: &ResolveContext,
    ) -> Result<Option<String>, ResolveError> {
        let (status, body) = self.fetch(url, &[], ctx).await?;
        match status {
            200..=299 => Ok(Some(body)),
            404 | 410 => Ok(None),
            _ => Err(ResolveError::http_status(url, status)),
        }
    }

    /// GETs `url` and parses the body as JSON.
    ///
    /// # Errors
    ///
    /// Same as [`get_text`](Self::get_text), plus
    /// [`ResolveError::ManifestParse`] when the body is not JSON.
    pub async fn get_json(&self, url: &str, ctx: &ResolveContext) -> Result<Value, ResolveError> {
        let body = self
            .get_text_with_headers(url, &[("Accept", "application/json, application/ld+json")], ctx)
            .await?;
        serde_json::from_str(&body)
            .map_err(|e| ResolveError::parse(self.source_id, url, format!("invalid JSON: {e}")))
    }

    /// Whether `url` answers 2xx, without reading a body. Tries `HEAD` and
    /// repeats as `GET` when the server rejects the method.
    ///
    /// # Errors
    ///
    /// [`ResolveError::Network`] for transport failures and 5xx statuses,
    /// [`ResolveError::Cancelled`] on cancel. Other 4xx statuses are `false`.
    #[instrument(skip(self, ctx), fields(source_id = self.source_id))]
    pub async fn exists(&self, url: &str, ctx: &ResolveContext) -> Result<bool, ResolveError> {
        let mut status = self.status_of(Method::HEAD, url, ctx).await?;
        if matches!(status, 405 | 501) {
            status = self.status_of(Method::GET, url, ctx).await?;
        }
        match status {
            200..=299 => Ok(true),
            400..=499 => Ok(false),
            _ => Err(ResolveError::http_status(url, status)),
        }
    }

    async fn status_of(
        &self,
        method: Method,
        url: &str,
        ctx: &ResolveContext,
    ) -> Result<u16, ResolveError> {
        let send = self.client.request(method, url).send();
        let response = tokio::select! {
            () = ctx.cancel.cancelled() => return Err(ResolveError::cancelled(url)),
            sent = send => sent.map_err(|e| {
                if e.is_timeout() {
                    ResolveError::network(url, "request timed out")
                } else {
                    ResolveError::network(url, e.to_string())
                }
            })?,
        };
        let status = response.status().as_u16();
        debug!(url, status, "checked resource");
        Ok(status)
    }

    async fn fetch(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        ctx: &ResolveContext,
    ) -> Result<(u16, String), ResolveError> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        let exchange = async {
            let response = request.send().await.map_err(|e| {
                if e.is_timeout() {
                    ResolveError::network(url, "request timed out")
                } else {
                    ResolveError::network(url, e.to_string())
                }
            })?;
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|e| ResolveError::network(url, format!("reading body: {e}")))?;
            Ok::<_, ResolveError>((status, body))
        };

        let (status, body) = tokio::select! {
            () = ctx.cancel.cancelled() => return Err(ResolveError::cancelled(url)),
            result = exchange => result?,
        };
        debug!(url, status, bytes = body.len(), "fetched manifest document");

        if let Some(signature) = &self.geo_block
            && signature.matches(status, &body)
        {
            return Err(ResolveError::geo_blocked(self.source_id, url, status));
        }
        Ok((status, body))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_headers_skip_invalid() {
        let headers = default_headers(&[("Referer", "https://www.nb.no/"), ("Bad Header", "x")]);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("referer").unwrap(), "https://www.nb.no/");
    }

    #[test]
    fn test_build_client_with_relaxed_tls() {
        let caps = Capabilities {
            relaxed_tls: true,
            ..Capabilities::default()
        };
        let client = build_source_http_client(
            "bdl",
            "test-agent",
            &caps,
            RESOLVER_CONNECT_TIMEOUT,
            RESOLVER_READ_TIMEOUT,
        );
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn test_exists_falls_back_to_get() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/img/1"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xFF, 0xD8]))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/img/2"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let http = SourceHttp::new(&crate::source::lookup("rome").unwrap()).unwrap();
        let ctx = ResolveContext::new();
        assert!(http.exists(&format!("{}/img/1", server.uri()), &ctx).await.unwrap());
        assert!(!http.exists(&format!("{}/img/2", server.uri()), &ctx).await.unwrap());
    }

    #[test]
    fn test_source_http_new_for_table_entries() {
        for descriptor in crate::source::source_table() {
            assert!(SourceHttp::new(descriptor).is_ok(), "{}", descriptor.id());
        }
    }
}
