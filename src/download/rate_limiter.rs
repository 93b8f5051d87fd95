//! Per-host request spacing.
//!
//! [`RateLimiter`] enforces a minimum delay between requests to the same
//! host and honours server-mandated pauses (`Retry-After` on 429/503).
//! Requests to different hosts never wait for each other.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use manuscript_core::download::RateLimiter;
//!
//! # async fn example() {
//! let limiter = RateLimiter::new(Duration::from_millis(250));
//! limiter.acquire("https://gallica.bnf.fr/iiif/page1.jpg").await;
//! limiter.acquire("https://gallica.bnf.fr/iiif/page2.jpg").await; // waits ~250ms
//! limiter.acquire("https://digi.vatlib.it/iiif/page1.jpg").await; // immediate
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Warning threshold for cumulative delay per host.
const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Maximum Retry-After value honoured (1 hour).
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Per-host rate limiter shared by every job of an orchestrator.
#[derive(Debug)]
pub struct RateLimiter {
    /// Minimum spacing between requests to one host.
    spacing: Duration,

    /// Per-host state. Values are `Arc` so the map shard lock is released
    /// before awaiting on the inner mutex.
    hosts: DashMap<String, Arc<HostState>>,
}

#[derive(Debug)]
struct HostState {
    /// `None` until the first request; the first request is immediate.
    last_request: Mutex<Option<Instant>>,

    /// Earliest instant the server allows the next request.
    blocked_until: Mutex<Option<Instant>>,

    cumulative_delay_ms: AtomicU64,
}

impl HostState {
    fn new() -> Self {
        Self {
            last_request: Mutex::new(None),
            blocked_until: Mutex::new(None),
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let new_total = self.cumulative_delay_ms.fetch_add(delay_ms, Ordering::SeqCst) + delay_ms;
        Duration::from_millis(new_total)
    }
}

impl RateLimiter {
    /// Creates a limiter with the given spacing. Zero spacing only applies
    /// server-mandated pauses.
    #[must_use]
    #[instrument(skip_all, fields(spacing_ms = spacing.as_millis()))]
    pub fn new(spacing: Duration) -> Self {
        debug!("creating rate limiter");
        Self {
            spacing,
            hosts: DashMap::new(),
        }
    }

    /// Returns the configured spacing.
    #[must_use]
    pub fn spacing(&self) -> Duration {
        self.spacing
    }

    fn state(&self, host: &str) -> Arc<HostState> {
        self.hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(HostState::new()))
            .clone()
    }

    /// Waits until a request to `url`'s host is allowed, then records it.
    #[instrument(skip(self), fields(host))]
    pub async fn acquire(&self, url: &str) {
        let host = extract_domain(url);
        tracing::Span::current().record("host", &host);
        let state = self.state(&host);

        let pause = state
            .blocked_until
            .lock()
            .await
            .and_then(|until| until.checked_duration_since(Instant::now()));
        if let Some(pause) = pause {
            debug!(host = %host, delay_ms = pause.as_millis(), "honouring server rate limit");
            tokio::time::sleep(pause).await;
        }

        if self.spacing.is_zero() {
            return;
        }

        let mut last_request = state.last_request.lock().await;
        if let Some(last) = *last_request {
            let elapsed = last.elapsed();
            if elapsed < self.spacing {
                let delay = self.spacing.saturating_sub(elapsed);
                let cumulative = state.add_cumulative_delay(delay);
                debug!(
                    host = %host,
                    delay_ms = delay.as_millis(),
                    cumulative_ms = cumulative.as_millis(),
                    "applying request spacing"
                );
                if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
                    warn!(
                        host = %host,
                        cumulative_delay_secs = cumulative.as_secs(),
                        "excessive request spacing - consider lowering concurrency for this source"
                    );
                }
                tokio::time::sleep(delay).await;
            }
        }
        *last_request = Some(Instant::now());
    }

    /// Records a server-mandated pause for `url`'s host. Later calls to
    /// [`acquire`](Self::acquire) for that host wait until it has elapsed.
    #[instrument(skip(self), fields(host))]
    pub async fn record_rate_limit(&self, url: &str, delay: Duration) {
        let host = extract_domain(url);
        tracing::Span::current().record("host", &host);
        let state = self.state(&host);

        let until = Instant::now() + delay.min(MAX_RETRY_AFTER);
        let mut blocked_until = state.blocked_until.lock().await;
        if blocked_until.is_none_or(|current| current < until) {
            *blocked_until = Some(until);
        }
        let cumulative = state.add_cumulative_delay(delay);
        debug!(
            host = %host,
            delay_ms = delay.as_millis(),
            cumulative_ms = cumulative.as_millis(),
            "recorded server rate limit"
        );
        if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
            warn!(
                host = %host,
                cumulative_delay_secs = cumulative.as_secs(),
                "excessive server rate limiting - library may be under heavy load"
            );
        }
    }
}

/// Extracts the lowercase host from a URL, or `"unknown"` when unparseable.
///
/// ```
/// use manuscript_core::download::rate_limiter::extract_domain;
///
/// assert_eq!(extract_domain("https://Gallica.BNF.fr/iiif/x"), "gallica.bnf.fr");
/// assert_eq!(extract_domain("http://127.0.0.1:8080/x"), "127.0.0.1");
/// assert_eq!(extract_domain("not a url"), "unknown");
/// ```
#[must_use]
pub fn extract_domain(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Parses a Retry-After header value (integer seconds or HTTP-date).
///
/// Returns `None` if the value cannot be parsed. Caps excessive values at 1 hour.
///
/// ```
/// use std::time::Duration;
/// use manuscript_core::download::rate_limiter::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
#[instrument]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        let Ok(seconds) = u64::try_from(seconds) else {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        };
        let duration = Duration::from_secs(seconds);
        if duration > MAX_RETRY_AFTER {
            warn!(seconds, "Retry-After exceeds maximum, capping at 1 hour");
            return Some(MAX_RETRY_AFTER);
        }
        return Some(duration);
    }

    if let Ok(datetime) = httpdate::parse_http_date(header_value) {
        let duration = datetime
            .duration_since(std::time::SystemTime::now())
            .unwrap_or(Duration::ZERO);
        Some(duration.min(MAX_RETRY_AFTER))
    } else {
        debug!(header_value, "unparseable Retry-After value");
        None
    }
}
