//! Retry logic with exponential backoff for transient page failures.
//!
//! When a fetch fails, the error is classified into a [`FailureType`]:
//! - [`FailureType::Transient`] - Temporary failures that may succeed on retry
//! - [`FailureType::Permanent`] - Failures that won't succeed regardless of retries
//! - [`FailureType::GeoBlocked`] - Source refused the client's region; never retried
//! - [`FailureType::RateLimited`] - Server rate limiting (retries with backoff)
//!
//! The [`RetryPolicy`] then determines whether to retry based on failure type
//! and attempt count, calculating exponential backoff delays with jitter.
//!
//! # Example
//!
//! ```
//! use manuscript_core::{FetchError, RetryDecision, RetryPolicy, classify_error};
//!
//! let policy = RetryPolicy::default();
//! let error = FetchError::http_status("https://example.com/page.jpg", 503);
//!
//! match policy.should_retry(classify_error(&error), 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("Retrying in {delay:?} (attempt {attempt})");
//!     }
//!     RetryDecision::DoNotRetry { reason } => {
//!         println!("Not retrying: {reason}");
//!     }
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use crate::config::{DEFAULT_MAX_RETRIES, EngineConfig};

use super::FetchError;

/// Default base delay for exponential backoff (1 second).
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap (32 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Maximum jitter added to delays (500ms).
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Classification of page fetch failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: network timeout, 5xx server errors, connection reset.
    Transient,

    /// Permanent failure that won't succeed regardless of retries.
    ///
    /// Examples: 404 Not Found, 400 Bad Request, invalid URL.
    Permanent,

    /// The source's geo-restriction signature matched.
    GeoBlocked,

    /// Server rate limiting (HTTP 429).
    RateLimited,
}

/// Decision on whether to retry a failed fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the fetch after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Do not retry the fetch.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Configuration for retry behavior with exponential backoff.
///
/// # Delay Calculation
///
/// ```text
/// delay = min(base_delay * multiplier^(attempt-1), max_delay) + jitter
/// ```
///
/// With defaults, delays are approximately: 1s, 2s, 4s (before hitting max attempts).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,

    /// Base delay for the first retry.
    base_delay: Duration,

    /// Maximum delay cap.
    max_delay: Duration,

    /// Multiplier applied each attempt.
    backoff_multiplier: f32,

    /// Upper bound of the random jitter.
    max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_jitter: MAX_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with custom settings.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
            max_jitter: MAX_JITTER,
        }
    }

    /// Builds the policy an orchestrator applies to every page.
    ///
    /// Jitter never exceeds the base delay, so a zero base delay (as used by
    /// tests) retries immediately.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.backoff_base,
            max_delay: config.backoff_max,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_jitter: MAX_JITTER.min(config.backoff_base),
        }
    }

    /// Creates a policy with a custom `max_attempts`, using defaults for other settings.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Determines whether to retry a failed fetch.
    ///
    /// `attempt` is the attempt number that just failed (1-indexed).
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        match failure_type {
            FailureType::Permanent => {
                return RetryDecision::DoNotRetry {
                    reason: "permanent failure - retry would not help".to_string(),
                };
            }
            FailureType::GeoBlocked => {
                return RetryDecision::DoNotRetry {
                    reason: "geo-blocked - the source refuses this region".to_string(),
                };
            }
            FailureType::Transient | FailureType::RateLimited => {}
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Formula: `min(base_delay * multiplier^(attempt-1), max_delay) + jitter`
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let multiplier = f64::from(self.backoff_multiplier);
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * multiplier.powf(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_ms as u64) + self.calculate_jitter()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn calculate_jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::thread_rng();
        Duration::from_millis(rng.gen_range(0..=max_ms))
    }
}

/// Classifies a fetch error into a failure type for retry decisions.
///
/// | Error | Type |
/// |-------|------|
/// | GeoBlocked | GeoBlocked |
/// | 408, 5xx | Transient |
/// | 429 | RateLimited |
/// | other 4xx | Permanent |
/// | Timeout, EmptyBody | Transient |
/// | Network (TLS) | Permanent |
/// | Network (other) | Transient |
/// | Io, InvalidUrl, Cancelled | Permanent |
#[instrument]
pub fn classify_error(error: &FetchError) -> FailureType {
    match error {
        FetchError::GeoBlocked { .. } => FailureType::GeoBlocked,
        FetchError::HttpStatus { status, .. } => classify_http_status(*status),
        FetchError::Timeout { .. } | FetchError::EmptyBody { .. } => FailureType::Transient,
        FetchError::Network { source, .. } => {
            if is_tls_error(source) {
                FailureType::Permanent
            } else {
                FailureType::Transient
            }
        }
        FetchError::Io { .. }
        | FetchError::InvalidUrl { .. }
        | FetchError::NotAnImage { .. }
        | FetchError::Cancelled { .. } => FailureType::Permanent,
    }
}

#[allow(clippy::match_same_arms)]
fn classify_http_status(status: u16) -> FailureType {
    match status {
        408 => FailureType::Transient,
        429 => FailureType::RateLimited,
        status if (400..500).contains(&status) => FailureType::Permanent,
        status if (500..600).contains(&status) => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

fn is_tls_error(error: &reqwest::Error) -> bool {
    let error_string = error.to_string().to_lowercase();
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
        || error_string.contains("handshake")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_default_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(32));
        assert!((policy.backoff_multiplier - 2.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_retry_policy_max_attempts_minimum_is_one() {
        assert_eq!(RetryPolicy::with_max_attempts(0).max_attempts(), 1);
    }

    #[test]
    fn test_from_config_zero_base_has_no_jitter() {
        let config = EngineConfig {
            backoff_base: Duration::ZERO,
            max_attempts: 4,
            ..EngineConfig::default()
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.calculate_delay(1), Duration::ZERO);
        assert_eq!(policy.calculate_delay(3), Duration::ZERO);
    }

    #[test]
    fn test_delay_calculation_first_attempt() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(32), 2.0);
        let delay = policy.calculate_delay(1);
        assert!(delay >= Duration::from_secs(1));
        assert!(delay <= Duration::from_millis(1500));
    }

    #[test]
    fn test_delay_calculation_third_attempt() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(32), 2.0);
        let delay = policy.calculate_delay(3);
        assert!(delay >= Duration::from_secs(4));
        assert!(delay <= Duration::from_millis(4500));
    }

    #[test]
    fn test_delay_calculation_respects_max_delay() {
        let policy = RetryPolicy::new(20, Duration::from_secs(1), Duration::from_secs(10), 2.0);
        let delay = policy.calculate_delay(10);
        assert!(delay >= Duration::from_secs(10));
        assert!(delay <= Duration::from_millis(10_500));
    }

    #[test]
    fn test_classify_geo_blocked_never_retried() {
        let error = FetchError::geo_blocked("https://x/img", "norwegian", 403);
        let failure = classify_error(&error);
        assert_eq!(failure, FailureType::GeoBlocked);
        assert!(matches!(
            RetryPolicy::default().should_retry(failure, 1),
            RetryDecision::DoNotRetry { .. }
        ));
    }

    #[test]
    fn test_classify_http_statuses() {
        let cases = [
            (400, FailureType::Permanent),
            (403, FailureType::Permanent),
            (404, FailureType::Permanent),
            (408, FailureType::Transient),
            (410, FailureType::Permanent),
            (429, FailureType::RateLimited),
            (500, FailureType::Transient),
            (502, FailureType::Transient),
            (503, FailureType::Transient),
            (504, FailureType::Transient),
            (302, FailureType::Permanent),
        ];
        for (status, expected) in cases {
            assert_eq!(
                classify_error(&FetchError::http_status("https://x", status)),
                expected,
                "status {status}"
            );
        }
    }

    #[test]
    fn test_classify_timeout_transient() {
        assert_eq!(classify_error(&FetchError::timeout("https://x")), FailureType::Transient);
    }

    #[test]
    fn test_classify_invalid_url_and_cancel_permanent() {
        assert_eq!(classify_error(&FetchError::invalid_url("nope")), FailureType::Permanent);
        assert_eq!(classify_error(&FetchError::cancelled("https://x")), FailureType::Permanent);
        assert_eq!(
            classify_error(&FetchError::not_an_image("https://x", "markup document")),
            FailureType::Permanent
        );
    }

    #[test]
    fn test_should_retry_permanent_does_not_retry() {
        let decision = RetryPolicy::default().should_retry(FailureType::Permanent, 1);
        assert!(matches!(decision, RetryDecision::DoNotRetry { .. }));
    }

    #[test]
    fn test_should_retry_transient_retries() {
        match RetryPolicy::default().should_retry(FailureType::Transient, 1) {
            RetryDecision::Retry { attempt, .. } => assert_eq!(attempt, 2),
            RetryDecision::DoNotRetry { reason } => panic!("expected retry: {reason}"),
        }
    }

    #[test]
    fn test_should_retry_rate_limited_retries() {
        let decision = RetryPolicy::default().should_retry(FailureType::RateLimited, 2);
        assert!(matches!(decision, RetryDecision::Retry { attempt: 3, .. }));
    }

    #[test]
    fn test_should_retry_respects_max_attempts() {
        let policy = RetryPolicy::with_max_attempts(3);
        let decision = policy.should_retry(FailureType::Transient, 3);
        match decision {
            RetryDecision::DoNotRetry { reason } => assert!(reason.contains("exhausted")),
            RetryDecision::Retry { .. } => panic!("expected no retry"),
        }
    }
}
