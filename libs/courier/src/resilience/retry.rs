use super::circuit_breaker::CircuitBreakerConfig;
use crate::error::{ErrorCode, HttpError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Header carrying the retry attempt number on retried requests (1-based).
pub const RETRY_ATTEMPT_HEADER: &str = "x-retry-attempt";

/// Statuses retried by default.
pub const DEFAULT_RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Delay schedule between attempts.
///
/// Retry `n` (0-based) waits `initial * multiplier^n`, capped at `max`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExponentialBackoff {
    #[serde(with = "crate::humantime_serde")]
    pub initial: Duration,
    #[serde(with = "crate::humantime_serde")]
    pub max: Duration,
    pub multiplier: f64,
    /// Scale each delay by a random factor in `[0.75, 1.25]`.
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ExponentialBackoff {
    /// Longest delay ever produced, whatever `max` says.
    const CEILING_SECS: f64 = 86_400.0;

    /// Millisecond delays without jitter, for tests.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(100),
            jitter: false,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based).
    ///
    /// A NaN, infinite or negative multiplier is treated as `1.0`.
    #[must_use]
    pub fn delay(&self, attempt: usize) -> Duration {
        let growth = if self.multiplier.is_finite() && self.multiplier >= 0.0 {
            self.multiplier
        } else {
            1.0
        };
        let cap = self.max.as_secs_f64().min(Self::CEILING_SECS);
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);

        let mut secs = self.initial.as_secs_f64() * growth.powi(exponent);
        secs = if secs.is_finite() { secs.clamp(0.0, cap) } else { cap };
        if self.jitter {
            secs = (secs * rand::rng().random_range(0.75..=1.25)).min(cap);
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Circuit breaker attached to a retry policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerBinding {
    /// Breaker name; defaults to the endpoint (`METHOD origin/path`)
    pub name: Option<String>,
    /// Configuration used when the breaker is first created
    pub config: Option<CircuitBreakerConfig>,
}

/// Per-request retry behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts including the first (default: 3)
    pub max_attempts: usize,
    pub backoff: ExponentialBackoff,
    /// Response statuses worth another attempt
    pub retryable_statuses: BTreeSet<u16>,
    /// Retry `timeout` errors (default: true)
    pub retry_on_timeout: bool,
    /// Let a `Retry-After` header replace the computed delay (default: true)
    pub respect_retry_after: bool,
    /// Upper bound for a `Retry-After` delay (default: 60s)
    #[serde(with = "crate::humantime_serde::option")]
    pub max_retry_after: Option<Duration>,
    pub circuit_breaker: Option<BreakerBinding>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: ExponentialBackoff::default(),
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.into_iter().collect(),
            retry_on_timeout: true,
            respect_retry_after: true,
            max_retry_after: Some(Duration::from_secs(60)),
            circuit_breaker: None,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_retryable_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_statuses = statuses.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_retry_on_timeout(mut self, retry: bool) -> Self {
        self.retry_on_timeout = retry;
        self
    }

    #[must_use]
    pub fn with_respect_retry_after(mut self, respect: bool) -> Self {
        self.respect_retry_after = respect;
        self
    }

    /// Guard the endpoint with a circuit breaker named after it.
    #[must_use]
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(BreakerBinding {
            name: None,
            config: Some(config),
        });
        self
    }

    /// Guard the call with the breaker called `name`.
    #[must_use]
    pub fn with_named_breaker(mut self, name: impl Into<String>) -> Self {
        let binding = self.circuit_breaker.get_or_insert_with(BreakerBinding::default);
        binding.name = Some(name.into());
        self
    }

    /// Whether `err` is worth another attempt.
    ///
    /// Only the error code and the response status are consulted.
    #[must_use]
    pub fn should_retry(&self, err: &HttpError) -> bool {
        match err.code() {
            ErrorCode::Network => true,
            ErrorCode::Timeout => self.retry_on_timeout,
            ErrorCode::BadResponse => err
                .status()
                .is_some_and(|status| self.retryable_statuses.contains(&status.as_u16())),
            _ => false,
        }
    }

    /// Delay before retry number `attempt` (0-based) after `err`.
    #[must_use]
    pub fn delay_for(&self, attempt: usize, err: &HttpError) -> Duration {
        let server_wait = err
            .response()
            .filter(|_| self.respect_retry_after)
            .and_then(|response| response.retry_after(self.max_retry_after));
        server_wait.unwrap_or_else(|| self.backoff.delay(attempt))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::cancel::Cancel;
    use crate::request::RequestConfig;
    use crate::response::Response;
    use http::{HeaderValue, StatusCode};

    fn status_error(status: StatusCode) -> HttpError {
        HttpError::bad_status(Response::new(status, RequestConfig::new("/x")))
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = ExponentialBackoff {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(3), Duration::from_millis(500));
        assert_eq!(backoff.delay(usize::MAX), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_is_symmetric_band() {
        let backoff = ExponentialBackoff {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        };
        for _ in 0..200 {
            let delay = backoff.delay(0);
            assert!(delay >= Duration::from_millis(750), "{delay:?}");
            assert!(delay <= Duration::from_millis(1250), "{delay:?}");
        }
    }

    #[test]
    fn test_backoff_sanitizes_multiplier() {
        let backoff = ExponentialBackoff {
            initial: Duration::from_millis(10),
            max: Duration::from_secs(1),
            multiplier: f64::NAN,
            jitter: false,
        };
        assert_eq!(backoff.delay(5), Duration::from_millis(10));
    }

    #[test]
    fn test_should_retry_classification() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(&HttpError::network("reset")));
        assert!(policy.should_retry(&HttpError::timeout(Duration::from_secs(1))));
        assert!(policy.should_retry(&status_error(StatusCode::SERVICE_UNAVAILABLE)));
        assert!(policy.should_retry(&status_error(StatusCode::TOO_MANY_REQUESTS)));

        assert!(!policy.should_retry(&status_error(StatusCode::NOT_FOUND)));
        assert!(!policy.should_retry(&HttpError::cancelled(Cancel::default())));
        assert!(!policy.should_retry(&HttpError::config("bad")));
        assert!(!policy.should_retry(
            &crate::error::ErrorKind::CircuitOpen { name: "x".into() }.into()
        ));

        let no_timeouts = RetryPolicy::default().with_retry_on_timeout(false);
        assert!(!no_timeouts.should_retry(&HttpError::timeout(Duration::from_secs(1))));
    }

    #[test]
    fn test_retry_after_overrides_backoff() {
        let mut response = Response::new(StatusCode::TOO_MANY_REQUESTS, RequestConfig::new("/x"));
        response
            .headers
            .insert(http::header::RETRY_AFTER, HeaderValue::from_static("7"));
        let err = HttpError::bad_status(response);

        let policy = RetryPolicy::default().with_backoff(ExponentialBackoff::fast());
        assert_eq!(policy.delay_for(0, &err), Duration::from_secs(7));

        let capped = RetryPolicy {
            max_retry_after: Some(Duration::from_secs(2)),
            ..policy.clone()
        };
        assert_eq!(capped.delay_for(0, &err), Duration::from_secs(2));

        let ignoring = policy.with_respect_retry_after(false);
        assert_eq!(ignoring.delay_for(0, &err), Duration::from_millis(1));
    }

    #[test]
    fn test_policy_from_json() {
        let policy: RetryPolicy = serde_json::from_str(
            r#"{"max_attempts": 5, "backoff": {"initial": "250ms", "jitter": false}}"#,
        )
        .unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff.initial, Duration::from_millis(250));
        assert_eq!(policy.backoff.max, Duration::from_secs(10));
        assert!(policy.retryable_statuses.contains(&503));
    }
}
