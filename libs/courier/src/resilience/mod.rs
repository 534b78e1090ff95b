//! Retry and circuit breaking around single transport attempts.

mod circuit_breaker;
mod registry;
mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
};
pub use registry::CircuitBreakerRegistry;
pub use retry::{
    BreakerBinding, DEFAULT_RETRYABLE_STATUSES, ExponentialBackoff, RETRY_ATTEMPT_HEADER,
    RetryPolicy,
};

use crate::cancel::Cancellation;
use crate::error::HttpError;
use crate::request::RequestConfig;
use crate::response::Response;
use http::header::{HeaderName, HeaderValue};
use std::future::Future;
use std::sync::Arc;

/// Runs request attempts under the request's retry policy and, when the
/// policy names one, its circuit breaker.
#[derive(Debug, Clone, Default)]
pub struct ResilienceLayer {
    breakers: Arc<CircuitBreakerRegistry>,
}

impl ResilienceLayer {
    #[must_use]
    pub fn new(breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self { breakers }
    }

    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Execute `attempt` until it succeeds, the error is not retryable or the
    /// policy's attempts are spent.
    ///
    /// Requests without a retry policy, and requests whose body is a stream,
    /// get exactly one attempt.
    ///
    /// # Errors
    ///
    /// Returns the last attempt's error, `circuit-open` when the breaker
    /// refuses the call, or `cancelled` when cancellation fires during a
    /// backoff delay.
    pub async fn execute<F, Fut>(
        &self,
        config: &RequestConfig,
        attempt: F,
    ) -> Result<Response, HttpError>
    where
        F: Fn(RequestConfig) -> Fut,
        Fut: Future<Output = Result<Response, HttpError>>,
    {
        let Some(policy) = config.retry.as_ref() else {
            return attempt(config.clone()).await;
        };

        let breaker = policy
            .circuit_breaker
            .as_ref()
            .map(|binding| {
                let name = binding
                    .name
                    .clone()
                    .unwrap_or_else(|| endpoint_key(config));
                self.breakers.get_or_create(&name, binding.config.as_ref())
            })
            .transpose()
            .map_err(|e| e.with_config(config))?;

        let streaming = config.data.as_ref().is_some_and(|d| d.is_stream());
        let max_attempts = if streaming {
            1
        } else {
            policy.max_attempts.max(1)
        };
        let cancellation = Cancellation::from_config(config);

        let mut retry = 0usize;
        loop {
            let mut current = config.clone();
            if retry > 0 {
                current.headers.insert(
                    HeaderName::from_static(RETRY_ATTEMPT_HEADER),
                    HeaderValue::from(retry),
                );
            }

            let result = match &breaker {
                Some(breaker) => breaker.execute(|| attempt(current)).await,
                None => attempt(current).await,
            };
            let err = match result {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };

            if retry + 1 >= max_attempts || !policy.should_retry(&err) {
                return Err(err.with_config(config));
            }

            let delay = policy.delay_for(retry, &err);
            retry += 1;
            tracing::debug!(
                url = config.url.as_deref().unwrap_or_default(),
                retry,
                code = %err.code(),
                status = err.status().map(|status| status.as_u16()),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "retrying request"
            );

            tokio::select! {
                biased;
                reason = cancellation.cancelled() => {
                    return Err(HttpError::cancelled(reason).with_config(config));
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Breaker key for a request: `METHOD origin/path`, query excluded.
#[must_use]
pub fn endpoint_key(config: &RequestConfig) -> String {
    let method = config.method();
    let full = config.full_url().unwrap_or_default();
    let endpoint = match url::Url::parse(&full) {
        Ok(url) => format!("{}{}", url.origin().ascii_serialization(), url.path()),
        Err(_) => full
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_owned(),
    };
    format!("{method} {endpoint}")
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::error::ErrorCode;
    use http::StatusCode;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::default().with_backoff(ExponentialBackoff::fast())
    }

    /// Attempt function replaying `statuses` in order.
    fn scripted(
        statuses: Vec<u16>,
        calls: Arc<AtomicUsize>,
        seen: Arc<Mutex<Vec<Option<String>>>>,
    ) -> impl Fn(RequestConfig) -> futures::future::BoxFuture<'static, Result<Response, HttpError>>
    {
        move |config: RequestConfig| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            seen.lock().push(
                config
                    .headers
                    .get(RETRY_ATTEMPT_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned),
            );
            let code = statuses.get(n).copied().unwrap_or(200);
            Box::pin(async move {
                let status = StatusCode::from_u16(code).unwrap();
                let response = Response::new(status, config);
                if status.is_success() {
                    Ok(response)
                } else {
                    Err(HttpError::bad_status(response))
                }
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let layer = ResilienceLayer::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let config = RequestConfig::new("https://api.example.com/flaky").with_retry(fast_policy());

        let response = layer
            .execute(&config, scripted(vec![503, 503, 200], calls.clone(), seen.clone()))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            *seen.lock(),
            vec![None, Some("1".to_owned()), Some("2".to_owned())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_status_single_call() {
        let layer = ResilienceLayer::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let config =
            RequestConfig::new("https://api.example.com/missing").with_retry(fast_policy());

        let err = layer
            .execute(&config, scripted(vec![404], calls.clone(), Arc::default()))
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_surfaces_last_error() {
        let layer = ResilienceLayer::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let config = RequestConfig::new("https://api.example.com/down")
            .with_retry(fast_policy().with_max_attempts(2));

        let err = layer
            .execute(&config, scripted(vec![500, 502, 200], calls.clone(), Arc::default()))
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(StatusCode::BAD_GATEWAY));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_policy_single_attempt() {
        let layer = ResilienceLayer::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let config = RequestConfig::new("https://api.example.com/once");

        let _ = layer
            .execute(&config, scripted(vec![503, 200], calls.clone(), Arc::default()))
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let layer = ResilienceLayer::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let source = CancelToken::source();
        let policy = RetryPolicy::default().with_backoff(ExponentialBackoff {
            initial: Duration::from_secs(30),
            max: Duration::from_secs(30),
            multiplier: 1.0,
            jitter: false,
        });
        let config = RequestConfig::new("https://api.example.com/slow")
            .with_retry(policy)
            .with_cancel_token(source.token());

        let canceller = source.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel("shutting down");
        });

        let err = layer
            .execute(&config, scripted(vec![503, 200], calls.clone(), Arc::default()))
            .await
            .unwrap_err();
        assert!(err.is_cancel());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_is_not_retried() {
        let layer = ResilienceLayer::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let config = RequestConfig::new("https://api.example.com/guarded")
            .with_retry(fast_policy().with_named_breaker("guarded"));

        layer
            .breakers()
            .get_or_create("guarded", None)
            .unwrap()
            .force_open();

        let err = layer
            .execute(&config, scripted(vec![200], calls.clone(), Arc::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_breaker_config_fails_before_any_attempt() {
        let layer = ResilienceLayer::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let config = RequestConfig::new("https://api.example.com/users").with_retry(
            fast_policy().with_circuit_breaker(CircuitBreakerConfig {
                failure_threshold: f64::NAN,
                ..CircuitBreakerConfig::default()
            }),
        );

        let err = layer
            .execute(&config, scripted(vec![200], calls.clone(), Arc::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(layer.breakers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_keyed_by_endpoint() {
        let layer = ResilienceLayer::default();
        let config = RequestConfig::new("https://api.example.com/users?page=2")
            .with_retry(fast_policy().with_circuit_breaker(CircuitBreakerConfig::default()));

        let _ = layer
            .execute(&config, scripted(vec![200], Arc::default(), Arc::default()))
            .await;
        assert_eq!(
            layer.breakers().names(),
            vec!["GET https://api.example.com/users".to_owned()]
        );
    }

    #[test]
    fn test_endpoint_key() {
        let config = RequestConfig::new("/v1/items?x=1")
            .with_base_url("https://api.example.com:8443")
            .with_method(http::Method::POST);
        assert_eq!(endpoint_key(&config), "POST https://api.example.com:8443/v1/items");

        let relative = RequestConfig::new("/local#frag");
        assert_eq!(endpoint_key(&relative), "GET /local");
    }
}
