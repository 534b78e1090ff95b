use crate::error::{ErrorKind, HttpError};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Request};
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Tower layer that fills in headers the request does not carry yet.
#[derive(Debug, Clone)]
pub(crate) struct DefaultHeadersLayer {
    defaults: HeaderMap,
}

impl DefaultHeadersLayer {
    pub(crate) fn new() -> Self {
        Self {
            defaults: HeaderMap::new(),
        }
    }

    /// Add a default header.
    ///
    /// # Errors
    ///
    /// Returns a `validation` error if `value` is not a valid header value.
    pub(crate) fn with(mut self, name: HeaderName, value: &str) -> Result<Self, HttpError> {
        let value = HeaderValue::from_str(value)
            .map_err(|e| ErrorKind::InvalidHeader(format!("{name}: {e}")))?;
        self.defaults.insert(name, value);
        Ok(self)
    }
}

impl<S> Layer<S> for DefaultHeadersLayer {
    type Service = DefaultHeaders<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DefaultHeaders {
            inner,
            defaults: self.defaults.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct DefaultHeaders<S> {
    inner: S,
    defaults: HeaderMap,
}

impl<S, B> Service<Request<B>> for DefaultHeaders<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        let headers = req.headers_mut();
        for (name, value) in &self.defaults {
            if !headers.contains_key(name) {
                headers.insert(name.clone(), value.clone());
            }
        }
        self.inner.call(req)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use http::header::USER_AGENT;
    use tower::ServiceExt;

    async fn user_agent_seen(req: Request<()>) -> Option<HeaderValue> {
        let layer = DefaultHeadersLayer::new()
            .with(USER_AGENT, "courier-test/1.0")
            .unwrap();
        let service = layer.layer(tower::service_fn(|req: Request<()>| async move {
            Ok::<_, std::convert::Infallible>(req.headers().get(USER_AGENT).cloned())
        }));
        service.oneshot(req).await.unwrap()
    }

    #[tokio::test]
    async fn test_default_added_when_missing() {
        let seen = user_agent_seen(Request::new(())).await;
        assert_eq!(seen.unwrap(), "courier-test/1.0");
    }

    #[tokio::test]
    async fn test_existing_header_not_overwritten() {
        let req = Request::builder()
            .header(USER_AGENT, "custom/2.0")
            .body(())
            .unwrap();
        let seen = user_agent_seen(req).await;
        assert_eq!(seen.unwrap(), "custom/2.0");
    }

    #[test]
    fn test_invalid_value_rejected() {
        let result = DefaultHeadersLayer::new().with(USER_AGENT, "bad\x00agent");
        assert!(result.is_err());
    }
}
