use crate::cache::CachePolicy;
use crate::cancel::CancelToken;
use crate::client::HttpClient;
use crate::error::{ErrorKind, HttpError};
use crate::request::{BasicAuth, ProgressEvent, RequestBody, RequestConfig, ResponseType};
use crate::resilience::RetryPolicy;
use crate::response::Response;
use crate::settings::header_pair;
use http::StatusCode;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::form_urlencoded;

/// Fluent request builder returned by the [`HttpClient`] method shortcuts.
///
/// Header and body encoding errors are captured and reported by
/// [`send`](Self::send).
///
/// ```ignore
/// let created = client
///     .post("/users")
///     .header("x-request-id", "abc123")
///     .json(&NewUser { name: "Alice" })
///     .send()
///     .await?;
/// ```
#[must_use = "RequestBuilder does nothing until .send() is called"]
pub struct RequestBuilder {
    client: HttpClient,
    config: RequestConfig,
    /// Error captured during building (deferred to `send()`)
    error: Option<HttpError>,
}

impl RequestBuilder {
    pub(crate) fn new(client: HttpClient, config: RequestConfig) -> Self {
        Self {
            client,
            config,
            error: None,
        }
    }

    fn fail(&mut self, err: HttpError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    /// Append a header value.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        match header_pair(name, value) {
            Ok((name, value)) => {
                self.config.headers.append(name, value);
            }
            Err(err) => self.fail(err),
        }
        self
    }

    /// Add a query parameter; repeated names become lists.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.params.append(name, value);
        self
    }

    /// Add every field of a serializable struct or map as a query parameter.
    pub fn query<T: Serialize + ?Sized>(mut self, query: &T) -> Self {
        match serde_urlencoded::to_string(query) {
            Ok(encoded) => {
                for (name, value) in form_urlencoded::parse(encoded.as_bytes()) {
                    self.config.params.append(name, value);
                }
            }
            Err(err) => self.fail(ErrorKind::Encode(Box::new(err)).into()),
        }
        self
    }

    /// JSON body.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Self {
        match RequestBody::json(body) {
            Ok(data) => self.config.data = Some(data),
            Err(err) => self.fail(err),
        }
        self
    }

    /// Url-encoded form body.
    pub fn form<T: Serialize + ?Sized>(mut self, body: &T) -> Self {
        match RequestBody::form(body) {
            Ok(data) => self.config.data = Some(data),
            Err(err) => self.fail(err),
        }
        self
    }

    /// Text, bytes, JSON value or stream body.
    pub fn body(mut self, body: impl Into<RequestBody>) -> Self {
        self.config.data = Some(body.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    pub fn response_type(mut self, response_type: ResponseType) -> Self {
        self.config.response_type = Some(response_type);
        self
    }

    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.auth = Some(BasicAuth::new(username, password));
        self
    }

    pub fn with_credentials(mut self, with_credentials: bool) -> Self {
        self.config.with_credentials = Some(with_credentials);
        self
    }

    pub fn validate_status<F>(mut self, validate: F) -> Self
    where
        F: Fn(StatusCode) -> bool + Send + Sync + 'static,
    {
        self.config.validate_status = Some(Arc::new(validate));
        self
    }

    pub fn max_redirects(mut self, max: usize) -> Self {
        self.config.max_redirects = Some(max);
        self
    }

    pub fn max_content_length(mut self, limit: usize) -> Self {
        self.config.max_content_length = Some(limit);
        self
    }

    pub fn max_body_length(mut self, limit: usize) -> Self {
        self.config.max_body_length = Some(limit);
        self
    }

    pub fn decompress(mut self, decompress: bool) -> Self {
        self.config.decompress = Some(decompress);
        self
    }

    /// Fail on JSON decode errors instead of falling back to text.
    pub fn strict_json(mut self, strict: bool) -> Self {
        self.config.strict_json = Some(strict);
        self
    }

    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.config.cancel_token = Some(token);
        self
    }

    pub fn signal(mut self, signal: CancellationToken) -> Self {
        self.config.signal = Some(signal);
        self
    }

    pub fn on_upload_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(ProgressEvent) + Send + Sync + 'static,
    {
        self.config.on_upload_progress = Some(Arc::new(callback));
        self
    }

    pub fn on_download_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(ProgressEvent) + Send + Sync + 'static,
    {
        self.config.on_download_progress = Some(Arc::new(callback));
        self
    }

    pub fn cache(mut self, policy: CachePolicy) -> Self {
        self.config.cache = Some(policy);
        self
    }

    /// Bypass the client's cache for this request.
    pub fn no_cache(self) -> Self {
        self.cache(CachePolicy::disabled())
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = Some(policy);
        self
    }

    /// Single attempt regardless of the client's default policy.
    pub fn no_retry(self) -> Self {
        self.retry(RetryPolicy::none())
    }

    /// The call-site config built so far, before client defaults.
    #[must_use]
    pub fn config(&self) -> &RequestConfig {
        &self.config
    }

    /// # Errors
    ///
    /// Returns a deferred build error, or whatever [`HttpClient::request`]
    /// returns.
    pub async fn send(self) -> Result<Response, HttpError> {
        if let Some(err) = self.error {
            return Err(err.with_config(&self.config));
        }
        self.client.request(self.config).await
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::transport::{MockAdapter, MockReply};
    use http::Method;
    use serde_json::json;

    fn client(mock: &Arc<MockAdapter>) -> HttpClient {
        HttpClient::builder()
            .mock(Arc::clone(mock))
            .base_url("https://api.example.com")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_post_json_with_params() {
        let mock = Arc::new(MockAdapter::new());
        mock.reply(
            Method::POST,
            "/users",
            MockReply::json(StatusCode::CREATED, &json!({"id": 7})),
        );

        let response = client(&mock)
            .post("/users")
            .param("notify", "true")
            .header("x-request-id", "abc123")
            .json(&json!({"name": "Alice"}))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::CREATED);
        let request = &mock.requests()[0];
        assert_eq!(request.url, "https://api.example.com/users?notify=true");
        assert_eq!(request.headers["x-request-id"], "abc123");
        assert_eq!(request.headers["content-type"], "application/json");
        assert_eq!(request.json(), Some(json!({"name": "Alice"})));
    }

    #[tokio::test]
    async fn test_query_struct() {
        #[derive(Serialize)]
        struct Page {
            page: u32,
            sort: &'static str,
        }

        let mock = Arc::new(MockAdapter::new());
        mock.reply(Method::GET, "/items", MockReply::status(StatusCode::OK));

        client(&mock)
            .get("/items")
            .query(&Page {
                page: 2,
                sort: "asc",
            })
            .send()
            .await
            .unwrap();

        assert_eq!(
            mock.requests()[0].url,
            "https://api.example.com/items?page=2&sort=asc"
        );
    }

    #[tokio::test]
    async fn test_invalid_header_is_deferred() {
        let mock = Arc::new(MockAdapter::new());
        let err = client(&mock)
            .get("/items")
            .header("x-ok", "1")
            .header("bad header", "x")
            .send()
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::Validation);
        assert!(err.config_ref().is_some());
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn test_validate_status_override() {
        let mock = Arc::new(MockAdapter::new());
        mock.reply(Method::GET, "/gone", MockReply::status(StatusCode::GONE));

        let response = client(&mock)
            .get("/gone")
            .validate_status(|status| status.as_u16() < 500)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::GONE);
    }
}
