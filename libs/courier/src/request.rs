use crate::cache::CachePolicy;
use crate::cancel::CancelToken;
use crate::error::{BoxError, ErrorKind, HttpError};
use crate::resilience::RetryPolicy;
use bytes::Bytes;
use futures::Stream;
use futures::stream::BoxStream;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default redirect limit for adapters that follow redirects
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Default `accept` header applied when the caller sets none
pub const DEFAULT_ACCEPT: &str = "application/json, text/plain, */*";

/// Predicate deciding which statuses resolve successfully
pub type ValidateStatus = Arc<dyn Fn(StatusCode) -> bool + Send + Sync>;

/// Upload/download progress observer
pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Chunked body stream
pub type ByteStream = BoxStream<'static, Result<Bytes, BoxError>>;

/// Progress notification for uploads and downloads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressEvent {
    /// Bytes transferred so far
    pub loaded: u64,
    /// Total bytes, when known
    pub total: Option<u64>,
    /// Fraction in `0.0..=1.0`; `0.0` when the total is unknown
    pub progress: f64,
    /// Whether `total` is known
    pub length_computable: bool,
}

impl ProgressEvent {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(loaded: u64, total: Option<u64>) -> Self {
        let progress = match total {
            Some(total) if total > 0 => (loaded as f64 / total as f64).min(1.0),
            _ => 0.0,
        };
        Self {
            loaded,
            total,
            progress,
            length_computable: total.is_some(),
        }
    }
}

/// How the response body should be decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    /// Try structured (JSON) decoding, fall back to text or bytes
    #[default]
    Auto,
    /// JSON, falling back to text unless `strict_json` is set
    Json,
    Text,
    Binary,
    /// Hand the body back unread
    Stream,
}

/// Username/password pair for HTTP basic authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Query parameters: name to list of values.
///
/// A list serializes as repeated keys (`a=1&a=2`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(BTreeMap<String, Vec<String>>);

impl Params {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `name` to a single value, replacing previous values.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), vec![value.into()]);
    }

    /// Add a value to `name`.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.entry(name.into()).or_default().push(value.into());
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.0.get(name).map(Vec::as_slice)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate `(name, values)` in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Flattened `(name, value)` pairs in name order.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .flat_map(|(k, vs)| vs.iter().map(move |v| (k.as_str(), v.as_str())))
    }

    /// Merge `other` into `self`; `other` wins per key.
    pub fn merge_from(&mut self, other: &Params) {
        for (name, values) in &other.0 {
            self.0.insert(name.clone(), values.clone());
        }
    }
}

impl<K, V> FromIterator<(K, V)> for Params
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (k, v) in iter {
            params.append(k, v);
        }
        params
    }
}

/// Take-once streaming body.
///
/// Clones share the same underlying stream; whichever clone takes it first
/// owns it. A stream body can therefore be sent once, and is never replayed
/// by retries.
#[derive(Clone)]
pub struct BodyStream {
    inner: Arc<Mutex<Option<ByteStream>>>,
    length: Option<u64>,
}

impl BodyStream {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, BoxError>> + Send + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Some(Box::pin(stream)))),
            length: None,
        }
    }

    /// Declare the total length, used for progress reporting.
    #[must_use]
    pub fn with_length(mut self, length: u64) -> Self {
        self.length = Some(length);
        self
    }

    #[must_use]
    pub fn length(&self) -> Option<u64> {
        self.length
    }

    /// Take the stream. Returns `None` if it was already taken.
    #[must_use]
    pub fn take(&self) -> Option<ByteStream> {
        self.inner.lock().take()
    }

    #[must_use]
    pub fn is_consumed(&self) -> bool {
        self.inner.lock().is_none()
    }
}

impl fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyStream")
            .field("length", &self.length)
            .field("consumed", &self.is_consumed())
            .finish()
    }
}

/// Request payload.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Text(String),
    Binary(Bytes),
    /// Structured body, sent as `application/json`
    Json(serde_json::Value),
    /// Already url-encoded form body
    Form(String),
    Stream(BodyStream),
}

impl RequestBody {
    /// Serialize `value` into a JSON body.
    ///
    /// # Errors
    ///
    /// Returns a `validation` error if `value` cannot be represented as JSON.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, HttpError> {
        serde_json::to_value(value)
            .map(Self::Json)
            .map_err(|e| ErrorKind::Encode(Box::new(e)).into())
    }

    /// Serialize `value` into an url-encoded form body.
    ///
    /// # Errors
    ///
    /// Returns a `validation` error if `value` is not a flat map or sequence of pairs.
    pub fn form<T: Serialize + ?Sized>(value: &T) -> Result<Self, HttpError> {
        serde_urlencoded::to_string(value)
            .map(Self::Form)
            .map_err(|e| ErrorKind::Encode(Box::new(e)).into())
    }

    #[must_use]
    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }
}

impl From<String> for RequestBody {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for RequestBody {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<Bytes> for RequestBody {
    fn from(value: Bytes) -> Self {
        Self::Binary(value)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(value))
    }
}

impl From<serde_json::Value> for RequestBody {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

impl From<BodyStream> for RequestBody {
    fn from(value: BodyStream) -> Self {
        Self::Stream(value)
    }
}

/// Declarative description of a request.
///
/// Every field is optional so a config can act as a partial overlay.
/// Client defaults and call-site configs combine through [`RequestConfig::merge`].
#[derive(Clone, Default)]
pub struct RequestConfig {
    pub url: Option<String>,
    pub base_url: Option<String>,
    /// Defaults to GET
    pub method: Option<Method>,
    pub headers: HeaderMap,
    pub params: Params,
    pub data: Option<RequestBody>,
    /// Per-attempt timeout; zero or absent disables it
    pub timeout: Option<Duration>,
    pub response_type: Option<ResponseType>,
    /// Defaults to accepting 2xx
    pub validate_status: Option<ValidateStatus>,
    pub with_credentials: Option<bool>,
    pub auth: Option<BasicAuth>,
    pub max_redirects: Option<usize>,
    /// Maximum decoded response body size
    pub max_content_length: Option<usize>,
    /// Maximum serialized request body size
    pub max_body_length: Option<usize>,
    /// Defaults to `true`
    pub decompress: Option<bool>,
    /// Fail with `parse` instead of falling back to text for `json` responses
    pub strict_json: Option<bool>,
    pub cancel_token: Option<CancelToken>,
    pub signal: Option<CancellationToken>,
    pub on_upload_progress: Option<ProgressCallback>,
    pub on_download_progress: Option<ProgressCallback>,
    pub cache: Option<CachePolicy>,
    pub retry: Option<RetryPolicy>,
}

impl RequestConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Append a header value.
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.append(name, value);
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: impl Into<RequestBody>) -> Self {
        self.data = Some(data.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_response_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = Some(response_type);
        self
    }

    #[must_use]
    pub fn with_validate_status<F>(mut self, validate: F) -> Self
    where
        F: Fn(StatusCode) -> bool + Send + Sync + 'static,
    {
        self.validate_status = Some(Arc::new(validate));
        self
    }

    #[must_use]
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    #[must_use]
    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    #[must_use]
    pub fn with_cache(mut self, policy: CachePolicy) -> Self {
        self.cache = Some(policy);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Effective method.
    #[must_use]
    pub fn method(&self) -> Method {
        self.method.clone().unwrap_or(Method::GET)
    }

    /// Effective response type.
    #[must_use]
    pub fn response_type(&self) -> ResponseType {
        self.response_type.unwrap_or_default()
    }

    #[must_use]
    pub fn decompress(&self) -> bool {
        self.decompress.unwrap_or(true)
    }

    #[must_use]
    pub fn max_redirects(&self) -> usize {
        self.max_redirects.unwrap_or(DEFAULT_MAX_REDIRECTS)
    }

    #[must_use]
    pub fn strict_json(&self) -> bool {
        self.strict_json.unwrap_or(false)
    }

    /// Whether `status` resolves successfully for this request.
    #[must_use]
    pub fn accepts_status(&self, status: StatusCode) -> bool {
        match &self.validate_status {
            Some(validate) => validate(status),
            None => status.is_success(),
        }
    }

    /// Base URL and URL joined, without query parameters.
    ///
    /// An absolute `url` ignores `base_url`.
    #[must_use]
    pub fn full_url(&self) -> Option<String> {
        match (self.base_url.as_deref(), self.url.as_deref()) {
            (_, Some(url)) if is_absolute_url(url) => Some(url.to_owned()),
            (Some(base), Some(url)) => Some(combine_urls(base, url)),
            (Some(base), None) => Some(base.to_owned()),
            (None, Some(url)) => Some(url.to_owned()),
            (None, None) => None,
        }
    }

    /// Right-biased merge: every field set on `child` wins.
    ///
    /// Headers are unioned by name, with child names replacing all parent
    /// values of that name. Params merge key-wise with the child winning.
    /// `cache` and `retry` are leaves: their fields carry concrete defaults
    /// rather than "unset", so a child policy replaces the parent's whole.
    #[must_use]
    pub fn merge(&self, child: &RequestConfig) -> RequestConfig {
        let mut headers = self.headers.clone();
        for name in child.headers.keys() {
            headers.remove(name);
            for value in child.headers.get_all(name) {
                headers.append(name.clone(), value.clone());
            }
        }

        let mut params = self.params.clone();
        params.merge_from(&child.params);

        RequestConfig {
            url: pick(&child.url, &self.url),
            base_url: pick(&child.base_url, &self.base_url),
            method: pick(&child.method, &self.method),
            headers,
            params,
            data: pick(&child.data, &self.data),
            timeout: child.timeout.or(self.timeout),
            response_type: child.response_type.or(self.response_type),
            validate_status: pick(&child.validate_status, &self.validate_status),
            with_credentials: child.with_credentials.or(self.with_credentials),
            auth: pick(&child.auth, &self.auth),
            max_redirects: child.max_redirects.or(self.max_redirects),
            max_content_length: child.max_content_length.or(self.max_content_length),
            max_body_length: child.max_body_length.or(self.max_body_length),
            decompress: child.decompress.or(self.decompress),
            strict_json: child.strict_json.or(self.strict_json),
            cancel_token: pick(&child.cancel_token, &self.cancel_token),
            signal: pick(&child.signal, &self.signal),
            on_upload_progress: pick(&child.on_upload_progress, &self.on_upload_progress),
            on_download_progress: pick(&child.on_download_progress, &self.on_download_progress),
            cache: pick(&child.cache, &self.cache),
            retry: pick(&child.retry, &self.retry),
        }
    }
}

fn pick<T: Clone>(child: &Option<T>, parent: &Option<T>) -> Option<T> {
    child.as_ref().or(parent.as_ref()).cloned()
}

/// `scheme://...` or protocol-relative `//host/...`
pub(crate) fn is_absolute_url(url: &str) -> bool {
    if url.starts_with("//") {
        return true;
    }
    let Some((scheme, _)) = url.split_once("://") else {
        return false;
    };
    let mut chars = scheme.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

fn combine_urls(base: &str, relative: &str) -> String {
    if relative.is_empty() {
        return base.to_owned();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        relative.trim_start_matches('/')
    )
}

impl fmt::Debug for RequestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestConfig")
            .field("url", &self.url)
            .field("base_url", &self.base_url)
            .field("method", &self.method)
            .field("headers", &self.headers)
            .field("params", &self.params)
            .field("data", &self.data)
            .field("timeout", &self.timeout)
            .field("response_type", &self.response_type)
            .field("auth", &self.auth)
            .field("max_redirects", &self.max_redirects)
            .field("max_content_length", &self.max_content_length)
            .field("max_body_length", &self.max_body_length)
            .field("decompress", &self.decompress)
            .field("cache", &self.cache)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
