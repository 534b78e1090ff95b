use crate::error::{BoxError, ErrorKind, HttpError};
use crate::request::{BodyStream, RequestConfig};
use crate::transport::AdapterKind;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::{Duration, SystemTime};

/// Wait requested by a `Retry-After` header, measured from `now`.
///
/// The value is either delta-seconds or an HTTP-date. A date that has
/// already passed asks for an immediate retry and yields zero; anything
/// else unreadable (signs, fractions, free text) yields `None`.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let raw = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?.trim();
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        return raw.parse().ok().map(Duration::from_secs);
    }
    let at = httpdate::parse_http_date(raw).ok()?;
    Some(at.duration_since(now).unwrap_or_default())
}

/// Identity of the request that produced a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHandle {
    pub adapter: AdapterKind,
    pub method: Method,
    /// Final URL, including the query string
    pub url: String,
}

/// Decoded response body.
#[derive(Clone)]
pub enum ResponseData {
    /// The body was empty
    Empty,
    Json(serde_json::Value),
    Text(String),
    Binary(Bytes),
    /// Unread body, for `ResponseType::Stream`
    Stream(BodyStream),
}

impl ResponseData {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    #[must_use]
    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }

    #[must_use]
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }
}

impl fmt::Debug for ResponseData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Binary(bytes) => write!(f, "Binary({} bytes)", bytes.len()),
            Self::Stream(stream) => f.debug_tuple("Stream").field(stream).finish(),
        }
    }
}

/// Normalized response, identical in shape across every transport.
#[derive(Debug, Clone)]
pub struct Response {
    pub data: ResponseData,
    pub status: StatusCode,
    pub status_text: String,
    pub headers: HeaderMap,
    /// Configuration that produced this response
    pub config: RequestConfig,
    pub request: Option<RequestHandle>,
}

impl Response {
    /// Empty response with the canonical status text, e.g. for an error
    /// handler recovering with a synthetic reply.
    #[must_use]
    pub fn new(status: StatusCode, config: RequestConfig) -> Self {
        Self {
            data: ResponseData::Empty,
            status,
            status_text: status.canonical_reason().unwrap_or_default().to_owned(),
            headers: HeaderMap::new(),
            config,
            request: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: ResponseData) -> Self {
        self.data = data;
        self
    }

    /// Deserialize the body into `T`.
    ///
    /// Works on JSON bodies as well as text bodies holding JSON.
    ///
    /// # Errors
    ///
    /// Returns a `parse` error if the body is not valid JSON for `T`, or is
    /// binary or a stream.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HttpError> {
        let parsed: Result<T, BoxError> = match &self.data {
            ResponseData::Json(value) => T::deserialize(value).map_err(Into::into),
            ResponseData::Text(text) => serde_json::from_str(text).map_err(Into::into),
            ResponseData::Empty => serde_json::from_str("null").map_err(Into::into),
            ResponseData::Binary(_) | ResponseData::Stream(_) => {
                Err("response body is not textual".into())
            }
        };
        parsed.map_err(|e| HttpError::new(ErrorKind::Parse(e)))
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Header value as string, if present and valid UTF-8.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Server-requested wait before the next attempt, at most `cap`.
    #[must_use]
    pub fn retry_after(&self, cap: Option<Duration>) -> Option<Duration> {
        let wait = parse_retry_after(&self.headers, SystemTime::now())?;
        Some(cap.map_or(wait, |cap| wait.min(cap)))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use http::HeaderValue;
    use serde::Deserialize;

    fn response(data: ResponseData) -> Response {
        Response {
            data,
            status: StatusCode::OK,
            status_text: "OK".to_owned(),
            headers: HeaderMap::new(),
            config: RequestConfig::default(),
            request: None,
        }
    }

    fn retry_after_headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::RETRY_AFTER, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_retry_after_delta_seconds() {
        let now = SystemTime::now();
        assert_eq!(
            parse_retry_after(&retry_after_headers(" 120 "), now),
            Some(Duration::from_secs(120))
        );
        for garbage in ["-5", "+5", "1.5", "soon", ""] {
            assert_eq!(parse_retry_after(&retry_after_headers(garbage), now), None);
        }
        assert_eq!(parse_retry_after(&HeaderMap::new(), now), None);
    }

    #[test]
    fn test_retry_after_http_date() {
        let now = httpdate::parse_http_date("Wed, 21 Oct 2015 07:28:00 GMT").unwrap();
        let later = retry_after_headers("Wed, 21 Oct 2015 07:30:00 GMT");
        assert_eq!(parse_retry_after(&later, now), Some(Duration::from_secs(120)));

        let earlier = retry_after_headers("Wed, 21 Oct 2015 07:00:00 GMT");
        assert_eq!(parse_retry_after(&earlier, now), Some(Duration::ZERO));
    }

    #[test]
    fn test_response_retry_after_is_capped() {
        let mut response = Response::new(StatusCode::SERVICE_UNAVAILABLE, RequestConfig::new("/x"));
        response.headers = retry_after_headers("300");
        assert_eq!(response.retry_after(None), Some(Duration::from_secs(300)));
        assert_eq!(
            response.retry_after(Some(Duration::from_secs(60))),
            Some(Duration::from_secs(60))
        );
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct User {
        id: u32,
    }

    #[test]
    fn test_json_from_structured_and_text() {
        let structured = response(ResponseData::Json(serde_json::json!({"id": 7})));
        assert_eq!(structured.json::<User>().unwrap(), User { id: 7 });

        let text = response(ResponseData::Text(r#"{"id": 8}"#.to_owned()));
        assert_eq!(text.json::<User>().unwrap(), User { id: 8 });
    }

    #[test]
    fn test_json_on_binary_is_parse_error() {
        let binary = response(ResponseData::Binary(Bytes::from_static(b"\x00\x01")));
        let err = binary.json::<User>().unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::Parse);
    }
}
