//! Turning a [`RequestConfig`] into something a primitive can send.

use super::AdapterKind;
use crate::error::{ErrorKind, HttpError};
use crate::request::{BodyStream, DEFAULT_ACCEPT, RequestBody, RequestConfig};
use crate::response::RequestHandle;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::{HeaderMap, Method};
use url::form_urlencoded;

/// Serialized request body.
#[derive(Debug, Clone)]
pub enum PreparedBody {
    Empty,
    Bytes(Bytes),
    /// Piped through unbuffered
    Stream(BodyStream),
}

impl PreparedBody {
    /// Length in bytes, when known up front.
    #[must_use]
    pub fn len(&self) -> Option<u64> {
        match self {
            Self::Empty => Some(0),
            Self::Bytes(bytes) => u64::try_from(bytes.len()).ok(),
            Self::Stream(stream) => stream.length(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }
}

/// Request ready to hand to a network primitive.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    /// Absolute or relative URL with the query string applied
    pub url: String,
    pub headers: HeaderMap,
    pub body: PreparedBody,
}

impl PreparedRequest {
    #[must_use]
    pub fn handle(&self, adapter: AdapterKind) -> RequestHandle {
        RequestHandle {
            adapter,
            method: self.method.clone(),
            url: self.url.clone(),
        }
    }
}

/// Build the target URL: base URL, path and query parameters.
///
/// Configured params replace pre-existing query parameters of the same name;
/// list values serialize as repeated keys. Without params the URL is used as is.
///
/// # Errors
///
/// Returns a `validation` error if neither `url` nor `base_url` is set.
pub fn build_url(config: &RequestConfig) -> Result<String, HttpError> {
    let full = config.full_url().ok_or_else(|| {
        HttpError::new(ErrorKind::InvalidUrl {
            url: String::new(),
            reason: "no url configured".to_owned(),
        })
    })?;

    if config.params.is_empty() {
        return Ok(full);
    }

    let without_fragment = full.split_once('#').map_or(full.as_str(), |(head, _)| head);
    let (path, existing) = match without_fragment.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (without_fragment, None),
    };

    let mut query = form_urlencoded::Serializer::new(String::new());
    if let Some(existing) = existing {
        for (name, value) in form_urlencoded::parse(existing.as_bytes()) {
            if !config.params.contains(&name) {
                query.append_pair(&name, &value);
            }
        }
    }
    for (name, value) in config.params.pairs() {
        query.append_pair(name, value);
    }

    let query = query.finish();
    if query.is_empty() {
        Ok(path.to_owned())
    } else {
        Ok(format!("{path}?{query}"))
    }
}

/// Resolve URL, headers and body for one attempt.
///
/// # Errors
///
/// Returns a `validation` error for a missing URL, an unencodable body or a
/// body larger than `max_body_length`.
pub fn prepare(config: &RequestConfig) -> Result<PreparedRequest, HttpError> {
    let url = build_url(config)?;
    let mut headers = config.headers.clone();
    let body = encode_body(config.data.as_ref(), &mut headers)?;

    if let (Some(limit), PreparedBody::Bytes(bytes)) = (config.max_body_length, &body)
        && bytes.len() > limit
    {
        return Err(ErrorKind::RequestBodyTooLarge {
            limit,
            actual: bytes.len(),
        }
        .into());
    }

    if let Some(len) = body.len().filter(|len| *len > 0) {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }

    if let Some(auth) = &config.auth {
        let credentials = STANDARD.encode(format!("{}:{}", auth.username, auth.password));
        let value = HeaderValue::from_str(&format!("Basic {credentials}"))
            .map_err(|e| ErrorKind::InvalidHeader(e.to_string()))?;
        headers.insert(header::AUTHORIZATION, value);
    }

    headers
        .entry(header::ACCEPT)
        .or_insert(HeaderValue::from_static(DEFAULT_ACCEPT));

    Ok(PreparedRequest {
        method: config.method(),
        url,
        headers,
        body,
    })
}

fn encode_body(
    data: Option<&RequestBody>,
    headers: &mut HeaderMap,
) -> Result<PreparedBody, HttpError> {
    let (body, content_type) = match data {
        None => return Ok(PreparedBody::Empty),
        Some(RequestBody::Text(text)) => (
            PreparedBody::Bytes(Bytes::from(text.clone())),
            "text/plain;charset=utf-8",
        ),
        Some(RequestBody::Binary(bytes)) => {
            (PreparedBody::Bytes(bytes.clone()), "application/octet-stream")
        }
        Some(RequestBody::Json(value)) => {
            let encoded =
                serde_json::to_vec(value).map_err(|e| ErrorKind::Encode(Box::new(e)))?;
            (PreparedBody::Bytes(Bytes::from(encoded)), "application/json")
        }
        Some(RequestBody::Form(form)) => (
            PreparedBody::Bytes(Bytes::from(form.clone())),
            "application/x-www-form-urlencoded",
        ),
        Some(RequestBody::Stream(stream)) => (
            PreparedBody::Stream(stream.clone()),
            "application/octet-stream",
        ),
    };

    headers
        .entry(header::CONTENT_TYPE)
        .or_insert(HeaderValue::from_static(content_type));
    Ok(body)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::request::BasicAuth;

    #[test]
    fn test_build_url_appends_params() {
        let config = RequestConfig::new("/users")
            .with_base_url("https://api.example.com")
            .with_param("page", "2");
        assert_eq!(
            build_url(&config).unwrap(),
            "https://api.example.com/users?page=2"
        );
    }

    #[test]
    fn test_build_url_params_override_existing_query() {
        let config = RequestConfig::new("https://x.test/list?page=1&sort=asc#top")
            .with_param("page", "3");
        assert_eq!(
            build_url(&config).unwrap(),
            "https://x.test/list?sort=asc&page=3"
        );
    }

    #[test]
    fn test_build_url_lists_repeat_keys() {
        let config = RequestConfig::new("/tags")
            .with_param("t", "a")
            .with_param("t", "b c");
        assert_eq!(build_url(&config).unwrap(), "/tags?t=a&t=b+c");
    }

    #[test]
    fn test_build_url_without_params_untouched() {
        let config = RequestConfig::new("https://x.test/a?b=1#frag");
        assert_eq!(build_url(&config).unwrap(), "https://x.test/a?b=1#frag");
    }

    #[test]
    fn test_build_url_requires_url() {
        let err = build_url(&RequestConfig::default()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);
    }

    #[test]
    fn test_json_body_sets_content_type_and_length() {
        let config = RequestConfig::new("/x")
            .with_method(Method::POST)
            .with_data(serde_json::json!({"a": 1}));
        let prepared = prepare(&config).unwrap();

        assert_eq!(prepared.headers[header::CONTENT_TYPE], "application/json");
        assert_eq!(prepared.headers[header::CONTENT_LENGTH], "7");
        assert_eq!(prepared.headers[header::ACCEPT], DEFAULT_ACCEPT);
        match prepared.body {
            PreparedBody::Bytes(b) => assert_eq!(&b[..], br#"{"a":1}"#),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_caller_content_type_is_kept() {
        let config = RequestConfig::new("/x")
            .with_header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/vnd.api+json"),
            )
            .with_data(serde_json::json!([]));
        let prepared = prepare(&config).unwrap();
        assert_eq!(
            prepared.headers[header::CONTENT_TYPE],
            "application/vnd.api+json"
        );
    }

    #[test]
    fn test_stream_body_has_no_content_length() {
        let stream = BodyStream::new(futures::stream::empty());
        let config = RequestConfig::new("/upload").with_data(stream);
        let prepared = prepare(&config).unwrap();
        assert!(!prepared.headers.contains_key(header::CONTENT_LENGTH));
        assert!(matches!(prepared.body, PreparedBody::Stream(_)));
    }

    #[test]
    fn test_basic_auth_header() {
        let config = RequestConfig {
            auth: Some(BasicAuth::new("Aladdin", "open sesame")),
            ..RequestConfig::new("/secret")
        };
        let prepared = prepare(&config).unwrap();
        assert_eq!(
            prepared.headers[header::AUTHORIZATION],
            "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="
        );
    }

    #[test]
    fn test_max_body_length() {
        let config = RequestConfig {
            max_body_length: Some(4),
            ..RequestConfig::new("/x").with_data("too long")
        };
        let err = prepare(&config).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);
        assert!(matches!(
            err.kind(),
            ErrorKind::RequestBodyTooLarge {
                limit: 4,
                actual: 8
            }
        ));
    }
}
