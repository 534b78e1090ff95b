use crate::request::RequestConfig;
use crate::response::{Response, ResponseData};
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Serializable snapshot of a response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum CachedData {
    Empty,
    Json(serde_json::Value),
    Text(String),
    Binary(#[serde(with = "base64_bytes")] Vec<u8>),
}

/// Serializable snapshot of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub data: CachedData,
}

impl CachedResponse {
    /// Snapshot `response`, dropping headers named in `exclude`.
    ///
    /// Returns `None` for streamed bodies, which cannot be replayed.
    #[must_use]
    pub fn capture(response: &Response, exclude: &[String]) -> Option<Self> {
        let data = match &response.data {
            ResponseData::Empty => CachedData::Empty,
            ResponseData::Json(value) => CachedData::Json(value.clone()),
            ResponseData::Text(text) => CachedData::Text(text.clone()),
            ResponseData::Binary(bytes) => CachedData::Binary(bytes.to_vec()),
            ResponseData::Stream(_) => return None,
        };
        let headers = response
            .headers
            .iter()
            .filter(|(name, _)| {
                !exclude
                    .iter()
                    .any(|excluded| excluded.eq_ignore_ascii_case(name.as_str()))
            })
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_owned(), v.to_owned()))
            })
            .collect();
        Some(Self {
            status: response.status.as_u16(),
            status_text: response.status_text.clone(),
            headers,
            data,
        })
    }

    /// Rebuild a response for `config`. Malformed stored headers are skipped.
    #[must_use]
    pub fn restore(&self, config: RequestConfig) -> Response {
        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }
        let data = match &self.data {
            CachedData::Empty => ResponseData::Empty,
            CachedData::Json(value) => ResponseData::Json(value.clone()),
            CachedData::Text(text) => ResponseData::Text(text.clone()),
            CachedData::Binary(bytes) => ResponseData::Binary(Bytes::from(bytes.clone())),
        };
        Response {
            data,
            status: StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK),
            status_text: self.status_text.clone(),
            headers,
            config,
            request: None,
        }
    }
}

/// A stored response plus its freshness bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub response: CachedResponse,
    /// Milliseconds since the Unix epoch
    pub created_at_ms: i64,
    pub ttl_ms: u64,
}

impl CacheEntry {
    #[must_use]
    pub fn new(key: impl Into<String>, response: CachedResponse, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            response,
            created_at_ms: now_ms(),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        }
    }

    #[must_use]
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        let age = now_ms.saturating_sub(self.created_at_ms);
        age > i64::try_from(self.ttl_ms).unwrap_or(i64::MAX)
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_ms())
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        bytes: &[u8],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
