//! Transport over a promise-style fetch primitive.

use super::body::{
    LimitedStream, ResponseHead, collect_stream, content_length, finish_buffered, settle,
};
use super::prepare::{PreparedBody, prepare};
use super::{AdapterKind, TransportAdapter, guarded};
use crate::error::{BoxError, HttpError};
use crate::request::{BodyStream, ByteStream, ProgressEvent, RequestConfig, ResponseType};
use crate::response::{Response, ResponseData};
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Whether cookies and credentials accompany the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CredentialsMode {
    Omit,
    #[default]
    SameOrigin,
    Include,
}

/// What the primitive does with a 3xx.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RedirectMode {
    #[default]
    Follow,
    /// Hand the 3xx back unfollowed
    Manual,
    Error,
}

/// Request body handed to the primitive.
pub enum FetchBody {
    Empty,
    Bytes(Bytes),
    Stream(ByteStream),
}

impl fmt::Debug for FetchBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

#[derive(Debug)]
pub struct FetchRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: FetchBody,
    pub credentials: CredentialsMode,
    pub redirect: RedirectMode,
    /// Fires when the attempt is abandoned (timeout, cancellation, drop)
    pub signal: CancellationToken,
}

pub struct FetchResponse {
    pub status: StatusCode,
    pub status_text: String,
    pub headers: HeaderMap,
    /// Final URL after redirects
    pub url: Option<String>,
    pub body: ByteStream,
}

impl fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchResponse")
            .field("status", &self.status)
            .field("status_text", &self.status_text)
            .field("headers", &self.headers)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

/// Promise-style network primitive.
///
/// Resolves once response headers arrive; the body is streamed afterwards.
#[async_trait]
pub trait FetchPrimitive: Send + Sync {
    /// # Errors
    ///
    /// Any error is reported to callers as a `network` failure.
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, BoxError>;
}

/// Transport for environments exposing a fetch primitive.
#[derive(Clone)]
pub struct FetchAdapter {
    primitive: Arc<dyn FetchPrimitive>,
}

impl FetchAdapter {
    #[must_use]
    pub fn new(primitive: Arc<dyn FetchPrimitive>) -> Self {
        Self { primitive }
    }

    async fn perform(&self, config: &RequestConfig) -> Result<Response, HttpError> {
        let prepared = prepare(config)?;
        let mut handle = prepared.handle(AdapterKind::Fetch);
        let upload_total = prepared.body.len();

        let body = match &prepared.body {
            PreparedBody::Empty => FetchBody::Empty,
            PreparedBody::Bytes(bytes) => FetchBody::Bytes(bytes.clone()),
            PreparedBody::Stream(stream) => FetchBody::Stream(stream.take().ok_or_else(|| {
                HttpError::config("stream body was already consumed by an earlier attempt")
            })?),
        };

        let signal = CancellationToken::new();
        let abort = signal.clone().drop_guard();

        let request = FetchRequest {
            method: prepared.method,
            url: prepared.url,
            headers: prepared.headers,
            body,
            credentials: if config.with_credentials.unwrap_or(false) {
                CredentialsMode::Include
            } else {
                CredentialsMode::SameOrigin
            },
            redirect: if config.max_redirects() == 0 {
                RedirectMode::Manual
            } else {
                RedirectMode::Follow
            },
            signal,
        };

        let response = self
            .primitive
            .fetch(request)
            .await
            .map_err(|e| HttpError::network(e).with_request(handle.clone()))?;

        if let (Some(on_progress), Some(total)) = (&config.on_upload_progress, upload_total)
            && total > 0
        {
            on_progress(ProgressEvent::new(total, Some(total)));
        }
        if let Some(url) = response.url {
            handle.url = url;
        }

        let head = ResponseHead {
            status: response.status,
            status_text: Some(response.status_text),
            headers: response.headers,
            request: handle.clone(),
        };

        if config.response_type() == ResponseType::Stream {
            // The caller now owns the body; keep the primitive alive.
            abort.disarm();
            let stream = BodyStream::new(LimitedStream::new(
                response.body,
                config.max_content_length,
            ));
            return settle(config, head, ResponseData::Stream(stream));
        }

        let total = content_length(&head.headers);
        let bytes = collect_stream(response.body, config, total)
            .await
            .map_err(|e| e.with_request(handle))?;
        finish_buffered(config, head, bytes)
    }
}

#[async_trait]
impl TransportAdapter for FetchAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Fetch
    }

    async fn execute(&self, config: RequestConfig) -> Result<Response, HttpError> {
        guarded(&config, self.perform(&config)).await
    }
}
