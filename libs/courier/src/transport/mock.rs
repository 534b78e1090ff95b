//! In-memory adapter for tests.
//!
//! Routes are matched on method and path; unmatched requests get a 404.
//! Every attempt is recorded so tests can assert on retry counts.

use super::body::{
    BodyCollector, ResponseHead, collect_stream, decode_content, finish_buffered, settle,
};
use super::prepare::{PreparedBody, prepare};
use super::{AdapterKind, TransportAdapter, guarded};
use crate::error::{BoxError, HttpError};
use crate::request::{BodyStream, ProgressEvent, RequestConfig, ResponseType};
use crate::response::{Response, ResponseData};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{future, stream};
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// A request as the mock saw it.
#[derive(Debug, Clone)]
pub struct MockRequest {
    pub method: Method,
    pub url: String,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl MockRequest {
    /// Request body parsed as JSON, if it is JSON.
    #[must_use]
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

/// Canned reply.
#[derive(Debug, Clone)]
pub struct MockReply {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    delay: Option<Duration>,
    failure: Option<String>,
}

impl MockReply {
    #[must_use]
    pub fn status(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            delay: None,
            failure: None,
        }
    }

    #[must_use]
    pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
        Self::status(status)
            .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .with_body(value.to_string())
    }

    #[must_use]
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self::status(status)
            .with_header(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain;charset=utf-8"),
            )
            .with_body(body.into())
    }

    /// Fail the attempt with a network error instead of answering.
    #[must_use]
    pub fn network_error(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::status(StatusCode::OK)
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Wait before answering.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

type Handler = Arc<dyn Fn(&MockRequest) -> MockReply + Send + Sync>;

struct Route {
    method: Option<Method>,
    path: String,
    handler: Handler,
}

/// Adapter answering from registered routes.
#[derive(Default)]
pub struct MockAdapter {
    routes: RwLock<Vec<Route>>,
    requests: Mutex<Vec<MockRequest>>,
}

impl MockAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `method path` with `handler`. `None` matches any method.
    ///
    /// Later registrations take precedence over earlier ones.
    pub fn on<F>(&self, method: Option<Method>, path: &str, handler: F)
    where
        F: Fn(&MockRequest) -> MockReply + Send + Sync + 'static,
    {
        self.routes.write().push(Route {
            method,
            path: path.to_owned(),
            handler: Arc::new(handler),
        });
    }

    /// Always answer `method path` with `reply`.
    pub fn reply(&self, method: Method, path: &str, reply: MockReply) {
        self.on(Some(method), path, move |_| reply.clone());
    }

    /// Answer successive calls with `replies` in order, repeating the last one.
    pub fn sequence(&self, method: Method, path: &str, replies: Vec<MockReply>) {
        let fallback = replies
            .last()
            .cloned()
            .unwrap_or_else(|| MockReply::status(StatusCode::NOT_FOUND));
        let queue = Mutex::new(VecDeque::from(replies));
        self.on(Some(method), path, move |_| {
            let mut queue = queue.lock();
            if queue.len() > 1 {
                queue.pop_front().unwrap_or_else(|| fallback.clone())
            } else {
                fallback.clone()
            }
        });
    }

    /// Number of attempts seen.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    /// Number of attempts seen for `path`.
    #[must_use]
    pub fn calls_to(&self, path: &str) -> usize {
        self.requests.lock().iter().filter(|r| r.path == path).count()
    }

    #[must_use]
    pub fn requests(&self) -> Vec<MockRequest> {
        self.requests.lock().clone()
    }

    /// Forget recorded requests; routes stay.
    pub fn reset(&self) {
        self.requests.lock().clear();
    }

    fn route(&self, request: &MockRequest) -> MockReply {
        let routes = self.routes.read();
        routes
            .iter()
            .rev()
            .find(|route| {
                route.path == request.path
                    && route.method.as_ref().is_none_or(|m| *m == request.method)
            })
            .map_or_else(
                || MockReply::text(StatusCode::NOT_FOUND, "no mock route"),
                |route| (route.handler)(request),
            )
    }

    async fn perform(&self, config: &RequestConfig) -> Result<Response, HttpError> {
        let prepared = prepare(config)?;
        let handle = prepared.handle(AdapterKind::Mock);

        let body = match &prepared.body {
            PreparedBody::Empty => Bytes::new(),
            PreparedBody::Bytes(bytes) => bytes.clone(),
            PreparedBody::Stream(stream) => {
                let stream = stream.take().ok_or_else(|| {
                    HttpError::config("stream body was already consumed by an earlier attempt")
                })?;
                let sink = RequestConfig::default();
                collect_stream(stream, &sink, None).await?
            }
        };
        if let Some(on_progress) = &config.on_upload_progress
            && !body.is_empty()
        {
            let total = u64::try_from(body.len()).unwrap_or(u64::MAX);
            on_progress(ProgressEvent::new(total, Some(total)));
        }

        let request = MockRequest {
            method: prepared.method,
            path: path_of(&prepared.url),
            url: prepared.url,
            headers: prepared.headers,
            body,
        };
        tracing::trace!(method = %request.method, path = %request.path, "mock request");
        self.requests.lock().push(request.clone());

        let reply = self.route(&request);
        if let Some(delay) = reply.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = reply.failure {
            return Err(HttpError::network(message).with_request(handle));
        }

        let mut head = ResponseHead {
            status: reply.status,
            status_text: None,
            headers: reply.headers,
            request: handle.clone(),
        };

        let total = u64::try_from(reply.body.len()).ok();
        let mut collector = BodyCollector::new(config, total);
        if !reply.body.is_empty() {
            collector
                .push(&reply.body)
                .map_err(|e| e.with_request(handle))?;
        }
        let bytes = collector.finish();

        if config.response_type() == ResponseType::Stream {
            let bytes = decode_content(config, &mut head.headers, bytes)?;
            let chunk: Result<Bytes, BoxError> = Ok(bytes);
            let stream = BodyStream::new(stream::once(future::ready(chunk)));
            return settle(config, head, ResponseData::Stream(stream));
        }
        finish_buffered(config, head, bytes)
    }
}

fn path_of(url: &str) -> String {
    if let Ok(parsed) = url::Url::parse(url) {
        return parsed.path().to_owned();
    }
    let end = url.find(['?', '#']).unwrap_or(url.len());
    url[..end].to_owned()
}

#[async_trait]
impl TransportAdapter for MockAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Mock
    }

    async fn execute(&self, config: RequestConfig) -> Result<Response, HttpError> {
        guarded(&config, self.perform(&config)).await
    }
}
