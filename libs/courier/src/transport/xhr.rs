//! Transport over an event-driven browser request primitive.
//!
//! The primitive reports its lifecycle through [`XhrEvent`]s on a channel;
//! the adapter folds those events into a single outcome.

use super::body::{
    BodyCollector, ResponseHead, content_length, decode_content, finish_buffered, settle,
};
use super::prepare::{PreparedBody, prepare};
use super::{AdapterKind, TransportAdapter, guarded};
use crate::cancel::Cancel;
use crate::error::{BoxError, HttpError};
use crate::request::{BodyStream, ProgressEvent, RequestConfig, ResponseType};
use crate::response::{Response, ResponseData};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{future, stream};
use http::{HeaderMap, Method, StatusCode};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct XhrRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub with_credentials: bool,
}

/// Lifecycle notifications emitted by the primitive.
#[derive(Debug, Clone)]
pub enum XhrEvent {
    UploadProgress {
        loaded: u64,
        total: Option<u64>,
    },
    HeadersReceived {
        status: StatusCode,
        status_text: String,
        headers: HeaderMap,
        /// Final URL after redirects
        url: Option<String>,
    },
    Progress(Bytes),
    Load,
    Error(String),
    Timeout,
    Abort,
}

/// Live request owned by the adapter.
pub trait XhrHandle: Send {
    fn abort(&mut self);
}

/// Event-driven network primitive.
pub trait XhrPrimitive: Send + Sync {
    /// Start `request`, reporting progress on `events` until a terminal event.
    fn send(
        &self,
        request: XhrRequest,
        events: mpsc::UnboundedSender<XhrEvent>,
    ) -> Box<dyn XhrHandle>;
}

/// Aborts the primitive unless the attempt reached a terminal event.
struct AbortOnDrop(Option<Box<dyn XhrHandle>>);

impl AbortOnDrop {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(mut handle) = self.0.take() {
            handle.abort();
        }
    }
}

/// Transport for browser-like environments.
#[derive(Clone)]
pub struct XhrAdapter {
    primitive: Arc<dyn XhrPrimitive>,
}

impl XhrAdapter {
    #[must_use]
    pub fn new(primitive: Arc<dyn XhrPrimitive>) -> Self {
        Self { primitive }
    }

    async fn perform(&self, config: &RequestConfig) -> Result<Response, HttpError> {
        let prepared = prepare(config)?;
        let mut handle = prepared.handle(AdapterKind::Browser);
        let body = match prepared.body {
            PreparedBody::Empty => None,
            PreparedBody::Bytes(bytes) => Some(bytes),
            PreparedBody::Stream(_) => {
                return Err(HttpError::config(
                    "streaming request bodies are not supported by the browser transport",
                ));
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = XhrRequest {
            method: prepared.method,
            url: prepared.url,
            headers: prepared.headers,
            body,
            with_credentials: config.with_credentials.unwrap_or(false),
        };
        let mut live = AbortOnDrop(Some(self.primitive.send(request, tx)));

        let mut head: Option<ResponseHead> = None;
        let mut collector: Option<BodyCollector<'_>> = None;

        loop {
            let Some(event) = rx.recv().await else {
                return Err(HttpError::network("request ended without a terminal event")
                    .with_request(handle));
            };
            match event {
                XhrEvent::UploadProgress { loaded, total } => {
                    if let Some(on_progress) = &config.on_upload_progress {
                        on_progress(ProgressEvent::new(loaded, total));
                    }
                }
                XhrEvent::HeadersReceived {
                    status,
                    status_text,
                    headers,
                    url,
                } => {
                    if let Some(url) = url {
                        handle.url = url;
                    }
                    collector = Some(BodyCollector::new(config, content_length(&headers)));
                    head = Some(ResponseHead {
                        status,
                        status_text: Some(status_text),
                        headers,
                        request: handle.clone(),
                    });
                }
                XhrEvent::Progress(chunk) => {
                    let collector = collector
                        .get_or_insert_with(|| BodyCollector::new(config, None));
                    collector
                        .push(&chunk)
                        .map_err(|e| e.with_request(handle.clone()))?;
                }
                XhrEvent::Load => break,
                XhrEvent::Error(message) => {
                    live.disarm();
                    return Err(HttpError::network(message).with_request(handle));
                }
                XhrEvent::Timeout => {
                    live.disarm();
                    return Err(
                        HttpError::timeout(config.timeout.unwrap_or_default()).with_request(handle)
                    );
                }
                XhrEvent::Abort => {
                    live.disarm();
                    return Err(HttpError::cancelled(Cancel::new("request aborted"))
                        .with_request(handle));
                }
            }
        }
        live.disarm();

        let head = head.ok_or_else(|| {
            HttpError::network("request completed without response headers")
                .with_request(handle.clone())
        })?;
        let bytes = collector.map(BodyCollector::finish).unwrap_or_default();

        if config.response_type() == ResponseType::Stream {
            // Buffered by the primitive anyway; hand it back as a one-chunk stream.
            let mut head = head;
            let bytes = decode_content(config, &mut head.headers, bytes)?;
            let chunk: Result<Bytes, BoxError> = Ok(bytes);
            let stream = BodyStream::new(stream::once(future::ready(chunk)));
            return settle(config, head, ResponseData::Stream(stream));
        }

        finish_buffered(config, head, bytes)
    }
}

#[async_trait]
impl TransportAdapter for XhrAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Browser
    }

    async fn execute(&self, config: RequestConfig) -> Result<Response, HttpError> {
        guarded(&config, self.perform(&config)).await
    }
}
