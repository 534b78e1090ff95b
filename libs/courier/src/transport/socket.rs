//! Native socket transport built on hyper.
//!
//! Tower stack (outer to inner):
//!
//! ```text
//! DefaultHeaders -> [Decompression] -> FollowRedirect -> hyper client
//! ```
//!
//! Two stacks are built up front, with and without the decompression layer,
//! so `decompress: false` requests get the raw encoded body.

use super::body::{
    BodyCollector, LimitedStream, ResponseHead, content_length, decode, settle,
};
use super::config::{HyperAdapterConfig, TransportSecurity};
use super::default_headers::DefaultHeadersLayer;
use super::prepare::{PreparedBody, prepare};
use super::redirect::{RedirectGuard, RedirectLimit};
use super::{AdapterKind, TransportAdapter, guarded, tls};
use crate::error::{BoxError, ErrorKind, HttpError};
use crate::request::{
    BodyStream, ByteStream, ProgressCallback, ProgressEvent, RequestConfig, ResponseType,
};
use crate::response::{Response, ResponseData};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use http::{Request, Uri};
use http_body::{Body, Frame, SizeHint};
use http_body_util::BodyExt;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::pin::Pin;
use std::task::{Context, Poll};
use tower::util::BoxCloneSyncService;
use tower::{Service, ServiceBuilder, ServiceExt};
use tower_http::decompression::DecompressionLayer;
use tower_http::follow_redirect::{FollowRedirectLayer, RequestUri};

/// Response body after the tower stack, type-erased.
type ResponseBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

type SocketService =
    BoxCloneSyncService<Request<TransportBody>, http::Response<ResponseBody>, HttpError>;

enum Source {
    Empty,
    Full { pending: Option<Bytes>, original: Bytes },
    Stream(Option<ByteStream>),
}

/// Outgoing request body with upload progress reporting.
///
/// Buffered bodies can be replayed for 307/308 redirects; streamed bodies cannot.
pub struct TransportBody {
    source: Source,
    on_progress: Option<ProgressCallback>,
    total: Option<u64>,
    sent: u64,
}

impl TransportBody {
    fn new(body: &PreparedBody, on_progress: Option<ProgressCallback>) -> Result<Self, HttpError> {
        let source = match body {
            PreparedBody::Empty => Source::Empty,
            PreparedBody::Bytes(bytes) => Source::Full {
                pending: Some(bytes.clone()),
                original: bytes.clone(),
            },
            PreparedBody::Stream(stream) => Source::Stream(Some(stream.take().ok_or_else(
                || HttpError::config("stream body was already consumed by an earlier attempt"),
            )?)),
        };
        Ok(Self {
            source,
            on_progress,
            total: body.len(),
            sent: 0,
        })
    }

    pub(crate) fn try_clone(&self) -> Option<Self> {
        let source = match &self.source {
            Source::Empty => Source::Empty,
            Source::Full { original, .. } => Source::Full {
                pending: Some(original.clone()),
                original: original.clone(),
            },
            Source::Stream(_) => return None,
        };
        Some(Self {
            source,
            on_progress: self.on_progress.clone(),
            total: self.total,
            sent: 0,
        })
    }
}

impl Default for TransportBody {
    fn default() -> Self {
        Self {
            source: Source::Empty,
            on_progress: None,
            total: Some(0),
            sent: 0,
        }
    }
}

impl Body for TransportBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let chunk = match &mut this.source {
            Source::Empty => return Poll::Ready(None),
            Source::Full { pending, .. } => match pending.take() {
                Some(bytes) => bytes,
                None => return Poll::Ready(None),
            },
            Source::Stream(stream) => {
                let Some(inner) = stream.as_mut() else {
                    return Poll::Ready(None);
                };
                match inner.poll_next_unpin(cx) {
                    Poll::Ready(Some(Ok(bytes))) => bytes,
                    Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                    Poll::Ready(None) => {
                        *stream = None;
                        return Poll::Ready(None);
                    }
                    Poll::Pending => return Poll::Pending,
                }
            }
        };

        this.sent = this
            .sent
            .saturating_add(u64::try_from(chunk.len()).unwrap_or(u64::MAX));
        if let Some(on_progress) = &this.on_progress {
            on_progress(ProgressEvent::new(this.sent, this.total));
        }
        Poll::Ready(Some(Ok(Frame::data(chunk))))
    }

    fn is_end_stream(&self) -> bool {
        match &self.source {
            Source::Empty => true,
            Source::Full { pending, .. } => pending.is_none(),
            Source::Stream(stream) => stream.is_none(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match (&self.source, self.total) {
            (Source::Empty, _) => SizeHint::with_exact(0),
            (Source::Full { original, .. }, _) => {
                SizeHint::with_exact(u64::try_from(original.len()).unwrap_or(u64::MAX))
            }
            (Source::Stream(_), Some(total)) => SizeHint::with_exact(total),
            (Source::Stream(_), None) => SizeHint::default(),
        }
    }
}

fn box_response<B>(response: http::Response<B>) -> http::Response<ResponseBody>
where
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    let (parts, body) = response.into_parts();
    http::Response::from_parts(parts, body.map_err(Into::into).boxed())
}

/// Transport for environments with a native socket stack.
#[derive(Clone)]
pub struct HyperAdapter {
    decoding: SocketService,
    raw: SocketService,
    transport: TransportSecurity,
}

impl HyperAdapter {
    /// Build the connection pool and tower stacks. Opens no connections.
    ///
    /// # Errors
    ///
    /// Returns a `validation` error if TLS roots cannot be loaded or the
    /// user agent is not a valid header value.
    pub fn new(config: &HyperAdapterConfig) -> Result<Self, HttpError> {
        let https = tls::https_connector(config.tls_roots, config.transport)?;

        let mut builder = Client::builder(TokioExecutor::new());
        builder
            .pool_timer(TokioTimer::new())
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .http2_only(false);
        if let Some(idle_timeout) = config.pool_idle_timeout {
            builder.pool_idle_timeout(idle_timeout);
        }
        let client = builder.build::<_, TransportBody>(https);

        let defaults =
            DefaultHeadersLayer::new().with(http::header::USER_AGENT, &config.user_agent)?;
        let policy = RedirectGuard::new(config.redirect.clone());

        let decoding = BoxCloneSyncService::new(
            ServiceBuilder::new()
                .layer(defaults.clone())
                .layer(DecompressionLayer::new())
                .layer(FollowRedirectLayer::with_policy(policy.clone()))
                .service(client.clone())
                .map_response(box_response)
                .map_err(HttpError::from),
        );

        let raw = BoxCloneSyncService::new(
            ServiceBuilder::new()
                .layer(defaults)
                .layer(FollowRedirectLayer::with_policy(policy))
                .service(client)
                .map_response(box_response)
                .map_err(HttpError::from),
        );

        Ok(Self {
            decoding,
            raw,
            transport: config.transport,
        })
    }

    fn parse_uri(&self, url: &str) -> Result<Uri, HttpError> {
        let invalid = |reason: &str| {
            HttpError::new(ErrorKind::InvalidUrl {
                url: url.to_owned(),
                reason: reason.to_owned(),
            })
        };
        let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| invalid(&e.to_string()))?;
        match uri.scheme_str() {
            Some("https") => {}
            Some("http") if self.transport == TransportSecurity::HttpOrHttps => {}
            Some("http") => return Err(invalid("plain HTTP is not allowed")),
            Some(_) => return Err(invalid("unsupported scheme")),
            None => return Err(invalid("absolute URL required")),
        }
        if uri.host().is_none() {
            return Err(invalid("missing host"));
        }
        Ok(uri)
    }

    async fn perform(&self, config: &RequestConfig) -> Result<Response, HttpError> {
        let prepared = prepare(config)?;
        let mut handle = prepared.handle(AdapterKind::ServerSocket);
        let uri = self.parse_uri(&prepared.url)?;

        let body = TransportBody::new(&prepared.body, config.on_upload_progress.clone())?;
        let mut request = Request::builder()
            .method(prepared.method)
            .uri(uri)
            .body(body)?;
        *request.headers_mut() = prepared.headers;
        if let Some(limit) = config.max_redirects {
            request.extensions_mut().insert(RedirectLimit(limit));
        }

        let mut service = if config.decompress() {
            self.decoding.clone()
        } else {
            self.raw.clone()
        };
        let response = service
            .ready()
            .await?
            .call(request)
            .await
            .map_err(|e| e.with_request(handle.clone()))?;

        let (parts, body) = response.into_parts();
        if let Some(RequestUri(final_uri)) = parts.extensions.get::<RequestUri>() {
            handle.url = final_uri.to_string();
        }
        let status_text = parts
            .extensions
            .get::<hyper::ext::ReasonPhrase>()
            .map(|reason| String::from_utf8_lossy(reason.as_bytes()).into_owned());
        let head = ResponseHead {
            status: parts.status,
            status_text,
            headers: parts.headers,
            request: handle.clone(),
        };

        if config.response_type() == ResponseType::Stream {
            let limited = LimitedStream::new(body.into_data_stream(), config.max_content_length);
            let stream = BodyStream::new(limited);
            return settle(config, head, ResponseData::Stream(stream));
        }

        let total = content_length(&head.headers);
        let bytes = read_body(body, config, total)
            .await
            .map_err(|e| e.with_request(handle.clone()))?;
        let data = decode(config, bytes).map_err(|e| e.with_request(handle))?;
        settle(config, head, data)
    }
}

async fn read_body(
    mut body: ResponseBody,
    config: &RequestConfig,
    total: Option<u64>,
) -> Result<Bytes, HttpError> {
    let mut collector = BodyCollector::new(config, total);
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(HttpError::network)?;
        if let Ok(data) = frame.into_data() {
            collector.push(&data)?;
        }
    }
    Ok(collector.finish())
}

#[async_trait]
impl TransportAdapter for HyperAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::ServerSocket
    }

    async fn execute(&self, config: RequestConfig) -> Result<Response, HttpError> {
        guarded(&config, self.perform(&config)).await
    }
}
