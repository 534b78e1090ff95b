//! Response body handling shared by every adapter.

use crate::error::{BoxError, ErrorKind, HttpError};
use crate::request::{ByteStream, ProgressEvent, RequestConfig, ResponseType};
use crate::response::{RequestHandle, Response, ResponseData};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use http::{HeaderMap, StatusCode, header};
use pin_project_lite::pin_project;
use std::io::Read;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

const BROTLI_BUFFER_SIZE: usize = 4096;

/// Accumulates body chunks under `max_content_length`, reporting download
/// progress as it goes.
pub(crate) struct BodyCollector<'a> {
    config: &'a RequestConfig,
    total: Option<u64>,
    buf: BytesMut,
    loaded: u64,
}

impl<'a> BodyCollector<'a> {
    pub(crate) fn new(config: &'a RequestConfig, total: Option<u64>) -> Self {
        Self {
            config,
            total,
            buf: BytesMut::new(),
            loaded: 0,
        }
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) -> Result<(), HttpError> {
        let actual = self.buf.len() + chunk.len();
        if let Some(limit) = self.config.max_content_length
            && actual > limit
        {
            return Err(ErrorKind::BodyTooLarge { limit, actual }.into());
        }
        self.buf.extend_from_slice(chunk);
        self.loaded = self
            .loaded
            .saturating_add(u64::try_from(chunk.len()).unwrap_or(u64::MAX));
        if let Some(on_progress) = &self.config.on_download_progress {
            on_progress(ProgressEvent::new(self.loaded, self.total));
        }
        Ok(())
    }

    pub(crate) fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

pin_project! {
    /// Chunk stream handed to callers in stream mode. Yields a `bad-response`
    /// error and ends once more than `limit` bytes went through.
    pub(crate) struct LimitedStream<S> {
        #[pin]
        inner: S,
        limit: Option<usize>,
        read: usize,
        exceeded: bool,
    }
}

impl<S> LimitedStream<S> {
    pub(crate) fn new(inner: S, limit: Option<usize>) -> Self {
        Self {
            inner,
            limit,
            read: 0,
            exceeded: false,
        }
    }
}

impl<S, E> Stream for LimitedStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<BoxError>,
{
    type Item = Result<Bytes, BoxError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if *this.exceeded {
            return Poll::Ready(None);
        }
        match ready!(this.inner.poll_next(cx)) {
            Some(Ok(chunk)) => {
                *this.read = this.read.saturating_add(chunk.len());
                if let Some(limit) = *this.limit
                    && *this.read > limit
                {
                    *this.exceeded = true;
                    let err = HttpError::from(ErrorKind::BodyTooLarge {
                        limit,
                        actual: *this.read,
                    });
                    return Poll::Ready(Some(Err(Box::new(err))));
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Err(e)) => Poll::Ready(Some(Err(e.into()))),
            None => Poll::Ready(None),
        }
    }
}

/// Declared `content-length`, if any.
pub(crate) fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Drain a chunk stream into memory under the request's limits.
pub(crate) async fn collect_stream(
    mut stream: ByteStream,
    config: &RequestConfig,
    total: Option<u64>,
) -> Result<Bytes, HttpError> {
    let mut collector = BodyCollector::new(config, total);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(HttpError::network)?;
        collector.push(&chunk)?;
    }
    Ok(collector.finish())
}

fn is_supported_encoding(encoding: &str) -> bool {
    matches!(encoding, "gzip" | "x-gzip" | "deflate" | "br")
}

/// Decompress a body according to its `content-encoding`.
///
/// Supports gzip, deflate (zlib-wrapped or raw) and brotli. Unknown or absent
/// encodings return the body unchanged. The decoded size is bounded by `limit`.
///
/// # Errors
///
/// Returns a `parse` error for corrupt compressed data and a `bad-response`
/// error when the decoded body exceeds `limit`.
pub fn decompress(
    content_encoding: Option<&str>,
    body: Bytes,
    limit: Option<usize>,
) -> Result<Bytes, HttpError> {
    let Some(encoding) = content_encoding.map(|e| e.trim().to_ascii_lowercase()) else {
        return Ok(body);
    };
    if body.is_empty() {
        return Ok(body);
    }
    if !is_supported_encoding(&encoding) {
        tracing::trace!(encoding = %encoding, "skipping unsupported content encoding");
        return Ok(body);
    }

    let cap = limit.map_or(u64::MAX, |l| {
        u64::try_from(l).unwrap_or(u64::MAX).saturating_add(1)
    });
    let mut out = Vec::new();
    let read = match encoding.as_str() {
        "gzip" | "x-gzip" => flate2::read::GzDecoder::new(&body[..])
            .take(cap)
            .read_to_end(&mut out),
        "deflate" => {
            let zlib = flate2::read::ZlibDecoder::new(&body[..])
                .take(cap)
                .read_to_end(&mut out);
            if zlib.is_err() {
                out.clear();
                flate2::read::DeflateDecoder::new(&body[..])
                    .take(cap)
                    .read_to_end(&mut out)
            } else {
                zlib
            }
        }
        _ => brotli::Decompressor::new(&body[..], BROTLI_BUFFER_SIZE)
            .take(cap)
            .read_to_end(&mut out),
    };
    read.map_err(|e| HttpError::new(ErrorKind::Parse(Box::new(e))))?;

    if let Some(limit) = limit
        && out.len() > limit
    {
        return Err(ErrorKind::BodyTooLarge {
            limit,
            actual: out.len(),
        }
        .into());
    }
    Ok(Bytes::from(out))
}

/// Decompress in place when enabled, dropping the encoding headers of a
/// decoded body.
pub(crate) fn decode_content(
    config: &RequestConfig,
    headers: &mut HeaderMap,
    body: Bytes,
) -> Result<Bytes, HttpError> {
    if !config.decompress() {
        return Ok(body);
    }
    let encoding = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(str::to_ascii_lowercase);
    let Some(encoding) = encoding.filter(|e| is_supported_encoding(e.trim())) else {
        return Ok(body);
    };
    let decoded = decompress(Some(encoding.as_str()), body, config.max_content_length)?;
    headers.remove(header::CONTENT_ENCODING);
    headers.remove(header::CONTENT_LENGTH);
    Ok(decoded)
}

fn text_or_binary(body: Bytes) -> ResponseData {
    match std::str::from_utf8(&body) {
        Ok(text) => ResponseData::Text(text.to_owned()),
        Err(_) => ResponseData::Binary(body),
    }
}

/// Decode a buffered body according to the request's response type.
pub(crate) fn decode(config: &RequestConfig, body: Bytes) -> Result<ResponseData, HttpError> {
    if body.is_empty() {
        return Ok(ResponseData::Empty);
    }
    let data = match config.response_type() {
        ResponseType::Binary | ResponseType::Stream => ResponseData::Binary(body),
        ResponseType::Text => ResponseData::Text(String::from_utf8_lossy(&body).into_owned()),
        ResponseType::Json => match serde_json::from_slice(&body) {
            Ok(value) => ResponseData::Json(value),
            Err(e) if config.strict_json() => {
                return Err(ErrorKind::Parse(Box::new(e)).into());
            }
            Err(_) => text_or_binary(body),
        },
        ResponseType::Auto => match serde_json::from_slice(&body) {
            Ok(value) => ResponseData::Json(value),
            Err(_) => text_or_binary(body),
        },
    };
    Ok(data)
}

/// Head of a response as reported by a primitive.
pub(crate) struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) status_text: Option<String>,
    pub(crate) headers: HeaderMap,
    pub(crate) request: RequestHandle,
}

/// Build the response and apply `validate_status`.
pub(crate) fn settle(
    config: &RequestConfig,
    head: ResponseHead,
    data: ResponseData,
) -> Result<Response, HttpError> {
    let status_text = head
        .status_text
        .filter(|s| !s.is_empty())
        .or_else(|| head.status.canonical_reason().map(ToOwned::to_owned))
        .unwrap_or_default();
    let response = Response {
        data,
        status: head.status,
        status_text,
        headers: head.headers,
        config: config.clone(),
        request: Some(head.request),
    };
    if config.accepts_status(response.status) {
        Ok(response)
    } else {
        Err(HttpError::bad_status(response))
    }
}

/// Decompress, decode and settle a fully buffered body.
pub(crate) fn finish_buffered(
    config: &RequestConfig,
    mut head: ResponseHead,
    body: Bytes,
) -> Result<Response, HttpError> {
    let request = head.request.clone();
    let body = decode_content(config, &mut head.headers, body)
        .map_err(|e| e.with_request(request.clone()))?;
    let data = decode(config, body).map_err(|e| e.with_request(request))?;
    settle(config, head, data)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use flate2::Compression;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use std::io::Write;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn gzip(data: &[u8]) -> Bytes {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        Bytes::from(encoder.finish().unwrap())
    }

    #[test]
    fn test_decompress_gzip() {
        let out = decompress(Some("gzip"), gzip(b"hello world"), None).unwrap();
        assert_eq!(&out[..], b"hello world");
    }

    #[test]
    fn test_decompress_deflate_zlib_wrapped() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"deflated").unwrap();
        let body = Bytes::from(encoder.finish().unwrap());
        let out = decompress(Some("deflate"), body, None).unwrap();
        assert_eq!(&out[..], b"deflated");
    }

    #[test]
    fn test_decompress_brotli() {
        let mut compressed = Vec::new();
        {
            let mut writer = brotli::CompressorWriter::new(&mut compressed, 4096, 5, 22);
            writer.write_all(b"brotli body").unwrap();
        }
        let out = decompress(Some("br"), Bytes::from(compressed), None).unwrap();
        assert_eq!(&out[..], b"brotli body");
    }

    #[test]
    fn test_unknown_encoding_is_skipped() {
        let body = Bytes::from_static(b"raw");
        let out = decompress(Some("zstd"), body.clone(), None).unwrap();
        assert_eq!(out, body);
    }

    #[test]
    fn test_decompressed_size_is_limited() {
        let err = decompress(Some("gzip"), gzip(&[b'a'; 4096]), Some(100)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadResponse);
    }

    #[test]
    fn test_corrupt_gzip_is_parse_error() {
        let err = decompress(Some("gzip"), Bytes::from_static(b"not gzip"), None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Parse);
    }

    #[test]
    fn test_decode_json_falls_back_to_text() {
        let config = RequestConfig::default().with_response_type(ResponseType::Json);
        let data = decode(&config, Bytes::from_static(b"not json")).unwrap();
        assert_eq!(data.as_text(), Some("not json"));
    }

    #[test]
    fn test_decode_strict_json_fails() {
        let config = RequestConfig {
            strict_json: Some(true),
            ..RequestConfig::default().with_response_type(ResponseType::Json)
        };
        let err = decode(&config, Bytes::from_static(b"not json")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Parse);
    }

    #[test]
    fn test_decode_auto() {
        let config = RequestConfig::default();
        let json = decode(&config, Bytes::from_static(br#"{"ok":true}"#)).unwrap();
        assert_eq!(json.as_json(), Some(&serde_json::json!({"ok": true})));

        let binary = decode(&config, Bytes::from_static(&[0xff, 0xfe, 0x00])).unwrap();
        assert!(binary.as_bytes().is_some());

        assert!(decode(&config, Bytes::new()).unwrap().is_empty());
    }

    #[test]
    fn test_collector_enforces_limit_and_reports_progress() {
        let seen = Arc::new(AtomicU64::new(0));
        let observer = Arc::clone(&seen);
        let config = RequestConfig {
            max_content_length: Some(5),
            on_download_progress: Some(Arc::new(move |event: ProgressEvent| {
                observer.store(event.loaded, Ordering::SeqCst);
            })),
            ..RequestConfig::default()
        };

        let mut collector = BodyCollector::new(&config, Some(5));
        collector.push(b"abc").unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        let err = collector.push(b"def").unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::BodyTooLarge {
                limit: 5,
                actual: 6
            }
        ));
    }

    #[tokio::test]
    async fn test_limited_stream_fails_past_limit_and_ends() {
        let chunks: Vec<Result<Bytes, BoxError>> = vec![
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"defg")),
            Ok(Bytes::from_static(b"hij")),
        ];
        let items: Vec<_> = LimitedStream::new(futures::stream::iter(chunks), Some(5))
            .collect()
            .await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), &Bytes::from_static(b"abc"));
        let err = items.into_iter().nth(1).unwrap().unwrap_err();
        let err = err.downcast::<HttpError>().unwrap();
        assert_eq!(err.code(), ErrorCode::BadResponse);
    }

    #[tokio::test]
    async fn test_limited_stream_without_limit_passes_through() {
        let chunks: Vec<Result<Bytes, BoxError>> = vec![Ok(Bytes::from_static(b"0123456789"))];
        let items: Vec<_> = LimitedStream::new(futures::stream::iter(chunks), None)
            .collect()
            .await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_ok());
    }

    #[test]
    fn test_content_length_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, http::HeaderValue::from_static("42"));
        assert_eq!(content_length(&headers), Some(42));
        assert_eq!(content_length(&HeaderMap::new()), None);
    }
}
