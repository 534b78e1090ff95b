use crate::cancel::Cancel;
use crate::request::RequestConfig;
use crate::response::{RequestHandle, Response};
use http::StatusCode;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Boxed error used for transport and codec sources.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Stable, machine-readable classification of a failed request.
///
/// Retry and circuit-breaker decisions are made on this code (plus the
/// response status), never on error message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorCode {
    /// Transport-level failure (connection refused, reset, DNS, TLS)
    Network,
    /// The per-request timer fired before a response was produced
    Timeout,
    /// A cancel token or abort signal fired
    Cancelled,
    /// The server replied with a status rejected by `validate_status`,
    /// or the response body violated a limit
    BadResponse,
    /// The response body could not be decoded as requested
    Parse,
    /// The request could not be built (bad URL, header, body or config)
    Validation,
    /// A circuit breaker rejected the call without executing it
    CircuitOpen,
    /// No transport is available in the current environment
    NoAdapter,
    /// Anything else
    Unknown,
}

impl ErrorCode {
    /// Wire form of the code, e.g. `"bad-response"`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::BadResponse => "bad-response",
            Self::Parse => "parse",
            Self::Validation => "validation",
            Self::CircuitOpen => "circuit-open",
            Self::NoAdapter => "no-adapter",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What went wrong.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Transport error (network, connection, TLS, etc)
    #[error("Network error: {0}")]
    Network(#[source] BoxError),

    /// Single request attempt timed out
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Cancelled through a cancel token or abort signal
    #[error("Request cancelled: {0}")]
    Cancelled(Cancel),

    /// Status rejected by the request's `validate_status`
    #[error("Request failed with status code {}", .status.as_u16())]
    BadStatus { status: StatusCode },

    /// Response body exceeded `max_content_length`
    #[error("Response body too large: limit {limit} bytes, got {actual} bytes")]
    BodyTooLarge { limit: usize, actual: usize },

    /// Request body exceeded `max_body_length`
    #[error("Request body too large: limit {limit} bytes, got {actual} bytes")]
    RequestBodyTooLarge { limit: usize, actual: usize },

    /// Response body could not be decoded
    #[error("Failed to parse response body: {0}")]
    Parse(#[source] BoxError),

    /// Invalid URL
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Invalid header name or value
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Request body could not be encoded
    #[error("Failed to encode request body: {0}")]
    Encode(#[source] BoxError),

    /// Invalid client or request configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Circuit breaker for the endpoint is open
    #[error("Circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    /// No transport available
    #[error("No transport adapter is available in this environment")]
    NoAdapter,

    /// Unclassified failure
    #[error("{0}")]
    Other(String),
}

impl ErrorKind {
    /// Map this kind onto its stable code.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Network(_) => ErrorCode::Network,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::Cancelled(_) => ErrorCode::Cancelled,
            Self::BadStatus { .. } | Self::BodyTooLarge { .. } => ErrorCode::BadResponse,
            Self::Parse(_) => ErrorCode::Parse,
            Self::RequestBodyTooLarge { .. }
            | Self::InvalidUrl { .. }
            | Self::InvalidHeader(_)
            | Self::Encode(_)
            | Self::Config(_) => ErrorCode::Validation,
            Self::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            Self::NoAdapter => ErrorCode::NoAdapter,
            Self::Other(_) => ErrorCode::Unknown,
        }
    }
}

/// Error returned by every request path.
///
/// Carries the failure [`ErrorKind`] plus whatever context was available when
/// it was raised: the request configuration, the request handle and, when the
/// server replied with a rejected status, the full [`Response`].
pub struct HttpError {
    kind: ErrorKind,
    config: Option<Box<RequestConfig>>,
    request: Option<Box<RequestHandle>>,
    response: Option<Box<Response>>,
}

impl HttpError {
    #[must_use]
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            config: None,
            request: None,
            response: None,
        }
    }

    /// Transport failure.
    pub fn network(err: impl Into<BoxError>) -> Self {
        Self::new(ErrorKind::Network(err.into()))
    }

    #[must_use]
    pub fn timeout(after: Duration) -> Self {
        Self::new(ErrorKind::Timeout(after))
    }

    #[must_use]
    pub fn cancelled(reason: Cancel) -> Self {
        Self::new(ErrorKind::Cancelled(reason))
    }

    /// Invalid configuration.
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config(message.into()))
    }

    /// Response with a status the request's validator rejected.
    ///
    /// The error takes over the response's configuration and request handle.
    #[must_use]
    pub fn bad_status(response: Response) -> Self {
        Self {
            kind: ErrorKind::BadStatus {
                status: response.status,
            },
            config: Some(Box::new(response.config.clone())),
            request: response.request.clone().map(Box::new),
            response: Some(Box::new(response)),
        }
    }

    /// Attach the request configuration unless one is already present.
    #[must_use]
    pub fn with_config(mut self, config: &RequestConfig) -> Self {
        if self.config.is_none() {
            self.config = Some(Box::new(config.clone()));
        }
        self
    }

    /// Attach the request handle unless one is already present.
    #[must_use]
    pub fn with_request(mut self, request: RequestHandle) -> Self {
        if self.request.is_none() {
            self.request = Some(Box::new(request));
        }
        self
    }

    #[must_use]
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    #[must_use]
    pub fn code(&self) -> ErrorCode {
        self.kind.code()
    }

    /// Status of the rejected response, if the server replied.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        match &self.kind {
            ErrorKind::BadStatus { status } => Some(*status),
            _ => self.response.as_ref().map(|r| r.status),
        }
    }

    #[must_use]
    pub fn config_ref(&self) -> Option<&RequestConfig> {
        self.config.as_deref()
    }

    #[must_use]
    pub fn request(&self) -> Option<&RequestHandle> {
        self.request.as_deref()
    }

    #[must_use]
    pub fn response(&self) -> Option<&Response> {
        self.response.as_deref()
    }

    /// Take the rejected response out of the error.
    #[must_use]
    pub fn into_response(self) -> Option<Response> {
        self.response.map(|r| *r)
    }

    /// `true` when the request was cancelled by the caller.
    #[must_use]
    pub fn is_cancel(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled(_))
    }

    /// Cancellation reason, if this is a cancellation.
    #[must_use]
    pub fn cancel_reason(&self) -> Option<&Cancel> {
        match &self.kind {
            ErrorKind::Cancelled(reason) => Some(reason),
            _ => None,
        }
    }
}

impl From<ErrorKind> for HttpError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<Cancel> for HttpError {
    fn from(reason: Cancel) -> Self {
        Self::cancelled(reason)
    }
}

impl From<hyper::Error> for HttpError {
    fn from(err: hyper::Error) -> Self {
        Self::network(err)
    }
}

impl From<hyper_util::client::legacy::Error> for HttpError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        Self::network(err)
    }
}

impl From<http::Error> for HttpError {
    fn from(err: http::Error) -> Self {
        Self::new(ErrorKind::InvalidHeader(err.to_string()))
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, f)
    }
}

impl fmt::Debug for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpError")
            .field("code", &self.code())
            .field("kind", &self.kind)
            .field("request", &self.request)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl std::error::Error for HttpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&self.kind)
    }
}
