#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Cross-environment HTTP request execution engine
//!
//! One request pipeline, several transports:
//! - Layered request configuration (client defaults merged with call-site values)
//! - Request and response interceptor chains with ejection and conditional handlers
//! - Adapter selection between native sockets (hyper + rustls), fetch-style and
//!   XHR-style host primitives, plus an in-memory mock
//! - Response caching in memory, per session, on disk (sled) or content-addressed
//! - Retries with exponential backoff, `Retry-After` and per-endpoint circuit breakers
//! - Cooperative cancellation through cancel tokens and cancellation signals
//! - Layered settings from YAML files and `COURIER__` environment variables
//!
//! # Example
//!
//! ```ignore
//! use courier::{HttpClient, RetryPolicy};
//! use std::time::Duration;
//!
//! let client = HttpClient::builder()
//!     .base_url("https://api.example.com")
//!     .timeout(Duration::from_secs(10))
//!     .retry(RetryPolicy::default())
//!     .build()?;
//!
//! let users: Vec<User> = client
//!     .get("/users")
//!     .param("page", "2")
//!     .send()
//!     .await?
//!     .json()?;
//! ```

mod builder;
pub mod cache;
mod cancel;
mod client;
mod error;
mod humantime_serde;
pub mod interceptor;
mod request;
mod request_builder;
pub mod resilience;
mod response;
pub mod settings;
pub mod transport;

pub use builder::HttpClientBuilder;
pub use cache::{CacheManager, CachePolicy, CacheStorage};
pub use cancel::{Cancel, CancelToken, CancelTokenSource, Cancellation, Canceller};
pub use client::HttpClient;
pub use error::{BoxError, ErrorCode, ErrorKind, HttpError};
pub use interceptor::{Interceptor, InterceptorId, InterceptorManager, Interceptors};
pub use request::{
    BasicAuth, BodyStream, ByteStream, DEFAULT_ACCEPT, DEFAULT_MAX_REDIRECTS, Params,
    ProgressCallback, ProgressEvent, RequestBody, RequestConfig, ResponseType, ValidateStatus,
};
pub use request_builder::RequestBuilder;
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, ExponentialBackoff,
    RetryPolicy,
};
pub use response::{RequestHandle, Response, ResponseData, parse_retry_after};
pub use settings::{ClientSettings, SettingsError};
pub use transport::{Adapter, AdapterKind, Environment, MockAdapter, MockReply, TransportAdapter};
