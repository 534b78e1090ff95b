//! Transport adapters.
//!
//! An adapter executes exactly one attempt of one request against one network
//! primitive and normalizes the outcome into a [`Response`] or [`HttpError`].
//! Retries, caching and interceptors live above this layer.

mod body;
mod config;
mod default_headers;
mod fetch;
mod mock;
mod prepare;
mod redirect;
mod selector;
mod socket;
mod tls;
mod xhr;

pub use body::decompress;
pub use config::{
    DEFAULT_USER_AGENT, HyperAdapterConfig, RedirectConfig, TlsRootConfig, TransportSecurity,
};
pub use fetch::{
    CredentialsMode, FetchAdapter, FetchBody, FetchPrimitive, FetchRequest, FetchResponse,
    RedirectMode,
};
pub use mock::{MockAdapter, MockReply, MockRequest};
pub use prepare::{PreparedBody, PreparedRequest, build_url, prepare};
pub use redirect::RedirectGuard;
pub use selector::{AdapterSelector, Capabilities, Environment};
pub use socket::HyperAdapter;
pub use xhr::{XhrAdapter, XhrEvent, XhrHandle, XhrPrimitive, XhrRequest};

use crate::cancel::Cancellation;
use crate::error::HttpError;
use crate::request::RequestConfig;
use crate::response::Response;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Which family of network primitive an adapter drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdapterKind {
    /// Event-driven browser request object
    Browser,
    /// Native socket stack
    ServerSocket,
    /// Promise-style fetch primitive
    Fetch,
    /// In-memory routes, for tests
    Mock,
}

impl AdapterKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Browser => "xhr",
            Self::ServerSocket => "http",
            Self::Fetch => "fetch",
            Self::Mock => "mock",
        }
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Executes a single request attempt.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    fn kind(&self) -> AdapterKind;

    /// Execute one attempt.
    ///
    /// # Errors
    ///
    /// Fails with `network`, `timeout`, `cancelled`, `bad-response`, `parse`
    /// or `validation` depending on where the attempt broke down.
    async fn execute(&self, config: RequestConfig) -> Result<Response, HttpError>;
}

/// Adapter chosen for an environment.
#[derive(Clone)]
pub enum Adapter {
    Browser(Arc<XhrAdapter>),
    ServerSocket(Arc<HyperAdapter>),
    Fetch(Arc<FetchAdapter>),
    Mock(Arc<MockAdapter>),
}

impl Adapter {
    #[must_use]
    pub fn kind(&self) -> AdapterKind {
        match self {
            Self::Browser(_) => AdapterKind::Browser,
            Self::ServerSocket(_) => AdapterKind::ServerSocket,
            Self::Fetch(_) => AdapterKind::Fetch,
            Self::Mock(_) => AdapterKind::Mock,
        }
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Adapter").field(&self.kind()).finish()
    }
}

#[async_trait]
impl TransportAdapter for Adapter {
    fn kind(&self) -> AdapterKind {
        Adapter::kind(self)
    }

    async fn execute(&self, config: RequestConfig) -> Result<Response, HttpError> {
        match self {
            Self::Browser(adapter) => adapter.execute(config).await,
            Self::ServerSocket(adapter) => adapter.execute(config).await,
            Self::Fetch(adapter) => adapter.execute(config).await,
            Self::Mock(adapter) => adapter.execute(config).await,
        }
    }
}

/// Run one attempt under the request's timeout and cancellation handles.
///
/// Whichever finishes first wins; the losing future is dropped, which releases
/// its socket, timer or primitive handle.
pub(crate) async fn guarded<F>(config: &RequestConfig, attempt: F) -> Result<Response, HttpError>
where
    F: Future<Output = Result<Response, HttpError>> + Send,
{
    let cancellation = Cancellation::from_config(config);
    if let Err(err) = cancellation.check() {
        return Err(err.with_config(config));
    }

    let timeout = config.timeout.filter(|t| !t.is_zero());
    let work = async move {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, attempt)
                .await
                .map_err(|_| HttpError::timeout(limit))?,
            None => attempt.await,
        }
    };

    let result = tokio::select! {
        biased;
        reason = cancellation.cancelled() => Err(HttpError::cancelled(reason)),
        result = work => result,
    };
    result.map_err(|e| e.with_config(config))
}
