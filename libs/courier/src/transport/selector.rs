//! Choosing an adapter for the host environment.

use super::config::HyperAdapterConfig;
use super::fetch::{FetchAdapter, FetchPrimitive};
use super::socket::HyperAdapter;
use super::xhr::{XhrAdapter, XhrPrimitive};
use super::{Adapter, AdapterKind};
use crate::error::{ErrorKind, HttpError};
use std::fmt;
use std::sync::Arc;

/// Which network primitives the environment exposes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct Capabilities {
    pub xhr: bool,
    pub server_socket: bool,
    pub fetch: bool,
}

/// Network primitives available to the client.
#[derive(Clone, Default)]
pub struct Environment {
    pub xhr: Option<Arc<dyn XhrPrimitive>>,
    /// Socket stack settings; `None` when sockets are unavailable
    pub server_socket: Option<HyperAdapterConfig>,
    pub fetch: Option<Arc<dyn FetchPrimitive>>,
}

impl Environment {
    /// A native process: sockets available, no browser primitives.
    #[must_use]
    pub fn detect() -> Self {
        Self {
            server_socket: Some(HyperAdapterConfig::default()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_xhr(mut self, primitive: Arc<dyn XhrPrimitive>) -> Self {
        self.xhr = Some(primitive);
        self
    }

    #[must_use]
    pub fn with_fetch(mut self, primitive: Arc<dyn FetchPrimitive>) -> Self {
        self.fetch = Some(primitive);
        self
    }

    #[must_use]
    pub fn with_server_socket(mut self, config: HyperAdapterConfig) -> Self {
        self.server_socket = Some(config);
        self
    }

    #[must_use]
    pub fn without_server_socket(mut self) -> Self {
        self.server_socket = None;
        self
    }

    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            xhr: self.xhr.is_some(),
            server_socket: self.server_socket.is_some(),
            fetch: self.fetch.is_some(),
        }
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("capabilities", &self.capabilities())
            .field("server_socket", &self.server_socket)
            .finish_non_exhaustive()
    }
}

pub struct AdapterSelector;

impl AdapterSelector {
    /// Preferred adapter family: browser request object, then sockets, then fetch.
    #[must_use]
    pub fn preferred(capabilities: Capabilities) -> Option<AdapterKind> {
        if capabilities.xhr {
            Some(AdapterKind::Browser)
        } else if capabilities.server_socket {
            Some(AdapterKind::ServerSocket)
        } else if capabilities.fetch {
            Some(AdapterKind::Fetch)
        } else {
            None
        }
    }

    /// Build the preferred adapter for `env`.
    ///
    /// # Errors
    ///
    /// Returns `no-adapter` if the environment exposes no primitive, or a
    /// `validation` error if the socket stack cannot be configured.
    pub fn select(env: &Environment) -> Result<Adapter, HttpError> {
        let adapter = match (Self::preferred(env.capabilities()), env) {
            (
                Some(AdapterKind::Browser),
                Environment {
                    xhr: Some(primitive),
                    ..
                },
            ) => Adapter::Browser(Arc::new(XhrAdapter::new(primitive.clone()))),
            (
                Some(AdapterKind::ServerSocket),
                Environment {
                    server_socket: Some(config),
                    ..
                },
            ) => Adapter::ServerSocket(Arc::new(HyperAdapter::new(config)?)),
            (
                Some(AdapterKind::Fetch),
                Environment {
                    fetch: Some(primitive),
                    ..
                },
            ) => Adapter::Fetch(Arc::new(FetchAdapter::new(primitive.clone()))),
            _ => return Err(ErrorKind::NoAdapter.into()),
        };
        tracing::debug!(adapter = %adapter.kind(), "selected transport adapter");
        Ok(adapter)
    }
}
