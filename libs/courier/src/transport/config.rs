//! Socket transport configuration.
//!
//! These types are built from [`TransportSettings`](crate::settings::TransportSettings)
//! or directly by callers that construct the socket adapter themselves.

use std::collections::HashSet;
use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str = concat!("courier/", env!("CARGO_PKG_VERSION"));

const DEFAULT_POOL_IDLE: Duration = Duration::from_secs(90);
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 32;

/// Rules applied to every 3xx hop the socket transport sees.
///
/// `max_redirects` is only the fallback: a request's own `max_redirects`
/// always takes precedence.
#[derive(Debug, Clone)]
pub struct RedirectConfig {
    /// Hop limit. `0` returns the first 3xx untouched.
    pub max_redirects: usize,
    /// Refuse hops to another origin unless the host is allow-listed.
    pub same_origin_only: bool,
    /// Bare hostnames exempt from `same_origin_only`.
    pub allowed_redirect_hosts: HashSet<String>,
    /// Drop credential headers once the chain has left the first origin.
    pub strip_sensitive_headers: bool,
    /// Follow `https` to `http` hops.
    pub allow_https_downgrade: bool,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            max_redirects: crate::request::DEFAULT_MAX_REDIRECTS,
            same_origin_only: false,
            allowed_redirect_hosts: HashSet::new(),
            strip_sensitive_headers: true,
            allow_https_downgrade: false,
        }
    }
}

impl RedirectConfig {
    /// Same-origin hops only.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            same_origin_only: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_redirects: 0,
            ..Self::default()
        }
    }

    /// Allows downgrades so plain-HTTP mock servers can redirect freely.
    /// Not for production use.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            allow_https_downgrade: true,
            ..Self::default()
        }
    }

    /// Adds `host` to the allow-list.
    #[must_use]
    pub fn allow_host(mut self, host: impl Into<String>) -> Self {
        self.allowed_redirect_hosts.insert(host.into());
        self
    }
}

/// Where trust anchors for TLS come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TlsRootConfig {
    /// Bundled Mozilla roots.
    #[default]
    WebPki,
    /// The platform certificate store.
    Native,
}

/// Accepted URL schemes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TransportSecurity {
    #[default]
    HttpOrHttps,
    /// `http://` URLs fail before a connection is attempted.
    HttpsOnly,
}

/// Settings for [`HyperAdapter`](super::HyperAdapter).
#[derive(Debug, Clone)]
pub struct HyperAdapterConfig {
    pub tls_roots: TlsRootConfig,
    pub transport: TransportSecurity,
    /// Used when neither the client nor the request sets `user-agent`.
    pub user_agent: String,
    /// `None` keeps idle connections until the peer closes them.
    pub pool_idle_timeout: Option<Duration>,
    pub pool_max_idle_per_host: usize,
    pub redirect: RedirectConfig,
}

impl Default for HyperAdapterConfig {
    fn default() -> Self {
        Self {
            tls_roots: TlsRootConfig::default(),
            transport: TransportSecurity::default(),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            pool_idle_timeout: Some(DEFAULT_POOL_IDLE),
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
            redirect: RedirectConfig::default(),
        }
    }
}

impl HyperAdapterConfig {
    /// Defaults suited to local mock servers: permissive redirects and no
    /// idle reaping.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            pool_idle_timeout: None,
            redirect: RedirectConfig::for_testing(),
            ..Self::default()
        }
    }
}
