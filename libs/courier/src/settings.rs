//! Layered client configuration.
//!
//! Sources, later ones winning:
//! 1. built-in defaults
//! 2. an optional YAML file
//! 3. environment variables prefixed `COURIER__`, with `__` separating
//!    nested keys (`COURIER__CACHE__TTL=10m`, `COURIER__RETRY__MAX_ATTEMPTS=5`)
//!
//! Durations are humantime strings such as `"30s"` or `"1m 30s"`.
//!
//! ```yaml
//! base_url: https://api.example.com
//! timeout: 10s
//! headers:
//!   x-tenant: acme
//! retry:
//!   max_attempts: 4
//!   backoff: { initial: 200ms, max: 5s }
//! cache:
//!   enabled: true
//!   ttl: 5m
//!   backend: { kind: persistent, profile: staging }
//! ```

use crate::cache::{
    CacheManager, CachePolicy, CacheStorage, CacheStoreError, ContentStore, MemoryStore,
    PersistentStore, SessionStore,
};
use crate::error::HttpError;
use crate::resilience::{CircuitBreakerConfig, RetryPolicy};
use crate::transport::{HyperAdapterConfig, RedirectConfig, TlsRootConfig, TransportSecurity};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use http::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Prefix of environment variables read by [`ClientSettings::load`].
pub const ENV_PREFIX: &str = "COURIER__";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to load client settings: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("invalid client settings: {0}")]
    Invalid(#[from] HttpError),

    #[error("failed to open cache backend: {0}")]
    Cache(#[from] CacheStoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientSettings {
    pub base_url: Option<String>,
    /// Per-attempt timeout; unset means no timeout
    #[serde(with = "crate::humantime_serde::option")]
    pub timeout: Option<Duration>,
    pub max_content_length: Option<usize>,
    pub max_body_length: Option<usize>,
    pub max_redirects: Option<usize>,
    pub decompress: Option<bool>,
    /// Default request headers
    pub headers: BTreeMap<String, String>,
    /// Overrides the socket transport's default `user-agent`
    pub user_agent: Option<String>,
    /// Default retry policy; unset means a single attempt
    pub retry: Option<RetryPolicy>,
    /// Configuration for breakers created without one
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub cache: CacheSettings,
    pub transport: TransportSettings,
}

impl ClientSettings {
    /// The layered sources, without extracting.
    #[must_use]
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and validate settings from every source.
    ///
    /// A missing YAML file is skipped.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Load`] if a source cannot be parsed and
    /// [`SettingsError::Invalid`] if the result fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        Self::from_figment(&Self::figment(path))
    }

    /// # Errors
    ///
    /// Same as [`load`](Self::load).
    pub fn from_figment(figment: &Figment) -> Result<Self, SettingsError> {
        let settings: Self = figment.extract().map_err(Box::new)?;
        settings.validate()?;
        tracing::debug!(
            base_url = settings.base_url.as_deref().unwrap_or_default(),
            cache = settings.cache.enabled,
            retry = settings.retry.is_some(),
            "client settings loaded"
        );
        Ok(settings)
    }

    /// # Errors
    ///
    /// Returns a `validation` error for malformed headers, a zero retry
    /// budget or an invalid circuit breaker configuration.
    pub fn validate(&self) -> Result<(), HttpError> {
        for (name, value) in &self.headers {
            header_pair(name, value)?;
        }
        if let Some(retry) = &self.retry {
            if retry.max_attempts == 0 {
                return Err(HttpError::config("retry.max_attempts must be at least 1"));
            }
            if let Some(config) = retry
                .circuit_breaker
                .as_ref()
                .and_then(|binding| binding.config.as_ref())
            {
                config.validate()?;
            }
        }
        if let Some(breaker) = &self.circuit_breaker {
            breaker.validate()?;
        }
        Ok(())
    }
}

pub(crate) fn header_pair(
    name: &str,
    value: &str,
) -> Result<(HeaderName, HeaderValue), HttpError> {
    let name = HeaderName::try_from(name)
        .map_err(|e| HttpError::config(format!("invalid header name '{name}': {e}")))?;
    let value = HeaderValue::try_from(value)
        .map_err(|e| HttpError::config(format!("invalid value for header '{name}': {e}")))?;
    Ok((name, value))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSettings {
    pub enabled: bool,
    #[serde(with = "crate::humantime_serde")]
    pub ttl: Duration,
    pub include_body_in_key: bool,
    pub backend: CacheBackend,
}

impl Default for CacheSettings {
    fn default() -> Self {
        let policy = CachePolicy::default();
        Self {
            enabled: false,
            ttl: policy.ttl,
            include_body_in_key: policy.include_body_in_key,
            backend: CacheBackend::default(),
        }
    }
}

impl CacheSettings {
    #[must_use]
    pub fn policy(&self) -> CachePolicy {
        CachePolicy {
            enabled: self.enabled,
            ttl: self.ttl,
            include_body_in_key: self.include_body_in_key,
            ..CachePolicy::default()
        }
    }

    /// Open the configured backend; `None` when caching is off.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if it cannot be opened.
    pub fn manager(&self) -> Result<Option<CacheManager>, CacheStoreError> {
        if !self.enabled {
            return Ok(None);
        }
        let storage: Arc<dyn CacheStorage> = match &self.backend {
            CacheBackend::Memory {
                max_entries: Some(max),
            } => Arc::new(MemoryStore::with_capacity(*max)),
            CacheBackend::Memory { max_entries: None } => Arc::new(MemoryStore::new()),
            CacheBackend::Session => Arc::new(SessionStore::new()?),
            CacheBackend::Persistent {
                path: Some(path), ..
            } => Arc::new(PersistentStore::open(path)?),
            CacheBackend::Persistent {
                path: None,
                profile,
            } => Arc::new(PersistentStore::for_profile(
                profile.as_deref().unwrap_or("default"),
            )?),
            CacheBackend::Content { root } => Arc::new(ContentStore::open(root)?),
        };
        tracing::debug!(backend = storage.name(), "cache backend opened");
        Ok(Some(CacheManager::new(storage)))
    }
}

/// Where cached responses live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheBackend {
    /// Process memory, optionally bounded
    Memory {
        #[serde(default)]
        max_entries: Option<usize>,
    },
    /// Temporary sled database removed on exit
    Session,
    /// Durable sled database at `path`, or per `profile` under the user
    /// cache directory
    Persistent {
        #[serde(default)]
        path: Option<PathBuf>,
        #[serde(default)]
        profile: Option<String>,
    },
    /// One file per entry below `root`
    Content { root: PathBuf },
}

impl Default for CacheBackend {
    fn default() -> Self {
        Self::Memory { max_entries: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportSettings {
    pub tls_roots: TlsRootConfig,
    pub security: TransportSecurity,
    #[serde(with = "crate::humantime_serde::option")]
    pub pool_idle_timeout: Option<Duration>,
    pub pool_max_idle_per_host: usize,
    pub redirect: RedirectSettings,
}

impl Default for TransportSettings {
    fn default() -> Self {
        let defaults = HyperAdapterConfig::default();
        Self {
            tls_roots: defaults.tls_roots,
            security: defaults.transport,
            pool_idle_timeout: defaults.pool_idle_timeout,
            pool_max_idle_per_host: defaults.pool_max_idle_per_host,
            redirect: RedirectSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[allow(clippy::struct_excessive_bools)]
pub struct RedirectSettings {
    pub same_origin_only: bool,
    pub allowed_hosts: Vec<String>,
    pub strip_sensitive_headers: bool,
    pub allow_https_downgrade: bool,
}

impl Default for RedirectSettings {
    fn default() -> Self {
        let defaults = RedirectConfig::default();
        Self {
            same_origin_only: defaults.same_origin_only,
            allowed_hosts: Vec::new(),
            strip_sensitive_headers: defaults.strip_sensitive_headers,
            allow_https_downgrade: defaults.allow_https_downgrade,
        }
    }
}

impl TransportSettings {
    /// Socket transport configuration for these settings.
    #[must_use]
    pub fn adapter_config(
        &self,
        user_agent: Option<&str>,
        max_redirects: Option<usize>,
    ) -> HyperAdapterConfig {
        let defaults = HyperAdapterConfig::default();
        HyperAdapterConfig {
            tls_roots: self.tls_roots,
            transport: self.security,
            user_agent: user_agent.map_or(defaults.user_agent, ToOwned::to_owned),
            pool_idle_timeout: self.pool_idle_timeout,
            pool_max_idle_per_host: self.pool_max_idle_per_host,
            redirect: RedirectConfig {
                max_redirects: max_redirects.unwrap_or(defaults.redirect.max_redirects),
                same_origin_only: self.redirect.same_origin_only,
                allowed_redirect_hosts: self.redirect.allowed_hosts.iter().cloned().collect(),
                strip_sensitive_headers: self.redirect.strip_sensitive_headers,
                allow_https_downgrade: self.redirect.allow_https_downgrade,
            },
        }
    }
}
