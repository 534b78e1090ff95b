use crate::cache::{CacheManager, CachePolicy};
use crate::client::HttpClient;
use crate::error::HttpError;
use crate::request::{BasicAuth, RequestConfig, ResponseType};
use crate::resilience::{CircuitBreakerRegistry, ResilienceLayer, RetryPolicy};
use crate::settings::{ClientSettings, SettingsError, header_pair};
use crate::transport::{
    Adapter, AdapterSelector, Environment, HyperAdapterConfig, MockAdapter, TransportAdapter,
};
use std::sync::Arc;
use std::time::Duration;

/// Builder for [`HttpClient`].
///
/// Without an explicit adapter or environment the client runs on the native
/// socket transport.
///
/// ```ignore
/// let client = HttpClient::builder()
///     .base_url("https://api.example.com")
///     .timeout(Duration::from_secs(10))
///     .header("x-tenant", "acme")
///     .retry(RetryPolicy::default())
///     .cache(CacheManager::in_memory(), CachePolicy::default())
///     .build()?;
/// ```
pub struct HttpClientBuilder {
    defaults: RequestConfig,
    environment: Option<Environment>,
    socket: Option<HyperAdapterConfig>,
    adapter: Option<Arc<dyn TransportAdapter>>,
    cache: Option<CacheManager>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    /// Error captured while building (deferred to `build()`)
    error: Option<HttpError>,
}

impl HttpClientBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            defaults: RequestConfig::default(),
            environment: None,
            socket: None,
            adapter: None,
            cache: None,
            breakers: None,
            error: None,
        }
    }

    /// Builder pre-filled from loaded settings.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Cache`] if the configured cache backend
    /// cannot be opened.
    pub fn from_settings(settings: &ClientSettings) -> Result<Self, SettingsError> {
        let mut builder = Self::new();

        let defaults = &mut builder.defaults;
        defaults.base_url.clone_from(&settings.base_url);
        defaults.timeout = settings.timeout;
        defaults.max_content_length = settings.max_content_length;
        defaults.max_body_length = settings.max_body_length;
        defaults.max_redirects = settings.max_redirects;
        defaults.decompress = settings.decompress;
        defaults.retry.clone_from(&settings.retry);
        for (name, value) in &settings.headers {
            let (name, value) = header_pair(name, value)?;
            defaults.headers.insert(name, value);
        }

        builder.socket = Some(
            settings
                .transport
                .adapter_config(settings.user_agent.as_deref(), settings.max_redirects),
        );

        if let Some(config) = &settings.circuit_breaker {
            builder.breakers = Some(Arc::new(CircuitBreakerRegistry::with_default_config(
                config.clone(),
            )));
        }

        if let Some(manager) = settings.cache.manager()? {
            builder = builder.cache(manager, settings.cache.policy());
        }
        Ok(builder)
    }

    /// Overlay `config` on the defaults collected so far.
    #[must_use]
    pub fn defaults(mut self, config: &RequestConfig) -> Self {
        self.defaults = self.defaults.merge(config);
        self
    }

    #[must_use]
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.defaults.base_url = Some(base_url.into());
        self
    }

    /// Per-attempt timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.defaults.timeout = Some(timeout);
        self
    }

    /// Default header sent with every request.
    ///
    /// An invalid name or value is reported by [`build`](Self::build).
    #[must_use]
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if self.error.is_some() {
            return self;
        }
        match header_pair(name, value) {
            Ok((name, value)) => {
                self.defaults.headers.insert(name, value);
            }
            Err(err) => self.error = Some(err),
        }
        self
    }

    #[must_use]
    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.defaults.auth = Some(BasicAuth::new(username, password));
        self
    }

    #[must_use]
    pub fn response_type(mut self, response_type: ResponseType) -> Self {
        self.defaults.response_type = Some(response_type);
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, with_credentials: bool) -> Self {
        self.defaults.with_credentials = Some(with_credentials);
        self
    }

    #[must_use]
    pub fn max_content_length(mut self, limit: usize) -> Self {
        self.defaults.max_content_length = Some(limit);
        self
    }

    #[must_use]
    pub fn max_body_length(mut self, limit: usize) -> Self {
        self.defaults.max_body_length = Some(limit);
        self
    }

    #[must_use]
    pub fn max_redirects(mut self, max: usize) -> Self {
        self.defaults.max_redirects = Some(max);
        self
    }

    #[must_use]
    pub fn decompress(mut self, decompress: bool) -> Self {
        self.defaults.decompress = Some(decompress);
        self
    }

    /// Default retry policy; requests may override it.
    #[must_use]
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.defaults.retry = Some(policy);
        self
    }

    /// User agent for the socket transport.
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.socket
            .get_or_insert_with(HyperAdapterConfig::default)
            .user_agent = user_agent.into();
        self
    }

    /// Socket transport configuration, used when sockets are available.
    #[must_use]
    pub fn socket_config(mut self, config: HyperAdapterConfig) -> Self {
        self.socket = Some(config);
        self
    }

    /// Pick the adapter from the primitives in `environment`.
    #[must_use]
    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Use `adapter` as is, bypassing selection.
    #[must_use]
    pub fn adapter(mut self, adapter: Arc<dyn TransportAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Route every request to an in-memory mock.
    #[must_use]
    pub fn mock(self, mock: Arc<MockAdapter>) -> Self {
        self.adapter(Arc::new(Adapter::Mock(mock)))
    }

    /// Cache responses in `manager` under `policy` by default.
    #[must_use]
    pub fn cache(mut self, manager: CacheManager, policy: CachePolicy) -> Self {
        self.cache = Some(manager);
        self.defaults.cache = Some(policy);
        self
    }

    /// Share circuit breakers with other clients.
    #[must_use]
    pub fn breakers(mut self, registry: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(registry);
        self
    }

    /// # Errors
    ///
    /// Returns a deferred header error, `no-adapter` when the environment has
    /// no usable primitive, or the socket transport's initialization error.
    pub fn build(self) -> Result<HttpClient, HttpError> {
        if let Some(err) = self.error {
            return Err(err);
        }

        let adapter: Arc<dyn TransportAdapter> = match self.adapter {
            Some(adapter) => adapter,
            None => {
                let mut environment = self.environment.unwrap_or_else(Environment::detect);
                if let Some(socket) = self.socket
                    && environment.server_socket.is_some()
                {
                    environment = environment.with_server_socket(socket);
                }
                Arc::new(AdapterSelector::select(&environment)?)
            }
        };

        let breakers = self.breakers.unwrap_or_default();
        tracing::debug!(
            adapter = %adapter.kind(),
            cache = self.cache.as_ref().map(|c| c.storage().name()),
            "http client built"
        );

        Ok(HttpClient::from_parts(
            self.defaults,
            adapter,
            self.cache,
            ResilienceLayer::new(breakers),
        ))
    }
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
