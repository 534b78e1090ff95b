use crate::builder::HttpClientBuilder;
use crate::cache::CacheManager;
use crate::error::HttpError;
use crate::interceptor::Interceptors;
use crate::request::RequestConfig;
use crate::request_builder::RequestBuilder;
use crate::resilience::{CircuitBreakerRegistry, ResilienceLayer};
use crate::response::Response;
use crate::transport::{AdapterKind, TransportAdapter, build_url};
use http::Method;
use std::fmt;
use std::sync::Arc;
use tracing::Instrument;

struct ClientInner {
    defaults: RequestConfig,
    interceptors: Interceptors,
    adapter: Arc<dyn TransportAdapter>,
    cache: Option<CacheManager>,
    resilience: ResilienceLayer,
}

/// HTTP client: default config, interceptor chains and a transport.
///
/// Cloning is cheap; clones share everything, including interceptors.
/// Use [`create`](Self::create) for a child with its own interceptors.
///
/// # Example
///
/// ```ignore
/// use courier::HttpClient;
///
/// let client = HttpClient::builder()
///     .base_url("https://api.example.com")
///     .build()?;
///
/// let users = client.get("/users").param("page", "2").send().await?;
/// ```
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

impl HttpClient {
    #[must_use]
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::new()
    }

    /// Client for the native environment with default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket transport cannot be initialized.
    pub fn new() -> Result<Self, HttpError> {
        HttpClientBuilder::new().build()
    }

    pub(crate) fn from_parts(
        defaults: RequestConfig,
        adapter: Arc<dyn TransportAdapter>,
        cache: Option<CacheManager>,
        resilience: ResilienceLayer,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                defaults,
                interceptors: Interceptors::default(),
                adapter,
                cache,
                resilience,
            }),
        }
    }

    /// Child client: defaults merged with `config`, fresh interceptor chains.
    ///
    /// The transport, cache manager and circuit breakers are shared with
    /// this client.
    #[must_use]
    pub fn create(&self, config: &RequestConfig) -> Self {
        Self::from_parts(
            self.inner.defaults.merge(config),
            Arc::clone(&self.inner.adapter),
            self.inner.cache.clone(),
            self.inner.resilience.clone(),
        )
    }

    #[must_use]
    pub fn defaults(&self) -> &RequestConfig {
        &self.inner.defaults
    }

    #[must_use]
    pub fn interceptors(&self) -> &Interceptors {
        &self.inner.interceptors
    }

    #[must_use]
    pub fn adapter_kind(&self) -> AdapterKind {
        self.inner.adapter.kind()
    }

    #[must_use]
    pub fn cache(&self) -> Option<&CacheManager> {
        self.inner.cache.as_ref()
    }

    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        self.inner.resilience.breakers()
    }

    /// Run `config` through the full pipeline.
    ///
    /// Defaults are merged first, then request interceptors run, the request
    /// is validated and served from cache or through the retrying transport,
    /// and finally response interceptors see the outcome. A failing request
    /// interceptor skips straight to the response chain's rejected handlers.
    ///
    /// # Errors
    ///
    /// Returns whatever error survives the response interceptors.
    pub async fn request(&self, config: RequestConfig) -> Result<Response, HttpError> {
        let merged = self.inner.defaults.merge(&config);
        let span = tracing::debug_span!(
            "courier.request",
            method = %merged.method(),
            url = merged.url.as_deref().unwrap_or_default(),
            adapter = %self.adapter_kind(),
        );

        async move {
            let fallback = merged.clone();
            let outcome = match self.inner.interceptors.request.run(Ok(merged)).await {
                Ok(config) => self.dispatch(config).await,
                Err(err) => Err(err.with_config(&fallback)),
            };
            let result = self.inner.interceptors.response.run(outcome).await;
            if let Err(err) = &result {
                tracing::debug!(code = %err.code(), status = ?err.status(), "request failed");
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn dispatch(&self, config: RequestConfig) -> Result<Response, HttpError> {
        build_url(&config).map_err(|e| e.with_config(&config))?;

        let cache = self
            .inner
            .cache
            .as_ref()
            .zip(config.cache.clone().filter(|policy| policy.enabled));

        if let Some((manager, policy)) = &cache
            && let Some(hit) = manager.get(&config, policy).await
        {
            return Ok(hit);
        }

        let adapter = &self.inner.adapter;
        let response = self
            .inner
            .resilience
            .execute(&config, |attempt| adapter.execute(attempt))
            .await?;

        if let Some((manager, policy)) = &cache {
            manager.set(&config, &response, policy).await;
        }
        Ok(response)
    }

    fn build(&self, method: Method, url: &str) -> RequestBuilder {
        RequestBuilder::new(
            self.clone(),
            RequestConfig::new(url).with_method(method),
        )
    }

    pub fn get(&self, url: &str) -> RequestBuilder {
        self.build(Method::GET, url)
    }

    pub fn delete(&self, url: &str) -> RequestBuilder {
        self.build(Method::DELETE, url)
    }

    pub fn head(&self, url: &str) -> RequestBuilder {
        self.build(Method::HEAD, url)
    }

    pub fn options(&self, url: &str) -> RequestBuilder {
        self.build(Method::OPTIONS, url)
    }

    pub fn post(&self, url: &str) -> RequestBuilder {
        self.build(Method::POST, url)
    }

    pub fn put(&self, url: &str) -> RequestBuilder {
        self.build(Method::PUT, url)
    }

    pub fn patch(&self, url: &str) -> RequestBuilder {
        self.build(Method::PATCH, url)
    }
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("adapter", &self.adapter_kind())
            .field("defaults", &self.inner.defaults)
            .field("interceptors", &self.inner.interceptors)
            .field("cache", &self.inner.cache.as_ref().map(|c| c.storage().name()))
            .field("breakers", &self.breakers().len())
            .finish()
    }
}
