//! Response cache.
//!
//! [`CacheManager`] decides what is stored and when an entry is fresh; a
//! [`CacheStorage`] backend only keeps bytes. Backend failures never reach the
//! request: they are logged and treated as a miss.

mod content;
mod entry;
mod key;
mod memory;
mod persistent;
mod session;
mod store;

pub use content::ContentStore;
pub use entry::{CacheEntry, CachedData, CachedResponse};
pub use key::{default_key, generate_key, is_cacheable};
pub use memory::MemoryStore;
pub use persistent::PersistentStore;
pub use session::SessionStore;
pub use store::{CacheStorage, CacheStoreError};

use crate::request::RequestConfig;
use crate::response::Response;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub type KeyGenerator = Arc<dyn Fn(&RequestConfig) -> String + Send + Sync>;

/// Per-request caching rules.
#[derive(Clone)]
pub struct CachePolicy {
    pub enabled: bool,
    pub ttl: Duration,
    /// Replaces the default key derivation
    pub key_generator: Option<KeyGenerator>,
    /// Response headers never written to the cache
    pub exclude_headers: Vec<String>,
    /// Add a digest of the request body to the default key
    pub include_body_in_key: bool,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(300),
            key_generator: None,
            exclude_headers: vec!["set-cookie".to_owned(), "authorization".to_owned()],
            include_body_in_key: false,
        }
    }
}

impl CachePolicy {
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_key_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(&RequestConfig) -> String + Send + Sync + 'static,
    {
        self.key_generator = Some(Arc::new(generator));
        self
    }
}

impl fmt::Debug for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePolicy")
            .field("enabled", &self.enabled)
            .field("ttl", &self.ttl)
            .field("key_generator", &self.key_generator.is_some())
            .field("exclude_headers", &self.exclude_headers)
            .field("include_body_in_key", &self.include_body_in_key)
            .finish()
    }
}

/// Cache front end shared by a client and its children.
#[derive(Clone)]
pub struct CacheManager {
    storage: Arc<dyn CacheStorage>,
}

impl CacheManager {
    #[must_use]
    pub fn new(storage: Arc<dyn CacheStorage>) -> Self {
        Self { storage }
    }

    /// Manager over a fresh [`MemoryStore`].
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<dyn CacheStorage> {
        &self.storage
    }

    /// Fresh cached response for `config`, if any.
    ///
    /// Expired entries are deleted on the way out.
    pub async fn get(&self, config: &RequestConfig, policy: &CachePolicy) -> Option<Response> {
        if !policy.enabled || !is_cacheable(config) {
            return None;
        }
        let key = generate_key(config, policy);
        let entry = match self.storage.get(&key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(err) => {
                self.degraded("get", &err);
                return None;
            }
        };
        if entry.is_expired() {
            tracing::debug!(backend = self.storage.name(), "expired cache entry removed");
            if let Err(err) = self.storage.delete(&key).await {
                self.degraded("delete", &err);
            }
            return None;
        }
        tracing::debug!(
            backend = self.storage.name(),
            status = entry.response.status,
            "cache hit"
        );
        Some(entry.response.restore(config.clone()))
    }

    /// Store `response` if the policy and response allow it.
    ///
    /// Returns whether an entry was written.
    pub async fn set(
        &self,
        config: &RequestConfig,
        response: &Response,
        policy: &CachePolicy,
    ) -> bool {
        if !policy.enabled || !is_cacheable(config) || !response.status.is_success() {
            return false;
        }
        let Some(snapshot) = CachedResponse::capture(response, &policy.exclude_headers) else {
            return false;
        };
        let entry = CacheEntry::new(generate_key(config, policy), snapshot, policy.ttl);
        match self.storage.set(entry).await {
            Ok(()) => true,
            Err(err) => {
                self.degraded("set", &err);
                false
            }
        }
    }

    pub async fn delete(&self, config: &RequestConfig, policy: &CachePolicy) -> bool {
        let key = generate_key(config, policy);
        self.storage.delete(&key).await.unwrap_or_else(|err| {
            self.degraded("delete", &err);
            false
        })
    }

    /// Whether a fresh entry exists.
    pub async fn has(&self, config: &RequestConfig, policy: &CachePolicy) -> bool {
        let key = generate_key(config, policy);
        match self.storage.get(&key).await {
            Ok(entry) => entry.is_some_and(|e| !e.is_expired()),
            Err(err) => {
                self.degraded("has", &err);
                false
            }
        }
    }

    pub async fn clear(&self) {
        if let Err(err) = self.storage.clear().await {
            self.degraded("clear", &err);
        }
    }

    fn degraded(&self, operation: &'static str, err: &CacheStoreError) {
        tracing::warn!(
            backend = self.storage.name(),
            operation,
            error = %err,
            "cache backend failed; treating as miss"
        );
    }
}

impl fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("backend", &self.storage.name())
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::response::ResponseData;
    use async_trait::async_trait;
    use http::header::{HeaderValue, SET_COOKIE};
    use http::{Method, StatusCode};
    use serde_json::json;

    fn ok_response(config: &RequestConfig) -> Response {
        let mut response = Response::new(StatusCode::OK, config.clone())
            .with_data(ResponseData::Json(json!({"users": []})));
        response
            .headers
            .insert(SET_COOKIE, HeaderValue::from_static("sid=1"));
        response
    }

    #[tokio::test]
    async fn test_round_trip() {
        let cache = CacheManager::in_memory();
        let policy = CachePolicy::default();
        let config = RequestConfig::new("https://api.test/users");

        assert!(cache.get(&config, &policy).await.is_none());
        assert!(cache.set(&config, &ok_response(&config), &policy).await);

        let hit = cache.get(&config, &policy).await.unwrap();
        assert_eq!(hit.data.as_json(), Some(&json!({"users": []})));
        assert!(hit.headers.get(SET_COOKIE).is_none());
        assert!(cache.has(&config, &policy).await);
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss_and_deleted() {
        let cache = CacheManager::in_memory();
        let policy = CachePolicy::default().with_ttl(Duration::ZERO);
        let config = RequestConfig::new("https://api.test/users");
        cache.set(&config, &ok_response(&config), &policy).await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cache.get(&config, &policy).await.is_none());
        let key = generate_key(&config, &policy);
        assert!(!cache.storage().has(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_ineligible_responses_not_stored() {
        let cache = CacheManager::in_memory();
        let policy = CachePolicy::default();

        let post = RequestConfig::new("/users").with_method(Method::POST);
        assert!(!cache.set(&post, &ok_response(&post), &policy).await);

        let get = RequestConfig::new("/users");
        let mut failed = ok_response(&get);
        failed.status = StatusCode::INTERNAL_SERVER_ERROR;
        assert!(!cache.set(&get, &failed, &policy).await);

        assert!(!cache.set(&get, &ok_response(&get), &CachePolicy::disabled()).await);
    }

    struct BrokenStore;

    #[async_trait]
    impl CacheStorage for BrokenStore {
        fn name(&self) -> &'static str {
            "broken"
        }
        async fn get(&self, _: &str) -> Result<Option<CacheEntry>, CacheStoreError> {
            Err(CacheStoreError::Unavailable("disk gone".into()))
        }
        async fn set(&self, _: CacheEntry) -> Result<(), CacheStoreError> {
            Err(CacheStoreError::QuotaExceeded("full".into()))
        }
        async fn delete(&self, _: &str) -> Result<bool, CacheStoreError> {
            Err(CacheStoreError::Unavailable("disk gone".into()))
        }
        async fn clear(&self) -> Result<(), CacheStoreError> {
            Err(CacheStoreError::Unavailable("disk gone".into()))
        }
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_backend_failures_degrade_to_miss() {
        let cache = CacheManager::new(Arc::new(BrokenStore));
        let policy = CachePolicy::default();
        let config = RequestConfig::new("/users");

        assert!(!cache.set(&config, &ok_response(&config), &policy).await);
        assert!(cache.get(&config, &policy).await.is_none());
        assert!(!cache.delete(&config, &policy).await);
        cache.clear().await;
        assert!(logs_contain("treating as miss"));
    }
}
