use super::entry::CacheEntry;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheStoreError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("cache database error: {0}")]
    Database(#[from] sled::Error),
    #[error("cache quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt cache entry for key {key}")]
    Corrupt { key: String },
}

/// Storage backend for cached responses.
///
/// Backends store entries verbatim; freshness is decided by the caller.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// # Errors
    ///
    /// Returns a [`CacheStoreError`] if the backend cannot be read.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheStoreError>;

    /// Insert or overwrite the entry under `entry.key`.
    ///
    /// # Errors
    ///
    /// Returns a [`CacheStoreError`] if the backend cannot be written.
    async fn set(&self, entry: CacheEntry) -> Result<(), CacheStoreError>;

    /// Returns whether an entry was removed.
    ///
    /// # Errors
    ///
    /// Returns a [`CacheStoreError`] if the backend cannot be written.
    async fn delete(&self, key: &str) -> Result<bool, CacheStoreError>;

    /// # Errors
    ///
    /// Returns a [`CacheStoreError`] if the backend cannot be read.
    async fn has(&self, key: &str) -> Result<bool, CacheStoreError> {
        Ok(self.get(key).await?.is_some())
    }

    /// # Errors
    ///
    /// Returns a [`CacheStoreError`] if the backend cannot be written.
    async fn clear(&self) -> Result<(), CacheStoreError>;
}
