use super::entry::CacheEntry;
use super::persistent::SledEntries;
use super::store::{CacheStorage, CacheStoreError};
use async_trait::async_trait;

/// Cache living for the lifetime of the store.
///
/// Same engine as [`PersistentStore`](super::PersistentStore), opened as a
/// temporary database that sled deletes on drop.
#[derive(Debug, Clone)]
pub struct SessionStore {
    entries: SledEntries,
}

impl SessionStore {
    /// # Errors
    ///
    /// Returns [`CacheStoreError::Database`] if the temporary database cannot
    /// be created.
    pub fn new() -> Result<Self, CacheStoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self {
            entries: SledEntries::new(db),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStorage for SessionStore {
    fn name(&self) -> &'static str {
        "session"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheStoreError> {
        self.entries.get(key)
    }

    async fn set(&self, entry: CacheEntry) -> Result<(), CacheStoreError> {
        self.entries.set(&entry)
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheStoreError> {
        self.entries.delete(key)
    }

    async fn has(&self, key: &str) -> Result<bool, CacheStoreError> {
        self.entries.has(key)
    }

    async fn clear(&self) -> Result<(), CacheStoreError> {
        self.entries.clear()
    }
}
