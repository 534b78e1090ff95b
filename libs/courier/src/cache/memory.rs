use super::entry::{CacheEntry, now_ms};
use super::store::{CacheStorage, CacheStoreError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const DEFAULT_EVICTION_INTERVAL: Duration = Duration::from_secs(60);

struct Entries {
    map: DashMap<String, CacheEntry>,
    max_entries: Option<usize>,
}

impl Entries {
    fn evict_expired(&self) -> usize {
        let now = now_ms();
        let before = self.map.len();
        self.map.retain(|_, entry| !entry.is_expired_at(now));
        before.saturating_sub(self.map.len())
    }

    /// Make room for one more entry.
    fn make_room(&self) {
        let Some(max) = self.max_entries else {
            return;
        };
        if self.map.len() < max {
            return;
        }
        self.evict_expired();
        while self.map.len() >= max {
            let oldest = self
                .map
                .iter()
                .min_by_key(|entry| entry.created_at_ms)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(key) => {
                    self.map.remove(&key);
                }
                None => break,
            }
        }
    }
}

/// In-process cache backed by a [`DashMap`].
///
/// A background task sweeps expired entries while a tokio runtime is
/// available; it stops when the store is dropped.
pub struct MemoryStore {
    entries: Arc<Entries>,
    sweeper: Option<JoinHandle<()>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(None, DEFAULT_EVICTION_INTERVAL)
    }

    /// Store holding at most `max_entries`; the oldest entry makes way.
    #[must_use]
    pub fn with_capacity(max_entries: usize) -> Self {
        Self::with_options(Some(max_entries), DEFAULT_EVICTION_INTERVAL)
    }

    #[must_use]
    pub fn with_options(max_entries: Option<usize>, eviction_interval: Duration) -> Self {
        let entries = Arc::new(Entries {
            map: DashMap::new(),
            max_entries: max_entries.filter(|max| *max > 0),
        });
        let sweeper = tokio::runtime::Handle::try_current().ok().map(|handle| {
            handle.spawn(sweep(Arc::downgrade(&entries), eviction_interval))
        });
        Self { entries, sweeper }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.map.is_empty()
    }

    /// Drop expired entries now. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        self.entries.evict_expired()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

async fn sweep(entries: Weak<Entries>, every: Duration) {
    let mut interval = tokio::time::interval(every.max(Duration::from_millis(10)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(entries) = entries.upgrade() else {
            break;
        };
        let removed = entries.evict_expired();
        if removed > 0 {
            tracing::trace!(removed, "swept expired cache entries");
        }
    }
}

#[async_trait]
impl CacheStorage for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheStoreError> {
        Ok(self.entries.map.get(key).map(|entry| entry.value().clone()))
    }

    async fn set(&self, entry: CacheEntry) -> Result<(), CacheStoreError> {
        if !self.entries.map.contains_key(&entry.key) {
            self.entries.make_room();
        }
        self.entries.map.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheStoreError> {
        Ok(self.entries.map.remove(key).is_some())
    }

    async fn has(&self, key: &str) -> Result<bool, CacheStoreError> {
        Ok(self.entries.map.contains_key(key))
    }

    async fn clear(&self) -> Result<(), CacheStoreError> {
        self.entries.map.clear();
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::cache::entry::{CachedData, CachedResponse};

    fn entry(key: &str, ttl: Duration) -> CacheEntry {
        CacheEntry::new(
            key,
            CachedResponse {
                status: 200,
                status_text: "OK".into(),
                headers: Vec::new(),
                data: CachedData::Text(key.into()),
            },
            ttl,
        )
    }

    #[tokio::test]
    async fn test_basic_operations() {
        let store = MemoryStore::new();
        store.set(entry("a", Duration::from_secs(60))).await.unwrap();

        assert!(store.has("a").await.unwrap());
        assert_eq!(store.get("a").await.unwrap().unwrap().key, "a");
        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert!(store.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let store = MemoryStore::with_capacity(2);
        let mut first = entry("first", Duration::from_secs(60));
        first.created_at_ms -= 10;
        store.set(first).await.unwrap();
        store.set(entry("second", Duration::from_secs(60))).await.unwrap();
        store.set(entry("third", Duration::from_secs(60))).await.unwrap();

        assert_eq!(store.len(), 2);
        assert!(!store.has("first").await.unwrap());
        assert!(store.has("third").await.unwrap());
    }

    #[tokio::test]
    async fn test_evict_expired() {
        let store = MemoryStore::new();
        let mut stale = entry("stale", Duration::from_millis(1));
        stale.created_at_ms -= 1_000;
        store.set(stale).await.unwrap();
        store.set(entry("fresh", Duration::from_secs(60))).await.unwrap();

        assert_eq!(store.evict_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_background_sweep() {
        let store = MemoryStore::with_options(None, Duration::from_millis(20));
        let mut stale = entry("stale", Duration::from_millis(1));
        stale.created_at_ms -= 1_000;
        store.set(stale).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.is_empty());
    }

    #[test]
    fn test_works_without_runtime() {
        let store = MemoryStore::new();
        assert!(store.sweeper.is_none());
        assert!(store.is_empty());
    }
}
