use super::entry::CacheEntry;
use super::store::{CacheStorage, CacheStoreError};
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};

/// Entry codec shared by the sled-backed stores.
#[derive(Clone)]
pub(super) struct SledEntries {
    db: sled::Db,
}

impl fmt::Debug for SledEntries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SledEntries")
            .field("len", &self.db.len())
            .finish()
    }
}

impl SledEntries {
    pub(super) fn new(db: sled::Db) -> Self {
        Self { db }
    }

    pub(super) fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheStoreError> {
        let Some(raw) = self.db.get(key)? else {
            return Ok(None);
        };
        match serde_json::from_slice::<CacheEntry>(&raw) {
            Ok(entry) if entry.key == key => Ok(Some(entry)),
            _ => {
                self.db.remove(key)?;
                Err(CacheStoreError::Corrupt { key: key.to_owned() })
            }
        }
    }

    pub(super) fn set(&self, entry: &CacheEntry) -> Result<(), CacheStoreError> {
        let raw = serde_json::to_vec(entry)?;
        self.db.insert(entry.key.as_bytes(), raw)?;
        Ok(())
    }

    pub(super) fn delete(&self, key: &str) -> Result<bool, CacheStoreError> {
        Ok(self.db.remove(key)?.is_some())
    }

    pub(super) fn has(&self, key: &str) -> Result<bool, CacheStoreError> {
        Ok(self.db.contains_key(key)?)
    }

    pub(super) fn clear(&self) -> Result<(), CacheStoreError> {
        self.db.clear()?;
        Ok(())
    }

    pub(super) fn len(&self) -> usize {
        self.db.len()
    }
}

/// Durable cache in a sled database.
#[derive(Debug, Clone)]
pub struct PersistentStore {
    entries: SledEntries,
    path: PathBuf,
}

impl PersistentStore {
    /// Open (or create) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheStoreError::Database`] if sled cannot open the path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheStoreError> {
        let path = path.as_ref().to_path_buf();
        let db = sled::open(&path)?;
        tracing::debug!(path = %path.display(), "opened persistent cache");
        Ok(Self {
            entries: SledEntries::new(db),
            path,
        })
    }

    /// Open the store for `profile` under the user cache directory.
    ///
    /// # Errors
    ///
    /// Returns [`CacheStoreError::Unavailable`] when the platform has no user
    /// cache directory, or a database error if it cannot be opened.
    pub fn for_profile(profile: &str) -> Result<Self, CacheStoreError> {
        let base = dirs::cache_dir().ok_or_else(|| {
            CacheStoreError::Unavailable("no user cache directory on this platform".to_owned())
        })?;
        Self::open(base.join("courier").join(profile_dir(profile)))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
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

/// Profile names become a single safe path component.
fn profile_dir(profile: &str) -> String {
    let cleaned: String = profile
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "default".to_owned()
    } else {
        cleaned
    }
}

#[async_trait]
impl CacheStorage for PersistentStore {
    fn name(&self) -> &'static str {
        "persistent"
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
