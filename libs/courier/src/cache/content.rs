use super::entry::CacheEntry;
use super::store::{CacheStorage, CacheStoreError};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Content-addressed cache directory.
///
/// Each entry lives at `<root>/<aa>/<sha256(key)>.json`. Writes go through a
/// temporary file in the same directory and are renamed into place.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    /// # Errors
    ///
    /// Returns [`CacheStoreError::Io`] if `root` cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheStoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        let shard = digest.get(..2).unwrap_or("00").to_owned();
        self.root.join(shard).join(format!("{digest}.json"))
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), CacheStoreError> {
    let dir = path
        .parent()
        .ok_or_else(|| CacheStoreError::Unavailable(format!("{} has no parent", path.display())))?;
    std::fs::create_dir_all(dir)?;
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl CacheStorage for ContentStore {
    fn name(&self) -> &'static str {
        "content"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheStoreError> {
        let raw = match tokio::fs::read(self.path_for(key)).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let entry: CacheEntry = serde_json::from_slice(&raw)?;
        if entry.key != key {
            return Err(CacheStoreError::Corrupt { key: key.to_owned() });
        }
        Ok(Some(entry))
    }

    async fn set(&self, entry: CacheEntry) -> Result<(), CacheStoreError> {
        let path = self.path_for(&entry.key);
        let raw = serde_json::to_vec(&entry)?;
        tokio::task::spawn_blocking(move || write_atomic(&path, &raw))
            .await
            .map_err(|e| CacheStoreError::Unavailable(e.to_string()))?
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheStoreError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn has(&self, key: &str) -> Result<bool, CacheStoreError> {
        Ok(tokio::fs::try_exists(self.path_for(key)).await?)
    }

    async fn clear(&self) -> Result<(), CacheStoreError> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }
}
