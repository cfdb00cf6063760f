//! In-memory cache index and its JSON persistence.

use parking_lot::RwLock;
use quarry_core::{CacheEntry, RepositoryPath};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

const INDEX_VERSION: u32 = 1;

/// Errors reading or writing the persisted index.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed index file: {0}")]
    Format(#[from] serde_json::Error),

    #[error("unsupported index version {0}")]
    Version(u32),
}

#[derive(Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    entries: Vec<CacheEntry>,
}

/// Map from repository path to cache entry.
///
/// Locks are held only for the map operation itself, never across I/O.
#[derive(Default)]
pub struct CacheIndex {
    entries: RwLock<HashMap<RepositoryPath, CacheEntry>>,
    dirty: AtomicBool,
}

impl CacheIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &RepositoryPath) -> Option<CacheEntry> {
        self.entries.read().get(path).cloned()
    }

    pub fn contains(&self, path: &RepositoryPath) -> bool {
        self.entries.read().contains_key(path)
    }

    /// Insert or replace the entry for its path.
    pub fn insert(&self, entry: CacheEntry) {
        self.entries.write().insert(entry.path.clone(), entry);
        self.dirty.store(true, Ordering::Release);
    }

    pub fn remove(&self, path: &RepositoryPath) -> Option<CacheEntry> {
        let removed = self.entries.write().remove(path);
        if removed.is_some() {
            self.dirty.store(true, Ordering::Release);
        }
        removed
    }

    /// Remove the entry only if it is still `expected`.
    ///
    /// Used when dropping an entry whose blob turned out to be missing, so
    /// a concurrent replacement is not thrown away.
    pub fn remove_if_same(&self, expected: &CacheEntry) -> bool {
        let mut entries = self.entries.write();
        if entries.get(&expected.path) == Some(expected) {
            entries.remove(&expected.path);
            self.dirty.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Empty the index in one critical section, returning what it held.
    pub fn take_all(&self) -> HashMap<RepositoryPath, CacheEntry> {
        let taken = std::mem::take(&mut *self.entries.write());
        self.dirty.store(true, Ordering::Release);
        taken
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Copy of every entry, sorted by path.
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<_> = self.entries.read().values().cloned().collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries
    }

    /// Whether the index changed since the last successful save.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Read a persisted index file. A missing file yields no entries.
    pub async fn load(path: &Path) -> Result<Vec<CacheEntry>, IndexError> {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let file: IndexFile = serde_json::from_slice(&data)?;
        if file.version != INDEX_VERSION {
            return Err(IndexError::Version(file.version));
        }
        Ok(file.entries)
    }

    /// Write the index to `path` atomically (temp file, sync, rename).
    pub async fn save(&self, path: &Path) -> Result<usize, IndexError> {
        // Cleared first so changes racing with the write mark it dirty again.
        self.dirty.store(false, Ordering::Release);
        let file = IndexFile {
            version: INDEX_VERSION,
            entries: self.snapshot(),
        };
        let count = file.entries.len();
        let data = match serde_json::to_vec_pretty(&file) {
            Ok(data) => data,
            Err(e) => {
                self.dirty.store(true, Ordering::Release);
                return Err(e.into());
            }
        };

        if let Err(e) = write_atomic(path, &data).await {
            self.dirty.store(true, Ordering::Release);
            return Err(e.into());
        }
        Ok(count)
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "index".to_string());
    let temp_path = path.with_file_name(format!(".{file_name}.tmp.{}", uuid::Uuid::new_v4()));

    let result = async {
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        tokio::fs::rename(&temp_path, path).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&temp_path).await;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::Origin;

    fn entry(path: &str, data: &[u8]) -> CacheEntry {
        CacheEntry::verified(
            RepositoryPath::parse(path).unwrap(),
            data,
            None,
            Origin::Upstream("central".to_string()),
        )
    }

    #[test]
    fn test_insert_get_remove() {
        let index = CacheIndex::new();
        let e = entry("g/a/1/a-1.jar", b"jar");
        index.insert(e.clone());
        assert_eq!(index.get(&e.path), Some(e.clone()));
        assert_eq!(index.len(), 1);
        assert_eq!(index.remove(&e.path), Some(e.clone()));
        assert!(index.is_empty());
    }

    #[test]
    fn test_remove_if_same_keeps_replacement() {
        let index = CacheIndex::new();
        let old = entry("g/a/1/a-1.jar", b"old");
        let new = entry("g/a/1/a-1.jar", b"new");
        index.insert(new.clone());

        assert!(!index.remove_if_same(&old));
        assert_eq!(index.get(&new.path), Some(new.clone()));
        assert!(index.remove_if_same(&new));
        assert!(!index.contains(&new.path));
    }

    #[test]
    fn test_take_all_empties() {
        let index = CacheIndex::new();
        index.insert(entry("g/a/1/a-1.jar", b"1"));
        index.insert(entry("g/a/1/a-1.pom", b"2"));
        let taken = index.take_all();
        assert_eq!(taken.len(), 2);
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("index.json");

        let index = CacheIndex::new();
        index.insert(entry("g/a/1/a-1.pom", b"<project/>"));
        index.insert(entry("g/a/1/a-1.jar", b"jar"));
        assert!(index.is_dirty());

        assert_eq!(index.save(&path).await.unwrap(), 2);
        assert!(!index.is_dirty());

        let loaded = CacheIndex::load(&path).await.unwrap();
        assert_eq!(loaded, index.snapshot());

        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[tokio::test]
    async fn test_load_missing_and_bad_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        assert!(CacheIndex::load(&path).await.unwrap().is_empty());

        std::fs::write(&path, r#"{"version": 9, "entries": []}"#).unwrap();
        assert!(matches!(
            CacheIndex::load(&path).await,
            Err(IndexError::Version(9))
        ));

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            CacheIndex::load(&path).await,
            Err(IndexError::Format(_))
        ));
    }
}
