//! Local filesystem storage backend.
//!
//! Blobs live in a directory tree that mirrors repository paths, so the
//! store root can be served by any static file server as a plain Maven
//! repository.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, ContentStore, ObjectMeta};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Chunk size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Local filesystem content store.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend, creating the root if needed.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to a path inside the root, off the async runtime.
    async fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || resolve_key(&root, &key))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }
}

/// Validate `key` and map it below `root`.
///
/// Rejects anything but plain relative components, hidden components (the
/// namespace used for in-progress writes), and any existing path or
/// ancestor that resolves outside the root through a symlink.
fn resolve_key(root: &Path, key: &str) -> StorageResult<PathBuf> {
    if key.is_empty() || key.contains('\\') || key.contains('\0') {
        return Err(StorageError::InvalidKey(format!("malformed key: {key:?}")));
    }
    // Splitting on '/' keeps `.` and empty segments that Path::components
    // would silently normalize away.
    if key
        .split('/')
        .any(|segment| segment.is_empty() || segment.starts_with('.'))
    {
        return Err(StorageError::InvalidKey(format!(
            "unsafe path component in key: {key}"
        )));
    }

    let path = root.join(key);
    let root_canonical = root.canonicalize().map_err(|e| {
        StorageError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to canonicalize root: {e}"),
        ))
    })?;

    // Check the deepest existing path on the way to `path`, including
    // `path` itself and dangling symlinks.
    let mut cursor = Some(path.as_path());
    while let Some(candidate) = cursor {
        match std::fs::symlink_metadata(candidate) {
            Ok(meta) => {
                let canonical = candidate.canonicalize().map_err(|e| {
                    if meta.file_type().is_symlink() {
                        StorageError::InvalidKey(format!("dangling symlink in key: {key}"))
                    } else {
                        StorageError::Io(e)
                    }
                })?;
                if !canonical.starts_with(&root_canonical) {
                    return Err(StorageError::InvalidKey(format!(
                        "resolved path escapes storage root: {key}"
                    )));
                }
                break;
            }
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {}
            Err(e) => return Err(StorageError::Io(e)),
        }
        cursor = candidate.parent();
    }

    Ok(path)
}

/// Name of the hidden temporary file used while writing `path`.
fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp.{}", Uuid::new_v4()))
}

fn is_layout_conflict(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::NotADirectory | ErrorKind::IsADirectory | ErrorKind::AlreadyExists
    )
}

#[async_trait]
impl ContentStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.key_path(key).await?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound || e.kind() == ErrorKind::NotADirectory => {
                Ok(false)
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let path = self.key_path(key).await?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| StorageError::from_io(key, e))?;
        if !metadata.is_file() {
            return Err(StorageError::NotFound(key.to_string()));
        }

        Ok(ObjectMeta {
            size: metadata.len(),
            last_modified: metadata.modified().ok().map(|t| t.into()),
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.key_path(key).await?;
        let data = fs::read(&path)
            .await
            .map_err(|e| StorageError::from_io(key, e))?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        use tokio::io::AsyncReadExt;

        let path = self.key_path(key).await?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| StorageError::from_io(key, e))?;

        // The open handle keeps the old inode alive across a concurrent
        // rename, so a streaming reader never sees a mix of two blobs.
        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                if is_layout_conflict(&e) {
                    StorageError::Conflict(key.to_string())
                } else {
                    StorageError::Io(e)
                }
            })?;
        }

        let temp_path = temp_path_for(&path);
        let written = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            fs::rename(&temp_path, &path).await
        }
        .await;

        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&temp_path).await
                && cleanup.kind() != ErrorKind::NotFound
            {
                debug!(temp = %temp_path.display(), error = %cleanup, "failed to remove temp file");
            }
            return Err(if is_layout_conflict(&e) {
                StorageError::Conflict(key.to_string())
            } else {
                StorageError::Io(e)
            });
        }

        Ok(())
    }

    /// Remove one blob. Parent directories are left in place, even when
    /// empty, since a concurrent `put` may be about to write into them.
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        fs::remove_file(&path)
            .await
            .map_err(|e| StorageError::from_io(key, e))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let base_path = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.key_path(prefix.trim_end_matches('/')).await?
        };
        let mut results = Vec::new();

        match fs::metadata(&base_path).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Ok(results),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(results),
            Err(e) => return Err(StorageError::Io(e)),
        }

        let mut stack = vec![base_path];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                // Hidden names are temp files from in-progress writes.
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                let path = entry.path();
                // file_type() does not follow symlinks; they are skipped.
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_file()
                    && let Ok(rel) = path.strip_prefix(&self.root)
                {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    results.push(key);
                }
            }
        }

        results.sort();
        Ok(results)
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    async fn health_check(&self) -> StorageResult<()> {
        let marker = self.root.join(format!(".health.{}", Uuid::new_v4()));
        fs::write(&marker, b"ok").await?;
        fs::remove_file(&marker).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        let key = "com/example/lib/1.0/lib-1.0.jar";
        let data = Bytes::from("hello world");

        backend.put(key, data.clone()).await.unwrap();
        assert!(backend.exists(key).await.unwrap());
        assert!(dir.path().join(key).is_file());

        let retrieved = backend.get(key).await.unwrap();
        assert_eq!(retrieved, data);

        let meta = backend.head(key).await.unwrap();
        assert_eq!(meta.size, 11);
        assert!(meta.last_modified.is_some());
    }

    #[tokio::test]
    async fn test_put_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        backend.put("g/a/maven-metadata.xml", Bytes::from("v1")).await.unwrap();
        backend.put("g/a/maven-metadata.xml", Bytes::from("v2")).await.unwrap();
        assert_eq!(
            backend.get("g/a/maven-metadata.xml").await.unwrap(),
            Bytes::from("v2")
        );
    }

    #[tokio::test]
    async fn test_put_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        backend.put("g/a/1/a-1.pom", Bytes::from("pom")).await.unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path().join("g/a/1"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a-1.pom".to_string()]);
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        assert!(backend.exists("../escape").await.is_err());
        assert!(backend.exists("/absolute/path").await.is_err());
        assert!(backend.exists("foo/../bar").await.is_err());
        assert!(backend.exists("foo/./bar").await.is_err());
        assert!(backend.exists("foo/.hidden").await.is_err());
        assert!(backend.exists("").await.is_err());

        assert!(!backend.exists("valid/nested/key").await.unwrap());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_symlink_traversal_rejected() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().unwrap();
        let outside_dir = tempfile::tempdir().unwrap();
        let outside_file = outside_dir.path().join("secret.txt");
        std::fs::write(&outside_file, "secret data").unwrap();

        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        symlink(&outside_file, dir.path().join("leak")).unwrap();
        symlink(outside_dir.path(), dir.path().join("outdir")).unwrap();

        match backend.get("leak").await {
            Err(StorageError::InvalidKey(msg)) => assert!(msg.contains("escapes storage root")),
            other => panic!("expected InvalidKey, got {other:?}"),
        }
        assert!(matches!(
            backend.put("outdir/new/file.jar", Bytes::from("x")).await,
            Err(StorageError::InvalidKey(_))
        ));
        assert!(!outside_dir.path().join("new").exists());
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        assert!(matches!(
            backend.delete("g/a/1/missing.jar").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_keeps_directories() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        backend.put("g/a/1/a-1.jar", Bytes::from("jar")).await.unwrap();
        backend.delete("g/a/1/a-1.jar").await.unwrap();

        assert!(dir.path().join("g/a/1").is_dir());
        assert!(backend.list("").await.unwrap().is_empty());

        backend.put("g/a/1/a-1.pom", Bytes::from("pom")).await.unwrap();
        assert_eq!(backend.list("g/").await.unwrap(), vec!["g/a/1/a-1.pom"]);
    }

    #[tokio::test]
    async fn test_parent_is_blob_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        backend.put("g/a/1", Bytes::from("file")).await.unwrap();
        assert!(matches!(
            backend.put("g/a/1/a-1.jar", Bytes::from("jar")).await,
            Err(StorageError::Conflict(_))
        ));
        assert!(!backend.exists("g/a/1/a-1.jar").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_skips_hidden_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();

        backend.put("g/b/1/b-1.jar", Bytes::from("b")).await.unwrap();
        backend.put("g/a/1/a-1.jar", Bytes::from("a")).await.unwrap();
        std::fs::write(dir.path().join("g/a/1/.a-1.jar.tmp.abc"), "partial").unwrap();

        let all = backend.list("").await.unwrap();
        assert_eq!(all, vec!["g/a/1/a-1.jar", "g/b/1/b-1.jar"]);

        let scoped = backend.list("g/b/").await.unwrap();
        assert_eq!(scoped, vec!["g/b/1/b-1.jar"]);

        assert!(backend.list("nothing/here").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_stream_reads_whole_blob() {
        use futures::StreamExt;

        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        let data = Bytes::from(vec![7u8; STREAM_CHUNK_SIZE * 2 + 10]);
        backend.put("g/a/1/big.jar", data.clone()).await.unwrap();

        let mut stream = backend.get_stream("g/a/1/big.jar").await.unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, data.to_vec());
    }

    #[tokio::test]
    async fn test_health_check() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path()).await.unwrap();
        backend.health_check().await.unwrap();
        assert!(backend.list("").await.unwrap().is_empty());
    }
}
