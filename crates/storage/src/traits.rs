//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Path-keyed blob store.
///
/// Keys are slash-separated relative paths. Implementations must make
/// [`ContentStore::put`] atomic: a concurrent reader observes either the
/// previous complete blob or the new one, never a partial write.
#[async_trait]
pub trait ContentStore: Send + Sync + 'static {
    /// Check if a blob exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get a blob's size without fetching content.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Get a blob's content.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Get a blob as a byte stream.
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream>;

    /// Put a blob atomically, replacing any previous content.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Delete a blob.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// List blob keys under a prefix (empty prefix lists everything).
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Get the name of this storage backend, for metrics and logging.
    fn backend_name(&self) -> &'static str;

    /// Verify the backend is usable. Called once at startup.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Metadata about a stored blob.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Blob size in bytes.
    pub size: u64,
    /// Last modification time (if available).
    pub last_modified: Option<time::OffsetDateTime>,
}
