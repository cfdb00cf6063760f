//! Content store abstraction and backends for quarry.
//!
//! This crate provides:
//! - A path-keyed blob store trait with atomic write semantics
//! - A local filesystem backend mirroring repository paths on disk

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::filesystem::FilesystemBackend;
pub use error::{StorageError, StorageResult};
pub use traits::{ByteStream, ContentStore, ObjectMeta};

use quarry_core::config::StorageConfig;
use std::sync::Arc;

/// Create a content store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ContentStore>> {
    let backend = FilesystemBackend::new(&config.path).await?;
    Ok(Arc::new(backend))
}
