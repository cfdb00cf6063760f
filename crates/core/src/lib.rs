//! Core domain types and shared logic for the quarry Maven proxy.
//!
//! This crate defines the data model used across all other crates:
//! - Repository paths and their classification (sidecars, mutable paths)
//! - Checksum algorithms and digests
//! - Cache entries and upstream source descriptions
//! - Application configuration

pub mod config;
pub mod entry;
pub mod error;
pub mod hash;
pub mod path;

pub use entry::{CacheEntry, Origin, UpstreamSource, ValidationState, sort_sources};
pub use error::{Error, Result};
pub use hash::{ChecksumAlgorithm, Checksums, DeclaredChecksum};
pub use path::{RepositoryPath, Sidecar};

/// Default maximum size of a published artifact: 24 MiB.
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 24 * 1024 * 1024;

/// Default maximum size of an artifact fetched from an upstream: 512 MiB.
pub const DEFAULT_MAX_ARTIFACT_SIZE: u64 = 512 * 1024 * 1024;
