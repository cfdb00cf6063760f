//! Cache entries and upstream source descriptions.

use crate::hash::Checksums;
use crate::path::RepositoryPath;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Validation state of a cached blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationState {
    /// Present in the store but never checked (e.g. adopted at startup).
    Unverified,
    /// Passed the trust policy of the source it came from.
    Verified,
    /// Checked and rejected; never served.
    Failed,
}

/// Where a cached blob came from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "source", rename_all = "lowercase")]
pub enum Origin {
    /// Fetched from the upstream with this id.
    Upstream(String),
    /// Uploaded directly with PUT.
    Published,
    /// Found in the content store at startup with no index record.
    Scanned,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Upstream(id) => write!(f, "upstream:{id}"),
            Origin::Published => f.write_str("published"),
            Origin::Scanned => f.write_str("scanned"),
        }
    }
}

/// Index record for one cached artifact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub path: RepositoryPath,
    /// Content store key of the blob.
    pub blob_key: String,
    pub content_length: u64,
    pub checksums: Checksums,
    /// Detached signature in `key-name:base64` form.
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub fetched_at: OffsetDateTime,
    pub origin: Origin,
    pub state: ValidationState,
}

impl CacheEntry {
    /// Build a verified entry for freshly stored bytes.
    pub fn verified(
        path: RepositoryPath,
        data: &[u8],
        signature: Option<String>,
        origin: Origin,
    ) -> Self {
        Self {
            blob_key: path.as_str().to_string(),
            path,
            content_length: data.len() as u64,
            checksums: Checksums::compute(data),
            signature,
            fetched_at: OffsetDateTime::now_utc(),
            origin,
            state: ValidationState::Verified,
        }
    }

    /// Whether the entry may be served without contacting an upstream.
    ///
    /// Mutable paths fetched from an upstream expire after `mutable_ttl`.
    /// Published entries never expire since this server is their origin.
    pub fn is_fresh(&self, now: OffsetDateTime, mutable_ttl: time::Duration) -> bool {
        if self.state != ValidationState::Verified {
            return false;
        }
        if !self.path.is_mutable() || self.origin == Origin::Published {
            return true;
        }
        now - self.fetched_at < mutable_ttl
    }
}

/// A remote Maven repository consulted on cache misses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamSource {
    /// Short identifier used in logs, metrics and console commands.
    pub id: String,
    /// Base URL; artifact paths are appended after a `/`.
    pub url: String,
    /// Lower values are consulted first.
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Reject artifacts without a valid signature from a trusted key.
    #[serde(default)]
    pub require_signature: bool,
    /// If non-empty, only signatures by these key names are accepted.
    #[serde(default)]
    pub allowed_keys: Vec<String>,
}

fn default_priority() -> u32 {
    100
}

impl UpstreamSource {
    /// Create a source with default priority and no signature requirement.
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            priority: default_priority(),
            require_signature: false,
            allowed_keys: Vec::new(),
        }
    }

    /// Validate id and URL shape.
    pub fn validate(&self) -> crate::Result<()> {
        if self.id.is_empty()
            || !self
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(crate::Error::InvalidSource(format!(
                "invalid source id: {:?}",
                self.id
            )));
        }
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(crate::Error::InvalidSource(format!(
                "source {} url must be http(s): {}",
                self.id, self.url
            )));
        }
        Ok(())
    }

    /// Full URL of `path` on this source.
    pub fn url_for(&self, path: &RepositoryPath) -> String {
        format!("{}/{}", self.url.trim_end_matches('/'), path)
    }
}

/// Sort sources into consultation order. Ties keep their relative order.
pub fn sort_sources(sources: &mut [UpstreamSource]) {
    sources.sort_by_key(|s| s.priority);
}
