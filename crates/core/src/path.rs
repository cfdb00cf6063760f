//! Repository path types and classification.

use crate::hash::ChecksumAlgorithm;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A canonical, slash-separated path identifying one file in a Maven
/// repository (e.g. `com/example/lib/1.0/lib-1.0.jar`).
///
/// Construction always goes through [`RepositoryPath::parse`], so a value of
/// this type never contains empty, `.` or `..` segments, hidden segments,
/// backslashes or control characters.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepositoryPath(String);

/// Kind of derived file a path refers to, relative to its base artifact.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sidecar {
    /// `X.sha1`, `X.sha256`, `X.sha512`: digest of `X`.
    Checksum(ChecksumAlgorithm),
    /// `X.sig`: detached Ed25519 signature of `X` in `name:base64` form.
    Signature,
    /// `X.md5`, `X.asc`: proxied verbatim, never derived locally.
    Opaque,
}

impl RepositoryPath {
    /// Longest accepted path, in bytes.
    pub const MAX_LEN: usize = 1024;

    /// Canonicalize and validate a raw request path.
    ///
    /// A single leading `/` is stripped. Anything else that is not already
    /// canonical is rejected rather than rewritten.
    pub fn parse(raw: &str) -> crate::Result<Self> {
        let path = raw.strip_prefix('/').unwrap_or(raw);

        if path.is_empty() {
            return Err(crate::Error::InvalidPath("path cannot be empty".to_string()));
        }
        if path.len() > Self::MAX_LEN {
            return Err(crate::Error::InvalidPath(format!(
                "path exceeds {} bytes",
                Self::MAX_LEN
            )));
        }
        if let Some(c) = path.chars().find(|c| c.is_control() || *c == '\\') {
            return Err(crate::Error::InvalidPath(format!(
                "invalid character in path: {:?}",
                c
            )));
        }

        for segment in path.split('/') {
            match segment {
                "" => {
                    return Err(crate::Error::InvalidPath(
                        "path contains an empty segment".to_string(),
                    ));
                }
                "." | ".." => {
                    return Err(crate::Error::InvalidPath(format!(
                        "path traversal segment: {segment}"
                    )));
                }
                s if s.starts_with('.') => {
                    return Err(crate::Error::InvalidPath(format!(
                        "hidden segment not allowed: {s}"
                    )));
                }
                _ => {}
            }
        }

        Ok(Self(path.to_string()))
    }

    /// Get the path string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterate over the path segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// The final segment.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Everything before the final segment, if any.
    pub fn parent(&self) -> Option<&str> {
        self.0.rsplit_once('/').map(|(parent, _)| parent)
    }

    /// Every proper ancestor directory, shortest first.
    pub fn ancestors(&self) -> impl Iterator<Item = &str> {
        self.0
            .match_indices('/')
            .map(|(idx, _)| &self.0[..idx])
    }

    /// Lowercase file extension without the dot.
    pub fn extension(&self) -> Option<String> {
        self.file_name()
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
    }

    /// Whether the content behind this path may legitimately change.
    ///
    /// `maven-metadata*` files are rewritten on every deploy, and anything
    /// under a `-SNAPSHOT` version is replaced by newer snapshot builds.
    pub fn is_mutable(&self) -> bool {
        self.file_name().starts_with("maven-metadata")
            || self.segments().any(|s| s.contains("-SNAPSHOT"))
    }

    /// Classify this path as a sidecar of another path.
    ///
    /// Returns the sidecar kind together with the base artifact path, or
    /// `None` when the path is a primary artifact.
    pub fn sidecar(&self) -> Option<(Sidecar, RepositoryPath)> {
        let ext = self.extension()?;
        let kind = match ext.as_str() {
            "sig" => Sidecar::Signature,
            "md5" | "asc" => Sidecar::Opaque,
            other => Sidecar::Checksum(ChecksumAlgorithm::from_extension(other)?),
        };
        let stem = &self.0[..self.0.len() - ext.len() - 1];
        Some((kind, Self(stem.to_string())))
    }

    /// Path of the sidecar of this artifact with the given extension.
    pub fn with_extension(&self, ext: &str) -> RepositoryPath {
        Self(format!("{}.{}", self.0, ext))
    }
}

impl TryFrom<String> for RepositoryPath {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<RepositoryPath> for String {
    fn from(path: RepositoryPath) -> Self {
        path.0
    }
}

impl fmt::Debug for RepositoryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RepositoryPath({})", self.0)
    }
}

impl fmt::Display for RepositoryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
