//! Checksum algorithms and digest sets.

use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;

/// Digest algorithms a Maven client may ask for as a sidecar file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Sha1,
    Sha256,
    Sha512,
}

impl ChecksumAlgorithm {
    /// All supported algorithms, strongest first.
    pub const ALL: [ChecksumAlgorithm; 3] = [Self::Sha512, Self::Sha256, Self::Sha1];

    /// Map a sidecar extension (`sha1`, `sha256`, `sha512`) to an algorithm.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "sha1" => Some(Self::Sha1),
            "sha256" => Some(Self::Sha256),
            "sha512" => Some(Self::Sha512),
            _ => None,
        }
    }

    /// Sidecar extension for this algorithm.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    /// Length of a hex-encoded digest.
    pub fn hex_len(self) -> usize {
        match self {
            Self::Sha1 => 40,
            Self::Sha256 => 64,
            Self::Sha512 => 128,
        }
    }

    /// Compute the lowercase hex digest of `data`.
    pub fn digest(self, data: &[u8]) -> String {
        match self {
            Self::Sha1 => hex::encode(Sha1::digest(data)),
            Self::Sha256 => hex::encode(Sha256::digest(data)),
            Self::Sha512 => hex::encode(Sha512::digest(data)),
        }
    }

    /// Parse the contents of a checksum sidecar file.
    ///
    /// Maven repositories publish either a bare digest or `sha1sum`-style
    /// `<digest>  <filename>` lines; only the first token is significant.
    pub fn parse_sidecar(self, contents: &str) -> crate::Result<String> {
        let token = contents
            .split_whitespace()
            .next()
            .ok_or_else(|| crate::Error::InvalidChecksum("empty checksum file".to_string()))?
            .to_ascii_lowercase();

        if token.len() != self.hex_len() {
            return Err(crate::Error::InvalidChecksum(format!(
                "expected {} hex chars for {self}, got {}",
                self.hex_len(),
                token.len()
            )));
        }
        if !token.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(crate::Error::InvalidChecksum(format!(
                "non-hex characters in {self} digest"
            )));
        }
        Ok(token)
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// A digest declared by an upstream for an artifact it served.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeclaredChecksum {
    pub algorithm: ChecksumAlgorithm,
    pub hex: String,
}

impl DeclaredChecksum {
    /// Verify `data` against this declared digest.
    pub fn verify(&self, data: &[u8]) -> crate::Result<()> {
        let actual = self.algorithm.digest(data);
        if actual != self.hex {
            return Err(crate::Error::ChecksumMismatch {
                algorithm: self.algorithm.to_string(),
                expected: self.hex.clone(),
                actual,
            });
        }
        Ok(())
    }
}

/// Every supported digest of one blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksums {
    pub sha1: String,
    pub sha256: String,
    pub sha512: String,
}

impl Checksums {
    /// Compute all digests of `data`.
    pub fn compute(data: &[u8]) -> Self {
        Self {
            sha1: ChecksumAlgorithm::Sha1.digest(data),
            sha256: ChecksumAlgorithm::Sha256.digest(data),
            sha512: ChecksumAlgorithm::Sha512.digest(data),
        }
    }

    /// Digest for one algorithm.
    pub fn get(&self, algorithm: ChecksumAlgorithm) -> &str {
        match algorithm {
            ChecksumAlgorithm::Sha1 => &self.sha1,
            ChecksumAlgorithm::Sha256 => &self.sha256,
            ChecksumAlgorithm::Sha512 => &self.sha512,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digests() {
        let sums = Checksums::compute(b"hello world");
        assert_eq!(sums.sha1, "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");
        assert_eq!(
            sums.sha256,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(sums.sha512.len(), 128);
        assert_eq!(sums.get(ChecksumAlgorithm::Sha1), sums.sha1);
    }

    #[test]
    fn test_parse_sidecar_formats() {
        let bare = "2AAE6C35C94FCFB415DBE95F408B9CE91EE846ED\n";
        let sum_style = "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed  lib-1.0.jar\n";

        let alg = ChecksumAlgorithm::Sha1;
        assert_eq!(
            alg.parse_sidecar(bare).unwrap(),
            "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed"
        );
        assert_eq!(
            alg.parse_sidecar(sum_style).unwrap(),
            "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed"
        );
    }

    #[test]
    fn test_parse_sidecar_rejects_garbage() {
        let alg = ChecksumAlgorithm::Sha256;
        assert!(alg.parse_sidecar("").is_err());
        assert!(alg.parse_sidecar("abc").is_err());
        assert!(alg.parse_sidecar(&"z".repeat(64)).is_err());
    }

    #[test]
    fn test_declared_checksum_mismatch() {
        let declared = DeclaredChecksum {
            algorithm: ChecksumAlgorithm::Sha1,
            hex: ChecksumAlgorithm::Sha1.digest(b"expected"),
        };
        assert!(declared.verify(b"expected").is_ok());

        let err = declared.verify(b"tampered").unwrap_err();
        assert!(matches!(err, crate::Error::ChecksumMismatch { .. }));
    }
}
