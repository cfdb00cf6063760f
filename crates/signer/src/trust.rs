//! Trusted verification key sets.

use crate::error::{SignerError, SignerResult};
use crate::key::PublicKey;
use quarry_core::config::TrustConfig;
use std::path::Path;

/// Named public keys accepted for signature verification.
///
/// A set is immutable once built; reloading builds a new set and swaps it
/// in, so a verification always runs against one consistent snapshot.
#[derive(Clone, Debug, Default)]
pub struct TrustedKeys {
    keys: Vec<(String, PublicKey)>,
}

impl TrustedKeys {
    /// Build the key set described by `config`: the key file first, then
    /// inline keys.
    pub fn load(config: &TrustConfig) -> SignerResult<Self> {
        let mut keys = Self::default();
        if let Some(path) = &config.keys_file {
            keys.extend_from_file(path)?;
        }
        for (idx, line) in config.keys.iter().enumerate() {
            let (name, key) = PublicKey::parse(line).map_err(|e| SignerError::KeyFile {
                path: "<inline>".to_string(),
                line: idx + 1,
                message: e.to_string(),
            })?;
            keys.insert(&name, key)?;
        }
        Ok(keys)
    }

    /// Parse key file contents: one `name:base64` key per line, blank lines
    /// and `#` comments ignored.
    pub fn parse(contents: &str, origin: &str) -> SignerResult<Self> {
        let mut keys = Self::default();
        keys.extend_from_str(contents, origin)?;
        Ok(keys)
    }

    fn extend_from_file(&mut self, path: &Path) -> SignerResult<()> {
        let contents = std::fs::read_to_string(path)?;
        self.extend_from_str(&contents, &path.display().to_string())
    }

    fn extend_from_str(&mut self, contents: &str, origin: &str) -> SignerResult<()> {
        for (idx, raw) in contents.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let key_error = |message: String| SignerError::KeyFile {
                path: origin.to_string(),
                line: idx + 1,
                message,
            };
            let (name, key) = PublicKey::parse(line).map_err(|e| key_error(e.to_string()))?;
            self.insert(&name, key).map_err(|e| key_error(e.to_string()))?;
        }
        Ok(())
    }

    /// Add a key. Re-adding the same key is a no-op; a different key under
    /// an existing name is rejected.
    pub fn insert(&mut self, name: &str, key: PublicKey) -> SignerResult<()> {
        match self.get(name) {
            Some(existing) if existing == &key => Ok(()),
            Some(_) => Err(SignerError::KeyParsing(format!(
                "conflicting keys for name {name}"
            ))),
            None => {
                self.keys.push((name.to_string(), key));
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&PublicKey> {
        self.keys.iter().find(|(n, _)| n == name).map(|(_, k)| k)
    }

    /// Key names in load order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
