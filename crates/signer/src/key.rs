//! Ed25519 key types and their `name:base64` text encoding.

use crate::error::{SignerError, SignerResult};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{SigningKey, VerifyingKey};
use std::fmt;

/// Split `name:base64` and validate the name part.
fn split_named(s: &str) -> SignerResult<(&str, Vec<u8>)> {
    let (name, b64) = s
        .trim()
        .split_once(':')
        .ok_or_else(|| SignerError::KeyParsing("expected 'keyname:base64' format".to_string()))?;
    validate_key_name(name)?;

    let bytes = STANDARD
        .decode(b64)
        .map_err(|e| SignerError::KeyParsing(format!("invalid base64: {e}")))?;
    Ok((name, bytes))
}

/// Key names appear in signature sidecars and console output, so they are
/// restricted to a conservative character set.
pub fn validate_key_name(name: &str) -> SignerResult<()> {
    if name.is_empty() {
        return Err(SignerError::KeyParsing("key name cannot be empty".to_string()));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(SignerError::KeyParsing(format!(
            "invalid character in key name: {c:?}"
        )));
    }
    Ok(())
}

/// A secret (private) key for signing.
pub struct SecretKey {
    inner: SigningKey,
}

impl SecretKey {
    /// Generate a new random secret key.
    pub fn generate() -> Self {
        let mut rng = rand_core::OsRng;
        Self {
            inner: SigningKey::generate(&mut rng),
        }
    }

    /// Parse `keyname:base64(secret || public)`.
    pub fn parse(s: &str) -> SignerResult<(String, Self)> {
        let (name, bytes) = split_named(s)?;

        if bytes.len() != 64 {
            return Err(SignerError::KeyParsing(format!(
                "expected 64 bytes, got {}",
                bytes.len()
            )));
        }

        let secret_bytes: [u8; 32] = bytes[..32]
            .try_into()
            .map_err(|_| SignerError::KeyParsing("invalid secret key bytes".to_string()))?;
        let inner = SigningKey::from_bytes(&secret_bytes);

        // The trailing half must be the matching public key.
        if inner.verifying_key().as_bytes() != &bytes[32..] {
            return Err(SignerError::KeyParsing(
                "public half does not match secret key".to_string(),
            ));
        }

        Ok((name.to_string(), Self { inner }))
    }

    /// Encode as `keyname:base64(secret || public)`.
    pub fn encode(&self, key_name: &str) -> String {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(self.inner.as_bytes());
        bytes.extend_from_slice(self.inner.verifying_key().as_bytes());
        format!("{key_name}:{}", STANDARD.encode(&bytes))
    }

    /// Get the corresponding public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: self.inner.verifying_key(),
        }
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.inner
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

/// A public key for verification.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    inner: VerifyingKey,
}

impl PublicKey {
    /// Parse `keyname:base64(public)`.
    pub fn parse(s: &str) -> SignerResult<(String, Self)> {
        let (name, bytes) = split_named(s)?;

        let key_bytes: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            SignerError::KeyParsing(format!("expected 32 bytes, got {}", b.len()))
        })?;

        let inner = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| SignerError::KeyParsing(format!("invalid public key: {e}")))?;

        Ok((name.to_string(), Self { inner }))
    }

    /// Encode as `keyname:base64(public)`.
    pub fn encode(&self, key_name: &str) -> String {
        format!("{key_name}:{}", STANDARD.encode(self.inner.as_bytes()))
    }

    pub(crate) fn verifying_key(&self) -> &VerifyingKey {
        &self.inner
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b64 = STANDARD.encode(self.inner.as_bytes());
        write!(f, "PublicKey({}...)", &b64[..8])
    }
}

/// A named key pair.
pub struct KeyPair {
    /// The key name (e.g., "repo.example.com-1").
    pub name: String,
    pub secret: SecretKey,
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new key pair with the given name.
    pub fn generate(name: impl Into<String>) -> Self {
        let secret = SecretKey::generate();
        let public = secret.public_key();
        Self {
            name: name.into(),
            secret,
            public,
        }
    }

    /// Parse from the secret key text format.
    pub fn from_secret_key(s: &str) -> SignerResult<Self> {
        let (name, secret) = SecretKey::parse(s)?;
        let public = secret.public_key();
        Ok(Self {
            name,
            secret,
            public,
        })
    }

    pub fn secret_key_string(&self) -> String {
        self.secret.encode(&self.name)
    }

    pub fn public_key_string(&self) -> String {
        self.public.encode(&self.name)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("name", &self.name)
            .field("public", &self.public)
            .finish()
    }
}
