//! Artifact signing and verification.

use crate::error::{SignerError, SignerResult};
use crate::key::{KeyPair, PublicKey, validate_key_name};
use crate::trust::TrustedKeys;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::Signer as _;
use ed25519_dalek::Verifier;
use std::fmt;

/// A detached signature over an artifact's bytes.
///
/// The text form, stored in `.sig` sidecars, is `key-name:base64(signature)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    pub key_name: String,
    /// Base64-encoded 64-byte Ed25519 signature.
    pub signature: String,
}

impl Signature {
    pub fn new(key_name: impl Into<String>, signature: impl Into<String>) -> Self {
        Self {
            key_name: key_name.into(),
            signature: signature.into(),
        }
    }

    /// Parse the sidecar text form. Surrounding whitespace is ignored.
    pub fn parse(s: &str) -> SignerResult<Self> {
        let (name, sig) = s.trim().split_once(':').ok_or_else(|| {
            SignerError::InvalidSignature("expected 'keyname:base64' format".to_string())
        })?;
        validate_key_name(name).map_err(|e| SignerError::InvalidSignature(e.to_string()))?;
        if sig.is_empty() {
            return Err(SignerError::InvalidSignature(
                "signature cannot be empty".to_string(),
            ));
        }
        Ok(Self::new(name, sig))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key_name, self.signature)
    }
}

/// Outcome of checking a signature against a trusted key set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verification {
    /// Valid signature by the named trusted key.
    Verified { key_name: String },
    /// Rejected, with a human-readable reason.
    Failed(String),
}

impl Verification {
    pub fn is_verified(&self) -> bool {
        matches!(self, Verification::Verified { .. })
    }
}

/// Signs artifacts published directly to this server.
pub struct ArtifactSigner {
    keypair: KeyPair,
}

impl ArtifactSigner {
    /// Create a new signer from a key pair.
    pub fn new(keypair: KeyPair) -> Self {
        Self { keypair }
    }

    /// Create from a secret key string.
    pub fn from_secret_key(s: &str) -> SignerResult<Self> {
        Ok(Self::new(KeyPair::from_secret_key(s)?))
    }

    /// Generate a new signer with a random key.
    pub fn generate(key_name: impl Into<String>) -> Self {
        Self::new(KeyPair::generate(key_name))
    }

    pub fn key_name(&self) -> &str {
        &self.keypair.name
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.keypair.public
    }

    /// Public key in `name:base64` form, for distribution to clients.
    pub fn public_key_string(&self) -> String {
        self.keypair.public_key_string()
    }

    pub fn secret_key_string(&self) -> String {
        self.keypair.secret_key_string()
    }

    /// Sign raw artifact bytes.
    pub fn sign(&self, data: &[u8]) -> Signature {
        let sig = self.keypair.secret.signing_key().sign(data);
        Signature::new(&self.keypair.name, STANDARD.encode(sig.to_bytes()))
    }
}

impl fmt::Debug for ArtifactSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactSigner")
            .field("key_name", &self.keypair.name)
            .finish()
    }
}

/// Verify one signature over `data` with a specific public key.
pub fn verify_signature(
    data: &[u8],
    signature: &Signature,
    public_key: &PublicKey,
) -> SignerResult<()> {
    let sig_bytes = STANDARD
        .decode(&signature.signature)
        .map_err(|e| SignerError::InvalidSignature(format!("invalid base64: {e}")))?;

    let sig_array: [u8; 64] = sig_bytes.try_into().map_err(|b: Vec<u8>| {
        SignerError::InvalidSignature(format!("expected 64 bytes, got {}", b.len()))
    })?;

    let signature = ed25519_dalek::Signature::from_bytes(&sig_array);

    public_key
        .verifying_key()
        .verify(data, &signature)
        .map_err(|_| SignerError::VerificationFailed)
}

/// Verify `data` against a trusted key set.
///
/// When `allowed_keys` is non-empty the signing key must also be one of
/// those names.
pub fn verify(
    data: &[u8],
    signature: &Signature,
    trusted: &TrustedKeys,
    allowed_keys: &[String],
) -> Verification {
    if !allowed_keys.is_empty() && !allowed_keys.iter().any(|k| k == &signature.key_name) {
        return Verification::Failed(format!(
            "key {} is not allowed for this source",
            signature.key_name
        ));
    }

    let Some(public_key) = trusted.get(&signature.key_name) else {
        return Verification::Failed(format!("unknown key: {}", signature.key_name));
    };

    match verify_signature(data, signature, public_key) {
        Ok(()) => Verification::Verified {
            key_name: signature.key_name.clone(),
        },
        Err(e) => Verification::Failed(e.to_string()),
    }
}
