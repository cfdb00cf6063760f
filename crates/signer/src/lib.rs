//! Artifact signing and verification for quarry.
//!
//! This crate provides:
//! - Ed25519 key generation and `name:base64` key encoding
//! - Detached signatures over raw artifact bytes
//! - Trusted key sets and signature verification against them

pub mod error;
pub mod key;
pub mod signer;
pub mod trust;

pub use error::{SignerError, SignerResult};
pub use key::{KeyPair, PublicKey, SecretKey};
pub use signer::{ArtifactSigner, Signature, Verification, verify, verify_signature};
pub use trust::TrustedKeys;
