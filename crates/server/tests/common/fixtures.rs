//! Test fixtures for generating artifacts and upstream responses.
//!
//! Note: #[allow(dead_code)] because each test file compiles common/ separately.

use bytes::Bytes;
use quarry_core::{ChecksumAlgorithm, DeclaredChecksum};
use quarry_server::{FetchOutcome, FetchedArtifact};
use quarry_signer::ArtifactSigner;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for generating unique artifact coordinates.
static ARTIFACT_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate deterministic test data based on a seed.
#[allow(dead_code)]
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    for chunk in data.chunks_mut(8) {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// Release jar path for a unique artifact id.
#[allow(dead_code)]
pub fn unique_jar_path(name: &str) -> String {
    let n = ARTIFACT_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("com/example/{name}{n}/1.0.{n}/{name}{n}-1.0.{n}.jar")
}

/// Upstream hit with no checksum or signature.
#[allow(dead_code)]
pub fn found(bytes: &Bytes) -> FetchOutcome {
    FetchOutcome::Found(FetchedArtifact {
        bytes: bytes.clone(),
        checksum: None,
        signature: None,
    })
}

/// Upstream hit with a correct `.sha1` sidecar.
#[allow(dead_code)]
pub fn found_with_checksum(bytes: &Bytes) -> FetchOutcome {
    FetchOutcome::Found(FetchedArtifact {
        bytes: bytes.clone(),
        checksum: Some(DeclaredChecksum {
            algorithm: ChecksumAlgorithm::Sha1,
            hex: ChecksumAlgorithm::Sha1.digest(bytes),
        }),
        signature: None,
    })
}

/// Upstream hit whose declared checksum belongs to other bytes.
#[allow(dead_code)]
pub fn found_with_bad_checksum(bytes: &Bytes) -> FetchOutcome {
    FetchOutcome::Found(FetchedArtifact {
        bytes: bytes.clone(),
        checksum: Some(DeclaredChecksum {
            algorithm: ChecksumAlgorithm::Sha1,
            hex: ChecksumAlgorithm::Sha1.digest(b"something else"),
        }),
        signature: None,
    })
}

/// Upstream hit signed by `signer`.
#[allow(dead_code)]
pub fn found_signed(bytes: &Bytes, signer: &ArtifactSigner) -> FetchOutcome {
    FetchOutcome::Found(FetchedArtifact {
        bytes: bytes.clone(),
        checksum: None,
        signature: Some(signer.sign(bytes).to_string()),
    })
}
