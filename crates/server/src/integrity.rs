//! Trust policy applied to fetched artifacts.

use crate::upstream::FetchedArtifact;
use quarry_core::UpstreamSource;
use quarry_signer::{Signature, TrustedKeys, Verification, verify};

/// Check a fetched artifact against its source's trust policy.
///
/// Returns the signature to store with the entry, or the reason the
/// artifact was rejected. `exempt` paths (opaque sidecars) skip the
/// signature requirement but a signature they do carry is still checked.
pub fn check(
    artifact: &FetchedArtifact,
    source: &UpstreamSource,
    trusted: &TrustedKeys,
    exempt: bool,
) -> Result<Option<String>, String> {
    if let Some(declared) = &artifact.checksum {
        declared.verify(&artifact.bytes).map_err(|e| e.to_string())?;
    }

    match &artifact.signature {
        Some(text) => {
            let signature = Signature::parse(text).map_err(|e| e.to_string())?;
            match verify(&artifact.bytes, &signature, trusted, &source.allowed_keys) {
                Verification::Verified { .. } => Ok(Some(signature.to_string())),
                Verification::Failed(reason) => Err(reason),
            }
        }
        None if source.require_signature && !exempt => {
            Err(format!("source {} requires a signature", source.id))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use quarry_core::{ChecksumAlgorithm, DeclaredChecksum};
    use quarry_signer::ArtifactSigner;

    const POM: &[u8] = b"<project><artifactId>lib</artifactId></project>";

    fn artifact(checksum: Option<DeclaredChecksum>, signature: Option<String>) -> FetchedArtifact {
        FetchedArtifact {
            bytes: Bytes::from_static(POM),
            checksum,
            signature,
        }
    }

    fn signed_source(keys: &[&str]) -> UpstreamSource {
        let mut source = UpstreamSource::new("internal", "https://maven.internal");
        source.require_signature = true;
        source.allowed_keys = keys.iter().map(|k| k.to_string()).collect();
        source
    }

    fn trusting(signer: &ArtifactSigner) -> TrustedKeys {
        let mut keys = TrustedKeys::default();
        keys.insert(signer.key_name(), signer.public_key().clone())
            .unwrap();
        keys
    }

    #[test]
    fn test_unsigned_plain_source_accepted() {
        let source = UpstreamSource::new("central", "https://repo.example");
        let declared = DeclaredChecksum {
            algorithm: ChecksumAlgorithm::Sha1,
            hex: ChecksumAlgorithm::Sha1.digest(POM),
        };
        assert_eq!(
            check(&artifact(Some(declared), None), &source, &TrustedKeys::default(), false),
            Ok(None)
        );
    }

    #[test]
    fn test_checksum_mismatch_rejected() {
        let source = UpstreamSource::new("central", "https://repo.example");
        let declared = DeclaredChecksum {
            algorithm: ChecksumAlgorithm::Sha256,
            hex: ChecksumAlgorithm::Sha256.digest(b"other"),
        };
        let err = check(&artifact(Some(declared), None), &source, &TrustedKeys::default(), false)
            .unwrap_err();
        assert!(err.contains("mismatch"));
    }

    #[test]
    fn test_required_signature() {
        let signer = ArtifactSigner::generate("build-1");
        let source = signed_source(&[]);
        let trusted = trusting(&signer);

        assert!(check(&artifact(None, None), &source, &trusted, false).is_err());
        assert_eq!(check(&artifact(None, None), &source, &trusted, true), Ok(None));

        let sig = signer.sign(POM).to_string();
        assert_eq!(
            check(&artifact(None, Some(sig.clone())), &source, &trusted, false),
            Ok(Some(sig))
        );
    }

    #[test]
    fn test_bad_signature_rejected_even_when_optional() {
        let signer = ArtifactSigner::generate("build-1");
        let source = UpstreamSource::new("central", "https://repo.example");
        let forged = signer.sign(b"different bytes").to_string();
        assert!(check(&artifact(None, Some(forged)), &source, &trusting(&signer), false).is_err());
        assert!(check(&artifact(None, Some("garbage".into())), &source, &trusting(&signer), false).is_err());
    }

    #[test]
    fn test_allowed_keys_enforced() {
        let signer = ArtifactSigner::generate("build-1");
        let source = signed_source(&["build-2"]);
        let sig = signer.sign(POM).to_string();
        let err = check(&artifact(None, Some(sig)), &source, &trusting(&signer), false).unwrap_err();
        assert!(err.contains("not allowed"));
    }
}
