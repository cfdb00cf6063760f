//! Upstream repository fetching.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use quarry_core::config::FetchConfig;
use quarry_core::{ChecksumAlgorithm, DeclaredChecksum, RepositoryPath, UpstreamSource};
use reqwest::StatusCode;
use tracing::debug;

/// An artifact as served by an upstream, before any verification.
#[derive(Clone, Debug)]
pub struct FetchedArtifact {
    pub bytes: Bytes,
    /// Digest the upstream published alongside the artifact.
    pub checksum: Option<DeclaredChecksum>,
    /// Contents of the upstream `.sig` sidecar.
    pub signature: Option<String>,
}

/// Result of asking one upstream for one path.
#[derive(Clone, Debug)]
pub enum FetchOutcome {
    Found(FetchedArtifact),
    NotFound,
    /// Worth retrying: timeouts, connection failures, 5xx.
    Transient(String),
}

/// Fetches artifacts from upstream repositories. Performs no caching and
/// no verification.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    async fn fetch(&self, source: &UpstreamSource, path: &RepositoryPath) -> FetchOutcome;
}

/// HTTP fetcher backed by a shared reqwest client.
pub struct HttpFetcher {
    client: reqwest::Client,
    max_artifact_size: u64,
}

enum Body {
    Bytes(Bytes),
    Missing,
    Transient(String),
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.connect_timeout())
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            max_artifact_size: config.max_artifact_size,
        })
    }

    async fn get(&self, url: &str) -> Body {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => return Body::Transient(format!("request failed: {e}")),
        };

        let status = response.status();
        if !status.is_success() {
            return if is_transient_status(status) {
                Body::Transient(format!("upstream returned {status}"))
            } else {
                Body::Missing
            };
        }

        if let Some(len) = response.content_length()
            && len > self.max_artifact_size
        {
            debug!(url, len, "Upstream response exceeds size limit");
            return Body::Missing;
        }

        // Chunked responses carry no length, so the limit is enforced while
        // reading and the connection dropped as soon as it is crossed.
        let capacity = response.content_length().unwrap_or(0) as usize;
        let mut body = BytesMut::with_capacity(capacity);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => return Body::Transient(format!("reading body failed: {e}")),
            };
            if (body.len() + chunk.len()) as u64 > self.max_artifact_size {
                debug!(url, read = body.len() + chunk.len(), "Upstream response exceeds size limit");
                return Body::Missing;
            }
            body.extend_from_slice(&chunk);
        }
        Body::Bytes(body.freeze())
    }

    /// Fetch the strongest checksum sidecar the upstream publishes.
    async fn declared_checksum(
        &self,
        source: &UpstreamSource,
        path: &RepositoryPath,
    ) -> Result<Option<DeclaredChecksum>, String> {
        for algorithm in [ChecksumAlgorithm::Sha256, ChecksumAlgorithm::Sha1] {
            let url = source.url_for(&path.with_extension(algorithm.extension()));
            match self.get(&url).await {
                Body::Bytes(bytes) => {
                    let text = String::from_utf8_lossy(&bytes);
                    match algorithm.parse_sidecar(&text) {
                        Ok(hex) => return Ok(Some(DeclaredChecksum { algorithm, hex })),
                        Err(e) => {
                            debug!(url = %url, error = %e, "Ignoring malformed checksum sidecar");
                        }
                    }
                }
                Body::Missing => {}
                Body::Transient(cause) => return Err(cause),
            }
        }
        Ok(None)
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, source: &UpstreamSource, path: &RepositoryPath) -> FetchOutcome {
        let bytes = match self.get(&source.url_for(path)).await {
            Body::Bytes(bytes) => bytes,
            Body::Missing => return FetchOutcome::NotFound,
            Body::Transient(cause) => return FetchOutcome::Transient(cause),
        };

        // Sidecars carry no sidecars of their own.
        if path.sidecar().is_some() {
            return FetchOutcome::Found(FetchedArtifact {
                bytes,
                checksum: None,
                signature: None,
            });
        }

        let checksum = match self.declared_checksum(source, path).await {
            Ok(checksum) => checksum,
            Err(cause) => return FetchOutcome::Transient(cause),
        };

        let signature = match self.get(&source.url_for(&path.with_extension("sig"))).await {
            Body::Bytes(bytes) => Some(String::from_utf8_lossy(&bytes).trim().to_string()),
            Body::Missing => None,
            Body::Transient(cause) => return FetchOutcome::Transient(cause),
        };

        FetchOutcome::Found(FetchedArtifact {
            bytes,
            checksum,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_statuses() {
        assert!(is_transient_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(is_transient_status(StatusCode::REQUEST_TIMEOUT));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
        assert!(!is_transient_status(StatusCode::GONE));
        assert!(!is_transient_status(StatusCode::FORBIDDEN));
    }

    #[test]
    fn test_client_builds_from_defaults() {
        assert!(HttpFetcher::new(&FetchConfig::default()).is_ok());
    }
}
