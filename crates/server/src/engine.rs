//! Pull-through cache engine.
//!
//! Resolution order for a path: a fresh verified index entry whose blob is
//! still in the store is served directly. Anything else joins (or starts)
//! the single in-flight fetch for that path, which walks a snapshot of the
//! upstream sources in priority order, verifies what it gets and persists
//! the first acceptable artifact. When no upstream has the path, an expired
//! entry or a blob adopted from the store at startup is served instead.

use crate::index::CacheIndex;
use crate::integrity;
use crate::metrics;
use crate::singleflight::{FlightError, Role, SingleFlight};
use crate::state::{CounterSnapshot, Counters, ServerState};
use crate::upstream::{FetchOutcome, FetchedArtifact, Fetcher};
use bytes::Bytes;
use futures::TryStreamExt;
use parking_lot::Mutex;
use quarry_core::config::{AppConfig, FetchConfig};
use quarry_core::{
    CacheEntry, ChecksumAlgorithm, Checksums, Origin, RepositoryPath, Sidecar, UpstreamSource,
    ValidationState,
};
use quarry_signer::ArtifactSigner;
use quarry_storage::{ByteStream, ContentStore, StorageError};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Errors surfaced by engine operations.
///
/// Cloneable so one fetch result can be handed to every waiter.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ResolveResult<T> = std::result::Result<T, ResolveError>;

impl From<quarry_core::Error> for ResolveError {
    fn from(e: quarry_core::Error) -> Self {
        match e {
            quarry_core::Error::InvalidPath(msg) => Self::InvalidPath(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<StorageError> for ResolveError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(key) => Self::NotFound(key),
            StorageError::Conflict(msg) => Self::Conflict(msg),
            other => Self::Storage(other.to_string()),
        }
    }
}

/// Engine tunables taken from the application config.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub fetch: FetchConfig,
    pub mutable_ttl: time::Duration,
    pub index_path: Option<PathBuf>,
}

impl EngineConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            fetch: config.fetch.clone(),
            mutable_ttl: config.cache.mutable_ttl(),
            index_path: config.index.path.clone(),
        }
    }
}

/// Response metadata for a served path.
#[derive(Clone, Debug)]
pub struct ArtifactMeta {
    pub path: RepositoryPath,
    pub content_length: u64,
    /// Hex SHA-256 of the served bytes.
    pub etag: String,
    pub last_modified: OffsetDateTime,
    pub origin: Origin,
}

impl ArtifactMeta {
    fn for_entry(entry: &CacheEntry) -> Self {
        Self {
            path: entry.path.clone(),
            content_length: entry.content_length,
            etag: entry.checksums.sha256.clone(),
            last_modified: entry.fetched_at,
            origin: entry.origin.clone(),
        }
    }

    fn for_derived(path: RepositoryPath, entry: &CacheEntry, body: &[u8]) -> Self {
        Self {
            path,
            content_length: body.len() as u64,
            etag: ChecksumAlgorithm::Sha256.digest(body),
            last_modified: entry.fetched_at,
            origin: entry.origin.clone(),
        }
    }
}

/// Response body for a served path.
pub enum ArtifactBody {
    /// Blob streamed from the content store.
    Stream(ByteStream),
    /// Small derived file (checksum or signature sidecar).
    Bytes(Bytes),
}

impl ArtifactBody {
    /// Read the whole body into memory.
    pub async fn collect(self) -> ResolveResult<Bytes> {
        match self {
            ArtifactBody::Bytes(bytes) => Ok(bytes),
            ArtifactBody::Stream(stream) => {
                let chunks: Vec<Bytes> = stream.try_collect().await?;
                Ok(Bytes::from(chunks.concat()))
            }
        }
    }
}

/// Result of a publish request.
#[derive(Clone, Debug)]
pub enum PublishOutcome {
    Stored(CacheEntry),
    /// Checksum and signature sidecars are derived locally, never stored.
    IgnoredSidecar,
}

/// Result of `purge *`.
pub struct PurgeSummary {
    /// Entries removed from the index.
    pub entries: usize,
    /// Background blob deletion, resolving to the number of blobs removed.
    pub deletion: Option<JoinHandle<usize>>,
}

/// Result of startup recovery.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub kept: usize,
    pub dropped: usize,
    pub adopted: usize,
}

/// Snapshot for the `stats` console command.
#[derive(Clone, Debug, Serialize)]
pub struct EngineStats {
    #[serde(flatten)]
    pub counters: CounterSnapshot,
    pub entries: usize,
    pub in_flight: usize,
    pub sources: usize,
    pub trusted_keys: usize,
}

struct EngineInner {
    state: Arc<ServerState>,
    store: Arc<dyn ContentStore>,
    fetcher: Arc<dyn Fetcher>,
    signer: Option<Arc<ArtifactSigner>>,
    config: EngineConfig,
    flights: SingleFlight<RepositoryPath, ResolveResult<CacheEntry>>,
    publishing: Mutex<HashSet<RepositoryPath>>,
    flushing: tokio::sync::Mutex<()>,
}

/// The cache/proxy engine. Cheap to clone.
#[derive(Clone)]
pub struct ProxyEngine {
    inner: Arc<EngineInner>,
}

impl ProxyEngine {
    pub fn new(
        state: Arc<ServerState>,
        store: Arc<dyn ContentStore>,
        fetcher: Arc<dyn Fetcher>,
        signer: Option<Arc<ArtifactSigner>>,
        config: EngineConfig,
    ) -> Self {
        let flights = SingleFlight::new(config.fetch.cancel_unwatched);
        Self {
            inner: Arc::new(EngineInner {
                state,
                store,
                fetcher,
                signer,
                config,
                flights,
                publishing: Mutex::new(HashSet::new()),
                flushing: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.inner.state
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.inner.store
    }

    pub fn signer(&self) -> Option<&Arc<ArtifactSigner>> {
        self.inner.signer.as_ref()
    }

    fn index(&self) -> &CacheIndex {
        self.inner.state.index()
    }

    fn counters(&self) -> &Counters {
        self.inner.state.counters()
    }

    /// Resolve a request path to its metadata and body.
    pub async fn resolve(&self, raw: &str) -> ResolveResult<(ArtifactMeta, ArtifactBody)> {
        let path = RepositoryPath::parse(raw)?;

        if let Some((meta, body)) = self.derived(&path).await? {
            return Ok((meta, ArtifactBody::Bytes(body)));
        }

        let entry = self.entry_for(&path).await?;
        match self.inner.store.get_stream(&entry.blob_key).await {
            Ok(stream) => Ok((ArtifactMeta::for_entry(&entry), ArtifactBody::Stream(stream))),
            Err(StorageError::NotFound(_)) => {
                // Deleted between lookup and open, e.g. by a concurrent purge.
                debug!(path = %path, "Blob vanished before streaming, fetching again");
                self.index().remove_if_same(&entry);
                let entry = self.fetch_shared(&path).await?;
                let stream = self.inner.store.get_stream(&entry.blob_key).await?;
                Ok((ArtifactMeta::for_entry(&entry), ArtifactBody::Stream(stream)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve a request path to its metadata only.
    pub async fn head(&self, raw: &str) -> ResolveResult<ArtifactMeta> {
        let path = RepositoryPath::parse(raw)?;
        if let Some((meta, _)) = self.derived(&path).await? {
            return Ok(meta);
        }
        let entry = self.entry_for(&path).await?;
        Ok(ArtifactMeta::for_entry(&entry))
    }

    /// Answer checksum and signature sidecars from their base artifact.
    async fn derived(&self, path: &RepositoryPath) -> ResolveResult<Option<(ArtifactMeta, Bytes)>> {
        let (body, entry) = match path.sidecar() {
            Some((Sidecar::Checksum(algorithm), base)) => {
                let entry = self.base_entry(&base).await?;
                (Bytes::from(entry.checksums.get(algorithm).to_string()), entry)
            }
            Some((Sidecar::Signature, base)) => {
                let entry = self.base_entry(&base).await?;
                let Some(signature) = entry.signature.clone() else {
                    return Err(ResolveError::NotFound(path.to_string()));
                };
                (Bytes::from(signature), entry)
            }
            Some((Sidecar::Opaque, _)) | None => return Ok(None),
        };
        Ok(Some((ArtifactMeta::for_derived(path.clone(), &entry, &body), body)))
    }

    async fn base_entry(&self, base: &RepositoryPath) -> ResolveResult<CacheEntry> {
        // A sidecar of a derived file is never a real artifact.
        if matches!(
            base.sidecar(),
            Some((Sidecar::Checksum(_) | Sidecar::Signature, _))
        ) {
            return Err(ResolveError::NotFound(base.to_string()));
        }
        self.entry_for(base).await
    }

    /// Cache lookup with fetch on miss.
    async fn entry_for(&self, path: &RepositoryPath) -> ResolveResult<CacheEntry> {
        let (fresh, fallback) = self.lookup(path).await?;
        if let Some(entry) = fresh {
            Counters::incr(&self.counters().hits);
            metrics::CACHE_HITS.inc();
            return Ok(entry);
        }

        Counters::incr(&self.counters().misses);
        metrics::CACHE_MISSES.inc();

        match (self.fetch_shared(path).await, fallback) {
            (Err(ResolveError::NotFound(_)), Some(entry)) => {
                if entry.state == ValidationState::Verified {
                    warn!(path = %path, "No upstream could refresh entry, serving stale copy");
                } else {
                    info!(path = %path, "No upstream has artifact, serving stored copy");
                }
                Ok(entry)
            }
            (result, _) => result,
        }
    }

    /// Returns `(fresh, fallback)`: a servable entry, or one to serve only
    /// when no upstream has the path. Fallbacks are expired mutable entries
    /// and unverified blobs adopted from the store. Entries whose blob is
    /// gone are dropped.
    async fn lookup(
        &self,
        path: &RepositoryPath,
    ) -> ResolveResult<(Option<CacheEntry>, Option<CacheEntry>)> {
        let Some(entry) = self.index().get(path) else {
            return Ok((None, None));
        };

        if !self.inner.store.exists(&entry.blob_key).await? {
            warn!(path = %path, blob = %entry.blob_key, "Indexed blob missing from store, dropping entry");
            self.index().remove_if_same(&entry);
            return Ok((None, None));
        }

        if entry.state != ValidationState::Verified {
            return Ok((None, Some(entry)));
        }
        if entry.is_fresh(OffsetDateTime::now_utc(), self.inner.config.mutable_ttl) {
            Ok((Some(entry), None))
        } else {
            Ok((None, Some(entry)))
        }
    }

    /// Join or start the single in-flight fetch for `path`.
    async fn fetch_shared(&self, path: &RepositoryPath) -> ResolveResult<CacheEntry> {
        let engine = self.clone();
        let key = path.clone();
        let result = self
            .inner
            .flights
            .run(path.clone(), move || async move { engine.fetch_from_sources(key).await })
            .await;

        match result {
            Ok((value, Role::Follower)) => {
                Counters::incr(&self.counters().singleflight_joins);
                metrics::SINGLEFLIGHT_JOINS.inc();
                value
            }
            Ok((value, Role::Leader)) => value,
            Err(FlightError::Abandoned) => Err(ResolveError::Internal(format!(
                "fetch for {path} ended without a result"
            ))),
        }
    }

    #[instrument(skip_all, fields(path = %path))]
    async fn fetch_from_sources(&self, path: RepositoryPath) -> ResolveResult<CacheEntry> {
        let sources = self.inner.state.sources();
        let trusted = self.inner.state.trusted_keys();
        let exempt = matches!(path.sidecar(), Some((Sidecar::Opaque, _)));

        for source in sources.iter() {
            let Some(artifact) = self.fetch_with_retries(source, &path).await else {
                continue;
            };

            let signature = match integrity::check(&artifact, source, &trusted, exempt) {
                Ok(signature) => signature,
                Err(reason) => {
                    warn!(source = %source.id, reason = %reason, "Rejected artifact failing verification");
                    Counters::incr(&self.counters().verification_failures);
                    metrics::VERIFICATION_FAILURES
                        .with_label_values(&[source.id.as_str()])
                        .inc();
                    continue;
                }
            };

            self.inner
                .store
                .put(path.as_str(), artifact.bytes.clone())
                .await
                .map_err(|e| ResolveError::Storage(e.to_string()))?;

            let entry = CacheEntry::verified(
                path.clone(),
                &artifact.bytes,
                signature,
                Origin::Upstream(source.id.clone()),
            );
            self.index().insert(entry.clone());
            info!(source = %source.id, size = entry.content_length, "Cached artifact from upstream");
            return Ok(entry);
        }

        Counters::incr(&self.counters().fetch_failures);
        debug!(sources = sources.len(), "No upstream could provide artifact");
        Err(ResolveError::NotFound(path.to_string()))
    }

    /// Fetch from one source, retrying transient failures with backoff.
    async fn fetch_with_retries(
        &self,
        source: &UpstreamSource,
        path: &RepositoryPath,
    ) -> Option<FetchedArtifact> {
        let fetch = &self.inner.config.fetch;
        for attempt in 1..=fetch.max_attempts {
            Counters::incr(&self.counters().upstream_fetches);
            let timer = metrics::UPSTREAM_FETCH_DURATION.start_timer();
            let outcome =
                match tokio::time::timeout(fetch.timeout(), self.inner.fetcher.fetch(source, path))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => FetchOutcome::Transient(format!(
                        "no response within {}s",
                        fetch.timeout().as_secs()
                    )),
                };
            timer.observe_duration();

            match outcome {
                FetchOutcome::Found(artifact) => {
                    metrics::record_upstream_fetch(&source.id, "found");
                    return Some(artifact);
                }
                FetchOutcome::NotFound => {
                    metrics::record_upstream_fetch(&source.id, "not_found");
                    debug!(source = %source.id, "Upstream does not have artifact");
                    return None;
                }
                FetchOutcome::Transient(cause) => {
                    metrics::record_upstream_fetch(&source.id, "transient");
                    warn!(
                        source = %source.id,
                        attempt,
                        max_attempts = fetch.max_attempts,
                        cause = %cause,
                        "Transient upstream failure"
                    );
                    if attempt < fetch.max_attempts {
                        tokio::time::sleep(fetch.backoff(attempt)).await;
                    }
                }
            }
        }
        None
    }

    /// Store an artifact uploaded directly to this server.
    #[instrument(skip(self, data), fields(size = data.len()))]
    pub async fn publish(&self, raw: &str, data: Bytes) -> ResolveResult<PublishOutcome> {
        let path = RepositoryPath::parse(raw)?;

        if matches!(
            path.sidecar(),
            Some((Sidecar::Checksum(_) | Sidecar::Signature, _))
        ) {
            debug!(path = %path, "Ignoring uploaded sidecar");
            return Ok(PublishOutcome::IgnoredSidecar);
        }

        let _claim = if path.is_mutable() {
            None
        } else {
            let claim = PublishClaim::acquire(&self.inner.publishing, &path)
                .ok_or_else(|| ResolveError::Conflict(format!("{path} is being published")))?;
            if self.index().contains(&path) || self.inner.store.exists(path.as_str()).await? {
                return Err(ResolveError::Conflict(format!("{path} already exists")));
            }
            Some(claim)
        };

        let signature = self
            .inner
            .signer
            .as_ref()
            .map(|signer| signer.sign(&data).to_string());

        self.inner.store.put(path.as_str(), data.clone()).await?;

        let entry = CacheEntry::verified(path, &data, signature, Origin::Published);
        self.index().insert(entry.clone());
        Counters::incr(&self.counters().publishes);
        metrics::ARTIFACTS_PUBLISHED.inc();
        info!(path = %entry.path, "Published artifact");

        // Published entries exist nowhere upstream, so they are written out
        // immediately rather than on the next periodic flush.
        if let Err(e) = self.flush_index().await {
            warn!(path = %entry.path, error = %e, "Failed to persist index after publish");
        }
        Ok(PublishOutcome::Stored(entry))
    }

    /// Remove one path from the index and the store.
    ///
    /// Returns whether anything was removed. A fetch in flight for the same
    /// path is not interrupted and re-populates the entry when it finishes.
    pub async fn purge(&self, raw: &str) -> ResolveResult<bool> {
        let path = RepositoryPath::parse(raw)?;
        let removed = self.index().remove(&path);
        let blob_key = removed
            .as_ref()
            .map(|e| e.blob_key.clone())
            .unwrap_or_else(|| path.as_str().to_string());

        let deleted = match self.inner.store.delete(&blob_key).await {
            Ok(()) => true,
            Err(StorageError::NotFound(_)) => false,
            Err(e) => return Err(e.into()),
        };

        Counters::incr(&self.counters().purges);
        info!(path = %path, indexed = removed.is_some(), deleted, "Purged path");
        Ok(removed.is_some() || deleted)
    }

    /// Empty the index at once; optionally delete the blobs in the
    /// background. Blobs re-cached before their turn are left alone.
    pub fn purge_all(&self, delete_blobs: bool) -> PurgeSummary {
        let taken = self.index().take_all();
        let entries = taken.len();
        Counters::incr(&self.counters().purges);
        info!(entries, delete_blobs, "Purged cache index");

        let deletion = delete_blobs.then(|| {
            let engine = self.clone();
            tokio::spawn(async move {
                let mut deleted = 0;
                for (path, entry) in taken {
                    if engine.index().contains(&path) {
                        continue;
                    }
                    match engine.inner.store.delete(&entry.blob_key).await {
                        Ok(()) => deleted += 1,
                        Err(StorageError::NotFound(_)) => {}
                        Err(e) => {
                            warn!(path = %path, error = %e, "Failed to delete purged blob");
                        }
                    }
                }
                info!(deleted, "Finished deleting purged blobs");
                deleted
            })
        });

        PurgeSummary { entries, deletion }
    }

    /// Index entry for one path, if any.
    pub fn show(&self, raw: &str) -> ResolveResult<Option<CacheEntry>> {
        let path = RepositoryPath::parse(raw)?;
        Ok(self.index().get(&path))
    }

    pub fn in_flight(&self) -> usize {
        self.inner.flights.in_flight()
    }

    pub fn stats(&self) -> EngineStats {
        let state = &self.inner.state;
        EngineStats {
            counters: state.counters().snapshot(),
            entries: state.index().len(),
            in_flight: self.in_flight(),
            sources: state.sources().len(),
            trusted_keys: state.trusted_keys().len(),
        }
    }

    /// Rebuild the index from a persisted snapshot and the store contents.
    ///
    /// Persisted entries are kept when their blob exists with the recorded
    /// size. Stored blobs with no entry are adopted as unverified: resolution
    /// asks the upstreams first and serves the stored blob only when none of
    /// them has the path.
    pub async fn recover(&self, persisted: Vec<CacheEntry>) -> ResolveResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for entry in persisted {
            match self.inner.store.head(&entry.blob_key).await {
                Ok(meta) if meta.size == entry.content_length => {
                    self.index().insert(entry);
                    report.kept += 1;
                }
                Ok(_) | Err(StorageError::NotFound(_)) => {
                    debug!(path = %entry.path, "Dropping index entry without matching blob");
                    report.dropped += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        for key in self.inner.store.list("").await? {
            let path = match RepositoryPath::parse(&key) {
                Ok(path) => path,
                Err(e) => {
                    debug!(key = %key, error = %e, "Skipping stored file with unusable path");
                    continue;
                }
            };
            if self.index().contains(&path)
                || matches!(
                    path.sidecar(),
                    Some((Sidecar::Checksum(_) | Sidecar::Signature, _))
                )
            {
                continue;
            }
            let data = match self.inner.store.get(&key).await {
                Ok(data) => data,
                Err(StorageError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            self.index().insert(CacheEntry {
                path,
                blob_key: key,
                content_length: data.len() as u64,
                checksums: Checksums::compute(&data),
                signature: None,
                fetched_at: OffsetDateTime::now_utc(),
                origin: Origin::Scanned,
                state: ValidationState::Unverified,
            });
            report.adopted += 1;
        }

        metrics::INDEX_ENTRIES.set(self.index().len() as i64);
        info!(
            kept = report.kept,
            dropped = report.dropped,
            adopted = report.adopted,
            "Recovered cache index"
        );
        Ok(report)
    }

    /// Persist the index now. Returns the number of entries written, or
    /// `None` when no index file is configured.
    ///
    /// Flushes are serialized so an older snapshot never replaces a newer one.
    pub async fn flush_index(&self) -> ResolveResult<Option<usize>> {
        let Some(path) = &self.inner.config.index_path else {
            return Ok(None);
        };
        let _flushing = self.inner.flushing.lock().await;
        let count = self
            .index()
            .save(path)
            .await
            .map_err(|e| ResolveError::Storage(e.to_string()))?;
        metrics::INDEX_ENTRIES.set(count as i64);
        debug!(entries = count, path = %path.display(), "Flushed cache index");
        Ok(Some(count))
    }

    /// Periodically persist the index while it has unsaved changes.
    pub fn spawn_index_flusher(&self, interval: Duration) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !engine.index().is_dirty() {
                    continue;
                }
                if let Err(e) = engine.flush_index().await {
                    warn!(error = %e, "Periodic index flush failed");
                }
            }
        })
    }
}

/// Marks an immutable path as being published until dropped.
struct PublishClaim<'a> {
    set: &'a Mutex<HashSet<RepositoryPath>>,
    path: RepositoryPath,
}

impl<'a> PublishClaim<'a> {
    fn acquire(set: &'a Mutex<HashSet<RepositoryPath>>, path: &RepositoryPath) -> Option<Self> {
        set.lock().insert(path.clone()).then(|| Self {
            set,
            path: path.clone(),
        })
    }
}

impl Drop for PublishClaim<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.path);
    }
}
