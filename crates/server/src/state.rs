//! Process-wide server state shared by request handlers and the console.

use crate::auth::UserStore;
use crate::engine::ProxyEngine;
use crate::index::CacheIndex;
use parking_lot::RwLock;
use quarry_core::config::{AppConfig, TrustConfig};
use quarry_core::{UpstreamSource, sort_sources};
use quarry_signer::{SignerError, SignerResult, TrustedKeys};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

/// Monotonic event counters. Reads never block writers.
#[derive(Debug, Default)]
pub struct Counters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub fetch_failures: AtomicU64,
    pub upstream_fetches: AtomicU64,
    pub verification_failures: AtomicU64,
    pub singleflight_joins: AtomicU64,
    pub publishes: AtomicU64,
    pub purges: AtomicU64,
}

impl Counters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            upstream_fetches: self.upstream_fetches.load(Ordering::Relaxed),
            verification_failures: self.verification_failures.load(Ordering::Relaxed),
            singleflight_joins: self.singleflight_joins.load(Ordering::Relaxed),
            publishes: self.publishes.load(Ordering::Relaxed),
            purges: self.purges.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`Counters`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub fetch_failures: u64,
    pub upstream_fetches: u64,
    pub verification_failures: u64,
    pub singleflight_joins: u64,
    pub publishes: u64,
    pub purges: u64,
}

/// Errors from mutating the upstream source list.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("source already exists: {0}")]
    Duplicate(String),

    #[error("unknown source: {0}")]
    Unknown(String),

    #[error(transparent)]
    Invalid(#[from] quarry_core::Error),
}

/// The live aggregate: upstream sources, cache index, trusted keys, upload
/// users and counters.
///
/// The source list and key set are copy-on-write: readers take an `Arc`
/// snapshot and iterate it without holding a lock, mutations build a new
/// value and swap it in under a short write lock.
pub struct ServerState {
    sources: RwLock<Arc<Vec<UpstreamSource>>>,
    trusted: RwLock<Arc<TrustedKeys>>,
    trust_config: TrustConfig,
    users: UserStore,
    index: CacheIndex,
    counters: Counters,
}

impl ServerState {
    pub fn new(config: &AppConfig, trusted: TrustedKeys) -> Self {
        let mut sources = config.upstreams.clone();
        sort_sources(&mut sources);
        Self {
            sources: RwLock::new(Arc::new(sources)),
            trusted: RwLock::new(Arc::new(trusted)),
            trust_config: config.trust.clone(),
            users: UserStore::new(config.auth.clone()),
            index: CacheIndex::new(),
            counters: Counters::default(),
        }
    }

    /// Replace the (initially empty) upload user set.
    pub fn with_users(mut self, users: UserStore) -> Self {
        self.users = users;
        self
    }

    /// Snapshot of the sources in consultation order.
    pub fn sources(&self) -> Arc<Vec<UpstreamSource>> {
        self.sources.read().clone()
    }

    /// Insert a source, keeping priority order.
    pub fn add_source(&self, source: UpstreamSource) -> Result<(), SourceError> {
        source.validate()?;
        let mut guard = self.sources.write();
        if guard.iter().any(|s| s.id == source.id) {
            return Err(SourceError::Duplicate(source.id));
        }
        let mut next = guard.as_ref().clone();
        next.push(source);
        sort_sources(&mut next);
        *guard = Arc::new(next);
        Ok(())
    }

    /// Remove a source by id. Fetches already iterating an older snapshot
    /// are unaffected.
    pub fn remove_source(&self, id: &str) -> Result<UpstreamSource, SourceError> {
        let mut guard = self.sources.write();
        let pos = guard
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| SourceError::Unknown(id.to_string()))?;
        let mut next = guard.as_ref().clone();
        let removed = next.remove(pos);
        *guard = Arc::new(next);
        Ok(removed)
    }

    /// Snapshot of the trusted key set.
    pub fn trusted_keys(&self) -> Arc<TrustedKeys> {
        self.trusted.read().clone()
    }

    /// Re-read trust material from its configured sources and swap it in.
    /// The file is read on the blocking pool. On error the previous set
    /// stays active.
    pub async fn reload_keys(&self) -> SignerResult<usize> {
        let config = self.trust_config.clone();
        let keys = tokio::task::spawn_blocking(move || TrustedKeys::load(&config))
            .await
            .map_err(|e| SignerError::Io(std::io::Error::other(e)))??;
        let count = keys.len();
        *self.trusted.write() = Arc::new(keys);
        Ok(count)
    }

    pub fn users(&self) -> &UserStore {
        &self.users
    }

    pub fn index(&self) -> &CacheIndex {
        &self.index
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }
}

/// Broadcast handle for graceful shutdown.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`Shutdown::trigger`] has been called.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so this only ends once triggered.
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Application state handed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub engine: ProxyEngine,
    pub shutdown: Shutdown,
}

impl AppState {
    pub fn new(config: AppConfig, engine: ProxyEngine) -> Self {
        Self {
            config: Arc::new(config),
            engine,
            shutdown: Shutdown::new(),
        }
    }
}
