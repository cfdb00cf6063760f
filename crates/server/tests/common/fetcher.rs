//! Scripted upstream fetcher.

use async_trait::async_trait;
use parking_lot::Mutex;
use quarry_core::{RepositoryPath, UpstreamSource};
use quarry_server::{FetchOutcome, Fetcher};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

type Key = (String, String);

/// A [`Fetcher`] answering from per-source, per-path scripts.
///
/// Each script is a queue of outcomes; the last one repeats forever.
/// Paths without a script are `NotFound`.
#[derive(Default)]
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<Key, VecDeque<FetchOutcome>>>,
    calls: Mutex<HashMap<Key, usize>>,
    delay: Mutex<Option<Duration>>,
    source_delays: Mutex<HashMap<String, Duration>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    /// Notified each time a fetch starts.
    pub entered: Notify,
}

#[allow(dead_code)]
impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `path` on `source` with `outcome` from now on.
    pub fn serve(&self, source: &str, path: &str, outcome: FetchOutcome) {
        self.script(source, path, vec![outcome]);
    }

    /// Answer `path` on `source` with `outcomes` in order.
    pub fn script(&self, source: &str, path: &str, outcomes: Vec<FetchOutcome>) {
        self.scripts
            .lock()
            .insert(key(source, path), outcomes.into_iter().collect());
    }

    /// Delay every response.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Delay every response from `source`, overriding [`ScriptedFetcher::set_delay`].
    pub fn set_source_delay(&self, source: &str, delay: Duration) {
        self.source_delays.lock().insert(source.to_string(), delay);
    }

    /// Hold every fetch until [`ScriptedFetcher::release`].
    pub fn pause(&self) {
        *self.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self) {
        if let Some(gate) = self.gate.lock().take() {
            gate.add_permits(1 << 20);
        }
    }

    pub fn calls(&self, source: &str, path: &str) -> usize {
        self.calls
            .lock()
            .get(&key(source, path))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }
}

fn key(source: &str, path: &str) -> Key {
    (
        source.to_string(),
        path.strip_prefix('/').unwrap_or(path).to_string(),
    )
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, source: &UpstreamSource, path: &RepositoryPath) -> FetchOutcome {
        let key = key(&source.id, path.as_str());
        *self.calls.lock().entry(key.clone()).or_default() += 1;
        self.entered.notify_one();

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await;
        }
        let delay = self
            .source_delays
            .lock()
            .get(&source.id)
            .copied()
            .or(*self.delay.lock());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut scripts = self.scripts.lock();
        match scripts.get_mut(&key) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(FetchOutcome::NotFound),
            Some(queue) => queue.front().cloned().unwrap_or(FetchOutcome::NotFound),
            None => FetchOutcome::NotFound,
        }
    }
}
