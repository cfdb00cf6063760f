//! Per-key de-duplication of in-progress work.
//!
//! The first caller for a key becomes the leader and spawns the work as a
//! task; later callers for the same key attach to it and receive a clone of
//! the same result. The registry slot is removed the moment the work
//! finishes, panics or is aborted, so the next caller after completion
//! starts fresh work.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tokio::task::AbortHandle;

/// How a caller took part in a flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Started the work.
    Leader,
    /// Attached to work already in progress.
    Follower,
}

#[derive(Debug, thiserror::Error)]
pub enum FlightError {
    /// The work ended without producing a value (panic or abort).
    #[error("in-flight work was abandoned")]
    Abandoned,
}

struct Slot<V> {
    generation: u64,
    rx: watch::Receiver<Option<V>>,
    waiters: usize,
    abort: AbortHandle,
}

type Registry<K, V> = Arc<Mutex<HashMap<K, Slot<V>>>>;

/// Registry of in-flight work keyed by `K`.
pub struct SingleFlight<K, V> {
    slots: Registry<K, V>,
    next_generation: AtomicU64,
    cancel_unwatched: bool,
}

impl<K, V> SingleFlight<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// When `cancel_unwatched` is set, work is aborted as soon as its last
    /// waiter goes away. Otherwise it always runs to completion.
    pub fn new(cancel_unwatched: bool) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
            cancel_unwatched,
        }
    }

    /// Number of keys with work in progress.
    pub fn in_flight(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.slots.lock().contains_key(key)
    }

    /// Run `work` for `key`, or join the run already in progress.
    ///
    /// `make` is only called when this caller becomes the leader.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> Result<(V, Role), FlightError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let (mut rx, role, generation) = {
            let mut slots = self.slots.lock();
            match slots.get_mut(&key) {
                Some(slot) => {
                    slot.waiters += 1;
                    (slot.rx.clone(), Role::Follower, slot.generation)
                }
                None => {
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(None);
                    let cleanup = SlotCleanup {
                        slots: self.slots.clone(),
                        key: key.clone(),
                        generation,
                    };
                    let work = make();
                    // The task cannot clear the slot before it is inserted:
                    // cleanup needs the lock held here.
                    let handle = tokio::spawn(async move {
                        let cleanup = cleanup;
                        let value = work.await;
                        drop(cleanup);
                        tx.send_replace(Some(value));
                    });
                    slots.insert(
                        key.clone(),
                        Slot {
                            generation,
                            rx: rx.clone(),
                            waiters: 1,
                            abort: handle.abort_handle(),
                        },
                    );
                    (rx, Role::Leader, generation)
                }
            }
        };

        let _waiter = WaiterGuard {
            slots: self.slots.clone(),
            key,
            generation,
            cancel_unwatched: self.cancel_unwatched,
        };

        let value = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| FlightError::Abandoned)?
            .clone()
            .ok_or(FlightError::Abandoned)?;
        Ok((value, role))
    }
}

/// Removes the slot when the work task ends, however it ends.
struct SlotCleanup<K: Hash + Eq, V> {
    slots: Registry<K, V>,
    key: K,
    generation: u64,
}

impl<K: Hash + Eq, V> Drop for SlotCleanup<K, V> {
    fn drop(&mut self) {
        let mut slots = self.slots.lock();
        if slots
            .get(&self.key)
            .is_some_and(|slot| slot.generation == self.generation)
        {
            slots.remove(&self.key);
        }
    }
}

/// Detaches one waiter; the last one out may abort the work.
struct WaiterGuard<K: Hash + Eq, V> {
    slots: Registry<K, V>,
    key: K,
    generation: u64,
    cancel_unwatched: bool,
}

impl<K: Hash + Eq, V> Drop for WaiterGuard<K, V> {
    fn drop(&mut self) {
        let mut slots = self.slots.lock();
        let abandon = match slots.get_mut(&self.key) {
            Some(slot) if slot.generation == self.generation => {
                slot.waiters = slot.waiters.saturating_sub(1);
                if slot.waiters == 0 && self.cancel_unwatched {
                    slot.abort.abort();
                    true
                } else {
                    false
                }
            }
            _ => false,
        };
        if abandon {
            slots.remove(&self.key);
        }
    }
}
