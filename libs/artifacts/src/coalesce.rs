//! Call coalescing: at most one in-flight execution per key.
//!
//! The first caller for a key spawns the work; callers arriving while it runs
//! get a handle to the same execution. When the work finishes its result is
//! published to every handle and the key is cleared in the same critical
//! section, so the next caller starts a fresh execution. Nothing is cached
//! here; that is the job of [`KeyedCache`](crate::keyed_cache::KeyedCache).

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::debug;

type Slot<T, E> = watch::Receiver<Option<Result<T, E>>>;

struct Entry<T, E> {
    id: u64,
    slot: Slot<T, E>,
}

type FlightMap<T, E> = Arc<Mutex<HashMap<String, Entry<T, E>>>>;

/// Merges concurrent executions that share a key.
pub struct Coalescer<T, E> {
    flights: FlightMap<T, E>,
    next_id: AtomicU64,
}

/// Handle to one (possibly shared) execution.
pub struct Flight<T, E> {
    slot: Slot<T, E>,
    leader: bool,
}

impl<T, E> Coalescer<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Join the in-flight execution for `key`, or start one with `make`.
    ///
    /// `make` is only called when no execution for `key` is running. The
    /// work is spawned onto the runtime, so it finishes even if every caller
    /// stops waiting.
    pub fn join<F, Fut>(&self, key: &str, make: F) -> Flight<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let mut flights = lock(&self.flights);

        if let Some(entry) = flights.get(key) {
            debug!(key = %key, "Joining in-flight fetch");
            return Flight {
                slot: entry.slot.clone(),
                leader: false,
            };
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, slot) = watch::channel(None);
        flights.insert(
            key.to_string(),
            Entry {
                id,
                slot: slot.clone(),
            },
        );
        drop(flights);

        let completion = Completion {
            flights: Arc::clone(&self.flights),
            key: key.to_string(),
            id,
            tx: Some(tx),
        };
        let work = make();
        tokio::spawn(async move {
            let result = work.await;
            completion.finish(result);
        });

        Flight { slot, leader: true }
    }

    /// Number of keys currently in flight.
    pub fn in_flight(&self) -> usize {
        lock(&self.flights).len()
    }
}

impl<T, E> Default for Coalescer<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone, E: Clone> Flight<T, E> {
    /// Whether this handle started the execution.
    pub fn is_leader(&self) -> bool {
        self.leader
    }

    /// Wait for the execution's result.
    ///
    /// Returns `None` if the work ended without a result (it panicked or the
    /// runtime shut down).
    pub async fn wait(mut self) -> Option<Result<T, E>> {
        match self.slot.wait_for(Option::is_some).await {
            Ok(result) => result.clone(),
            Err(_) => None,
        }
    }
}

/// Publishes the result and clears the key, also on panic.
struct Completion<T, E> {
    flights: FlightMap<T, E>,
    key: String,
    id: u64,
    tx: Option<watch::Sender<Option<Result<T, E>>>>,
}

impl<T, E> Completion<T, E> {
    fn finish(mut self, result: Result<T, E>) {
        self.release(Some(result));
    }

    fn release(&mut self, result: Option<Result<T, E>>) {
        let Some(tx) = self.tx.take() else {
            return;
        };

        let mut flights = lock(&self.flights);
        if flights.get(&self.key).is_some_and(|entry| entry.id == self.id) {
            flights.remove(&self.key);
        }
        if let Some(result) = result {
            tx.send_replace(Some(result));
        }
    }
}

impl<T, E> Drop for Completion<T, E> {
    fn drop(&mut self) {
        self.release(None);
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
