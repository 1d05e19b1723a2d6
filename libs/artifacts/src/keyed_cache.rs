//! Memoized keyed cache with pluggable invalidation.
//!
//! Every cache domain of the manager is a [`KeyedCache`] over one of three
//! policies:
//!
//! - [`OnDisk`]: a key is cached while `root/key` exists (installer
//!   artifacts, extension image tarballs)
//! - [`Ttl`]: a single snapshot that goes stale after an interval (version list)
//! - [`Permanent`]: entries are added once and never invalidated (extension
//!   catalog)
//!
//! Misses are routed through a [`Coalescer`], and the fetched value is
//! recorded by the policy inside the coalesced work, before any waiter is
//! released.

use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::cancel::Cancel;
use crate::coalesce::{lock, Coalescer};
use crate::error::{ArtifactError, FetchError};

/// Decides whether a key is satisfied and how fetched values are recorded.
pub trait CachePolicy: Send + Sync + 'static {
    /// What callers receive.
    type Value: Clone + Send + Sync + 'static;

    /// What a fetch produces.
    type Fetched: Send + 'static;

    /// Return the cached value if `key` is currently valid.
    fn lookup(&self, key: &str) -> Option<Self::Value>;

    /// Record a fetched value for `key` and return what callers receive.
    fn store(&self, key: &str, fetched: Self::Fetched) -> Self::Value;
}

/// A cache domain: a policy plus the coalescer that serializes its misses.
pub struct KeyedCache<P: CachePolicy> {
    name: &'static str,
    policy: Arc<P>,
    flights: Coalescer<P::Value, Arc<FetchError>>,
}

impl<P: CachePolicy> KeyedCache<P> {
    pub fn new(name: &'static str, policy: P) -> Self {
        Self {
            name,
            policy: Arc::new(policy),
            flights: Coalescer::new(),
        }
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Return the value for `key`, fetching it at most once across
    /// concurrent callers on a miss.
    ///
    /// `fetch` is only invoked by the caller that starts the execution. A
    /// fired `cancel` ends this caller's wait with [`ArtifactError::Cancelled`]
    /// without stopping the fetch.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        cancel: &Cancel,
        fetch: F,
    ) -> Result<P::Value, ArtifactError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<P::Fetched, FetchError>> + Send + 'static,
    {
        if let Some(value) = self.policy.lookup(key) {
            debug!(cache = self.name, key = %key, "Cache hit");
            return Ok(value);
        }

        let cache = self.name;
        let policy = Arc::clone(&self.policy);
        let owned_key = key.to_string();
        let flight = self.flights.join(key, move || {
            let work = fetch();
            async move {
                // A flight that finished after our lookup has already cleared
                // its key; its result is visible here.
                if let Some(value) = policy.lookup(&owned_key) {
                    debug!(cache = cache, key = %owned_key, "Cache hit after join");
                    return Ok(value);
                }

                let started = Instant::now();
                info!(cache = cache, key = %owned_key, "Cache miss, fetching");

                let fetched = work.await.map_err(Arc::new)?;
                let value = policy.store(&owned_key, fetched);

                info!(
                    cache = cache,
                    key = %owned_key,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Fetch completed"
                );
                Ok(value)
            }
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ArtifactError::Cancelled),
            result = flight.wait() => match result {
                Some(Ok(value)) => Ok(value),
                Some(Err(e)) => Err(ArtifactError::Fetch(e)),
                None => Err(ArtifactError::Fetch(Arc::new(FetchError::Abandoned))),
            },
        }
    }
}

/// Cached while `root/key` exists on disk.
///
/// The fetch is expected to publish `root/key` atomically; the policy itself
/// keeps no index.
#[derive(Debug, Clone)]
pub struct OnDisk {
    root: PathBuf,
}

impl OnDisk {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl CachePolicy for OnDisk {
    type Value = PathBuf;
    type Fetched = ();

    fn lookup(&self, key: &str) -> Option<PathBuf> {
        let path = self.path(key);
        fs::metadata(&path).is_ok().then_some(path)
    }

    fn store(&self, key: &str, _fetched: ()) -> PathBuf {
        self.path(key)
    }
}

/// A single snapshot that is fresh for `interval` after capture.
///
/// A failed refresh leaves the previous snapshot and its capture time in
/// place, so the next caller retries.
#[derive(Debug)]
pub struct Ttl<V> {
    interval: Duration,
    slot: Mutex<Option<(V, Instant)>>,
}

impl<V> Ttl<V> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            slot: Mutex::new(None),
        }
    }

    /// When the current snapshot was captured.
    pub fn captured_at(&self) -> Option<Instant> {
        lock(&self.slot).as_ref().map(|(_, at)| *at)
    }
}

impl<V: Clone + Send + Sync + 'static> CachePolicy for Ttl<V> {
    type Value = V;
    type Fetched = V;

    fn lookup(&self, _key: &str) -> Option<V> {
        let slot = lock(&self.slot);
        match &*slot {
            Some((value, captured)) if captured.elapsed() < self.interval => Some(value.clone()),
            _ => None,
        }
    }

    fn store(&self, _key: &str, fetched: V) -> V {
        *lock(&self.slot) = Some((fetched.clone(), Instant::now()));
        fetched
    }
}

/// Entries are inserted once per key and kept for the cache's lifetime.
#[derive(Debug)]
pub struct Permanent<V> {
    entries: Mutex<HashMap<String, V>>,
}

impl<V> Permanent<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V> Default for Permanent<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync + 'static> CachePolicy for Permanent<V> {
    type Value = V;
    type Fetched = V;

    fn lookup(&self, key: &str) -> Option<V> {
        lock(&self.entries).get(key).cloned()
    }

    fn store(&self, key: &str, fetched: V) -> V {
        lock(&self.entries).insert(key.to_string(), fetched.clone());
        fetched
    }
}
