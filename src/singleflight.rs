//! Generic async singleflight: collapse concurrent work on identical keys
//! into one execution.
//!
//! The teacher crate doesn't need this (it's single-threaded-blocking per
//! file handle), but it's the standard shape for deduplicating concurrent
//! async work: a map from key to an in-flight, cloneable future. The first
//! arrival installs the future and drives it; later arrivals for the same
//! key just await the same clone.

use std::future::Future;
use std::hash::Hash;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use crate::error::{Error, Result};

type SharedResult<V> = Shared<BoxFuture<'static, std::result::Result<V, SharedError>>>;

/// `Error` isn't `Clone` (it wraps `io::Error`), but `Shared` requires a
/// `Clone` output. We carry the rendered message across the clone boundary
/// and reconstitute a `Error::Protocol` for followers — the leader's caller
/// still sees the original, richer error.
#[derive(Clone)]
struct SharedError(String);

pub struct Group<K, V> {
    inflight: DashMap<K, SharedResult<V>>,
}

impl<K, V> Default for Group<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Group<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: DashMap::new(),
        }
    }

    /// Run `make` for `key` if no call for `key` is already in flight;
    /// otherwise await the in-flight call's result. Returns once the
    /// (possibly shared) work completes.
    pub async fn work<F, Fut>(&self, key: K, make: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let is_leader;
        let shared: SharedResult<V> = match self.inflight.entry(key.clone()) {
            Entry::Occupied(e) => {
                is_leader = false;
                e.get().clone()
            }
            Entry::Vacant(e) => {
                is_leader = true;
                let fut: BoxFuture<'static, std::result::Result<V, SharedError>> =
                    async move { make().await.map_err(|err| SharedError(err.to_string())) }.boxed();
                let shared = fut.shared();
                e.insert(shared.clone());
                shared
            }
        };

        let result = shared.await;

        if is_leader {
            self.inflight.remove(&key);
        }

        result.map_err(|e| Error::Protocol(e.0))
    }

    pub fn in_flight_count(&self) -> usize {
        self.inflight.len()
    }
}
