//! Computing Cache
//!
//! A read-through cache: values missing from the store are produced by a
//! computer function, stored, and returned. Concurrent misses for one key
//! share a single computation (see [`SingleFlight`]).

use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use tokio_util::sync::CancellationToken;

use super::flight::SingleFlight;
use super::store::AsyncCache;
use crate::error::ComputeError;
use crate::locking::{LockOwner, LockTable};

type Computer<K, V> = dyn Fn(K) -> BoxFuture<'static, Result<V, ComputeError>> + Send + Sync;

/// Read-through cache over an [`AsyncCache`] store.
pub struct ComputingCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    store: Arc<dyn AsyncCache<K, V>>,
    flights: SingleFlight<K, V>,
    computer: Arc<Computer<K, V>>,
}

impl<K, V> ComputingCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(store: Arc<dyn AsyncCache<K, V>>, computer: F) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, ComputeError>> + Send + 'static,
    {
        Self::with_locks(store, LockTable::default(), computer)
    }

    pub fn with_locks<F, Fut>(store: Arc<dyn AsyncCache<K, V>>, locks: LockTable<K>, computer: F) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, ComputeError>> + Send + 'static,
    {
        Self {
            store,
            flights: SingleFlight::new(locks),
            computer: Arc::new(move |key: K| computer(key).boxed()),
        }
    }

    /// Get the value for `key`, computing and storing it on a miss.
    pub async fn get(&self, key: K) -> Result<V, ComputeError> {
        self.get_cancellable(key, &CancellationToken::new()).await
    }

    /// Like [`get`](Self::get), but stops waiting once `cancel` fires.
    ///
    /// Cancelling returns [`ComputeError::Cancelled`] to this caller only;
    /// a computation already started keeps running for other waiters and
    /// still stores its result.
    pub async fn get_cancellable(&self, key: K, cancel: &CancellationToken) -> Result<V, ComputeError> {
        self.get_as(key, LockOwner::next(), cancel).await
    }

    /// Like [`get_cancellable`](Self::get_cancellable), acquiring the key
    /// lock on behalf of an existing call chain.
    pub async fn get_as(&self, key: K, owner: LockOwner, cancel: &CancellationToken) -> Result<V, ComputeError> {
        let lookup_key = key.clone();
        let lookup = || self.store.try_get(&lookup_key);

        let store = Arc::clone(&self.store);
        let computer = Arc::clone(&self.computer);
        let compute_key = key.clone();
        let compute = move || async move {
            let value = computer(compute_key.clone()).await?;
            store.set(compute_key, value.clone()).await;
            Ok(value)
        };

        self.flights.run(key, owner, cancel, lookup, compute).await
    }

    /// Same as [`get`](Self::get): a miss is always computed, so the
    /// result is never empty.
    pub async fn try_get(&self, key: K) -> Result<Option<V>, ComputeError> {
        self.get(key).await.map(Some)
    }

    /// Drop the stored value for `key`; the next `get` recomputes it.
    pub async fn invalidate(&self, key: &K) -> bool {
        self.store.remove(key).await
    }

    pub fn store(&self) -> &Arc<dyn AsyncCache<K, V>> {
        &self.store
    }

    pub fn is_computing(&self, key: &K) -> bool {
        self.flights.in_flight(key)
    }
}
