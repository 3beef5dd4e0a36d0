//! Single-Flight Execution
//!
//! The Read-Lock-Recheck-Compute-Store loop shared by the computing cache
//! and the computed graph.
//!
//! # Algorithm
//!
//! 1. Look the key up in the store; return on hit.
//! 2. Join the key's in-flight computation if there is one.
//! 3. Take the key's lock, then look it up again: whoever held the lock before
//!    us may have stored the value already.
//! 4. Join or start the in-flight computation while still holding the lock,
//!    so at most one is ever started per key.
//! 5. Release the lock and await the computation.
//!
//! The computation runs as a detached task behind a `Shared` future. A
//! waiter that gives up (token cancelled or future dropped) only stops
//! waiting; the computation finishes for everybody else. Its outcome,
//! success or failure, is handed to every waiter that joined it, and the
//! flight unregisters itself once done. A flight whose work has finished is
//! never joined, even before it unregisters: a late caller starts over
//! instead of inheriting an outcome produced before it asked. Failures are
//! never stored, so the next caller starts over too.

use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::ComputeError;
use crate::locking::{LockOwner, LockTable};

type FlightFuture<V> = Shared<BoxFuture<'static, Result<V, ComputeError>>>;

#[derive(Clone)]
struct Flight<V>
where
    V: Clone,
{
    generation: u64,
    /// Set once the work has finished, just before the flight unregisters.
    settled: Arc<AtomicBool>,
    future: FlightFuture<V>,
}

impl<V: Clone> Flight<V> {
    fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }
}

/// Deduplicates concurrent computations per key.
pub struct SingleFlight<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    locks: LockTable<K>,
    flights: Arc<DashMap<K, Flight<V>>>,
    next_generation: AtomicU64,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(locks: LockTable<K>) -> Self {
        Self {
            locks,
            flights: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Return the stored value for `key` or compute it exactly once.
    ///
    /// `lookup` reads the store. `compute` produces the future that computes
    /// and stores the value; it is only called if this caller ends up
    /// starting the computation. Requires a tokio runtime.
    pub async fn run<P, PF, F, Fut>(
        &self,
        key: K,
        owner: LockOwner,
        cancel: &CancellationToken,
        lookup: P,
        compute: F,
    ) -> Result<V, ComputeError>
    where
        P: Fn() -> PF,
        PF: Future<Output = Option<V>>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, ComputeError>> + Send + 'static,
    {
        if let Some(value) = lookup().await {
            trace!(?key, "cache hit");
            return Ok(value);
        }
        if let Some(flight) = self.joinable(&key) {
            trace!(?key, "joining in-flight computation");
            return Self::wait(flight, cancel).await;
        }

        let flight = {
            let _guard = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ComputeError::Cancelled),
                guard = self.locks.lock(key.clone(), owner) => guard?,
            };
            if let Some(value) = lookup().await {
                trace!(?key, "cache hit after lock");
                return Ok(value);
            }
            self.join_or_start(key, compute)
        };

        Self::wait(flight, cancel).await
    }

    /// Whether a computation for `key` is running.
    pub fn in_flight(&self, key: &K) -> bool {
        self.flights.contains_key(key)
    }

    /// Number of running computations.
    pub fn len(&self) -> usize {
        self.flights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flights.is_empty()
    }

    pub fn locks(&self) -> &LockTable<K> {
        &self.locks
    }

    fn joinable(&self, key: &K) -> Option<FlightFuture<V>> {
        self.flights
            .get(key)
            .filter(|flight| !flight.is_settled())
            .map(|flight| flight.future.clone())
    }

    fn join_or_start<F, Fut>(&self, key: K, compute: F) -> FlightFuture<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, ComputeError>> + Send + 'static,
    {
        // The map entry keeps the shard locked until the new flight is
        // registered, so its task cannot unregister before that.
        match self.flights.entry(key) {
            Entry::Occupied(entry) if !entry.get().is_settled() => entry.get().future.clone(),
            Entry::Occupied(mut entry) => {
                trace!(key = ?entry.key(), "replacing settled computation");
                let flight = self.start(entry.key().clone(), compute);
                let future = flight.future.clone();
                entry.insert(flight);
                future
            }
            Entry::Vacant(entry) => {
                let flight = self.start(entry.key().clone(), compute);
                let future = flight.future.clone();
                entry.insert(flight);
                future
            }
        }
    }

    fn start<F, Fut>(&self, key: K, compute: F) -> Flight<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, ComputeError>> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let settled = Arc::new(AtomicBool::new(false));
        debug!(?key, generation, "starting computation");

        let work = compute();
        let task = {
            let flights = Arc::clone(&self.flights);
            let settled = Arc::clone(&settled);
            tokio::spawn(async move {
                let result = work.await;
                settled.store(true, Ordering::Release);
                flights.remove_if(&key, |_, flight| flight.generation == generation);
                result
            })
        };
        let future = async move {
            match task.await {
                Ok(result) => result,
                Err(err) => Err(ComputeError::TaskFailed(err.to_string())),
            }
        }
        .boxed()
        .shared();

        Flight {
            generation,
            settled,
            future,
        }
    }

    async fn wait(flight: FlightFuture<V>, cancel: &CancellationToken) -> Result<V, ComputeError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ComputeError::Cancelled),
            result = flight => result,
        }
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(LockTable::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;
    use std::time::Duration;

    use tokio::sync::Notify;

    #[tokio::test]
    async fn store_hit_skips_compute() {
        let flights = SingleFlight::<u32, u32>::default();
        let cancel = CancellationToken::new();

        let value = flights
            .run(
                1,
                LockOwner::next(),
                &cancel,
                || async { Some(10) },
                || async { Err(ComputeError::msg("must not run")) },
            )
            .await
            .unwrap();

        assert_eq!(value, 10);
        assert!(flights.is_empty());
    }

    #[tokio::test]
    async fn failure_is_shared_then_retried() {
        let flights = Arc::new(SingleFlight::<u32, u32>::default());
        let calls = Arc::new(AtomicI32::new(0));
        let gate = Arc::new(Notify::new());

        let spawn_caller = |fail: bool| {
            let flights = Arc::clone(&flights);
            let calls = Arc::clone(&calls);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                flights
                    .run(
                        1,
                        LockOwner::next(),
                        &CancellationToken::new(),
                        || async { None },
                        move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            gate.notified().await;
                            if fail {
                                Err(ComputeError::msg("boom"))
                            } else {
                                Ok(5)
                            }
                        },
                    )
                    .await
            })
        };

        let first = spawn_caller(true);
        while !flights.in_flight(&1) {
            tokio::task::yield_now().await;
        }
        let second = spawn_caller(false);
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.notify_waiters();

        assert!(first.await.unwrap().is_err());
        assert!(second.await.unwrap().is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Nothing was stored, so the next caller computes again.
        let third = spawn_caller(false);
        while calls.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        gate.notify_waiters();
        assert_eq!(third.await.unwrap().unwrap(), 5);
    }

    #[tokio::test]
    async fn settled_flights_are_not_joined() {
        let flights = SingleFlight::<u32, u32>::default();
        // A flight whose work finished but which has not unregistered yet.
        flights.flights.insert(
            1,
            Flight {
                generation: u64::MAX,
                settled: Arc::new(AtomicBool::new(true)),
                future: futures_util::future::ready(Err(ComputeError::msg("stale")))
                    .boxed()
                    .shared(),
            },
        );

        let value = flights
            .run(
                1,
                LockOwner::next(),
                &CancellationToken::new(),
                || async { None },
                || async { Ok(7) },
            )
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert!(flights.is_empty());
    }
}
