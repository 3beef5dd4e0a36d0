//! Lock Table
//!
//! One async mutex per key, created on first use and dropped again once no
//! caller holds or awaits it. Waiting on one key never blocks another.
//!
//! # Reentry
//!
//! Every acquisition names a [`LockOwner`], the identity of the logical
//! call chain asking for the lock. In [`ReentryMode::CheckedFail`] an owner
//! that asks for a key it already holds gets [`LockError::Reentry`] back
//! instead of waiting on itself forever.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::LockError;

/// Identity of a logical call chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockOwner(u64);

impl LockOwner {
    /// Allocate a fresh owner id.
    ///
    /// Ids start at 1; 0 marks an unheld lock.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// What happens when an owner asks for a key it already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReentryMode {
    /// Fail with [`LockError::Reentry`].
    #[default]
    CheckedFail,
    /// Do not check; a reentrant acquisition waits on itself.
    Unchecked,
}

struct KeyLock {
    mutex: Arc<Mutex<()>>,
    /// Owner currently holding the mutex, 0 when free.
    holder: AtomicU64,
    /// Callers holding or waiting on the mutex.
    users: AtomicUsize,
}

impl KeyLock {
    fn new() -> Self {
        Self {
            mutex: Arc::new(Mutex::new(())),
            holder: AtomicU64::new(0),
            users: AtomicUsize::new(0),
        }
    }
}

type LockMap<K> = DashMap<K, Arc<KeyLock>>;

/// Per-key async mutual exclusion.
pub struct LockTable<K>
where
    K: Eq + Hash,
{
    locks: Arc<LockMap<K>>,
    mode: ReentryMode,
}

impl<K> LockTable<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    pub fn new(mode: ReentryMode) -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            mode,
        }
    }

    pub fn mode(&self) -> ReentryMode {
        self.mode
    }

    /// Acquire the lock for `key` on behalf of `owner`.
    ///
    /// Suspends until the lock is free. Dropping the returned future while
    /// waiting gives up the place in line; dropping the guard releases it.
    pub async fn lock(&self, key: K, owner: LockOwner) -> Result<LockGuard<K>, LockError> {
        let (lock, ticket) = self.enter(&key);

        if self.mode == ReentryMode::CheckedFail
            && lock.holder.load(Ordering::Acquire) == owner.raw()
        {
            // The ticket drops here and gives back our user slot.
            return Err(LockError::Reentry {
                key: format!("{key:?}"),
                owner: owner.raw(),
            });
        }

        let guard = Arc::clone(&lock.mutex).lock_owned().await;
        lock.holder.store(owner.raw(), Ordering::Release);

        Ok(LockGuard {
            guard: Some(guard),
            lock,
            _ticket: ticket,
        })
    }

    /// Whether some owner currently holds `key`.
    pub fn is_locked(&self, key: &K) -> bool {
        self.locks
            .get(key)
            .map(|lock| lock.holder.load(Ordering::Acquire) != 0)
            .unwrap_or(false)
    }

    /// Number of keys with at least one holder or waiter.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Register as a user of `key`'s lock, creating it if needed.
    fn enter(&self, key: &K) -> (Arc<KeyLock>, UserTicket<K>) {
        let lock = {
            let entry = self
                .locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(KeyLock::new()));
            entry.users.fetch_add(1, Ordering::AcqRel);
            Arc::clone(entry.value())
        };
        let ticket = UserTicket {
            key: key.clone(),
            locks: Arc::clone(&self.locks),
        };
        (lock, ticket)
    }
}

impl<K> Default for LockTable<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(ReentryMode::default())
    }
}

impl<K> Debug for LockTable<K>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockTable")
            .field("mode", &self.mode)
            .field("keys", &self.locks.len())
            .finish()
    }
}

/// Releases a user slot, removing the key's lock when it was the last one.
struct UserTicket<K>
where
    K: Eq + Hash,
{
    key: K,
    locks: Arc<LockMap<K>>,
}

impl<K> Drop for UserTicket<K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        // remove_if runs under the shard's write lock, the same lock `enter`
        // takes to increment, so a concurrent enter cannot be lost.
        self.locks.remove_if(&self.key, |_, lock| {
            lock.users.fetch_sub(1, Ordering::AcqRel) == 1
        });
    }
}

/// Held lock on one key. Released on drop.
pub struct LockGuard<K>
where
    K: Eq + Hash,
{
    guard: Option<OwnedMutexGuard<()>>,
    lock: Arc<KeyLock>,
    _ticket: UserTicket<K>,
}

impl<K> Drop for LockGuard<K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        self.lock.holder.store(0, Ordering::Release);
        // Release the mutex before the ticket gives up the user slot.
        self.guard.take();
    }
}
