//! Async cache stores.

use std::fmt;
use std::hash::Hash;

use async_trait::async_trait;
use dashmap::DashMap;

/// Key-value store consulted by the computing cache.
///
/// Implementations may be remote, hence async.
#[async_trait]
pub trait AsyncCache<K, V>: Send + Sync {
    async fn try_get(&self, key: &K) -> Option<V>;

    async fn set(&self, key: K, value: V);

    /// Returns whether a value was removed.
    async fn remove(&self, key: &K) -> bool;

    async fn clear(&self);
}

/// In-memory store.
pub struct MemoryCache<K, V>
where
    K: Eq + Hash,
{
    entries: DashMap<K, V>,
}

impl<K, V> MemoryCache<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> Default for MemoryCache<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for MemoryCache<K, V>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCache")
            .field("len", &self.entries.len())
            .finish()
    }
}

#[async_trait]
impl<K, V> AsyncCache<K, V> for MemoryCache<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn try_get(&self, key: &K) -> Option<V> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    async fn set(&self, key: K, value: V) {
        self.entries.insert(key, value);
    }

    async fn remove(&self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    async fn clear(&self) {
        self.entries.clear();
    }
}
