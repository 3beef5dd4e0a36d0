//! Computed Graph
//!
//! Memoizes compute methods per argument tuple and keeps, for every entry,
//! the entries it read and the entries that read it.
//!
//! # Reading
//!
//! Reading a key through a [`ComputeContext`]:
//!
//! 1. Fails with [`ComputeError::Reentry`] if the key is already being
//!    computed up the context's chain
//! 2. Finds or creates the key's entry
//! 3. Records the entry as a dependency of the reading computation
//! 4. Returns the entry's value if it is consistent; otherwise computes it
//!    once through the single-flight engine, however many readers arrive
//!    meanwhile
//!
//! A successful computation replaces the entry's dependencies with the ones
//! it captured and drops the back-edges of dependencies it no longer reads.
//! A failure is handed to every waiting reader and leaves the entry
//! invalidated, so the next read computes again.
//!
//! # Locking
//!
//! The key index is a `DashMap`; the arena sits behind one `RwLock` that is
//! only held for slot lookups and allocation. The index may be locked before
//! the arena, never the other way around, and no entry lock is ever held
//! while taking the arena lock.

use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::arena::EntryArena;
use super::computed::{ComputeMethod, Computed};
use super::context::ComputeContext;
use super::entry::{AnyValue, ComputedState, EntryId, EntryNode, Version};
use super::invalidation::{self, InvalidationTicket};
use super::key::{ComputeKey, KeyArgs};
use crate::caching::SingleFlight;
use crate::error::ComputeError;
use crate::locking::{LockTable, ReentryMode};
use crate::settings::Settings;

struct GraphInner {
    arena: RwLock<EntryArena>,
    index: DashMap<ComputeKey, EntryId>,
    flights: SingleFlight<ComputeKey, AnyValue>,
}

/// The memoized dependency graph. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ComputedGraph {
    inner: Arc<GraphInner>,
}

impl ComputedGraph {
    pub fn new() -> Self {
        Self::with_lock_table(LockTable::default())
    }

    /// Graph whose per-key locks handle reentry as `mode` says.
    pub fn with_reentry_mode(mode: ReentryMode) -> Self {
        Self::with_lock_table(LockTable::new(mode))
    }

    /// Graph configured from `settings` (`lock_reentry`).
    pub fn from_settings(settings: &Settings) -> Self {
        Self::with_reentry_mode(settings.lock_reentry)
    }

    /// Build a graph around an existing lock table.
    ///
    /// The table's reentry mode applies to every computation.
    pub fn with_lock_table(locks: LockTable<ComputeKey>) -> Self {
        Self {
            inner: Arc::new(GraphInner {
                arena: RwLock::new(EntryArena::new()),
                index: DashMap::new(),
                flights: SingleFlight::new(locks),
            }),
        }
    }

    /// How the graph's per-key locks treat a chain re-locking its own key.
    pub fn reentry_mode(&self) -> ReentryMode {
        self.inner.flights.locks().mode()
    }

    /// Context for reads that are not part of any computation.
    pub fn root_context(&self) -> ComputeContext {
        ComputeContext::root(self.clone(), CancellationToken::new())
    }

    /// Read `method(args)`, computing it if needed.
    pub async fn get<A, T>(&self, method: &ComputeMethod<A, T>, args: A) -> Result<T, ComputeError>
    where
        A: KeyArgs + Clone + 'static,
        T: Clone + Send + Sync + 'static,
    {
        self.root_context().get(method, args).await
    }

    /// Like [`get`](Self::get), but stops waiting once `cancel` fires.
    ///
    /// A computation already running for the key is not cancelled.
    pub async fn get_cancellable<A, T>(
        &self,
        method: &ComputeMethod<A, T>,
        args: A,
        cancel: &CancellationToken,
    ) -> Result<T, ComputeError>
    where
        A: KeyArgs + Clone + 'static,
        T: Clone + Send + Sync + 'static,
    {
        ComputeContext::root(self.clone(), cancel.clone())
            .get(method, args)
            .await
    }

    /// Read `method(args)` and return a strong handle on its entry.
    pub async fn capture<A, T>(&self, method: &ComputeMethod<A, T>, args: A) -> Result<Computed<T>, ComputeError>
    where
        A: KeyArgs + Clone + 'static,
        T: Clone + Send + Sync + 'static,
    {
        let (node, _) = self.read(&self.root_context(), method, args.clone()).await?;
        Ok(Computed::new(self.clone(), node, method.clone(), args))
    }

    /// Invalidate `method(args)` and, in the background, everything that
    /// depends on it. Does nothing if the entry does not exist.
    pub fn invalidate<A, T>(&self, method: &ComputeMethod<A, T>, args: &A) -> InvalidationTicket
    where
        A: KeyArgs + Clone + 'static,
        T: Clone + Send + Sync + 'static,
    {
        self.invalidate_key(&method.key(args))
    }

    /// Invalidate the entry for `key`, if there is one, and its dependents.
    pub fn invalidate_key(&self, key: &ComputeKey) -> InvalidationTicket {
        match self.node(key) {
            Some(node) => self.invalidate_node(&node),
            None => InvalidationTicket::none(),
        }
    }

    pub(crate) fn invalidate_node(&self, node: &Arc<EntryNode>) -> InvalidationTicket {
        invalidation::invalidate(self, node)
    }

    /// State of the entry for `key`, `None` if the graph has no entry.
    pub fn state(&self, key: &ComputeKey) -> Option<ComputedState> {
        self.node(key).map(|node| node.state())
    }

    /// Version of the entry for `key`, `None` if the graph has no entry.
    pub fn version(&self, key: &ComputeKey) -> Option<Version> {
        self.node(key).map(|node| node.version())
    }

    /// Whether `key` has an entry, consistent or not.
    pub fn contains(&self, key: &ComputeKey) -> bool {
        self.node(key).is_some()
    }

    /// Drop the entry for `key`.
    ///
    /// The entry is invalidated on its way out, together with everything
    /// that depends on it, so handles still holding it see it go stale and
    /// the next read computes a fresh entry.
    pub fn remove(&self, key: &ComputeKey) -> bool {
        let Some((_, id)) = self.inner.index.remove(key) else {
            return false;
        };
        let removed = self.inner.arena.write().remove(id);
        match removed {
            Some(node) => {
                self.retire(&node);
                true
            }
            None => false,
        }
    }

    /// Remove invalidated entries that nothing outside the graph holds.
    ///
    /// Returns the number of entries removed.
    pub fn prune(&self) -> usize {
        let removed: Vec<Arc<EntryNode>> = {
            let mut arena = self.inner.arena.write();
            let ids: Vec<EntryId> = arena
                .iter()
                .filter(|node| Arc::strong_count(*node) == 1 && node.state() == ComputedState::Invalidated)
                .map(|node| node.id())
                .collect();
            ids.into_iter().filter_map(|id| arena.remove(id)).collect()
        };
        for node in &removed {
            self.inner.index.remove_if(node.key(), |_, id| *id == node.id());
            self.detach(node);
        }
        if !removed.is_empty() {
            debug!(count = removed.len(), "pruned entries");
        }
        removed.len()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.arena.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry, invalidating each on its way out.
    pub fn clear(&self) {
        self.inner.index.clear();
        let removed = self.inner.arena.write().clear();
        for node in &removed {
            node.invalidate();
        }
        debug!(count = removed.len(), "cleared graph");
    }

    pub(crate) fn node(&self, key: &ComputeKey) -> Option<Arc<EntryNode>> {
        let id = *self.inner.index.get(key)?;
        self.node_by_id(id)
    }

    pub(crate) fn node_by_id(&self, id: EntryId) -> Option<Arc<EntryNode>> {
        self.inner.arena.read().get(id).cloned()
    }

    /// Read through `ctx`, returning the entry that was read and its value.
    pub(crate) async fn read<A, T>(
        &self,
        ctx: &ComputeContext,
        method: &ComputeMethod<A, T>,
        args: A,
    ) -> Result<(Arc<EntryNode>, T), ComputeError>
    where
        A: KeyArgs + Clone + 'static,
        T: Clone + Send + Sync + 'static,
    {
        let key = method.key(&args);
        ctx.check_reentry(&key)?;

        let node = self.entry(&key);
        ctx.record(&node);

        let lookup_node = Arc::clone(&node);
        let lookup = move || future::ready(lookup_node.consistent_value());

        let graph = self.clone();
        let compute_node = Arc::clone(&node);
        let child = ctx.child(Arc::clone(&node));
        let method = method.clone();
        let compute = move || {
            compute_node.begin_computing();
            async move {
                let result = method.call(child.clone(), args).await;
                graph.commit(&compute_node, &child, result.map(|value| Arc::new(value) as AnyValue))
            }
        };

        let value = self
            .inner
            .flights
            .run(key.clone(), ctx.owner(), ctx.cancellation(), lookup, compute)
            .await?;

        let typed = value
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| ComputeError::TypeMismatch {
                key: key.to_string(),
                expected: type_name::<T>(),
            })?;
        Ok((node, typed))
    }

    /// Find the entry for `key`, creating it if needed.
    fn entry(&self, key: &ComputeKey) -> Arc<EntryNode> {
        if let Some(node) = self.node(key) {
            return node;
        }
        match self.inner.index.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if let Some(node) = self.node_by_id(*occupied.get()) {
                    return node;
                }
                // Pruned between the two lookups.
                let node = self.allocate(key);
                occupied.insert(node.id());
                node
            }
            Entry::Vacant(vacant) => {
                let node = self.allocate(key);
                vacant.insert(node.id());
                node
            }
        }
    }

    fn allocate(&self, key: &ComputeKey) -> Arc<EntryNode> {
        let node = self
            .inner
            .arena
            .write()
            .insert(|id| EntryNode::new(id, key.clone()));
        trace!(key = ?key, id = %node.id(), "created entry");
        node
    }

    fn commit(
        &self,
        node: &Arc<EntryNode>,
        ctx: &ComputeContext,
        result: Result<AnyValue, ComputeError>,
    ) -> Result<AnyValue, ComputeError> {
        let captured = ctx.frame().map(|frame| frame.take_captured()).unwrap_or_default();
        match result {
            Ok(value) => {
                let commit = node.commit_value(Arc::clone(&value), captured);
                for stale in commit.stale {
                    if let Some(dependency) = self.node_by_id(stale) {
                        dependency.remove_dependent(node.id());
                    }
                }
                debug!(key = ?node.key(), version = %node.version(), "computed");
                if commit.invalidated {
                    let _ = invalidation::propagate_from(self, node);
                }
                Ok(value)
            }
            Err(err) => {
                let (dependencies, invalidated) = node.commit_error(err.clone());
                for id in captured.into_iter().filter(|id| !dependencies.contains(id)) {
                    if let Some(dependency) = self.node_by_id(id) {
                        dependency.remove_dependent(node.id());
                    }
                }
                debug!(key = ?node.key(), error = %err, "computation failed");
                if invalidated {
                    let _ = invalidation::propagate_from(self, node);
                }
                Err(err)
            }
        }
    }

    /// Invalidate a node just taken out of the arena and unlink it.
    fn retire(&self, node: &Arc<EntryNode>) {
        let _ = invalidation::invalidate(self, node);
        self.detach(node);
    }

    /// Drop `node`'s back-edges from the entries it read.
    fn detach(&self, node: &EntryNode) {
        for id in node.dependencies() {
            if let Some(dependency) = self.node_by_id(id) {
                dependency.remove_dependent(node.id());
            }
        }
    }
}

impl Default for ComputedGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ComputedGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputedGraph")
            .field("entries", &self.len())
            .field("computing", &self.inner.flights.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counted(name: &'static str, calls: Arc<AtomicUsize>) -> ComputeMethod<u32, u32> {
        ComputeMethod::new(name, move |_ctx, n: u32| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(n + 1) }
        })
    }

    #[tokio::test]
    async fn get_memoizes_until_invalidated() {
        let graph = ComputedGraph::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let inc = counted("inc", Arc::clone(&calls));

        assert_eq!(graph.get(&inc, 1).await.unwrap(), 2);
        assert_eq!(graph.get(&inc, 1).await.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let key = inc.key(&1);
        assert_eq!(graph.state(&key), Some(ComputedState::Consistent));
        assert_eq!(graph.version(&key), Some(Version::new(1)));

        assert_eq!(graph.invalidate(&inc, &1).completed().await, 1);
        assert_eq!(graph.state(&key), Some(ComputedState::Invalidated));
        assert_eq!(graph.get(&inc, 1).await.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(graph.version(&key), Some(Version::new(2)));
    }

    #[tokio::test]
    async fn invalidating_unknown_key_is_a_no_op() {
        let graph = ComputedGraph::new();
        let inc = counted("inc", Arc::new(AtomicUsize::new(0)));
        assert_eq!(graph.invalidate(&inc, &9).completed().await, 0);
        assert!(graph.is_empty());
    }

    #[tokio::test]
    async fn dependencies_follow_latest_computation() {
        let graph = ComputedGraph::new();
        let use_left = Arc::new(std::sync::atomic::AtomicBool::new(true));

        let left = ComputeMethod::new("left", |_ctx, _: ()| async { Ok(1u32) });
        let right = ComputeMethod::new("right", |_ctx, _: ()| async { Ok(2u32) });
        let pick = {
            let (left, right, use_left) = (left.clone(), right.clone(), Arc::clone(&use_left));
            ComputeMethod::new("pick", move |ctx: ComputeContext, _: ()| {
                let (left, right) = (left.clone(), right.clone());
                let which = use_left.load(Ordering::SeqCst);
                async move {
                    if which {
                        ctx.get(&left, ()).await
                    } else {
                        ctx.get(&right, ()).await
                    }
                }
            })
        };

        assert_eq!(graph.get(&pick, ()).await.unwrap(), 1);
        use_left.store(false, Ordering::SeqCst);
        graph.invalidate(&pick, &()).completed().await;
        assert_eq!(graph.get(&pick, ()).await.unwrap(), 2);

        // `left` is no longer a dependency.
        graph.invalidate(&left, &()).completed().await;
        assert_eq!(graph.state(&pick.key(&())), Some(ComputedState::Consistent));

        graph.invalidate(&right, &()).completed().await;
        assert_eq!(graph.state(&pick.key(&())), Some(ComputedState::Invalidated));
    }

    #[tokio::test]
    async fn remove_and_prune() {
        let graph = ComputedGraph::new();
        let inc = counted("inc", Arc::new(AtomicUsize::new(0)));

        graph.get(&inc, 1).await.unwrap();
        graph.get(&inc, 2).await.unwrap();
        let held = graph.capture(&inc, 3).await.unwrap();
        assert_eq!(graph.len(), 3);

        assert!(graph.remove(&inc.key(&1)));
        assert!(!graph.remove(&inc.key(&1)));
        assert_eq!(graph.len(), 2);

        graph.invalidate(&inc, &2).completed().await;
        held.invalidate().completed().await;
        assert_eq!(graph.prune(), 1);
        assert!(!graph.contains(&inc.key(&2)));
        assert!(graph.contains(held.key()));

        graph.clear();
        assert!(graph.is_empty());
    }

    #[tokio::test]
    async fn removed_entries_are_invalidated_for_their_holders() {
        let graph = ComputedGraph::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let inc = counted("inc", Arc::clone(&calls));
        let double = {
            let inc = inc.clone();
            ComputeMethod::new("double", move |ctx: ComputeContext, n: u32| {
                let inc = inc.clone();
                async move { Ok(ctx.get(&inc, n).await? * 2) }
            })
        };

        let held = graph.capture(&inc, 1).await.unwrap();
        let dependent = graph.capture(&double, 1).await.unwrap();
        assert!(graph.remove(held.key()));

        assert_eq!(held.state(), ComputedState::Invalidated);
        tokio::time::timeout(std::time::Duration::from_secs(1), dependent.when_invalidated())
            .await
            .unwrap();

        // The handle moves onto the entry created by the next read.
        assert_eq!(held.update().await.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(held.is_consistent());
        assert_eq!(held.version(), Version::new(1));
        held.invalidate().completed().await;
        assert_eq!(graph.state(held.key()), Some(ComputedState::Invalidated));

        assert_eq!(dependent.update().await.unwrap(), 4);
        assert!(dependent.is_consistent());
        graph.clear();
        assert_eq!(dependent.state(), ComputedState::Invalidated);
    }

    #[test]
    fn reentry_mode_comes_from_settings() {
        let settings = Settings::from_json(r#"{"lock_reentry": "unchecked"}"#).unwrap();
        assert_eq!(ComputedGraph::from_settings(&settings).reentry_mode(), ReentryMode::Unchecked);
        assert_eq!(
            ComputedGraph::from_settings(&Settings::default()).reentry_mode(),
            ReentryMode::CheckedFail
        );
    }

    #[tokio::test]
    async fn same_name_different_type_is_a_mismatch() {
        let graph = ComputedGraph::new();
        let as_u32 = ComputeMethod::new("shared", |_ctx, _: ()| async { Ok(1u32) });
        let as_string = ComputeMethod::new("shared", |_ctx, _: ()| async { Ok(String::new()) });

        graph.get(&as_u32, ()).await.unwrap();
        let err = graph.get(&as_string, ()).await.unwrap_err();
        assert!(matches!(err, ComputeError::TypeMismatch { .. }));
    }
}
