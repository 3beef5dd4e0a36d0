//! Compute Methods and Computed Handles
//!
//! A [`ComputeMethod`] is a named async function whose results the graph
//! memoizes per argument tuple. A [`Computed`] is a strong handle on one
//! memoized entry, held by code outside the graph (a publication, a test)
//! that wants to watch the entry rather than just read it once.

use std::any::type_name;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::trace;

use super::computed_graph::ComputedGraph;
use super::context::ComputeContext;
use super::entry::{ComputedState, EntryNode, EntrySnapshot, Output, Version};
use super::invalidation::InvalidationTicket;
use super::key::{ComputeKey, FunctionId, KeyArgs};
use crate::error::ComputeError;

type Body<A, T> = dyn Fn(ComputeContext, A) -> BoxFuture<'static, Result<T, ComputeError>> + Send + Sync;

/// A memoized async function.
///
/// # Example
///
/// ```ignore
/// let user_name = ComputeMethod::new("user_name", |_ctx, id: u64| async move {
///     Ok(format!("user-{id}"))
/// });
/// let name = graph.get(&user_name, 7).await?;
/// ```
pub struct ComputeMethod<A, T> {
    function: FunctionId,
    body: Arc<Body<A, T>>,
}

impl<A, T> ComputeMethod<A, T>
where
    A: KeyArgs + Clone + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Create a method from its name and body.
    ///
    /// The name identifies the method in compute keys, so two methods with
    /// the same name share cache entries.
    pub fn new<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: Fn(ComputeContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ComputeError>> + Send + 'static,
    {
        Self {
            function: FunctionId::new(name),
            body: Arc::new(move |ctx: ComputeContext, args: A| body(ctx, args).boxed()),
        }
    }

    /// The function half of every key this method produces.
    pub fn id(&self) -> FunctionId {
        self.function
    }

    /// Cache key for one invocation.
    pub fn key(&self, args: &A) -> ComputeKey {
        ComputeKey::new(self.function, args.clone())
    }

    pub(crate) fn call(&self, ctx: ComputeContext, args: A) -> BoxFuture<'static, Result<T, ComputeError>> {
        (self.body)(ctx, args)
    }
}

impl<A, T> Clone for ComputeMethod<A, T> {
    fn clone(&self) -> Self {
        Self {
            function: self.function,
            body: Arc::clone(&self.body),
        }
    }
}

impl<A, T> fmt::Debug for ComputeMethod<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeMethod")
            .field("function", &self.function)
            .field("output", &type_name::<T>())
            .finish()
    }
}

type Update<T> = dyn Fn(ComputeContext) -> BoxFuture<'static, Result<(Arc<EntryNode>, T), ComputeError>> + Send + Sync;

/// Strong handle on one entry of a [`ComputedGraph`].
///
/// Holding a `Computed` keeps the entry from being pruned. If the entry is
/// removed from the graph anyway, the handle sees it invalidated and
/// [`update`](Self::update) moves it onto the key's new entry. Clones share
/// the binding.
pub struct Computed<T> {
    graph: ComputedGraph,
    key: ComputeKey,
    node: Arc<RwLock<Arc<EntryNode>>>,
    update: Arc<Update<T>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new<A>(graph: ComputedGraph, node: Arc<EntryNode>, method: ComputeMethod<A, T>, args: A) -> Self
    where
        A: KeyArgs + Clone + 'static,
    {
        let update = move |ctx: ComputeContext| {
            let method = method.clone();
            let args = args.clone();
            async move {
                let graph = ctx.graph().clone();
                graph.read(&ctx, &method, args).await
            }
            .boxed()
        };
        Self {
            graph,
            key: node.key().clone(),
            node: Arc::new(RwLock::new(node)),
            update: Arc::new(update),
            _marker: PhantomData,
        }
    }

    pub fn key(&self) -> &ComputeKey {
        &self.key
    }

    /// Last computed value. `None` if never computed or the last
    /// computation failed.
    pub fn value(&self) -> Option<T> {
        match self.output()? {
            Ok(value) => Some(value),
            Err(_) => None,
        }
    }

    /// Last output of the computation, value or error.
    pub fn output(&self) -> Option<Result<T, ComputeError>> {
        match self.node().output()? {
            Output::Value(value) => Some(value.downcast_ref::<T>().cloned().ok_or_else(|| {
                ComputeError::TypeMismatch {
                    key: self.key.to_string(),
                    expected: type_name::<T>(),
                }
            })),
            Output::Error(err) => Some(Err(err)),
        }
    }

    /// Version of the entry the handle is bound to.
    pub fn version(&self) -> Version {
        self.node().version()
    }

    /// State of the entry this handle is currently bound to.
    pub fn state(&self) -> ComputedState {
        self.node().state()
    }

    pub fn is_consistent(&self) -> bool {
        self.state() == ComputedState::Consistent
    }

    /// Invalidate the bound entry and everything depending on it.
    pub fn invalidate(&self) -> InvalidationTicket {
        self.graph.invalidate_node(&self.node())
    }

    /// Resolves once the entry is invalidated.
    ///
    /// Returns immediately if it already is.
    pub async fn when_invalidated(&self) {
        let mut events = self.changes();
        // The sender lives in the node the receiver came from, so this cannot fail.
        let _ = events
            .wait_for(|snapshot| snapshot.state == ComputedState::Invalidated)
            .await;
    }

    /// Receiver for every state and version change of the bound entry.
    ///
    /// A receiver taken before [`update`](Self::update) re-binds the handle
    /// keeps watching the old entry.
    pub fn changes(&self) -> watch::Receiver<EntrySnapshot> {
        self.node().subscribe()
    }

    /// Return the current value, recomputing it first if it is stale.
    pub async fn update(&self) -> Result<T, ComputeError> {
        let (node, value) = (self.update)(self.graph.root_context()).await?;
        let mut bound = self.node.write();
        if !Arc::ptr_eq(&bound, &node) {
            trace!(key = %self.key, id = %node.id(), "re-bound to new entry");
            *bound = node;
        }
        Ok(value)
    }

    /// The graph the handle reads through.
    pub fn graph(&self) -> &ComputedGraph {
        &self.graph
    }

    fn node(&self) -> Arc<EntryNode> {
        Arc::clone(&self.node.read())
    }
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            graph: self.graph.clone(),
            key: self.key.clone(),
            node: Arc::clone(&self.node),
            update: Arc::clone(&self.update),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let node = self.node.read();
        f.debug_struct("Computed")
            .field("key", &self.key)
            .field("state", &node.state())
            .field("version", &node.version())
            .finish()
    }
}
