//! Change Feeds
//!
//! A change feed carries "something tagged X changed" notifications between
//! the writers of a data source and the caches reading it, possibly across
//! processes. [`FeedInvalidator`] turns those notifications into graph
//! invalidations.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::commands::Command;
use crate::graph::{ComputeKey, ComputeMethod, ComputedGraph, KeyArgs};

pub type ChangeCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Tag-based change notification.
pub trait ChangeFeed: Send + Sync {
    /// Announce that data tagged `tag` changed.
    fn notify(&self, tag: &str);

    /// Call `callback` for every notification until the returned
    /// subscription is dropped.
    fn on_changed(&self, callback: ChangeCallback) -> FeedSubscription;
}

/// Keeps a feed callback registered. Unregisters on drop.
#[derive(Debug)]
pub struct FeedSubscription {
    cancel: CancellationToken,
}

impl FeedSubscription {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// In-process feed on a broadcast channel.
///
/// A listener that falls more than `capacity` notifications behind skips
/// the ones it missed and logs a warning.
#[derive(Clone)]
pub struct LocalChangeFeed {
    sender: broadcast::Sender<Arc<str>>,
}

impl LocalChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn listeners(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LocalChangeFeed {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl fmt::Debug for LocalChangeFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalChangeFeed")
            .field("listeners", &self.listeners())
            .finish()
    }
}

impl ChangeFeed for LocalChangeFeed {
    fn notify(&self, tag: &str) {
        trace!(tag, "change notified");
        // No listeners is not an error.
        let _ = self.sender.send(Arc::from(tag));
    }

    /// Requires a tokio runtime.
    fn on_changed(&self, callback: ChangeCallback) -> FeedSubscription {
        let mut receiver = self.sender.subscribe();
        let cancel = CancellationToken::new();
        let stopped = cancel.clone();
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    biased;
                    _ = stopped.cancelled() => break,
                    received = receiver.recv() => received,
                };
                match received {
                    Ok(tag) => callback(&*tag),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "change feed listener lagged; notifications dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        FeedSubscription::new(cancel)
    }
}

/// Invalidates graph entries bound to feed tags.
pub struct FeedInvalidator {
    graph: ComputedGraph,
    bindings: Arc<DashMap<String, Vec<ComputeKey>>>,
    subscription: Option<FeedSubscription>,
}

impl FeedInvalidator {
    /// Invalidator that is driven by calling [`invalidate_tag`](Self::invalidate_tag).
    pub fn new(graph: ComputedGraph) -> Self {
        Self {
            graph,
            bindings: Arc::new(DashMap::new()),
            subscription: None,
        }
    }

    /// Invalidator listening on `feed`. Requires a tokio runtime.
    pub fn attach(feed: &dyn ChangeFeed, graph: ComputedGraph) -> Self {
        let mut invalidator = Self::new(graph);
        let (graph, bindings) = (invalidator.graph.clone(), Arc::clone(&invalidator.bindings));
        invalidator.subscription = Some(feed.on_changed(Arc::new(move |tag: &str| {
            invalidate_bound(&graph, &bindings, tag);
        })));
        invalidator
    }

    /// Invalidate `key` whenever `tag` is notified.
    pub fn bind(&self, tag: impl Into<String>, key: ComputeKey) {
        let mut keys = self.bindings.entry(tag.into()).or_default();
        if !keys.contains(&key) {
            keys.push(key);
        }
    }

    pub fn bind_method<A, T>(&self, tag: impl Into<String>, method: &ComputeMethod<A, T>, args: &A)
    where
        A: KeyArgs + Clone + 'static,
        T: Clone + Send + Sync + 'static,
    {
        self.bind(tag, method.key(args));
    }

    /// Invalidate `key` whenever a command of type `C` completes on a
    /// commander notifying this feed.
    pub fn bind_command<C: Command>(&self, key: ComputeKey) {
        self.bind(std::any::type_name::<C>(), key);
    }

    /// Remove every binding of `tag`, returning how many there were.
    pub fn unbind(&self, tag: &str) -> usize {
        self.bindings.remove(tag).map(|(_, keys)| keys.len()).unwrap_or(0)
    }

    /// Invalidate the keys bound to `tag` now. Returns how many were bound.
    pub fn invalidate_tag(&self, tag: &str) -> usize {
        invalidate_bound(&self.graph, &self.bindings, tag)
    }

    pub fn is_attached(&self) -> bool {
        self.subscription.is_some()
    }
}

impl fmt::Debug for FeedInvalidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedInvalidator")
            .field("tags", &self.bindings.len())
            .field("attached", &self.is_attached())
            .finish()
    }
}

fn invalidate_bound(graph: &ComputedGraph, bindings: &DashMap<String, Vec<ComputeKey>>, tag: &str) -> usize {
    let keys = match bindings.get(tag) {
        Some(keys) => keys.clone(),
        None => return 0,
    };
    for key in &keys {
        // Propagation continues in the background.
        let _ = graph.invalidate_key(key);
    }
    debug!(tag, keys = keys.len(), "invalidated bound keys");
    keys.len()
}
