//! Compute Context
//!
//! The context tracks which computation is currently running. Every
//! compute function receives one, and reading another entry through it
//! records the dependency edge between the two.
//!
//! # Implementation
//!
//! A context is an explicit value, not ambient state: it holds the frame
//! of the computation it belongs to and, through the frame's parents, the
//! whole chain of computations that led to it. That chain is how a
//! computation that requests its own key (directly or through others) is
//! detected and reported instead of waiting on itself.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio_util::sync::CancellationToken;

use super::computed::ComputeMethod;
use super::computed_graph::ComputedGraph;
use super::entry::{EdgeSet, EntryNode};
use super::invalidation::InvalidationTicket;
use super::key::{ComputeKey, KeyArgs};
use crate::error::ComputeError;
use crate::locking::LockOwner;

/// One running computation.
pub(crate) struct Frame {
    entry: Arc<EntryNode>,
    parent: Option<Arc<Frame>>,
    /// Entries read so far, in read order.
    captured: Mutex<EdgeSet<4>>,
}

impl Frame {
    pub fn entry(&self) -> &Arc<EntryNode> {
        &self.entry
    }

    /// Drain the dependencies captured so far.
    pub fn take_captured(&self) -> EdgeSet<4> {
        std::mem::take(&mut *self.captured.lock())
    }
}

/// Handle a compute function uses to read other entries.
#[derive(Clone)]
pub struct ComputeContext {
    graph: ComputedGraph,
    frame: Option<Arc<Frame>>,
    capture: bool,
    owner: LockOwner,
    cancel: CancellationToken,
}

impl ComputeContext {
    pub(crate) fn root(graph: ComputedGraph, cancel: CancellationToken) -> Self {
        Self {
            graph,
            frame: None,
            capture: true,
            owner: LockOwner::next(),
            cancel,
        }
    }

    /// Context for the computation of `entry`, called from this one.
    ///
    /// The child gets its own cancellation token: a computation is shared
    /// by every reader of its key and is never cancelled by one of them.
    pub(crate) fn child(&self, entry: Arc<EntryNode>) -> Self {
        Self {
            graph: self.graph.clone(),
            frame: Some(Arc::new(Frame {
                entry,
                parent: self.frame.clone(),
                captured: Mutex::new(SmallVec::new()),
            })),
            capture: true,
            owner: self.owner,
            cancel: CancellationToken::new(),
        }
    }

    /// Read another entry, recording it as a dependency of the current one.
    pub async fn get<A, T>(&self, method: &ComputeMethod<A, T>, args: A) -> Result<T, ComputeError>
    where
        A: KeyArgs + Clone + 'static,
        T: Clone + Send + Sync + 'static,
    {
        self.graph.read(self, method, args).await.map(|(_, value)| value)
    }

    /// A context that reads without recording dependencies.
    ///
    /// Entries read through it never invalidate the current computation.
    pub fn suspend_capture(&self) -> Self {
        Self {
            capture: false,
            ..self.clone()
        }
    }

    /// Whether reads through this context are recorded as dependencies.
    pub fn is_capturing(&self) -> bool {
        self.capture && self.frame.is_some()
    }

    /// Key of the computation this context belongs to, `None` at the root.
    pub fn current(&self) -> Option<&ComputeKey> {
        self.frame.as_ref().map(|frame| frame.entry().key())
    }

    /// The graph this context reads from.
    pub fn graph(&self) -> &ComputedGraph {
        &self.graph
    }

    /// The caller's token for a root context. Contexts of computations get
    /// a fresh token that nothing cancels.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Invalidate an entry of the graph this context reads from.
    pub fn invalidate<A, T>(&self, method: &ComputeMethod<A, T>, args: &A) -> InvalidationTicket
    where
        A: KeyArgs + Clone + 'static,
        T: Clone + Send + Sync + 'static,
    {
        self.graph.invalidate(method, args)
    }

    pub(crate) fn owner(&self) -> LockOwner {
        self.owner
    }

    pub(crate) fn frame(&self) -> Option<&Arc<Frame>> {
        self.frame.as_ref()
    }

    /// Fail if `key` is already being computed somewhere up this chain.
    pub(crate) fn check_reentry(&self, key: &ComputeKey) -> Result<(), ComputeError> {
        let mut chain = Vec::new();
        let mut frame = self.frame.as_ref();
        while let Some(current) = frame {
            let current_key = current.entry().key();
            chain.push(current_key);
            if current_key == key {
                let path = chain
                    .iter()
                    .rev()
                    .map(|key| key.to_string())
                    .chain(std::iter::once(key.to_string()))
                    .collect::<Vec<_>>()
                    .join(" -> ");
                return Err(ComputeError::Reentry { path });
            }
            frame = current.parent.as_ref();
        }
        Ok(())
    }

    /// Record that the current computation read `dependency`.
    ///
    /// The back-edge is added right away, so an invalidation of the
    /// dependency that races with this computation still reaches it.
    pub(crate) fn record(&self, dependency: &EntryNode) {
        if !self.capture {
            return;
        }
        let Some(frame) = &self.frame else {
            return;
        };
        {
            let mut captured = frame.captured.lock();
            if captured.contains(&dependency.id()) {
                return;
            }
            captured.push(dependency.id());
        }
        dependency.add_dependent(frame.entry().id());
    }
}

impl fmt::Debug for ComputeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeContext")
            .field("current", &self.current())
            .field("capture", &self.capture)
            .field("owner", &self.owner)
            .finish()
    }
}
