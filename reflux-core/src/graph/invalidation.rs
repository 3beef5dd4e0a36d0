//! Invalidation Propagation
//!
//! Invalidating an entry marks it stale on the caller's path and hands the
//! walk over its dependents to a background task, so a writer never waits
//! on the size of the graph below what it changed.
//!
//! # Algorithm
//!
//! Breadth-first over dependent edges:
//!
//! 1. Start with the direct dependents of the invalidated entry
//! 2. Pop an id; skip it if already visited
//! 3. Resolve it in the arena. A tombstoned id is dropped from the parent's
//!    dependents on the spot
//! 4. Invalidate it. Only an entry that actually changed state enqueues its
//!    own dependents; an already-invalidated one ends the branch
//!
//! Every entry is visited at most once, however many paths lead to it.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::computed_graph::ComputedGraph;
use super::entry::{EntryId, EntryNode};

/// Handle on an invalidation in progress.
///
/// The entry itself is already invalidated when the ticket is returned;
/// the ticket tracks the walk over its dependents. Dropping the ticket
/// detaches from the walk without stopping it.
#[derive(Debug)]
#[must_use = "dropping the ticket detaches from the propagation; await `completed()` to wait for it"]
pub struct InvalidationTicket {
    immediate: usize,
    propagation: Option<JoinHandle<usize>>,
}

impl InvalidationTicket {
    /// Ticket for an invalidation that changed nothing.
    pub fn none() -> Self {
        Self {
            immediate: 0,
            propagation: None,
        }
    }

    pub(crate) fn done(invalidated: usize) -> Self {
        Self {
            immediate: invalidated,
            propagation: None,
        }
    }

    /// Whether propagation is still running.
    pub fn is_pending(&self) -> bool {
        self.propagation
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Wait for propagation to finish.
    ///
    /// Returns the number of entries this invalidation changed.
    pub async fn completed(self) -> usize {
        let propagated = match self.propagation {
            Some(handle) => handle.await.unwrap_or(0),
            None => 0,
        };
        self.immediate + propagated
    }

    /// Wait for every ticket, returning the total number of entries changed.
    pub async fn all(tickets: impl IntoIterator<Item = InvalidationTicket>) -> usize {
        let mut total = 0;
        for ticket in tickets {
            total += ticket.completed().await;
        }
        total
    }
}

/// Invalidate `node` and schedule the walk over its dependents.
pub(crate) fn invalidate(graph: &ComputedGraph, node: &Arc<EntryNode>) -> InvalidationTicket {
    if !node.invalidate() {
        trace!(key = ?node.key(), "already invalidated");
        return InvalidationTicket::none();
    }
    debug!(key = ?node.key(), "invalidated");
    let ticket = propagate_from(graph, node);
    InvalidationTicket {
        immediate: ticket.immediate + 1,
        propagation: ticket.propagation,
    }
}

/// Schedule the walk over `node`'s dependents without touching `node`.
pub(crate) fn propagate_from(graph: &ComputedGraph, node: &Arc<EntryNode>) -> InvalidationTicket {
    if node.dependents().is_empty() {
        return InvalidationTicket::none();
    }
    match Handle::try_current() {
        Ok(runtime) => {
            let graph = graph.clone();
            let node = Arc::clone(node);
            InvalidationTicket {
                immediate: 0,
                propagation: Some(runtime.spawn(async move { propagate(&graph, &node) })),
            }
        }
        Err(_) => InvalidationTicket::done(propagate(graph, node)),
    }
}

/// Walk `source`'s dependents, invalidating each reachable entry once.
///
/// Returns the number of entries invalidated.
pub(crate) fn propagate(graph: &ComputedGraph, source: &Arc<EntryNode>) -> usize {
    let mut visited: HashSet<EntryId> = HashSet::new();
    let mut queue: VecDeque<(EntryId, Arc<EntryNode>)> = source
        .dependents()
        .into_iter()
        .map(|id| (id, Arc::clone(source)))
        .collect();
    let mut count = 0;

    while let Some((id, parent)) = queue.pop_front() {
        if !visited.insert(id) {
            continue;
        }
        let Some(node) = graph.node_by_id(id) else {
            // Tombstoned since the edge was recorded.
            parent.remove_dependent(id);
            continue;
        };
        if node.invalidate() {
            count += 1;
            trace!(key = ?node.key(), "invalidated dependent");
            for dependent in node.dependents() {
                queue.push_back((dependent, Arc::clone(&node)));
            }
        }
    }

    debug!(source = ?source.key(), count, "invalidation propagated");
    count
}
