//! Computed Entries
//!
//! An entry is one slot of the computed graph: the last output of its
//! compute function, a version, a state, and the edges recorded by the
//! most recent computation.
//!
//! # States
//!
//! ```text
//!             begin_computing            commit_value
//! Invalidated ───────────────> Computing ─────────────> Consistent
//!      ^                           │                        │
//!      │      commit_error         │                        │
//!      ├───────────────────────────┘        invalidate      │
//!      └────────────────────────────────────────────────────┘
//! ```
//!
//! Invalidating a `Computing` entry is remembered and applied when the
//! computation commits, so the value it produces is already stale.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio::sync::watch;

use super::key::ComputeKey;
use crate::error::ComputeError;

/// Type-erased computed value.
pub type AnyValue = Arc<dyn Any + Send + Sync>;

/// Stable address of an entry in the graph's arena.
///
/// The generation changes every time a slot is reused, so an id held by a
/// removed entry's former neighbours never resolves to its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId {
    index: u32,
    generation: u32,
}

impl EntryId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot in the arena.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Bumped every time the slot is reused.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Lifecycle of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComputedState {
    /// A computation is running.
    Computing,
    /// The output reflects the current state of every dependency.
    Consistent,
    /// The output is stale (or missing) and will be recomputed on next read.
    Invalidated,
}

/// Logical version of an entry's output.
///
/// Incremented by every successful computation; 0 means never computed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(u64);

impl Version {
    pub const ZERO: Version = Version(0);

    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Last result of an entry's compute function.
#[derive(Clone)]
pub enum Output {
    Value(AnyValue),
    Error(ComputeError),
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Output::Value(_) => f.write_str("Value(..)"),
            Output::Error(err) => f.debug_tuple("Error").field(err).finish(),
        }
    }
}

/// What watchers of an entry observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub version: Version,
    pub state: ComputedState,
}

pub(crate) type EdgeSet<const N: usize> = SmallVec<[EntryId; N]>;

struct EntryInner {
    state: ComputedState,
    version: Version,
    output: Option<Output>,
    /// Entries read by the last successful computation.
    dependencies: EdgeSet<4>,
    /// Entries whose computation read this one. Not owning.
    dependents: EdgeSet<2>,
    /// Invalidated while computing.
    invalidate_on_commit: bool,
}

/// Outcome of committing a computation.
pub(crate) struct Commit {
    /// Dependencies of the previous computation not read this time.
    pub stale: Vec<EntryId>,
    /// The entry was invalidated while computing and is already stale.
    pub invalidated: bool,
}

/// One node of the computed graph.
pub struct EntryNode {
    id: EntryId,
    key: ComputeKey,
    inner: Mutex<EntryInner>,
    events: watch::Sender<EntrySnapshot>,
}

impl EntryNode {
    pub(crate) fn new(id: EntryId, key: ComputeKey) -> Self {
        let snapshot = EntrySnapshot {
            version: Version::ZERO,
            state: ComputedState::Invalidated,
        };
        let (events, _) = watch::channel(snapshot);
        Self {
            id,
            key,
            inner: Mutex::new(EntryInner {
                state: snapshot.state,
                version: snapshot.version,
                output: None,
                dependencies: SmallVec::new(),
                dependents: SmallVec::new(),
                invalidate_on_commit: false,
            }),
            events,
        }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn key(&self) -> &ComputeKey {
        &self.key
    }

    pub fn state(&self) -> ComputedState {
        self.inner.lock().state
    }

    pub fn version(&self) -> Version {
        self.inner.lock().version
    }

    /// Stored output, `None` until the first computation finishes.
    pub fn output(&self) -> Option<Output> {
        self.inner.lock().output.clone()
    }

    /// Receiver notified on every state or version change.
    pub fn subscribe(&self) -> watch::Receiver<EntrySnapshot> {
        self.events.subscribe()
    }

    /// The output, if it is a value that is still consistent.
    pub(crate) fn consistent_value(&self) -> Option<AnyValue> {
        let inner = self.inner.lock();
        match (&inner.state, &inner.output) {
            (ComputedState::Consistent, Some(Output::Value(value))) => Some(Arc::clone(value)),
            _ => None,
        }
    }

    pub(crate) fn begin_computing(&self) {
        let mut inner = self.inner.lock();
        inner.state = ComputedState::Computing;
        inner.invalidate_on_commit = false;
        self.publish(&inner);
    }

    pub(crate) fn commit_value(&self, value: AnyValue, dependencies: EdgeSet<4>) -> Commit {
        let mut inner = self.inner.lock();
        let stale = inner
            .dependencies
            .iter()
            .filter(|id| !dependencies.contains(id))
            .copied()
            .collect();
        let invalidated = std::mem::take(&mut inner.invalidate_on_commit);

        inner.dependencies = dependencies;
        inner.output = Some(Output::Value(value));
        inner.version = inner.version.next();
        inner.state = if invalidated {
            ComputedState::Invalidated
        } else {
            ComputedState::Consistent
        };
        self.publish(&inner);

        Commit { stale, invalidated }
    }

    /// Record a failure. Dependencies stay those of the last success.
    pub(crate) fn commit_error(&self, error: ComputeError) -> (EdgeSet<4>, bool) {
        let mut inner = self.inner.lock();
        let invalidated = std::mem::take(&mut inner.invalidate_on_commit);
        inner.output = Some(Output::Error(error));
        inner.state = ComputedState::Invalidated;
        self.publish(&inner);
        (inner.dependencies.clone(), invalidated)
    }

    /// Mark the entry stale.
    ///
    /// Returns `false` if there was nothing to do, in which case the caller
    /// must not propagate further.
    pub(crate) fn invalidate(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            ComputedState::Consistent => {
                inner.state = ComputedState::Invalidated;
                self.publish(&inner);
                true
            }
            ComputedState::Computing => !std::mem::replace(&mut inner.invalidate_on_commit, true),
            ComputedState::Invalidated => false,
        }
    }

    pub(crate) fn add_dependent(&self, id: EntryId) {
        let mut inner = self.inner.lock();
        if !inner.dependents.contains(&id) {
            inner.dependents.push(id);
        }
    }

    pub(crate) fn remove_dependent(&self, id: EntryId) {
        self.inner.lock().dependents.retain(|dependent| *dependent != id);
    }

    pub(crate) fn dependents(&self) -> EdgeSet<2> {
        self.inner.lock().dependents.clone()
    }

    pub(crate) fn dependencies(&self) -> EdgeSet<4> {
        self.inner.lock().dependencies.clone()
    }

    fn publish(&self, inner: &EntryInner) {
        self.events.send_replace(EntrySnapshot {
            version: inner.version,
            state: inner.state,
        });
    }
}

impl fmt::Debug for EntryNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("EntryNode")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &inner.state)
            .field("version", &inner.version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::key::FunctionId;

    fn node(index: u32) -> EntryNode {
        EntryNode::new(
            EntryId::new(index, 0),
            ComputeKey::new(FunctionId::new("f"), index),
        )
    }

    fn value(v: i32) -> AnyValue {
        Arc::new(v)
    }

    #[test]
    fn new_entry_is_invalidated_at_version_zero() {
        let entry = node(0);
        assert_eq!(entry.state(), ComputedState::Invalidated);
        assert_eq!(entry.version(), Version::ZERO);
        assert!(entry.output().is_none());
        assert!(entry.consistent_value().is_none());
    }

    #[test]
    fn commit_bumps_version_and_replaces_dependencies() {
        let entry = node(0);
        let a = EntryId::new(1, 0);
        let b = EntryId::new(2, 0);

        entry.begin_computing();
        let commit = entry.commit_value(value(1), SmallVec::from_slice(&[a, b]));
        assert!(commit.stale.is_empty());
        assert!(!commit.invalidated);
        assert_eq!(entry.state(), ComputedState::Consistent);
        assert_eq!(entry.version(), Version::new(1));

        entry.invalidate();
        entry.begin_computing();
        let commit = entry.commit_value(value(2), SmallVec::from_slice(&[b]));
        assert_eq!(commit.stale, vec![a]);
        assert_eq!(entry.dependencies().as_slice(), &[b]);
        assert_eq!(entry.version(), Version::new(2));
    }

    #[test]
    fn invalidate_is_idempotent() {
        let entry = node(0);
        entry.begin_computing();
        entry.commit_value(value(1), SmallVec::new());

        assert!(entry.invalidate());
        assert!(!entry.invalidate());
        assert_eq!(entry.state(), ComputedState::Invalidated);
        // The last value is kept.
        assert!(matches!(entry.output(), Some(Output::Value(_))));
    }

    #[test]
    fn invalidation_while_computing_applies_on_commit() {
        let entry = node(0);
        entry.begin_computing();
        assert!(entry.invalidate());
        assert!(!entry.invalidate());
        assert_eq!(entry.state(), ComputedState::Computing);

        let commit = entry.commit_value(value(1), SmallVec::new());
        assert!(commit.invalidated);
        assert_eq!(entry.state(), ComputedState::Invalidated);
        assert_eq!(entry.version(), Version::new(1));
    }

    #[test]
    fn errors_keep_version_and_dependencies() {
        let entry = node(0);
        let dep = EntryId::new(3, 1);
        entry.begin_computing();
        entry.commit_value(value(1), SmallVec::from_slice(&[dep]));

        entry.invalidate();
        entry.begin_computing();
        let (deps, invalidated) = entry.commit_error(ComputeError::msg("nope"));
        assert_eq!(deps.as_slice(), &[dep]);
        assert!(!invalidated);
        assert_eq!(entry.state(), ComputedState::Invalidated);
        assert_eq!(entry.version(), Version::new(1));
        assert!(matches!(entry.output(), Some(Output::Error(_))));
    }

    #[test]
    fn dependents_are_a_set() {
        let entry = node(0);
        let d = EntryId::new(9, 0);
        entry.add_dependent(d);
        entry.add_dependent(d);
        assert_eq!(entry.dependents().len(), 1);
        entry.remove_dependent(d);
        assert!(entry.dependents().is_empty());
    }

    #[test]
    fn watchers_see_transitions() {
        let entry = node(0);
        let rx = entry.subscribe();
        entry.begin_computing();
        assert_eq!(rx.borrow().state, ComputedState::Computing);
        entry.commit_value(value(5), SmallVec::new());
        assert_eq!(
            *rx.borrow(),
            EntrySnapshot {
                version: Version::new(1),
                state: ComputedState::Consistent
            }
        );
    }
}
