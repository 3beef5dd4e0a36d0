//! Computed Graph
//!
//! This module implements the memoized dependency graph: every read of a
//! compute method is an entry, and every entry knows which entries it read
//! and which entries read it.
//!
//! # Overview
//!
//! - A [`ComputeMethod`] is an async function memoized per argument tuple
//! - A [`ComputeContext`] is handed to every computation; reads through it
//!   become dependency edges
//! - Invalidating an entry marks it and, transitively, its dependents stale.
//!   Nothing recomputes until it is read again
//!
//! # Design Decisions
//!
//! 1. Entries live in an arena and refer to each other by [`EntryId`], so
//!    edges never own the entries they point to.
//!
//! 2. Dependent edges are added the moment a read happens; dependency sets
//!    are replaced only when a computation succeeds.
//!
//! 3. Capture is an explicit context value rather than ambient state, so it
//!    survives any number of `.await` points and task hops.

mod arena;
mod computed;
mod computed_graph;
mod context;
mod entry;
mod invalidation;
mod key;

pub use computed::{ComputeMethod, Computed};
pub use computed_graph::ComputedGraph;
pub use context::ComputeContext;
pub use entry::{AnyValue, ComputedState, EntryId, EntrySnapshot, Output, Version};
pub use invalidation::InvalidationTicket;
pub use key::{ComputeKey, DynEq, FunctionId, KeyArgs};
