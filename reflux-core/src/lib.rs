//! Reflux Core
//!
//! This crate provides the core runtime for the Reflux reactive computation
//! cache. It implements:
//!
//! - Single-flight memoization of async computations
//! - A dependency graph with transitive invalidation
//! - Command dispatch with a separate invalidation pass
//! - Versioned publication of computed values to remote subscribers
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `locking`: per-key async locks with reentry detection
//! - `caching`: read-through caches and single-flight computation
//! - `graph`: memoized compute methods and dependency tracking
//! - `commands`: handler resolution and two-pass dispatch
//! - `bridge`: publications, subscribers and transports
//! - `delay`: debounce and retry backoff for publication updates
//! - `clock`, `feed`, `settings`: collaborators and configuration
//!
//! # Example
//!
//! ```rust,ignore
//! use reflux_core::graph::{ComputeMethod, ComputedGraph};
//!
//! let graph = ComputedGraph::new();
//!
//! let price = ComputeMethod::new("price", |_ctx, sku: String| async move {
//!     Ok(load_price(&sku).await?)
//! });
//! let total = ComputeMethod::new("total", {
//!     let price = price.clone();
//!     move |ctx, skus: Vec<String>| {
//!         let price = price.clone();
//!         async move {
//!             let mut total = 0;
//!             for sku in skus {
//!                 total += ctx.get(&price, sku).await?;
//!             }
//!             Ok(total)
//!         }
//!     }
//! });
//!
//! graph.get(&total, vec!["a".into(), "b".into()]).await?;
//!
//! // "total" read "price", so it is stale now too.
//! graph.invalidate(&price, &"a".to_string()).completed().await;
//! ```

pub mod bridge;
pub mod caching;
pub mod clock;
pub mod commands;
pub mod delay;
pub mod error;
pub mod feed;
pub mod graph;
pub mod locking;
pub mod settings;

pub use clock::{Clock, ManualClock, Moment, TokioClock};
pub use error::{CommandError, ComputeError, ConfigurationError, LockError, PublishError, SettingsError, TransportError};
pub use settings::Settings;
