//! Read-through caching.
//!
//! - [`AsyncCache`]: the store a cache reads from and writes to
//! - [`SingleFlight`]: per-key deduplication of concurrent computations
//! - [`ComputingCache`]: store + single-flight + computer function

mod computing;
mod flight;
mod store;

pub use computing::ComputingCache;
pub use flight::SingleFlight;
pub use store::{AsyncCache, MemoryCache};
