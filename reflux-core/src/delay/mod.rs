//! Update delays.
//!
//! - [`RetryDelaySeq`]: backoff per retry count
//! - [`UpdateDelayer`] / [`FixedDelayer`]: debounce plus backoff wait
//! - [`DelayerRegistry`]: delayers shared by configuration

mod delayer;
mod registry;
mod retry;

pub use delayer::{FixedDelayer, UpdateDelayer};
pub use registry::DelayerRegistry;
pub use retry::RetryDelaySeq;
