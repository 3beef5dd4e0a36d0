//! Shared helpers for integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use reflux_core::graph::ComputeMethod;

/// Route `tracing` output to the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A method returning `args * 10` that counts its invocations.
#[allow(dead_code)]
pub fn counted(name: &'static str) -> (ComputeMethod<u32, u32>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let method = {
        let calls = Arc::clone(&calls);
        ComputeMethod::new(name, move |_ctx, n: u32| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(n * 10) }
        })
    };
    (method, calls)
}
