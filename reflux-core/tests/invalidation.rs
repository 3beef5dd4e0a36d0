//! Integration tests for dependency capture and invalidation.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use reflux_core::graph::{ComputeMethod, ComputedGraph, ComputedState, Version};
use reflux_core::ComputeError;

/// `outer(n)` reads `inner(n)` and adds one.
fn derived(name: &'static str, inner: &ComputeMethod<u32, u32>) -> (ComputeMethod<u32, u32>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let method = {
        let (inner, calls) = (inner.clone(), Arc::clone(&calls));
        ComputeMethod::new(name, move |ctx, n: u32| {
            let inner = inner.clone();
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(ctx.get(&inner, n).await? + 1) }
        })
    };
    (method, calls)
}

/// C depends on B depends on A. Invalidating A makes the next reads of B
/// and C recompute although neither was invalidated directly.
#[tokio::test]
async fn invalidation_is_transitive() {
    common::init_tracing();
    let graph = ComputedGraph::new();
    let (a, a_calls) = common::counted("a");
    let (b, b_calls) = derived("b", &a);
    let (c, c_calls) = derived("c", &b);

    assert_eq!(graph.get(&c, 4).await.unwrap(), 42);
    assert_eq!(graph.get(&b, 4).await.unwrap(), 41);
    let counts = || {
        (
            a_calls.load(Ordering::SeqCst),
            b_calls.load(Ordering::SeqCst),
            c_calls.load(Ordering::SeqCst),
        )
    };
    assert_eq!(counts(), (1, 1, 1));

    let invalidated = graph.invalidate(&a, &4).completed().await;
    assert_eq!(invalidated, 3);
    assert_eq!(graph.state(&b.key(&4)), Some(ComputedState::Invalidated));
    assert_eq!(graph.state(&c.key(&4)), Some(ComputedState::Invalidated));

    assert_eq!(graph.get(&b, 4).await.unwrap(), 41);
    assert_eq!(graph.get(&c, 4).await.unwrap(), 42);
    assert_eq!(counts(), (2, 2, 2));
}

/// D reads B and C, which both read A. Invalidating A reaches D through
/// both paths but invalidates it once.
#[tokio::test]
async fn diamond_dependents_are_invalidated_once() {
    common::init_tracing();
    let graph = ComputedGraph::new();
    let (a, a_calls) = common::counted("a");
    let (b, b_calls) = derived("b", &a);
    let (c, c_calls) = derived("c", &a);
    let d_calls = Arc::new(AtomicUsize::new(0));
    let d = {
        let (b, c, calls) = (b.clone(), c.clone(), Arc::clone(&d_calls));
        ComputeMethod::new("d", move |ctx, n: u32| {
            let (b, c) = (b.clone(), c.clone());
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(ctx.get(&b, n).await? + ctx.get(&c, n).await?) }
        })
    };

    assert_eq!(graph.get(&d, 2).await.unwrap(), 42);
    let counts = || {
        [&a_calls, &b_calls, &c_calls, &d_calls].map(|calls| calls.load(Ordering::SeqCst))
    };
    assert_eq!(counts(), [1, 1, 1, 1]);

    assert_eq!(graph.invalidate(&a, &2).completed().await, 4);
    for key in [b.key(&2), c.key(&2), d.key(&2)] {
        assert_eq!(graph.state(&key), Some(ComputedState::Invalidated));
    }

    assert_eq!(graph.get(&d, 2).await.unwrap(), 42);
    assert_eq!(counts(), [2, 2, 2, 2]);
}

#[tokio::test]
async fn unrelated_entries_stay_consistent() {
    common::init_tracing();
    let graph = ComputedGraph::new();
    let (a, _) = common::counted("a");
    let (b, b_calls) = derived("b", &a);

    graph.get(&b, 1).await.unwrap();
    graph.get(&b, 2).await.unwrap();
    graph.invalidate(&a, &1).completed().await;

    assert_eq!(graph.state(&b.key(&2)), Some(ComputedState::Consistent));
    graph.get(&b, 2).await.unwrap();
    assert_eq!(b_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn reads_with_capture_suspended_are_not_dependencies() {
    common::init_tracing();
    let graph = ComputedGraph::new();
    let (a, _) = common::counted("a");
    let peek = {
        let a = a.clone();
        ComputeMethod::new("peek", move |ctx, n: u32| {
            let a = a.clone();
            async move {
                let untracked = ctx.suspend_capture();
                assert!(!untracked.is_capturing());
                Ok(untracked.get(&a, n).await? * 2)
            }
        })
    };

    assert_eq!(graph.get(&peek, 3).await.unwrap(), 60);
    graph.invalidate(&a, &3).completed().await;
    assert_eq!(graph.state(&peek.key(&3)), Some(ComputedState::Consistent));
}

static OUROBOROS: OnceLock<ComputeMethod<u32, u32>> = OnceLock::new();

fn ouroboros() -> &'static ComputeMethod<u32, u32> {
    OUROBOROS.get_or_init(|| {
        ComputeMethod::new("ouroboros", |ctx, n: u32| async move {
            if n == 0 {
                // Reads ouroboros(2), which is already being computed below us.
                return ctx.get(ouroboros(), 2).await;
            }
            ctx.get(ouroboros(), n - 1).await
        })
    })
}

#[tokio::test]
async fn cyclic_reads_fail_with_reentry() {
    common::init_tracing();
    let graph = ComputedGraph::new();

    let err = graph.get(ouroboros(), 2).await.unwrap_err();
    match err {
        ComputeError::Reentry { path } => {
            let hops: Vec<&str> = path.split(" -> ").collect();
            let key = ouroboros().key(&2).to_string();
            assert_eq!(hops.len(), 4);
            assert_eq!(hops.first(), Some(&key.as_str()));
            assert_eq!(hops.last(), Some(&key.as_str()));
        }
        other => panic!("expected reentry, got {other:?}"),
    }
    // Failures are not cached: the entry is stale, not stuck computing.
    assert_eq!(graph.state(&ouroboros().key(&2)), Some(ComputedState::Invalidated));
}

#[tokio::test]
async fn versions_advance_only_on_recompute() {
    common::init_tracing();
    let graph = ComputedGraph::new();
    let (a, _) = common::counted("a");

    let computed = graph.capture(&a, 1).await.unwrap();
    let first = computed.version();
    assert!(first > Version::ZERO);
    assert_eq!(computed.value(), Some(10));

    computed.invalidate().completed().await;
    computed.when_invalidated().await;
    assert_eq!(computed.version(), first);

    assert_eq!(computed.update().await.unwrap(), 10);
    assert!(computed.version() > first);
    assert!(computed.is_consistent());
}

#[tokio::test]
async fn prune_keeps_captured_and_consistent_entries() {
    common::init_tracing();
    let graph = ComputedGraph::new();
    let (a, _) = common::counted("a");
    let (b, _) = derived("b", &a);

    graph.get(&b, 1).await.unwrap();
    let held = graph.capture(&a, 2).await.unwrap();
    graph.invalidate(&a, &1).completed().await;
    held.invalidate().completed().await;
    assert_eq!(graph.len(), 3);

    // a(1) and b(1) are stale and unreferenced; a(2) is held.
    assert_eq!(graph.prune(), 2);
    assert!(graph.contains(&a.key(&2)));
    assert!(!graph.contains(&b.key(&1)));

    // Pruned entries are recreated on demand.
    assert_eq!(graph.get(&b, 1).await.unwrap(), 11);
}
