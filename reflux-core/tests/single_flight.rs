//! Integration tests for single-flight computation and cancellation.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use reflux_core::caching::{ComputingCache, MemoryCache};
use reflux_core::graph::{ComputeMethod, ComputedGraph};
use reflux_core::ComputeError;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// A method that blocks until `gate` opens, counting invocations.
fn gated(gate: watch::Receiver<bool>, calls: Arc<AtomicUsize>) -> ComputeMethod<String, usize> {
    ComputeMethod::new("gated", move |_ctx, key: String| {
        let mut gate = gate.clone();
        let calls = Arc::clone(&calls);
        async move {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = gate.wait_for(|open| *open).await;
            Ok(key.len() * 100 + call)
        }
    })
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// N concurrent reads of one key issued before it completes invoke the
/// compute function once and all observe the same value.
#[tokio::test]
async fn concurrent_graph_reads_compute_once() {
    common::init_tracing();
    let graph = ComputedGraph::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let (open, gate) = watch::channel(false);
    let method = gated(gate, Arc::clone(&calls));

    let readers: Vec<_> = (0..16)
        .map(|_| {
            let (graph, method) = (graph.clone(), method.clone());
            tokio::spawn(async move { graph.get(&method, "k".to_string()).await })
        })
        .collect();

    settle().await;
    open.send(true).unwrap();

    let results: Vec<usize> = join_all(readers)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(results.iter().all(|value| *value == 101));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cache_misses_compute_once() {
    common::init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = {
        let calls = Arc::clone(&calls);
        Arc::new(ComputingCache::new(
            Arc::new(MemoryCache::<u32, u32>::new()),
            move |key: u32| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(key + 1)
                }
            },
        ))
    };

    let readers = (0..32).map(|_| {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.get(41).await })
    });
    for joined in join_all(readers).await {
        assert_eq!(joined.unwrap().unwrap(), 42);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.try_get(41).await.unwrap(), Some(42));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// One of two waiters cancels; the other still gets the value and the
/// computation is not restarted.
#[tokio::test]
async fn cancelling_one_waiter_leaves_the_other() {
    common::init_tracing();
    let graph = ComputedGraph::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let (open, gate) = watch::channel(false);
    let method = gated(gate, Arc::clone(&calls));
    let cancel = CancellationToken::new();

    let patient = {
        let (graph, method) = (graph.clone(), method.clone());
        tokio::spawn(async move { graph.get(&method, "key".to_string()).await })
    };
    let impatient = {
        let (graph, method, cancel) = (graph.clone(), method.clone(), cancel.clone());
        tokio::spawn(async move { graph.get_cancellable(&method, "key".to_string(), &cancel).await })
    };

    settle().await;
    cancel.cancel();
    let cancelled = impatient.await.unwrap();
    assert!(matches!(cancelled, Err(ComputeError::Cancelled)));

    open.send(true).unwrap();
    assert_eq!(patient.await.unwrap().unwrap(), 301);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // The cancelled caller's retry hits the stored value.
    assert_eq!(graph.get(&method, "key".to_string()).await.unwrap(), 301);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failures_reach_every_waiter_and_are_not_cached() {
    common::init_tracing();
    let graph = ComputedGraph::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let (open, gate) = watch::channel(false);
    let method = {
        let calls = Arc::clone(&calls);
        ComputeMethod::new("flaky", move |_ctx, _: ()| {
            let mut gate = gate.clone();
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                let _ = gate.wait_for(|open| *open).await;
                if call == 0 {
                    Err(ComputeError::msg("backend unavailable"))
                } else {
                    Ok("ok".to_string())
                }
            }
        })
    };

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let (graph, method) = (graph.clone(), method.clone());
            tokio::spawn(async move { graph.get(&method, ()).await })
        })
        .collect();
    settle().await;
    open.send(true).unwrap();

    for joined in join_all(waiters).await {
        let err = joined.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "backend unavailable");
    }
    assert_eq!(graph.get(&method, ()).await.unwrap(), "ok");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
