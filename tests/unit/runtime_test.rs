//! Tests for tokio spawner utilities

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use prometheus_slot_scheduler::runtime::{Spawn, TokioSpawner};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tokio_spawner_spawn() {
    let spawner = TokioSpawner::new(tokio::runtime::Handle::current());

    let (tx, rx) = tokio::sync::oneshot::channel();
    spawner.spawn(async move {
        tx.send(123).unwrap();
    });

    let result = rx.await.expect("oneshot result");
    assert_eq!(result, 123);
}

#[tokio::test]
async fn test_cloned_spawners_share_the_runtime() {
    let spawner = TokioSpawner::try_current().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    for s in [spawner.clone(), spawner] {
        let counter = Arc::clone(&counter);
        let tx = tx.clone();
        s.spawn(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tx.send(()).unwrap();
        });
    }
    rx.recv().await.unwrap();
    rx.recv().await.unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn test_spawner_from_explicit_runtime() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let spawner = TokioSpawner::new(runtime.handle().clone());
    let (tx, rx) = tokio::sync::oneshot::channel();
    spawner.spawn(async move {
        tx.send("done").unwrap();
    });
    assert_eq!(runtime.block_on(rx).unwrap(), "done");
}
