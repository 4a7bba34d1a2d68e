//! Inactivity pruning tests: high-water-mark floor within a window, then
//! convergence toward the configured minimum in later quiet windows.


use std::sync::Arc;
use std::time::Duration;

use sqlpool::{Pool, PoolConfig};
use test_helpers::MockDriver;

#[tokio::test(start_paused = true)]
async fn test_pruning_respects_window_high_water_mark() {
    let driver = MockDriver::new();
    let config = PoolConfig::builder("db://test")
        .minimum_connections(1)
        .maximum_connections(10)
        .inactivity_timeout(Duration::from_secs(10))
        .prune_interval(Duration::from_secs(1))
        .connection_timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    let pool = Pool::new(Arc::new(driver.clone()), config).unwrap();

    // Ramp to six concurrent borrows.
    let (release_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let (ready_tx, mut ready_rx) = tokio::sync::mpsc::channel::<u64>(8);

    let mut holders = Vec::new();
    for _ in 0..6 {
        let pool = pool.clone();
        let ready = ready_tx.clone();
        let mut release = release_tx.subscribe();
        holders.push(tokio::spawn(async move {
            let conn = pool.get().await.unwrap();
            ready.send(conn.id()).await.unwrap();
            release.recv().await.unwrap();
            conn.close().await.unwrap();
        }));
    }

    for _ in 0..6 {
        ready_rx.recv().await.unwrap();
    }
    assert_eq!(pool.status().active.get(), 6);
    assert_eq!(pool.status().total.get(), 6);

    // Release everything and go quiet.
    release_tx.send(()).unwrap();
    for holder in holders {
        holder.await.unwrap();
    }
    assert_eq!(pool.status().available, 6);

    // First quiet window: the floor is max(min, window peak) = 6, so nothing
    // is pruned.
    tokio::time::sleep(Duration::from_secs(12)).await;
    assert_eq!(pool.status().total.get(), 6);

    // The window peak was reset after that pass; a further quiet window
    // converges the population to the configured minimum.
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(pool.status().total.get(), 1);
    assert_eq!(pool.status().available, 1);
}

#[tokio::test(start_paused = true)]
async fn test_pruning_disabled_by_zero_inactivity_timeout() {
    let driver = MockDriver::new();
    let config = PoolConfig::builder("db://test")
        .minimum_connections(0)
        .maximum_connections(4)
        .inactivity_timeout(Duration::ZERO)
        .prune_interval(Duration::from_secs(1))
        .build()
        .unwrap();
    let pool = Pool::new(Arc::new(driver.clone()), config).unwrap();

    // Build up two idle connections from two tasks.
    let (ready_tx, mut ready_rx) = tokio::sync::mpsc::channel::<()>(2);
    let (release_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let mut holders = Vec::new();
    for _ in 0..2 {
        let pool = pool.clone();
        let ready = ready_tx.clone();
        let mut release = release_tx.subscribe();
        holders.push(tokio::spawn(async move {
            let conn = pool.get().await.unwrap();
            ready.send(()).await.unwrap();
            release.recv().await.unwrap();
            conn.close().await.unwrap();
        }));
    }
    ready_rx.recv().await.unwrap();
    ready_rx.recv().await.unwrap();
    release_tx.send(()).unwrap();
    for holder in holders {
        holder.await.unwrap();
    }

    // With pruning disabled the idle population persists indefinitely.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(pool.status().total.get(), 2);
    assert_eq!(pool.status().available, 2);
}

#[tokio::test(start_paused = true)]
async fn test_pruning_never_drops_below_minimum() {
    let driver = MockDriver::new();
    let config = PoolConfig::builder("db://test")
        .minimum_connections(2)
        .maximum_connections(8)
        .inactivity_timeout(Duration::from_secs(5))
        .prune_interval(Duration::from_secs(1))
        .build()
        .unwrap();
    let pool = Pool::new(Arc::new(driver.clone()), config).unwrap();

    // Let the opener satisfy the floor, then ramp to four with borrows.
    let (ready_tx, mut ready_rx) = tokio::sync::mpsc::channel::<()>(4);
    let (release_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let mut holders = Vec::new();
    for _ in 0..4 {
        let pool = pool.clone();
        let ready = ready_tx.clone();
        let mut release = release_tx.subscribe();
        holders.push(tokio::spawn(async move {
            let conn = pool.get().await.unwrap();
            ready.send(()).await.unwrap();
            release.recv().await.unwrap();
            conn.close().await.unwrap();
        }));
    }
    for _ in 0..4 {
        ready_rx.recv().await.unwrap();
    }
    release_tx.send(()).unwrap();
    for holder in holders {
        holder.await.unwrap();
    }
    assert_eq!(pool.status().total.get(), 4);

    // Across many quiet windows the population settles at the minimum and
    // stays there.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(pool.status().total.get(), 2);
    assert_eq!(pool.status().available, 2);
}
