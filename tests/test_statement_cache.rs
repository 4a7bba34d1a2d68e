//! Statement cache integration tests: reuse, LRU eviction, poolability and
//! the disabled-cache path.


use std::sync::Arc;
use std::time::Duration;

use sqlpool::{Pool, PoolConfig};
use test_helpers::{wait_until, MockDriver};

fn cached_pool(driver: &MockDriver, cache_size: usize) -> Pool {
    let config = PoolConfig::builder("db://test")
        .maximum_connections(1)
        .connection_timeout(Duration::from_secs(5))
        .statement_cache_size(cache_size)
        .build()
        .unwrap();
    Pool::new(Arc::new(driver.clone()), config).unwrap()
}

#[tokio::test]
async fn test_prepare_close_prepare_is_a_cache_hit() {
    let driver = MockDriver::new();
    let pool = cached_pool(&driver, 2);

    let conn = pool.get().await.unwrap();

    let stmt = conn.prepare("A").await.unwrap();
    stmt.close().await.unwrap();
    assert_eq!(driver.prepare_count(), 1);

    // Second prepare of the same text reuses the cached statement.
    let stmt = conn.prepare("A").await.unwrap();
    stmt.close().await.unwrap();
    assert_eq!(driver.prepare_count(), 1);
    assert_eq!(driver.statement_close_count("A"), 0);

    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_lru_eviction_closes_evicted_statement_once() {
    let driver = MockDriver::new();
    let pool = cached_pool(&driver, 2);

    let conn = pool.get().await.unwrap();

    // Fill the cache with A then B.
    conn.prepare("A").await.unwrap().close().await.unwrap();
    conn.prepare("B").await.unwrap().close().await.unwrap();
    assert_eq!(driver.prepare_count(), 2);

    // Hit on A promotes it; B becomes least-recently-used.
    conn.prepare("A").await.unwrap().close().await.unwrap();
    assert_eq!(driver.prepare_count(), 2);

    // C evicts B; B's driver statement is closed exactly once.
    conn.prepare("C").await.unwrap().close().await.unwrap();
    assert_eq!(driver.prepare_count(), 3);
    assert_eq!(driver.statement_close_count("B"), 1);
    assert_eq!(driver.statement_close_count("A"), 0);
    assert_eq!(driver.statement_close_count("C"), 0);

    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_cache_cleared_when_connection_retires() {
    let driver = MockDriver::new();
    let pool = cached_pool(&driver, 4);

    let conn = pool.get().await.unwrap();
    conn.prepare("A").await.unwrap().close().await.unwrap();
    conn.prepare("B").await.unwrap().close().await.unwrap();
    conn.close().await.unwrap();

    pool.shutdown().await;

    // Closing the pooled connection destroys every cached statement.
    assert!(wait_until(50, || driver.statement_close_count("A") == 1).await);
    assert_eq!(driver.statement_close_count("B"), 1);
}

#[tokio::test]
async fn test_non_poolable_statement_is_destroyed_on_close() {
    let driver = MockDriver::new().not_poolable("N");
    let pool = cached_pool(&driver, 2);

    let conn = pool.get().await.unwrap();

    let stmt = conn.prepare("N").await.unwrap();
    stmt.close().await.unwrap();
    assert_eq!(driver.statement_close_count("N"), 1);

    // Not cached, so the next prepare hits the driver again.
    let stmt = conn.prepare("N").await.unwrap();
    stmt.close().await.unwrap();
    assert_eq!(driver.prepare_count(), 2);

    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_zero_capacity_disables_caching() {
    let driver = MockDriver::new();
    let pool = cached_pool(&driver, 0);

    let conn = pool.get().await.unwrap();

    conn.prepare("A").await.unwrap().close().await.unwrap();
    conn.prepare("A").await.unwrap().close().await.unwrap();

    assert_eq!(driver.prepare_count(), 2);
    assert_eq!(driver.statement_close_count("A"), 2);

    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_direct_statements_bypass_cache() {
    let driver = MockDriver::new().on_update("UPDATE t SET x = 1", 1);
    let pool = cached_pool(&driver, 2);

    let conn = pool.get().await.unwrap();

    let stmt = conn.statement("UPDATE t SET x = 1").await.unwrap();
    assert_eq!(stmt.execute_update().await.unwrap(), 1);
    stmt.close().await.unwrap();
    assert_eq!(driver.statement_close_count("UPDATE t SET x = 1"), 1);

    let stmt = conn.statement("UPDATE t SET x = 1").await.unwrap();
    stmt.close().await.unwrap();
    assert_eq!(driver.prepare_count(), 2);

    // The transaction left pending by the direct update is rolled back on
    // close.
    assert!(conn.close().await.is_err());
    assert_eq!(driver.rollback_count(), 1);
}

#[tokio::test]
async fn test_cached_statement_survives_release_cycle() {
    let driver = MockDriver::new();
    let pool = cached_pool(&driver, 2);

    let conn = pool.get().await.unwrap();
    conn.prepare("A").await.unwrap().close().await.unwrap();
    conn.close().await.unwrap();

    // The statement cache rides along with the pooled connection.
    let conn = pool.get().await.unwrap();
    conn.prepare("A").await.unwrap().close().await.unwrap();
    assert_eq!(driver.prepare_count(), 1);
    conn.close().await.unwrap();
}
