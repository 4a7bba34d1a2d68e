//! Failure handling tests: churn on communication errors, validation on
//! borrow, end-of-life retirement, and the opener's failure backoff.


use std::sync::Arc;
use std::time::Duration;

use sqlpool::{DbError, Error, Pool, PoolConfig};
use test_helpers::{init_test_logging, wait_until, MockDriver};

#[tokio::test]
async fn test_communication_error_churns_connection() {
    init_test_logging();
    let driver = MockDriver::new()
        .fail_execute("SELECT broken", DbError::new("socket gone").with_state("08003"));
    let config = PoolConfig::builder("db://test")
        .maximum_connections(2)
        .connection_timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    let pool = Pool::new(Arc::new(driver.clone()), config).unwrap();

    let conn = pool.get().await.unwrap();
    let first_id = conn.id();

    let stmt = conn.prepare("SELECT broken").await.unwrap();
    assert!(stmt.execute_query().await.is_err());
    stmt.close().await.unwrap();

    // The captured communication-class failure poisons the connection:
    // release retires it instead of requeueing.
    conn.close().await.unwrap();
    assert_eq!(pool.status().churned.get(), 1);
    assert_eq!(pool.status().available, 0);

    // The next borrow is served a fresh connection.
    let replacement = pool.get().await.unwrap();
    assert_ne!(replacement.id(), first_id);
    replacement.close().await.unwrap();

    assert!(wait_until(50, || driver.connection_close_count() == 1).await);
    assert_eq!(driver.open_count(), 2);
}

#[tokio::test]
async fn test_io_class_failure_surfaces_as_connection_failure() {
    let driver = MockDriver::new()
        .fail_execute("SELECT dead", DbError::connection_failure("socket reset"));
    let pool = Pool::new(
        Arc::new(driver.clone()),
        PoolConfig::builder("db://test").maximum_connections(2).build().unwrap(),
    )
    .unwrap();

    let conn = pool.get().await.unwrap();
    let stmt = conn.prepare("SELECT dead").await.unwrap();

    // A captured I/O-class failure surfaces under the connection-failure
    // kind, not as a plain driver error.
    let err = stmt.execute_query().await.unwrap_err();
    assert!(matches!(err, Error::ConnectionFailure(_)), "got {err:?}");
    stmt.close().await.unwrap();

    // And it still poisons the connection on release.
    conn.close().await.unwrap();
    assert_eq!(pool.status().churned.get(), 1);
    assert_eq!(pool.status().available, 0);
}

#[tokio::test]
async fn test_application_error_keeps_connection() {
    let driver = MockDriver::new()
        .fail_execute("SELECT bad", DbError::new("syntax error").with_state("42601"));
    let pool = Pool::new(
        Arc::new(driver.clone()),
        PoolConfig::builder("db://test").maximum_connections(1).build().unwrap(),
    )
    .unwrap();

    let conn = pool.get().await.unwrap();
    let id = conn.id();
    let stmt = conn.prepare("SELECT bad").await.unwrap();
    assert!(stmt.execute_query().await.is_err());
    stmt.close().await.unwrap();
    conn.close().await.unwrap();

    // Application-class failures do not poison the connection.
    assert_eq!(pool.status().churned.get(), 0);
    assert_eq!(pool.status().available, 1);

    let again = pool.get().await.unwrap();
    assert_eq!(again.id(), id);
    again.close().await.unwrap();
}

#[tokio::test]
async fn test_validate_on_borrow_retires_stale_connection() {
    let driver = MockDriver::new();
    let config = PoolConfig::builder("db://test")
        .maximum_connections(2)
        .validate_on_borrow(true)
        .connection_timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    let pool = Pool::new(Arc::new(driver.clone()), config).unwrap();

    let conn = pool.get().await.unwrap();
    let first_id = conn.id();
    conn.close().await.unwrap();

    // The idle connection goes stale; a fresh one validates fine.
    driver.invalidate_open_connections();

    let replacement = pool.get().await.unwrap();
    assert_ne!(replacement.id(), first_id);
    assert_eq!(pool.status().churned.get(), 1);
    replacement.close().await.unwrap();
}

#[tokio::test]
async fn test_end_of_life_retires_without_churn() {
    let driver = MockDriver::new();
    let config = PoolConfig::builder("db://test")
        .maximum_connections(2)
        .maximum_lifetime(Duration::from_millis(50))
        .connection_timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    let pool = Pool::new(Arc::new(driver.clone()), config).unwrap();

    let conn = pool.get().await.unwrap();
    let first_id = conn.id();
    conn.close().await.unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;

    let replacement = pool.get().await.unwrap();
    assert_ne!(replacement.id(), first_id);
    // End-of-life retirement is normal lifetime, not churn.
    assert_eq!(pool.status().churned.get(), 0);
    replacement.close().await.unwrap();

    assert!(wait_until(50, || driver.connection_close_count() == 1).await);
}

#[tokio::test(start_paused = true)]
async fn test_opener_backoff_grows_and_resets() {
    let driver = MockDriver::new().refuse_opens();
    let config = PoolConfig::builder("db://test")
        .minimum_connections(2)
        .maximum_connections(4)
        .backoff_period(Duration::from_secs(1))
        .backoff_multiplier(2.0)
        .backoff_limit(Duration::from_secs(8))
        .build()
        .unwrap();
    let pool = Pool::new(Arc::new(driver.clone()), config).unwrap();

    // Attempts land at roughly t=0, 1, 3, 7, 15, 23: gaps 1, 2, 4, 8, 8.
    tokio::time::sleep(Duration::from_secs(24)).await;

    let attempts = driver.open_attempts();
    assert!(attempts.len() >= 6, "expected at least 6 attempts, got {}", attempts.len());

    let expected_gaps = [1.0f64, 2.0, 4.0, 8.0, 8.0];
    for (i, expected) in expected_gaps.iter().enumerate() {
        let gap = (attempts[i + 1] - attempts[i]).as_secs_f64();
        assert!(
            (gap - expected).abs() < 0.5,
            "gap {i} was {gap:.2}s, expected ~{expected}s"
        );
    }

    // Recovery: the next attempt succeeds and the opener immediately fills
    // the floor with no residual backoff.
    driver.set_refusing(false);
    assert!(wait_until(600, || driver.open_count() == 2).await);
    assert_eq!(pool.status().total.get(), 2);

    let attempts = driver.open_attempts();
    let last = attempts.len() - 1;
    // The two successful opens are back-to-back.
    assert!((attempts[last] - attempts[last - 1]).as_secs_f64() < 0.5);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_respects_limit_under_default_multiplier() {
    let driver = MockDriver::new().refuse_opens();
    let config = PoolConfig::builder("db://test")
        .minimum_connections(1)
        .maximum_connections(2)
        .backoff_period(Duration::from_secs(2))
        .build()
        .unwrap();
    let pool = Pool::new(Arc::new(driver.clone()), config).unwrap();

    // With the default multiplier of 1, attempts are evenly spaced at the
    // base period.
    tokio::time::sleep(Duration::from_secs(9)).await;

    let attempts = driver.open_attempts();
    assert!(attempts.len() >= 4);
    for window in attempts.windows(2).take(3) {
        let gap = (window[1] - window[0]).as_secs_f64();
        assert!((gap - 2.0).abs() < 0.5, "gap was {gap:.2}s, expected ~2s");
    }

    drop(pool);
}
