//! Integration tests for per-configuration pooling.
//!
//! Tests verify that:
//! - Concurrent callers never open more connections than the capacity
//! - A full pool fails with PoolExhausted once the acquire timeout elapses
//! - Connection establishment failures surface as connection errors
//! - Idle connections are swept and shutdown refuses new work

use sql_gateway::config::{ExecutorSettings, PoolSettings};
use sql_gateway::db::{ConnectionManager, SqlExecutor};
use sql_gateway::error::{DbError, ErrorKind};
use sql_gateway::models::{ConfigId, ConfigurationRequest, NormalizedResult, SqlStatement};
use sql_gateway::service::DatabaseService;
use sql_gateway::store::RecordStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn sqlite_request(dir: &TempDir, params: &[(&str, &str)]) -> ConfigurationRequest {
    ConfigurationRequest {
        name: "pooled".to_string(),
        driver: "sqlite".to_string(),
        database: dir.path().join("pool.db").to_str().unwrap().to_string(),
        params: params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_bound_under_concurrency() {
    let dir = tempfile::tempdir().unwrap();
    let service = DatabaseService::new(PoolSettings::default(), ExecutorSettings::default());
    let config = service
        .save(sqlite_request(&dir, &[("max_connections", "3")]))
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..12 {
        let service = service.clone();
        tasks.push(tokio::spawn(async move {
            service
                .execute(&SqlStatement::new(
                    config.id,
                    "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 200000) SELECT count(*) AS n FROM c",
                ))
                .await
        }));
    }
    for task in tasks {
        let result = task.await.unwrap().unwrap();
        assert_eq!(result.row_count(), 1);
    }

    let status = service.pool_status(config.id).await.unwrap();
    assert_eq!(status.capacity, 3);
    assert!(status.peak_open <= 3, "peak {} over capacity", status.peak_open);
    assert!(status.peak_open >= 1);
    assert_eq!(status.in_use, 0);
    assert_eq!(status.open, status.idle);
}

#[tokio::test]
async fn test_pool_exhausted_after_acquire_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let records = Arc::new(RecordStore::new());
    let manager = ConnectionManager::new(Arc::clone(&records), PoolSettings::default());
    let executor = SqlExecutor::new(
        Arc::clone(&manager),
        Arc::clone(&records),
        ExecutorSettings::default(),
    );
    let config = records
        .insert(sqlite_request(&dir, &[("acquire_timeout", "100ms")]))
        .unwrap();

    // SQLite capacity defaults to one connection
    let held = manager
        .acquire(config.id, Duration::from_secs(1))
        .await
        .unwrap();

    let start = Instant::now();
    let err = executor
        .execute(&SqlStatement::new(config.id, "SELECT 1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PoolExhausted);
    assert!(start.elapsed() >= Duration::from_millis(100));

    manager.release(held, true).await;
    let result = executor
        .execute(&SqlStatement::new(config.id, "SELECT 1"))
        .await
        .unwrap();
    assert!(matches!(result, NormalizedResult::Rows { .. }));
}

#[tokio::test]
async fn test_waiter_gets_released_connection() {
    let dir = tempfile::tempdir().unwrap();
    let records = Arc::new(RecordStore::new());
    let manager = ConnectionManager::new(Arc::clone(&records), PoolSettings::default());
    let config = records.insert(sqlite_request(&dir, &[])).unwrap();

    let held = manager
        .acquire(config.id, Duration::from_secs(1))
        .await
        .unwrap();

    let waiter = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.acquire(config.id, Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.release(held, true).await;

    let handle = waiter.await.unwrap().unwrap();
    let status = manager.pool_status(config.id).await.unwrap();
    assert_eq!(status.open, 1);
    assert_eq!(status.in_use, 1);
    manager.release(handle, true).await;
}

#[tokio::test]
async fn test_unreachable_database_is_connection_error() {
    let dir = tempfile::tempdir().unwrap();
    let settings = PoolSettings {
        connect_attempts: 2,
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(20),
        ..PoolSettings::default()
    };
    let service = DatabaseService::new(settings, ExecutorSettings::default());
    let config = service
        .save(ConfigurationRequest {
            name: "missing".to_string(),
            driver: "sqlite".to_string(),
            database: dir
                .path()
                .join("no/such/dir/missing.db")
                .to_str()
                .unwrap()
                .to_string(),
            ..Default::default()
        })
        .unwrap();

    let err = service
        .execute(&SqlStatement::new(config.id, "SELECT 1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionError);

    let status = service.pool_status(config.id).await.unwrap();
    assert_eq!(status.open, 0);
    assert_eq!(status.in_use, 0);

    // Capacity was given back, so the next attempt fails the same way
    let err = service.introspect(config.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionError);
}

#[tokio::test]
async fn test_read_only_without_create_fails_to_connect() {
    let dir = tempfile::tempdir().unwrap();
    let service = DatabaseService::new(PoolSettings::default(), ExecutorSettings::default());
    let config = service
        .save(sqlite_request(
            &dir,
            &[("create_if_missing", "false"), ("read_only", "true")],
        ))
        .unwrap();

    let err = service
        .execute(&SqlStatement::new(config.id, "SELECT 1"))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Connection { .. }), "{:?}", err);
}

#[tokio::test]
async fn test_idle_connections_are_swept() {
    let dir = tempfile::tempdir().unwrap();
    let settings = PoolSettings {
        sweep_interval: Duration::from_millis(30),
        ..PoolSettings::default()
    };
    let service = DatabaseService::new(settings, ExecutorSettings::default());
    let config = service
        .save(sqlite_request(&dir, &[("idle_timeout", "50ms")]))
        .unwrap();

    service
        .execute(&SqlStatement::new(config.id, "SELECT 1"))
        .await
        .unwrap();
    assert_eq!(service.pool_status(config.id).await.unwrap().idle, 1);

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = service.pool_status(config.id).await.unwrap();
        if status.open == 0 {
            break;
        }
        assert!(Instant::now() < deadline, "idle connection never swept");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // A swept pool still serves new work
    service
        .execute(&SqlStatement::new(config.id, "SELECT 1"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_pools() {
    let dir = tempfile::tempdir().unwrap();
    let service = DatabaseService::new(PoolSettings::default(), ExecutorSettings::default());
    let config = service.save(sqlite_request(&dir, &[])).unwrap();

    service
        .execute(&SqlStatement::new(config.id, "SELECT 1"))
        .await
        .unwrap();
    service.shutdown().await;

    assert!(service.pool_status(config.id).await.is_none());
    let err = service
        .execute(&SqlStatement::new(config.id, "SELECT 1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionError);

    // Records stay readable
    assert_eq!(service.get(config.id).unwrap().id, config.id);
    assert!(matches!(
        service.get(ConfigId(999)),
        Err(DbError::NotFound { .. })
    ));
}
