//! Leak-freedom test: a long mixed workload must leave no borrowed connections.

use rand::Rng;
use sql_gateway::config::{ExecutorSettings, PoolSettings};
use sql_gateway::error::ErrorKind;
use sql_gateway::models::{ConfigurationRequest, SqlStatement};
use sql_gateway::service::DatabaseService;
use std::collections::BTreeMap;

const CALLS_PER_TASK: usize = 250;
const TASKS: usize = 4;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mixed_workload_returns_to_steady_state() {
    let dir = tempfile::tempdir().unwrap();
    let service = DatabaseService::new(PoolSettings::default(), ExecutorSettings::default());
    let config = service
        .save(ConfigurationRequest {
            name: "leak".to_string(),
            driver: "sqlite".to_string(),
            database: dir.path().join("leak.db").to_str().unwrap().to_string(),
            params: BTreeMap::from([("max_connections".to_string(), "2".to_string())]),
            ..Default::default()
        })
        .unwrap();
    service
        .execute(&SqlStatement::new(
            config.id,
            "CREATE TABLE events (id INTEGER PRIMARY KEY, payload TEXT)",
        ))
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..TASKS {
        let service = service.clone();
        let id = config.id;
        tasks.push(tokio::spawn(async move {
            let mut failures = 0usize;
            for i in 0..CALLS_PER_TASK {
                let choice = rand::thread_rng().gen_range(0..6);
                let sql = match choice {
                    0 => "SELECT 1".to_string(),
                    1 => format!("INSERT INTO events (payload) VALUES ('event {}')", i),
                    2 => "SELECT * FROM events ORDER BY id DESC LIMIT 3".to_string(),
                    3 => "SELECT * FROM no_such_table".to_string(),
                    4 => "SELEC broken syntax".to_string(),
                    _ => "SELECT 1; SELECT 2".to_string(),
                };
                if let Err(e) = service.execute(&SqlStatement::new(id, sql)).await {
                    assert!(
                        matches!(e.kind(), ErrorKind::SqlError | ErrorKind::ValidationError),
                        "unexpected failure: {:?}",
                        e
                    );
                    failures += 1;
                }
            }
            failures
        }));
    }

    let mut failures = 0;
    for task in tasks {
        failures += task.await.unwrap();
    }
    assert!(failures > 0);

    let status = service.pool_status(config.id).await.unwrap();
    assert_eq!(status.in_use, 0);
    assert_eq!(status.open, status.idle);
    assert!(status.open <= 2);
    assert!(status.peak_open <= 2);
}
