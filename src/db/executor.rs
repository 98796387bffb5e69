//! Statement execution engine.
//!
//! This module provides statement execution with support for:
//! - Leading-keyword classification (rows vs affected count)
//! - Row caps enforced while streaming (only fetches needed rows + 1)
//! - Statement timeouts, enforced inside SQLite so an abandoned statement
//!   does not keep holding database locks
//! - Scoped connection borrowing with release on every exit path
//!
//! Statements are sent without bind arguments, so MySQL and PostgreSQL use the
//! text protocol and statements that cannot be prepared still run.

use crate::config::{ExecutorSettings, PoolOptions};
use crate::db::classify::{ClassifiedStatement, classify};
use crate::db::connection::DbConnection;
use crate::db::manager::ConnectionManager;
use crate::db::sqlite;
use crate::db::types::NormalizeRow;
use crate::error::{DbError, DbResult};
use crate::models::{NormalizedResult, SqlStatement};
use crate::store::RecordStore;
use crate::with_connection;
use futures_util::TryStreamExt;
use futures_util::stream::BoxStream;
use sqlx::Executor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

impl DbConnection {
    /// Run a row-returning statement, keeping at most `max_rows` rows.
    pub async fn run_query(&mut self, sql: &str, max_rows: u32) -> DbResult<NormalizedResult> {
        if let DbConnection::Sqlite(c) = self {
            let declared = sqlite::declared_types(c, sql).await?;
            let mut result = collect_rows(c.fetch(sql), max_rows).await?;
            sqlite::apply_declared_types(&mut result, &declared);
            return Ok(result);
        }
        with_connection!(self, c => collect_rows(c.fetch(sql), max_rows).await)
    }

    /// Run a statement and report the affected-row count.
    pub async fn run_update(&mut self, sql: &str) -> DbResult<u64> {
        with_connection!(self, c => c.execute(sql).await.map(|r| r.rows_affected()))
            .map_err(DbError::from)
    }
}

/// Normalize rows from a driver stream, stopping one row past the cap.
async fn collect_rows<R: NormalizeRow>(
    mut stream: BoxStream<'_, Result<R, sqlx::Error>>,
    max_rows: u32,
) -> DbResult<NormalizedResult> {
    let limit = max_rows as usize;
    let mut columns = Vec::new();
    let mut rows = Vec::new();
    let mut truncated = false;

    while let Some(row) = stream.try_next().await? {
        if rows.len() >= limit {
            truncated = true;
            break;
        }
        if rows.is_empty() {
            columns = row.result_columns();
        }
        rows.push(row.normalize()?);
    }

    if truncated {
        warn!(limit = max_rows, "Result truncated");
    }

    Ok(NormalizedResult::Rows {
        columns,
        rows,
        truncated,
    })
}

/// Executes raw statements against pooled connections.
#[derive(Debug, Clone)]
pub struct SqlExecutor {
    manager: Arc<ConnectionManager>,
    records: Arc<RecordStore>,
    settings: ExecutorSettings,
}

impl SqlExecutor {
    pub fn new(
        manager: Arc<ConnectionManager>,
        records: Arc<RecordStore>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            manager,
            records,
            settings,
        }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Classify, run and normalize one statement.
    ///
    /// Input problems are reported before a connection is borrowed. Once
    /// borrowed, the connection is released on every path: healthy after
    /// success or an SQL error, destroyed after a timeout, a connection fault
    /// or a session-altering statement.
    pub async fn execute(&self, statement: &SqlStatement) -> DbResult<NormalizedResult> {
        let start = Instant::now();
        let id = statement.config_id;

        let config = self.records.get(id)?.ok_or(DbError::not_found(id))?;
        let mut classified = classify(&statement.sql, config.driver)?;
        self.check_timeout_override(statement.timeout_ms)?;

        let acquire_timeout = config
            .pool_options()
            .acquire_timeout_or_default(self.manager.settings());
        let mut handle = self.manager.acquire(id, acquire_timeout).await?;

        // The connection may come from a newer record than the one read above
        if handle.family() != config.driver {
            classified = match classify(&statement.sql, handle.family()) {
                Ok(c) => c,
                Err(e) => {
                    self.manager.release(handle, true).await;
                    return Err(e);
                }
            };
        }
        let options = handle.pool_options();
        let limit = self.statement_timeout(statement.timeout_ms, &options);
        let max_rows = options.max_rows_or_default(&self.settings);

        debug!(
            config_id = %id,
            driver = %handle.family(),
            keyword = %classified.keyword,
            returns_rows = classified.returns_rows(),
            timeout_ms = limit.as_millis() as u64,
            max_rows,
            "Executing statement"
        );

        let outcome = match handle.connection() {
            Ok(conn) => run_statement(conn, &statement.sql, &classified, max_rows, limit).await,
            Err(e) => Err(e),
        };

        let healthy = match &outcome {
            Ok(_) => !classified.alters_session(),
            Err(e) => !e.poisons_connection(),
        };
        self.manager.release(handle, healthy).await;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &outcome {
            Ok(result) => debug!(
                config_id = %id,
                elapsed_ms,
                rows = result.row_count(),
                "Statement completed"
            ),
            Err(e) => debug!(
                config_id = %id,
                elapsed_ms,
                kind = %e.kind(),
                error = %e,
                "Statement failed"
            ),
        }
        outcome
    }

    fn check_timeout_override(&self, timeout_ms: Option<u64>) -> DbResult<()> {
        if timeout_ms == Some(0) {
            return Err(DbError::validation("timeout_ms must be greater than zero."));
        }
        Ok(())
    }

    /// Per-call override, else the configuration's option, else the default,
    /// clamped to the maximum.
    fn statement_timeout(&self, timeout_ms: Option<u64>, options: &PoolOptions) -> Duration {
        timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| options.statement_timeout_or_default(&self.settings))
            .min(self.settings.max_statement_timeout)
    }
}

async fn run_statement(
    conn: &mut DbConnection,
    sql: &str,
    classified: &ClassifiedStatement,
    max_rows: u32,
    limit: Duration,
) -> DbResult<NormalizedResult> {
    let deadline = conn.arm_deadline(limit).await?;

    let work = async {
        if classified.returns_rows() {
            conn.run_query(sql, max_rows).await
        } else {
            conn.run_update(sql)
                .await
                .map(|count| NormalizedResult::Affected { count })
        }
    };

    let outcome = match timeout(limit, work).await {
        Ok(Err(_)) if deadline.as_ref().is_some_and(|d| d.fired()) => {
            Err(timed_out(classified, limit))
        }
        Ok(result) => result,
        Err(_) => Err(timed_out(classified, limit)),
    };

    // Poisoned connections are destroyed with their handler
    if deadline.is_some() && !matches!(&outcome, Err(e) if e.poisons_connection()) {
        conn.disarm_deadline().await?;
    }
    outcome
}

fn timed_out(classified: &ClassifiedStatement, limit: Duration) -> DbError {
    warn!(
        keyword = %classified.keyword,
        timeout_ms = limit.as_millis() as u64,
        "Statement timed out, connection will be discarded"
    );
    DbError::timeout("statement execution", limit.as_millis() as u64)
}
