//! Native SQLite handle access.
//!
//! SQLite statements run on a driver worker thread. Dropping the future that
//! awaits them does not stop the statement, so deadlines are enforced inside
//! the engine with a progress handler. The driver also reduces declared column
//! types to their affinity; the declared text is read from the raw handle.

use crate::db::connection::DbConnection;
use crate::db::types::canonical_type_name;
use crate::error::DbResult;
use crate::models::NormalizedResult;
use libsqlite3_sys::{
    SQLITE_OK, sqlite3_column_count, sqlite3_column_decltype, sqlite3_finalize,
    sqlite3_prepare_v2, sqlite3_stmt,
};
use sqlx::sqlite::SqliteConnection;
use std::ffi::{CStr, CString};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Virtual machine instructions between deadline checks.
const PROGRESS_OPS: i32 = 1_000;

/// An armed engine-side deadline.
#[derive(Debug, Clone)]
pub struct Deadline {
    fired: Arc<AtomicBool>,
}

impl Deadline {
    /// Whether the engine interrupted a statement because the deadline passed.
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

impl DbConnection {
    /// Interrupt statements still running once `limit` elapses.
    ///
    /// Only SQLite needs this: on the network engines the connection is
    /// discarded on timeout and the server ends the session.
    pub async fn arm_deadline(&mut self, limit: Duration) -> DbResult<Option<Deadline>> {
        match self {
            DbConnection::Sqlite(c) => Ok(Some(arm(c, limit).await?)),
            _ => Ok(None),
        }
    }

    /// Remove a deadline armed by [`DbConnection::arm_deadline`].
    pub async fn disarm_deadline(&mut self) -> DbResult<()> {
        if let DbConnection::Sqlite(c) = self {
            c.lock_handle().await?.remove_progress_handler();
        }
        Ok(())
    }
}

async fn arm(conn: &mut SqliteConnection, limit: Duration) -> DbResult<Deadline> {
    let deadline = Instant::now() + limit;
    let fired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&fired);

    // The handle lock must be released before the statement runs
    conn.lock_handle()
        .await?
        .set_progress_handler(PROGRESS_OPS, move || {
            if Instant::now() < deadline {
                return true;
            }
            flag.store(true, Ordering::Release);
            false
        });

    Ok(Deadline { fired })
}

/// Declared type of each result column, `None` for expressions.
///
/// Returns an empty list when the statement does not prepare; the error is
/// reported when it runs.
pub async fn declared_types(conn: &mut SqliteConnection, sql: &str) -> DbResult<Vec<Option<String>>> {
    let Ok(sql) = CString::new(sql) else {
        return Ok(Vec::new());
    };

    let mut handle = conn.lock_handle().await?;
    let db = handle.as_raw_handle();
    let mut stmt: *mut sqlite3_stmt = ptr::null_mut();

    // SAFETY: `db` stays valid while the handle lock is held, and the prepared
    // statement is finalized before the lock is released. Decltype strings are
    // copied out before finalizing.
    let types = unsafe {
        let rc = sqlite3_prepare_v2(db.as_ptr(), sql.as_ptr(), -1, &mut stmt, ptr::null_mut());
        if rc != SQLITE_OK || stmt.is_null() {
            if !stmt.is_null() {
                sqlite3_finalize(stmt);
            }
            return Ok(Vec::new());
        }

        let count = sqlite3_column_count(stmt);
        let types = (0..count)
            .map(|idx| {
                let decl = sqlite3_column_decltype(stmt, idx);
                if decl.is_null() {
                    None
                } else {
                    Some(CStr::from_ptr(decl).to_string_lossy().into_owned())
                }
            })
            .collect();
        sqlite3_finalize(stmt);
        types
    };

    Ok(types)
}

/// Replace affinity names with declared types where the column has one.
pub fn apply_declared_types(result: &mut NormalizedResult, declared: &[Option<String>]) {
    if let NormalizedResult::Rows { columns, .. } = result {
        for (column, decl) in columns.iter_mut().zip(declared) {
            if let Some(decl) = decl.as_deref().filter(|d| !d.trim().is_empty()) {
                column.type_name = canonical_type_name(decl);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ResultColumn, SqlValue};
    use sqlx::Connection;
    use sqlx::sqlite::SqliteConnectOptions;
    use std::collections::BTreeMap;

    async fn open(dir: &tempfile::TempDir) -> SqliteConnection {
        let options = SqliteConnectOptions::new()
            .filename(dir.path().join("native.db"))
            .create_if_missing(true);
        SqliteConnection::connect_with(&options).await.unwrap()
    }

    #[tokio::test]
    async fn test_declared_types_from_table_columns() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = open(&dir).await;
        sqlx::Executor::execute(
            &mut conn,
            "CREATE TABLE items (id INTEGER, label VARCHAR(40), price NUMERIC(10,2))",
        )
        .await
        .unwrap();

        let types = declared_types(&mut conn, "SELECT id, label, price, id + 1 AS next FROM items")
            .await
            .unwrap();
        assert_eq!(
            types,
            vec![
                Some("INTEGER".to_string()),
                Some("VARCHAR(40)".to_string()),
                Some("NUMERIC(10,2)".to_string()),
                None,
            ]
        );

        // Unpreparable SQL yields nothing; running it reports the error
        let types = declared_types(&mut conn, "SELECT * FROM missing").await.unwrap();
        assert!(types.is_empty());
    }

    #[test]
    fn test_apply_declared_types() {
        let mut result = NormalizedResult::Rows {
            columns: vec![
                ResultColumn {
                    name: "label".to_string(),
                    type_name: "text".to_string(),
                },
                ResultColumn {
                    name: "n".to_string(),
                    type_name: "integer".to_string(),
                },
            ],
            rows: vec![BTreeMap::from([(
                "label".to_string(),
                SqlValue::String("a".to_string()),
            )])],
            truncated: false,
        };
        apply_declared_types(&mut result, &[Some("VARCHAR(40)".to_string()), None]);

        match result {
            NormalizedResult::Rows { columns, .. } => {
                assert_eq!(columns[0].type_name, "varchar");
                assert_eq!(columns[1].type_name, "integer");
            }
            other => panic!("expected rows, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deadline_interrupts_statement() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = DbConnection::Sqlite(open(&dir).await);

        let deadline = conn
            .arm_deadline(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        let start = Instant::now();
        let err = conn
            .run_query(
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 500000000) SELECT count(*) FROM c",
                10,
            )
            .await
            .unwrap_err();
        assert!(deadline.fired(), "{:?}", err);
        assert!(start.elapsed() < Duration::from_secs(5));

        // Disarmed connections run to completion
        conn.disarm_deadline().await.unwrap();
        let result = conn.run_query("SELECT 1 AS one", 10).await.unwrap();
        assert_eq!(result.row_count(), 1);
        conn.close().await;
    }
}
