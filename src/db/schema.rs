//! Catalog introspection.
//!
//! # Architecture
//!
//! SQL queries are organized in the `queries` submodule with constants for each
//! database type. Database-specific implementations are in their respective
//! submodules (postgres, mysql, sqlite), each reading one page of the catalog.
//! [`DbConnection::introspect_catalog`] pages through the catalog in bounded
//! batches and groups the columns per table.

use crate::db::connection::DbConnection;
use crate::db::manager::ConnectionManager;
use crate::db::types::canonical_type_name;
use crate::dispatch_connection;
use crate::error::{DbError, DbResult};
use crate::models::{ColumnMeta, ConfigId, SchemaMetadata};
use crate::store::RecordStore;
use sqlx::Row;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

impl DbConnection {
    /// Read every column of every table and view under `schema`.
    ///
    /// `schema` defaults to the session's current schema (PostgreSQL) or the
    /// configured database (MySQL); SQLite always reads `main`.
    pub async fn introspect_catalog(
        &mut self,
        schema: Option<&str>,
        batch_size: u32,
    ) -> DbResult<SchemaMetadata> {
        let batch = i64::from(batch_size.max(1));
        let mut metadata = SchemaMetadata::new();
        let mut offset = 0i64;

        loop {
            let page = dispatch_connection!(&mut *self, {
                MySql(c) => mysql::fetch_page(c, schema, batch, offset).await,
                Postgres(c) => postgres::fetch_page(c, schema, batch, offset).await,
                Sqlite(c) => sqlite::fetch_page(c, batch, offset).await,
            })?;

            let fetched = page.len() as i64;
            for column in page {
                metadata
                    .entry(column.table_name.clone())
                    .or_default()
                    .push(column);
            }

            if fetched < batch {
                break;
            }
            offset += batch;
        }

        Ok(metadata)
    }
}

/// Builds [`SchemaMetadata`] through borrowed connections.
#[derive(Debug, Clone)]
pub struct MetadataIntrospector {
    manager: Arc<ConnectionManager>,
    records: Arc<RecordStore>,
    batch_size: u32,
    timeout: Duration,
}

impl MetadataIntrospector {
    pub fn new(
        manager: Arc<ConnectionManager>,
        records: Arc<RecordStore>,
        batch_size: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            manager,
            records,
            batch_size,
            timeout,
        }
    }

    async fn read_catalog(
        &self,
        conn: &mut DbConnection,
        schema: Option<&str>,
    ) -> DbResult<SchemaMetadata> {
        let deadline = conn.arm_deadline(self.timeout).await?;
        let timed_out = || DbError::timeout("metadata introspection", self.timeout.as_millis() as u64);

        let outcome = match tokio::time::timeout(
            self.timeout,
            conn.introspect_catalog(schema, self.batch_size),
        )
        .await
        {
            Ok(Err(_)) if deadline.as_ref().is_some_and(|d| d.fired()) => Err(timed_out()),
            Ok(result) => result,
            Err(_) => Err(timed_out()),
        };

        if deadline.is_some() && !matches!(&outcome, Err(e) if e.poisons_connection()) {
            conn.disarm_deadline().await?;
        }
        outcome
    }

    /// Tables and their columns in ordinal order.
    ///
    /// Acquisition errors are returned unchanged. The connection is released
    /// whether the catalog read succeeds or not.
    pub async fn introspect(&self, id: ConfigId) -> DbResult<SchemaMetadata> {
        let start = Instant::now();
        let acquire_timeout = match self.records.get(id)? {
            Some(config) => config
                .pool_options()
                .acquire_timeout_or_default(self.manager.settings()),
            None => return Err(DbError::not_found(id)),
        };

        let mut handle = self.manager.acquire(id, acquire_timeout).await?;
        let schema = handle.pool_options().schema;

        let outcome = match handle.connection() {
            Ok(conn) => self.read_catalog(conn, schema.as_deref()).await,
            Err(e) => Err(e),
        };

        let healthy = match &outcome {
            Ok(_) => true,
            Err(e) => !e.poisons_connection(),
        };
        self.manager.release(handle, healthy).await;

        match &outcome {
            Ok(metadata) => debug!(
                config_id = %id,
                tables = metadata.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Introspected catalog"
            ),
            Err(e) => warn!(config_id = %id, error = %e, "Catalog introspection failed"),
        }
        outcome
    }
}

// =============================================================================
// SQL Query Templates
// =============================================================================

mod queries {
    pub mod postgres {
        pub const COLUMNS: &str = r#"
            SELECT
                c.table_name::text AS table_name,
                c.column_name::text AS column_name,
                CASE
                    WHEN c.data_type IN ('USER-DEFINED', 'ARRAY') THEN c.udt_name::text
                    ELSE c.data_type::text
                END AS data_type,
                (c.is_nullable = 'YES') AS nullable,
                c.ordinal_position::int4 AS ordinal
            FROM information_schema.columns c
            JOIN information_schema.tables t
                ON t.table_schema = c.table_schema AND t.table_name = c.table_name
            WHERE c.table_schema::text = COALESCE($1::text, current_schema()::text)
            AND t.table_type IN ('BASE TABLE', 'VIEW')
            ORDER BY c.table_name, c.ordinal_position
            LIMIT $2 OFFSET $3
            "#;
    }

    pub mod mysql {
        pub const COLUMNS: &str = r#"
            SELECT
                c.TABLE_NAME AS table_name,
                c.COLUMN_NAME AS column_name,
                c.DATA_TYPE AS data_type,
                CASE WHEN c.IS_NULLABLE = 'YES' THEN 1 ELSE 0 END AS nullable,
                c.ORDINAL_POSITION AS ordinal
            FROM information_schema.COLUMNS c
            JOIN information_schema.TABLES t
                ON t.TABLE_SCHEMA = c.TABLE_SCHEMA AND t.TABLE_NAME = c.TABLE_NAME
            WHERE c.TABLE_SCHEMA = COALESCE(?, DATABASE())
            AND t.TABLE_TYPE IN ('BASE TABLE', 'VIEW')
            ORDER BY c.TABLE_NAME, c.ORDINAL_POSITION
            LIMIT ? OFFSET ?
            "#;
    }

    pub mod sqlite {
        pub const COLUMNS: &str = r#"
            SELECT
                m.name AS table_name,
                p.cid AS cid,
                p.name AS column_name,
                p.type AS data_type,
                p."notnull" AS not_null
            FROM sqlite_master m
            JOIN pragma_table_info(m.name) p
            WHERE m.type IN ('table', 'view')
            AND m.name NOT LIKE 'sqlite_%'
            ORDER BY m.name, p.cid
            LIMIT ? OFFSET ?
            "#;
    }
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================

mod postgres {
    use super::*;
    use sqlx::PgConnection;

    pub async fn fetch_page(
        conn: &mut PgConnection,
        schema: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> DbResult<Vec<ColumnMeta>> {
        let rows = sqlx::query(queries::postgres::COLUMNS)
            .bind(schema)
            .bind(limit)
            .bind(offset)
            .fetch_all(conn)
            .await?;

        rows.iter()
            .map(|row| {
                let ordinal: i32 = row.try_get("ordinal")?;
                Ok(ColumnMeta {
                    table_name: row.try_get("table_name")?,
                    name: row.try_get("column_name")?,
                    type_name: canonical_type_name(&row.try_get::<String, _>("data_type")?),
                    nullable: row.try_get("nullable")?,
                    ordinal: u32::try_from(ordinal).unwrap_or_default(),
                })
            })
            .collect()
    }
}

mod mysql {
    use super::*;
    use sqlx::MySqlConnection;
    use sqlx::mysql::MySqlRow;

    pub async fn fetch_page(
        conn: &mut MySqlConnection,
        schema: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> DbResult<Vec<ColumnMeta>> {
        let rows = sqlx::query(queries::mysql::COLUMNS)
            .bind(schema)
            .bind(limit)
            .bind(offset)
            .fetch_all(conn)
            .await?;

        Ok(rows
            .iter()
            .map(|row| ColumnMeta {
                table_name: get_string(row, "table_name"),
                name: get_string(row, "column_name"),
                type_name: canonical_type_name(&get_string(row, "data_type")),
                nullable: try_get_u64(row, "nullable").unwrap_or(0) != 0,
                ordinal: try_get_u64(row, "ordinal")
                    .and_then(|v| u32::try_from(v).ok())
                    .unwrap_or_default(),
            })
            .collect())
    }

    fn try_get_u64(row: &MySqlRow, column: &str) -> Option<u64> {
        // Try u64 first (MySQL 8.x / BIGINT UNSIGNED)
        if let Ok(Some(v)) = row.try_get::<Option<u64>, _>(column) {
            return Some(v);
        }
        // Fallback to i64 (MySQL 5.x / MariaDB / BIGINT)
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(column) {
            return u64::try_from(v).ok();
        }
        None
    }

    /// MySQL may return VARBINARY instead of VARCHAR depending on charset configuration.
    fn get_string(row: &MySqlRow, column: &str) -> String {
        row.try_get::<String, _>(column)
            .ok()
            .or_else(|| {
                row.try_get::<Vec<u8>, _>(column)
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
            })
            .unwrap_or_default()
    }
}

mod sqlite {
    use super::*;
    use sqlx::SqliteConnection;

    pub async fn fetch_page(
        conn: &mut SqliteConnection,
        limit: i64,
        offset: i64,
    ) -> DbResult<Vec<ColumnMeta>> {
        let rows = sqlx::query(queries::sqlite::COLUMNS)
            .bind(limit)
            .bind(offset)
            .fetch_all(conn)
            .await?;

        rows.iter()
            .map(|row| {
                let cid: i64 = row.try_get("cid")?;
                let not_null: i64 = row.try_get("not_null")?;
                let declared: Option<String> = row.try_get("data_type")?;
                Ok(ColumnMeta {
                    table_name: row.try_get("table_name")?,
                    name: row.try_get("column_name")?,
                    type_name: canonical_type_name(declared.as_deref().unwrap_or_default()),
                    nullable: not_null == 0,
                    ordinal: u32::try_from(cid + 1).unwrap_or_default(),
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(DbError::from)
    }
}
