//! Result normalization.
//!
//! Driver-native rows become [`Row`] maps of [`SqlValue`]s so callers never
//! branch on the engine.
//!
//! # Architecture
//!
//! Type conversion uses a two-phase approach:
//! 1. [`categorize_type`] classifies a column's type name into a [`TypeCategory`]
//! 2. Engine-specific decoders extract the value, falling back to text
//!
//! Statements run without bind arguments, so PostgreSQL and MySQL return every
//! value in text format. [`RawText`] relies on that to read exact decimals and
//! types without a native Rust mapping.
//!
//! SQLite is typed by the value's storage class instead of the column, since
//! expression columns carry no declared type.

use crate::error::{DbError, DbResult};
use crate::models::{DriverFamily, Number, ResultColumn, Row, SqlValue};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::Row as _;
use sqlx::{Column, ColumnIndex, Decode, Type, TypeInfo, ValueRef};

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Temporal(Temporal),
    Binary,
    Text,
}

/// Date/time flavor of a temporal column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Temporal {
    /// Instant with a zone, reported in UTC
    Zoned,
    Naive,
    Date,
    Time,
}

/// Classify a driver type name into a logical category.
pub fn categorize_type(type_name: &str, family: DriverFamily) -> TypeCategory {
    let lower = type_name.trim().to_ascii_lowercase();
    let lower = lower.strip_suffix(" unsigned").unwrap_or(&lower);

    // Decimal/Numeric first, "numeric" would otherwise look like nothing else
    if lower.contains("decimal") || lower.contains("numeric") {
        return TypeCategory::Decimal;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    match lower {
        "timestamptz" | "timestamp with time zone" => {
            return TypeCategory::Temporal(Temporal::Zoned);
        }
        // MySQL TIMESTAMP is an instant, PostgreSQL TIMESTAMP is not
        "timestamp" if family == DriverFamily::MySql => {
            return TypeCategory::Temporal(Temporal::Zoned);
        }
        "timestamp" | "timestamp without time zone" | "datetime" => {
            return TypeCategory::Temporal(Temporal::Naive);
        }
        "date" => return TypeCategory::Temporal(Temporal::Date),
        "time" | "time without time zone" => return TypeCategory::Temporal(Temporal::Time),
        _ => {}
    }

    // Checked before the integer suffix rule ("point" ends with "int")
    if lower.contains("interval") || lower.contains("point") {
        return TypeCategory::Text;
    }

    if lower.ends_with("int")
        || matches!(lower, "integer" | "int2" | "int4" | "int8")
        || lower.ends_with("serial")
    {
        return TypeCategory::Integer;
    }

    if matches!(
        lower,
        "float" | "float4" | "float8" | "double" | "double precision" | "real"
    ) {
        return TypeCategory::Float;
    }

    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    // json, uuid, char, varchar, text, enums, ...
    TypeCategory::Text
}

/// Canonical spelling of a declared type: lowercase, modifiers removed,
/// common aliases folded.
///
/// ```
/// use sql_gateway::db::types::canonical_type_name;
///
/// assert_eq!(canonical_type_name("INTEGER"), "int");
/// assert_eq!(canonical_type_name("character varying(255)"), "varchar");
/// assert_eq!(canonical_type_name("NUMERIC(10, 2)"), "decimal");
/// ```
pub fn canonical_type_name(declared: &str) -> String {
    let lower = declared.trim().to_ascii_lowercase();

    // Drop every parenthesized modifier: varchar(255), numeric(10,2), timestamp(3) with time zone
    let mut stripped = String::with_capacity(lower.len());
    let mut depth = 0usize;
    for c in lower.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => stripped.push(c),
            _ => {}
        }
    }
    let cleaned = stripped.split_whitespace().collect::<Vec<_>>().join(" ");

    let canonical = match cleaned.as_str() {
        "integer" | "int4" | "int" => "int",
        "int8" | "bigint" => "bigint",
        "int2" | "smallint" => "smallint",
        "character varying" | "varchar" => "varchar",
        "character" | "bpchar" | "char" => "char",
        "bool" | "boolean" => "boolean",
        "float8" | "double precision" | "double" => "double",
        "float4" | "real" => "real",
        "numeric" | "decimal" => "decimal",
        "timestamp without time zone" | "timestamp" => "timestamp",
        "timestamp with time zone" | "timestamptz" => "timestamptz",
        "time without time zone" | "time" => "time",
        "time with time zone" | "timetz" => "timetz",
        other => return other.to_string(),
    };
    canonical.to_string()
}

// =============================================================================
// Text Fallback Support
// =============================================================================

/// A value read as its textual representation.
///
/// Compatible with every column type. Only valid for text-format results,
/// which is what statements without bind arguments produce.
#[derive(Debug)]
pub struct RawText(pub String);

impl Type<sqlx::MySql> for RawText {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(_ty: &MySqlTypeInfo) -> bool {
        true
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawText {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawText(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawText {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(_ty: &PgTypeInfo) -> bool {
        true
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawText {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::Postgres>>::decode(value)?;
        Ok(RawText(s.to_string()))
    }
}

// =============================================================================
// Value Formatting
// =============================================================================

pub fn blob_value(bytes: &[u8]) -> SqlValue {
    SqlValue::Blob(STANDARD.encode(bytes))
}

/// Non-finite floats have no JSON number form and become strings.
pub fn float_value(v: f64) -> SqlValue {
    if v.is_finite() {
        SqlValue::Number(Number::Float(v))
    } else {
        SqlValue::String(v.to_string())
    }
}

pub fn zoned_value(v: DateTime<Utc>) -> SqlValue {
    SqlValue::Timestamp(v.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

pub fn naive_value(v: NaiveDateTime) -> SqlValue {
    SqlValue::Timestamp(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
}

pub fn date_value(v: NaiveDate) -> SqlValue {
    SqlValue::Timestamp(v.format("%Y-%m-%d").to_string())
}

pub fn time_value(v: NaiveTime) -> SqlValue {
    SqlValue::Timestamp(v.format("%H:%M:%S%.f").to_string())
}

fn unsigned_value(v: u64) -> SqlValue {
    match i64::try_from(v) {
        Ok(signed) => SqlValue::integer(signed),
        Err(_) => SqlValue::Number(Number::Unsigned(v)),
    }
}

// =============================================================================
// Row Normalization Trait
// =============================================================================

/// Converts one driver row into the canonical shape.
pub trait NormalizeRow {
    /// Column descriptors in select order.
    fn result_columns(&self) -> Vec<ResultColumn>;

    /// Values keyed by column name.
    fn normalize(&self) -> DbResult<Row>;
}

impl NormalizeRow for MySqlRow {
    fn result_columns(&self) -> Vec<ResultColumn> {
        declared_columns(self)
    }

    fn normalize(&self) -> DbResult<Row> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let value = mysql::decode_column(self, idx, col.type_info().name())?;
                Ok((col.name().to_string(), value))
            })
            .collect()
    }
}

impl NormalizeRow for PgRow {
    fn result_columns(&self) -> Vec<ResultColumn> {
        declared_columns(self)
    }

    fn normalize(&self) -> DbResult<Row> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let value = postgres::decode_column(self, idx, col.type_info().name())?;
                Ok((col.name().to_string(), value))
            })
            .collect()
    }
}

impl NormalizeRow for SqliteRow {
    fn result_columns(&self) -> Vec<ResultColumn> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                // The driver only keeps the declared type's affinity here.
                // `run_query` swaps in the declared text for table columns.
                // Expression columns have no declared type; use this row's storage class
                let declared = col.type_info();
                let type_name = if declared.is_null() {
                    self.try_get_raw(idx)
                        .map(|v| v.type_info().name().to_string())
                        .unwrap_or_else(|_| declared.name().to_string())
                } else {
                    declared.name().to_string()
                };
                ResultColumn {
                    name: col.name().to_string(),
                    type_name: canonical_type_name(&type_name),
                }
            })
            .collect()
    }

    fn normalize(&self) -> DbResult<Row> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let value = sqlite::decode_column(self, idx, col.type_info().name())?;
                Ok((col.name().to_string(), value))
            })
            .collect()
    }
}

fn declared_columns<R: sqlx::Row>(row: &R) -> Vec<ResultColumn> {
    row.columns()
        .iter()
        .map(|col| ResultColumn {
            name: col.name().to_string(),
            type_name: canonical_type_name(col.type_info().name()),
        })
        .collect()
}

fn decode_failed(row_column: &str, type_name: &str, error: impl std::fmt::Display) -> DbError {
    DbError::internal(format!(
        "Failed to decode column '{}' of type {}: {}",
        row_column, type_name, error
    ))
}

// =============================================================================
// Shared Decoders (PostgreSQL, MySQL)
// =============================================================================

fn decode_temporal<R>(row: &R, idx: usize, temporal: Temporal) -> Option<SqlValue>
where
    R: sqlx::Row,
    usize: ColumnIndex<R>,
    for<'r> DateTime<Utc>: Decode<'r, R::Database> + Type<R::Database>,
    for<'r> NaiveDateTime: Decode<'r, R::Database> + Type<R::Database>,
    for<'r> NaiveDate: Decode<'r, R::Database> + Type<R::Database>,
    for<'r> NaiveTime: Decode<'r, R::Database> + Type<R::Database>,
{
    match temporal {
        Temporal::Zoned => row
            .try_get::<DateTime<Utc>, _>(idx)
            .ok()
            .map(zoned_value)
            .or_else(|| row.try_get::<NaiveDateTime, _>(idx).ok().map(naive_value)),
        Temporal::Naive => row
            .try_get::<NaiveDateTime, _>(idx)
            .ok()
            .map(naive_value)
            .or_else(|| row.try_get::<DateTime<Utc>, _>(idx).ok().map(zoned_value)),
        Temporal::Date => row.try_get::<NaiveDate, _>(idx).ok().map(date_value),
        Temporal::Time => row.try_get::<NaiveTime, _>(idx).ok().map(time_value),
    }
}

fn decode_float<R>(row: &R, idx: usize) -> Option<SqlValue>
where
    R: sqlx::Row,
    usize: ColumnIndex<R>,
    for<'r> f64: Decode<'r, R::Database> + Type<R::Database>,
    for<'r> f32: Decode<'r, R::Database> + Type<R::Database>,
{
    if let Ok(v) = row.try_get::<f64, _>(idx) {
        return Some(float_value(v));
    }
    row.try_get::<f32, _>(idx).ok().map(|v| float_value(v as f64))
}

fn decode_common<R>(row: &R, idx: usize, category: TypeCategory) -> Option<SqlValue>
where
    R: sqlx::Row,
    usize: ColumnIndex<R>,
    for<'r> RawText: Decode<'r, R::Database> + Type<R::Database>,
    for<'r> bool: Decode<'r, R::Database> + Type<R::Database>,
    for<'r> Vec<u8>: Decode<'r, R::Database> + Type<R::Database>,
    for<'r> f64: Decode<'r, R::Database> + Type<R::Database>,
    for<'r> f32: Decode<'r, R::Database> + Type<R::Database>,
    for<'r> DateTime<Utc>: Decode<'r, R::Database> + Type<R::Database>,
    for<'r> NaiveDateTime: Decode<'r, R::Database> + Type<R::Database>,
    for<'r> NaiveDate: Decode<'r, R::Database> + Type<R::Database>,
    for<'r> NaiveTime: Decode<'r, R::Database> + Type<R::Database>,
{
    match category {
        TypeCategory::Decimal => row
            .try_get::<RawText, _>(idx)
            .ok()
            .map(|v| SqlValue::Number(Number::Decimal(v.0))),
        TypeCategory::Boolean => row.try_get::<bool, _>(idx).ok().map(SqlValue::Boolean),
        TypeCategory::Float => decode_float(row, idx),
        TypeCategory::Temporal(temporal) => decode_temporal(row, idx, temporal),
        TypeCategory::Binary => row.try_get::<Vec<u8>, _>(idx).ok().map(|v| blob_value(&v)),
        // Integers are engine-specific
        TypeCategory::Integer | TypeCategory::Text => None,
    }
}

fn decode_as_text<R>(row: &R, idx: usize, type_name: &str) -> DbResult<SqlValue>
where
    R: sqlx::Row,
    usize: ColumnIndex<R>,
    for<'r> RawText: Decode<'r, R::Database> + Type<R::Database>,
{
    row.try_get::<RawText, _>(idx)
        .map(|v| SqlValue::String(v.0))
        .map_err(|e| {
            let name = row
                .columns()
                .get(idx)
                .map(|c| c.name().to_string())
                .unwrap_or_else(|| idx.to_string());
            decode_failed(&name, type_name, e)
        })
}

// =============================================================================
// Database-Specific Decoders
// =============================================================================

mod mysql {
    use super::*;
    use sqlx::Row as _;

    pub fn decode_column(row: &MySqlRow, idx: usize, type_name: &str) -> DbResult<SqlValue> {
        if row.try_get_raw(idx)?.is_null() {
            return Ok(SqlValue::Null);
        }

        let category = categorize_type(type_name, DriverFamily::MySql);
        let value = match category {
            TypeCategory::Integer => decode_integer(row, idx),
            other => decode_common(row, idx, other),
        };
        match value {
            Some(v) => Ok(v),
            None => decode_as_text(row, idx, type_name),
        }
    }

    fn decode_integer(row: &MySqlRow, idx: usize) -> Option<SqlValue> {
        if let Ok(v) = row.try_get::<i64, _>(idx) {
            return Some(SqlValue::integer(v));
        }
        row.try_get::<u64, _>(idx).ok().map(unsigned_value)
    }
}

mod postgres {
    use super::*;
    use sqlx::Row as _;

    pub fn decode_column(row: &PgRow, idx: usize, type_name: &str) -> DbResult<SqlValue> {
        if row.try_get_raw(idx)?.is_null() {
            return Ok(SqlValue::Null);
        }

        let category = categorize_type(type_name, DriverFamily::Postgres);
        let value = match category {
            TypeCategory::Integer => decode_integer(row, idx),
            other => decode_common(row, idx, other),
        };
        match value {
            Some(v) => Ok(v),
            None => decode_as_text(row, idx, type_name),
        }
    }

    fn decode_integer(row: &PgRow, idx: usize) -> Option<SqlValue> {
        if let Ok(v) = row.try_get::<i16, _>(idx) {
            return Some(SqlValue::integer(v.into()));
        }
        if let Ok(v) = row.try_get::<i32, _>(idx) {
            return Some(SqlValue::integer(v.into()));
        }
        row.try_get::<i64, _>(idx).ok().map(SqlValue::integer)
    }
}

mod sqlite {
    use super::*;
    use sqlx::Row as _;

    pub fn decode_column(row: &SqliteRow, idx: usize, declared: &str) -> DbResult<SqlValue> {
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            return Ok(SqlValue::Null);
        }
        let storage = raw.type_info().name().to_string();
        let declared = declared.to_ascii_uppercase();
        let failed = |e: sqlx::Error| {
            let name = row
                .columns()
                .get(idx)
                .map(|c| c.name().to_string())
                .unwrap_or_else(|| idx.to_string());
            decode_failed(&name, &storage, e)
        };

        match storage.as_str() {
            "INTEGER" | "BOOLEAN" => {
                let v = row.try_get::<i64, _>(idx).map_err(failed)?;
                Ok(match declared.as_str() {
                    "BOOLEAN" => SqlValue::Boolean(v != 0),
                    "DATETIME" => DateTime::from_timestamp(v, 0)
                        .map(zoned_value)
                        .unwrap_or(SqlValue::integer(v)),
                    _ => SqlValue::integer(v),
                })
            }
            "REAL" => Ok(float_value(row.try_get::<f64, _>(idx).map_err(failed)?)),
            "BLOB" => {
                let bytes = row.try_get::<Vec<u8>, _>(idx).map_err(failed)?;
                Ok(blob_value(&bytes))
            }
            _ => {
                let text = row.try_get::<String, _>(idx).map_err(failed)?;
                if matches!(declared.as_str(), "DATETIME" | "DATE" | "TIME") {
                    if let Some(value) = parse_temporal_text(&text) {
                        return Ok(value);
                    }
                }
                Ok(SqlValue::String(text))
            }
        }
    }
}

/// Normalize a date/time stored as text (SQLite has no temporal storage class).
pub fn parse_temporal_text(text: &str) -> Option<SqlValue> {
    let text = text.trim();

    if let Ok(v) = DateTime::parse_from_rfc3339(text) {
        return Some(zoned_value(v.with_timezone(&Utc)));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(v) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive_value(v));
        }
    }
    if let Ok(v) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Some(date_value(v));
    }
    if let Ok(v) = NaiveTime::parse_from_str(text, "%H:%M:%S%.f") {
        return Some(time_value(v));
    }
    None
}
