//! Statement and result models.

use crate::models::ConfigId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// A raw SQL statement addressed to one configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlStatement {
    pub config_id: ConfigId,
    /// Single statement; multiple statements are rejected.
    pub sql: String,
    /// Overrides the default statement timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl SqlStatement {
    pub fn new(config_id: ConfigId, sql: impl Into<String>) -> Self {
        Self {
            config_id,
            sql: sql.into(),
            timeout_ms: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis().min(u64::MAX as u128) as u64);
        self
    }
}

/// Numeric value; decimals keep their exact textual form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Number {
    Integer(i64),
    Unsigned(u64),
    Float(f64),
    Decimal(String),
}

/// Canonical value shared by every engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum SqlValue {
    Null,
    Boolean(bool),
    Number(Number),
    String(String),
    /// ISO-8601 text.
    Timestamp(String),
    /// Standard base64.
    Blob(String),
}

impl SqlValue {
    pub fn integer(v: i64) -> Self {
        Self::Number(Number::Integer(v))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Integer view of a numeric value, if it fits.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(Number::Integer(v)) => Some(*v),
            Self::Number(Number::Unsigned(v)) => i64::try_from(*v).ok(),
            Self::Number(Number::Decimal(s)) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::Timestamp(s) | Self::Blob(s) => Some(s),
            Self::Number(Number::Decimal(s)) => Some(s),
            _ => None,
        }
    }
}

/// Result column in select order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultColumn {
    pub name: String,
    /// Canonical type name.
    #[serde(rename = "type")]
    pub type_name: String,
}

/// One result row keyed by column name.
pub type Row = BTreeMap<String, SqlValue>;

/// Outcome of executing a statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NormalizedResult {
    Rows {
        columns: Vec<ResultColumn>,
        rows: Vec<Row>,
        /// More rows existed than the row cap allowed.
        truncated: bool,
    },
    Affected {
        count: u64,
    },
}

impl NormalizedResult {
    pub fn row_count(&self) -> usize {
        match self {
            Self::Rows { rows, .. } => rows.len(),
            Self::Affected { .. } => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_timeout_builder() {
        let stmt = SqlStatement::new(ConfigId(2), "SELECT 1").with_timeout(Duration::from_secs(2));
        assert_eq!(stmt.timeout_ms, Some(2000));
    }

    #[test]
    fn test_value_serialization_is_tagged() {
        let json = serde_json::to_value(SqlValue::integer(1)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "number", "value": 1}));

        let json = serde_json::to_value(SqlValue::Number(Number::Decimal("10.50".into()))).unwrap();
        assert_eq!(json, serde_json::json!({"type": "number", "value": "10.50"}));

        let json = serde_json::to_value(SqlValue::Null).unwrap();
        assert_eq!(json, serde_json::json!({"type": "null"}));
    }

    #[test]
    fn test_result_serialization() {
        let result = NormalizedResult::Affected { count: 3 };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "affected", "count": 3}));
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(SqlValue::integer(5).as_i64(), Some(5));
        assert_eq!(
            SqlValue::Number(Number::Unsigned(u64::MAX)).as_i64(),
            None
        );
        assert_eq!(SqlValue::Blob("AAE=".into()).as_str(), Some("AAE="));
        assert!(SqlValue::Null.is_null());
    }
}
