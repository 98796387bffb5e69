//! Catalog metadata models.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One column of a table or view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub table_name: String,
    pub name: String,
    /// Canonical declared type, e.g. `int`, `varchar`.
    #[serde(rename = "type")]
    pub type_name: String,
    pub nullable: bool,
    /// 1-based position within the table.
    pub ordinal: u32,
}

/// Table name to its columns in ordinal order.
pub type SchemaMetadata = BTreeMap<String, Vec<ColumnMeta>>;
