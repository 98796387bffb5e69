//! Data models for the SQL gateway.
//!
//! This module re-exports all model types used throughout the application.

pub mod configuration;
pub mod metadata;
pub mod statement;

// Re-export commonly used types
pub use configuration::{
    ConfigId, ConfigurationError, ConfigurationRequest, DatabaseConfiguration, DriverFamily,
};
pub use metadata::{ColumnMeta, SchemaMetadata};
pub use statement::{NormalizedResult, Number, ResultColumn, Row, SqlStatement, SqlValue};
