//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Native per-engine connections behind one enum
//! - Bounded per-configuration pools and the registry that owns them
//! - Statement classification and execution
//! - Catalog introspection
//! - Native SQLite handle access (deadlines, declared column types)
//! - Result normalization and type mappings
//! - Dispatch macros for reducing code duplication

pub mod classify;
pub mod connection;
pub mod executor;
#[macro_use]
pub mod macros;
pub mod manager;
pub mod pool;
pub mod schema;
pub mod sqlite;
pub mod types;

pub use classify::{ClassifiedStatement, StatementKind, classify};
pub use connection::{DbConnection, PlaintextSecrets, SecretResolver};
pub use executor::SqlExecutor;
pub use manager::ConnectionManager;
pub use pool::{PoolStatus, PooledConnection};
pub use schema::MetadataIntrospector;
