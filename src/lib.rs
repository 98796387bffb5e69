//! SQL Gateway Library
//!
//! Stores database connection configurations, keeps a bounded connection pool
//! per configuration, introspects schemas and runs ad-hoc SQL against SQLite,
//! PostgreSQL and MySQL, returning engine-independent results.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod service;
pub mod store;

pub use config::Config;
pub use error::{DbError, DbResult};
pub use service::DatabaseService;
