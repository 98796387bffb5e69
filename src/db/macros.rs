//! Driver dispatch macros.
//!
//! Every engine capability is a `match` over [`DbConnection`](super::DbConnection)
//! variants. These macros keep the match arms in one shape so the per-engine
//! code reads linearly.

/// Generate match arms over `DbConnection` variants.
///
/// # Example
///
/// ```ignore
/// dispatch_connection!(conn, {
///     MySql(c) => mysql::run_update(c, sql).await,
///     Postgres(c) => postgres::run_update(c, sql).await,
///     Sqlite(c) => sqlite::run_update(c, sql).await,
/// })
/// ```
#[macro_export]
macro_rules! dispatch_connection {
    ($conn:expr, { $($variant:ident($c:ident) => $body:expr),+ $(,)? }) => {
        match $conn {
            $(
                $crate::db::connection::DbConnection::$variant($c) => $body,
            )+
        }
    };
}

/// Same expression for every variant, for engine-generic sqlx calls.
#[macro_export]
macro_rules! with_connection {
    ($conn:expr, $c:ident => $body:expr) => {
        $crate::dispatch_connection!($conn, {
            MySql($c) => $body,
            Postgres($c) => $body,
            Sqlite($c) => $body,
        })
    };
}

pub use dispatch_connection;
pub use with_connection;
