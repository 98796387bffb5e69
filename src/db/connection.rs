//! Driver connections.
//!
//! [`DbConnection`] holds one native sqlx connection per engine (avoids AnyConnection
//! limitations). Engine capabilities are methods on it that dispatch per variant:
//! `connect`, `ping` and `close` live here, `run_query`/`run_update` in the executor
//! and `introspect_catalog` in the schema module.

use crate::config::parse_duration;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseConfiguration, DriverFamily};
use crate::with_connection;
use sqlx::mysql::MySqlConnectOptions;
use sqlx::postgres::PgConnectOptions;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection, MySqlConnection, PgConnection, SqliteConnection};
use std::str::FromStr;
use tracing::{debug, warn};
use url::Url;

/// Turns the stored (encrypted) password into the secret handed to the driver.
pub trait SecretResolver: Send + Sync + std::fmt::Debug {
    fn reveal(&self, config: &DatabaseConfiguration) -> DbResult<String>;
}

/// Uses the stored value as-is, for deployments that decrypt before storing
/// or run without passwords.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextSecrets;

impl SecretResolver for PlaintextSecrets {
    fn reveal(&self, config: &DatabaseConfiguration) -> DbResult<String> {
        Ok(config.encrypted_password.clone())
    }
}

/// Engine-specific live connection.
#[derive(Debug)]
pub enum DbConnection {
    MySql(MySqlConnection),
    Postgres(PgConnection),
    Sqlite(SqliteConnection),
}

impl DbConnection {
    /// Open a new session for a configuration.
    pub async fn connect(config: &DatabaseConfiguration, password: &str) -> DbResult<Self> {
        debug!(
            config_id = %config.id,
            driver = %config.driver,
            "Opening connection"
        );

        match config.driver {
            DriverFamily::MySql => {
                let url = network_url("mysql", config, password)?;
                let options = MySqlConnectOptions::from_str(url.as_str())
                    .map_err(|e| {
                        DbError::connection(
                            format!("Invalid MySQL connection options: {}", e),
                            "Check the host, database and driver parameters",
                        )
                    })?
                    .charset("utf8mb4");
                let conn = options
                    .connect()
                    .await
                    .map_err(|e| connect_error(config.driver, &e))?;
                Ok(Self::MySql(conn))
            }
            DriverFamily::Postgres => {
                let url = network_url("postgres", config, password)?;
                let options = PgConnectOptions::from_str(url.as_str()).map_err(|e| {
                    DbError::connection(
                        format!("Invalid PostgreSQL connection options: {}", e),
                        "Check the host, database and driver parameters",
                    )
                })?;
                let conn = options
                    .connect()
                    .await
                    .map_err(|e| connect_error(config.driver, &e))?;
                Ok(Self::Postgres(conn))
            }
            DriverFamily::Sqlite => {
                let options = sqlite_options(config)?;
                let conn = options
                    .connect()
                    .await
                    .map_err(|e| connect_error(config.driver, &e))?;
                Ok(Self::Sqlite(conn))
            }
        }
    }

    /// Lightweight liveness check.
    pub async fn ping(&mut self) -> DbResult<()> {
        with_connection!(self, c => c.ping().await).map_err(DbError::from)
    }

    /// Graceful close. Errors are logged, the connection is gone either way.
    pub async fn close(self) {
        let family = self.family();
        if let Err(e) = with_connection!(self, c => c.close().await) {
            warn!(driver = %family, error = %e, "Error while closing connection");
        }
    }

    pub fn family(&self) -> DriverFamily {
        match self {
            Self::MySql(_) => DriverFamily::MySql,
            Self::Postgres(_) => DriverFamily::Postgres,
            Self::Sqlite(_) => DriverFamily::Sqlite,
        }
    }
}

/// Build a driver URL for a networked engine. Reserved gateway options are
/// left out; every other parameter becomes a query pair.
pub fn network_url(
    scheme: &str,
    config: &DatabaseConfiguration,
    password: &str,
) -> DbResult<Url> {
    let invalid = |what: &str| {
        DbError::connection(
            format!("Invalid {} for configuration {}", what, config.id),
            "Check the configuration's host and credentials",
        )
    };

    let mut url = Url::parse(&format!("{}://localhost", scheme))
        .map_err(|e| DbError::internal(format!("Invalid URL scheme '{}': {}", scheme, e)))?;
    url.set_host(Some(&config.host)).map_err(|_| invalid("host"))?;
    url.set_port(Some(config.port)).map_err(|_| invalid("port"))?;
    if !config.username.is_empty() {
        url.set_username(&config.username)
            .map_err(|_| invalid("username"))?;
    }
    if !password.is_empty() {
        url.set_password(Some(password))
            .map_err(|_| invalid("password"))?;
    }
    url.set_path(&format!("/{}", config.database));

    let params: Vec<(&str, &str)> = config.driver_params().collect();
    if !params.is_empty() {
        url.query_pairs_mut().extend_pairs(params);
    }
    Ok(url)
}

/// SQLite options from the file path and the supported parameters.
pub fn sqlite_options(config: &DatabaseConfiguration) -> DbResult<SqliteConnectOptions> {
    let mut options = if config.database == ":memory:" {
        SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| DbError::internal(format!("Invalid in-memory options: {}", e)))?
    } else {
        SqliteConnectOptions::new()
            .filename(&config.database)
            .create_if_missing(true)
    };

    for (key, value) in config.driver_params() {
        options = match key.to_ascii_lowercase().as_str() {
            "read_only" => options.read_only(parse_flag(key, value)?),
            "create_if_missing" => options.create_if_missing(parse_flag(key, value)?),
            "foreign_keys" => options.foreign_keys(parse_flag(key, value)?),
            "busy_timeout" => {
                let timeout = parse_duration(value).ok_or_else(|| {
                    DbError::connection(
                        format!("Invalid busy_timeout '{}'", value),
                        "Use a duration such as 500ms or 5s",
                    )
                })?;
                options.busy_timeout(timeout)
            }
            other => {
                return Err(DbError::connection(
                    format!("Unsupported SQLite parameter '{}'", other),
                    "Remove the parameter from the configuration",
                ));
            }
        };
    }
    Ok(options)
}

fn parse_flag(key: &str, value: &str) -> DbResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(DbError::connection(
            format!("Invalid boolean for {}: '{}'", key, value),
            "Use true or false",
        )),
    }
}

/// Establishment failures are always connection errors, whatever sqlx calls them.
fn connect_error(family: DriverFamily, error: &sqlx::Error) -> DbError {
    DbError::connection(
        format!("Failed to connect: {}", error),
        connection_suggestion(family, error),
    )
}

/// Generate a helpful suggestion for connection errors.
fn connection_suggestion(family: DriverFamily, error: &sqlx::Error) -> String {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") {
        return format!("Check that the {} server is running and accessible", family);
    }

    if error_str.contains("authentication") || error_str.contains("password") {
        return "Verify the username and password of the configuration".to_string();
    }

    if error_str.contains("does not exist") || error_str.contains("unknown database") {
        return "Check that the database name exists".to_string();
    }

    if error_str.contains("tls") || error_str.contains("ssl") {
        return "Check TLS/SSL parameters or try disabling them".to_string();
    }

    match family {
        DriverFamily::Postgres | DriverFamily::MySql => {
            format!("Verify host, port and database for {}", family)
        }
        DriverFamily::Sqlite => "Verify the file path exists and is accessible".to_string(),
    }
}
