//! Configuration handling for the SQL gateway.
//!
//! Process-wide defaults come from CLI arguments and environment variables
//! ([`Config`]). Per-configuration overrides come from reserved keys in a
//! configuration's extra parameters ([`PoolOptions`]).

use crate::models::DriverFamily;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_STATEMENT_TIMEOUT_SECS: u64 = 30;
pub const MAX_STATEMENT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 100;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 2_000;
pub const DEFAULT_VALIDATION_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_MAX_CONNECTIONS_SQLITE: u32 = 1;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

// Result shaping defaults
pub const DEFAULT_MAX_ROWS: u32 = 1_000;
pub const MAX_ROW_LIMIT: u32 = 10_000;
pub const DEFAULT_METADATA_BATCH_SIZE: u32 = 500;

/// Process-wide pool behavior shared by every configuration.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub max_connections_sqlite: u32,
    pub acquire_timeout: Duration,
    pub connect_timeout: Duration,
    /// Total connection establishment attempts, including the first.
    pub connect_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub validation_timeout: Duration,
    /// How long update/delete wait for borrowed connections to come back.
    pub drain_timeout: Duration,
    pub test_before_acquire: bool,
}

impl PoolSettings {
    /// Delay before the given retry (1-based), doubling from the base and capped.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_connections_sqlite: DEFAULT_MAX_CONNECTIONS_SQLITE,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            backoff_max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            validation_timeout: Duration::from_secs(DEFAULT_VALIDATION_TIMEOUT_SECS),
            drain_timeout: Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS),
            test_before_acquire: true,
        }
    }
}

/// Process-wide statement execution behavior.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub statement_timeout: Duration,
    pub max_statement_timeout: Duration,
    pub max_rows: u32,
    pub metadata_batch_size: u32,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            statement_timeout: Duration::from_secs(DEFAULT_STATEMENT_TIMEOUT_SECS),
            max_statement_timeout: Duration::from_secs(MAX_STATEMENT_TIMEOUT_SECS),
            max_rows: DEFAULT_MAX_ROWS,
            metadata_batch_size: DEFAULT_METADATA_BATCH_SIZE,
        }
    }
}

/// Per-configuration overrides parsed from reserved extra parameters.
///
/// Reserved keys are consumed by the gateway; every other parameter is
/// handed to the driver.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PoolOptions {
    pub max_connections: Option<u32>,
    pub acquire_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub test_before_acquire: Option<bool>,
    pub statement_timeout: Option<Duration>,
    pub max_rows: Option<u32>,
    /// Catalog namespace used by metadata introspection.
    pub schema: Option<String>,
}

impl PoolOptions {
    /// Extra parameter keys that are gateway options rather than driver parameters.
    pub const RESERVED_KEYS: &'static [&'static str] = &[
        "max_connections",
        "acquire_timeout",
        "idle_timeout",
        "test_before_acquire",
        "statement_timeout",
        "max_rows",
        "schema",
    ];

    /// Whether a parameter key is consumed by the gateway.
    pub fn is_reserved(key: &str) -> bool {
        Self::RESERVED_KEYS.contains(&key.to_ascii_lowercase().as_str())
    }

    /// Parse the reserved keys out of a parameter map.
    ///
    /// Collects every problem instead of stopping at the first one.
    pub fn from_params(params: &BTreeMap<String, String>) -> Result<Self, Vec<String>> {
        let mut opts = Self::default();
        let mut errors = Vec::new();

        for (key, value) in params {
            let value = value.trim();
            match key.to_ascii_lowercase().as_str() {
                "max_connections" => match value.parse::<u32>() {
                    Ok(0) | Err(_) => errors.push(format!(
                        "max_connections must be a positive integer, got '{}'.",
                        value
                    )),
                    Ok(n) => opts.max_connections = Some(n),
                },
                "acquire_timeout" => {
                    opts.acquire_timeout = parse_duration_into("acquire_timeout", value, &mut errors)
                }
                "idle_timeout" => {
                    opts.idle_timeout = parse_duration_into("idle_timeout", value, &mut errors)
                }
                "statement_timeout" => {
                    opts.statement_timeout =
                        parse_duration_into("statement_timeout", value, &mut errors)
                }
                "test_before_acquire" => {
                    if value.eq_ignore_ascii_case("true") {
                        opts.test_before_acquire = Some(true);
                    } else if value.eq_ignore_ascii_case("false") {
                        opts.test_before_acquire = Some(false);
                    } else {
                        errors.push(format!(
                            "test_before_acquire must be true or false, got '{}'.",
                            value
                        ));
                    }
                }
                "max_rows" => match value.parse::<u32>() {
                    Ok(n) if (1..=MAX_ROW_LIMIT).contains(&n) => opts.max_rows = Some(n),
                    _ => errors.push(format!(
                        "max_rows must be between 1 and {}, got '{}'.",
                        MAX_ROW_LIMIT, value
                    )),
                },
                "schema" => {
                    if value.is_empty() {
                        errors.push("schema must not be empty.".to_string());
                    } else {
                        opts.schema = Some(value.to_string());
                    }
                }
                _ => {}
            }
        }

        if errors.is_empty() {
            Ok(opts)
        } else {
            Err(errors)
        }
    }

    /// Get max_connections with default value based on driver family.
    pub fn max_connections_or_default(&self, family: DriverFamily, settings: &PoolSettings) -> u32 {
        self.max_connections.unwrap_or(match family {
            DriverFamily::Sqlite => settings.max_connections_sqlite,
            _ => settings.max_connections,
        })
    }

    pub fn idle_timeout_or_default(&self, settings: &PoolSettings) -> Duration {
        self.idle_timeout.unwrap_or(settings.idle_timeout)
    }

    pub fn acquire_timeout_or_default(&self, settings: &PoolSettings) -> Duration {
        self.acquire_timeout.unwrap_or(settings.acquire_timeout)
    }

    pub fn test_before_acquire_or_default(&self, settings: &PoolSettings) -> bool {
        self.test_before_acquire
            .unwrap_or(settings.test_before_acquire)
    }

    pub fn statement_timeout_or_default(&self, settings: &ExecutorSettings) -> Duration {
        self.statement_timeout.unwrap_or(settings.statement_timeout)
    }

    pub fn max_rows_or_default(&self, settings: &ExecutorSettings) -> u32 {
        self.max_rows
            .unwrap_or(settings.max_rows)
            .clamp(1, MAX_ROW_LIMIT)
    }
}

/// Parse `250ms`, `5s` or a bare number of seconds.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Some(ms) = value.strip_suffix("ms") {
        return ms.trim().parse::<u64>().ok().map(Duration::from_millis);
    }
    let secs = value.strip_suffix('s').unwrap_or(value);
    secs.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn parse_duration_into(key: &str, value: &str, errors: &mut Vec<String>) -> Option<Duration> {
    match parse_duration(value) {
        Some(d) if !d.is_zero() => Some(d),
        _ => {
            errors.push(format!(
                "{} must be a positive duration such as 500ms or 30s, got '{}'.",
                key, value
            ));
            None
        }
    }
}

/// Operation to run once the profiles are loaded.
#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// List all configurations
    List,
    /// Show one configuration
    Show {
        /// Configuration id
        id: u64,
    },
    /// Print table and column metadata for a configuration
    Metadata {
        /// Configuration id
        id: u64,
    },
    /// Execute one SQL statement and print the normalized result
    Execute {
        /// Configuration id
        id: u64,
        /// SQL text (single statement)
        sql: String,
        /// Statement timeout override in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

/// Configuration for the SQL gateway binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "sql-gateway",
    about = "Pooled, multi-database SQL gateway - manage connection profiles, inspect schemas and run ad-hoc SQL",
    version,
    author
)]
pub struct Config {
    /// JSON file holding an array of configuration payloads to register at startup
    #[arg(short = 'p', long, value_name = "FILE", env = "SQL_GATEWAY_PROFILES")]
    pub profiles: Option<PathBuf>,

    /// Default maximum connections per configuration (MySQL/PostgreSQL)
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS, env = "SQL_GATEWAY_MAX_CONNECTIONS")]
    pub max_connections: u32,

    /// Seconds to wait for a free connection before failing
    #[arg(long, default_value_t = DEFAULT_ACQUIRE_TIMEOUT_SECS, env = "SQL_GATEWAY_ACQUIRE_TIMEOUT")]
    pub acquire_timeout: u64,

    /// Connection timeout in seconds (per attempt)
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS, env = "SQL_GATEWAY_CONNECT_TIMEOUT")]
    pub connect_timeout: u64,

    /// Connection establishment attempts before giving up
    #[arg(long, default_value_t = DEFAULT_CONNECT_ATTEMPTS, env = "SQL_GATEWAY_CONNECT_ATTEMPTS")]
    pub connect_attempts: u32,

    /// Idle connections older than this many seconds are closed
    #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT_SECS, env = "SQL_GATEWAY_IDLE_TIMEOUT")]
    pub idle_timeout: u64,

    /// Seconds between idle sweeps
    #[arg(long, default_value_t = DEFAULT_SWEEP_INTERVAL_SECS, env = "SQL_GATEWAY_SWEEP_INTERVAL")]
    pub sweep_interval: u64,

    /// Seconds a configuration change waits for borrowed connections to close
    #[arg(long, default_value_t = DEFAULT_DRAIN_TIMEOUT_SECS, env = "SQL_GATEWAY_DRAIN_TIMEOUT")]
    pub drain_timeout: u64,

    /// Statement timeout in seconds
    #[arg(long, default_value_t = DEFAULT_STATEMENT_TIMEOUT_SECS, env = "SQL_GATEWAY_STATEMENT_TIMEOUT")]
    pub statement_timeout: u64,

    /// Maximum rows returned by a row-returning statement
    #[arg(long, default_value_t = DEFAULT_MAX_ROWS, env = "SQL_GATEWAY_MAX_ROWS")]
    pub max_rows: u32,

    /// Catalog rows fetched per metadata batch
    #[arg(long, default_value_t = DEFAULT_METADATA_BATCH_SIZE, env = "SQL_GATEWAY_METADATA_BATCH_SIZE")]
    pub metadata_batch_size: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "SQL_GATEWAY_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "SQL_GATEWAY_JSON_LOGS")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Config {
    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            profiles: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT_SECS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT_SECS,
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT_SECS,
            sweep_interval: DEFAULT_SWEEP_INTERVAL_SECS,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT_SECS,
            statement_timeout: DEFAULT_STATEMENT_TIMEOUT_SECS,
            max_rows: DEFAULT_MAX_ROWS,
            metadata_batch_size: DEFAULT_METADATA_BATCH_SIZE,
            log_level: "info".to_string(),
            json_logs: false,
            command: Command::List,
        }
    }

    /// Pool settings derived from the CLI values.
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_connections: self.max_connections.max(1),
            acquire_timeout: Duration::from_secs(self.acquire_timeout),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            connect_attempts: self.connect_attempts.max(1),
            idle_timeout: Duration::from_secs(self.idle_timeout),
            sweep_interval: Duration::from_secs(self.sweep_interval.max(1)),
            drain_timeout: Duration::from_secs(self.drain_timeout),
            ..PoolSettings::default()
        }
    }

    /// Executor settings derived from the CLI values.
    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            statement_timeout: Duration::from_secs(self.statement_timeout),
            max_rows: self.max_rows.clamp(1, MAX_ROW_LIMIT),
            metadata_batch_size: self.metadata_batch_size.max(1),
            ..ExecutorSettings::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}
