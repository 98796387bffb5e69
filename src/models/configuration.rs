//! Configuration-related data models.
//!
//! A [`DatabaseConfiguration`] is the stored connection profile. Callers submit
//! a [`ConfigurationRequest`], which is validated before anything is stored.

use crate::config::PoolOptions;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Identifier assigned to a configuration on creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigId(pub u64);

impl std::fmt::Display for ConfigId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ConfigId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverFamily {
    /// Includes MariaDB
    #[serde(alias = "mariadb")]
    MySql,
    #[serde(alias = "postgresql")]
    Postgres,
    Sqlite,
}

impl DriverFamily {
    /// Get the display name for this driver family.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::MySql => "MySQL",
            Self::Postgres => "PostgreSQL",
            Self::Sqlite => "SQLite",
        }
    }

    /// Get the default port for this driver family.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::Postgres => Some(5432),
            Self::MySql => Some(3306),
            Self::Sqlite => None,
        }
    }

    /// Whether connections go over the network (host and port are required).
    pub fn is_networked(&self) -> bool {
        !matches!(self, Self::Sqlite)
    }
}

impl FromStr for DriverFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(Self::MySql),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("Unknown driver family '{}'.", other)),
        }
    }
}

impl std::fmt::Display for DriverFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Create/update payload for a configuration.
///
/// Fields are deliberately loose (free-text driver, wide port) so bad values
/// reach validation instead of failing deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationRequest {
    pub name: String,
    pub driver: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u32,
    #[serde(default)]
    pub username: String,
    /// Encrypted form of the password, as handed over by the caller.
    #[serde(default)]
    pub encrypted_password: String,
    pub database: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// Field-level validation failures for a configuration payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Name must not be empty.")]
    EmptyName,

    #[error("{0}")]
    UnknownDriver(String),

    #[error("Host must not be empty.")]
    EmptyHost,

    #[error("Port must be between 1 and 65535, got {0}.")]
    InvalidPort(u32),

    #[error("Database must not be empty.")]
    EmptyDatabase,

    #[error("{0}")]
    InvalidOption(String),

    #[error("Unsupported SQLite parameter '{0}'.")]
    UnsupportedParam(String),
}

/// SQLite has no URL query to forward unknown parameters to.
pub const SQLITE_PARAMS: &[&str] = &["read_only", "create_if_missing", "busy_timeout", "foreign_keys"];

impl ConfigurationRequest {
    /// Validate every field, returning all failures at once.
    pub fn validate(&self) -> Result<(DriverFamily, u16), Vec<ConfigurationError>> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push(ConfigurationError::EmptyName);
        }

        let family = match self.driver.parse::<DriverFamily>() {
            Ok(family) => Some(family),
            Err(msg) => {
                errors.push(ConfigurationError::UnknownDriver(msg));
                None
            }
        };

        let networked = family.is_none_or(|f| f.is_networked());
        let port = if networked {
            if self.host.trim().is_empty() {
                errors.push(ConfigurationError::EmptyHost);
            }
            match u16::try_from(self.port) {
                Ok(port) if port != 0 => port,
                _ => {
                    errors.push(ConfigurationError::InvalidPort(self.port));
                    0
                }
            }
        } else {
            u16::try_from(self.port).unwrap_or(0)
        };

        if self.database.trim().is_empty() {
            errors.push(ConfigurationError::EmptyDatabase);
        }

        if let Err(messages) = PoolOptions::from_params(&self.params) {
            errors.extend(messages.into_iter().map(ConfigurationError::InvalidOption));
        }

        if family == Some(DriverFamily::Sqlite) {
            for key in self.params.keys() {
                let lower = key.to_ascii_lowercase();
                if !PoolOptions::is_reserved(&lower) && !SQLITE_PARAMS.contains(&lower.as_str()) {
                    errors.push(ConfigurationError::UnsupportedParam(key.clone()));
                }
            }
        }

        match family {
            Some(family) if errors.is_empty() => Ok((family, port)),
            _ => Err(errors),
        }
    }
}

/// Join validation failures into one message, space separated.
pub fn join_errors(errors: &[ConfigurationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// A stored connection profile.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfiguration {
    pub id: ConfigId,
    pub name: String,
    pub driver: DriverFamily,
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Never decrypted at rest; see `SecretResolver`.
    pub encrypted_password: String,
    pub database: String,
    pub params: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DatabaseConfiguration {
    /// Build a record from an already validated request.
    pub fn from_validated(
        id: ConfigId,
        request: ConfigurationRequest,
        driver: DriverFamily,
        port: u16,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: request.name.trim().to_string(),
            driver,
            host: request.host.trim().to_string(),
            port,
            username: request.username,
            encrypted_password: request.encrypted_password,
            database: request.database.trim().to_string(),
            params: request.params,
            created_at: now,
            updated_at: now,
        }
    }

    /// Gateway options from the reserved parameters.
    ///
    /// Records are validated on the way in, so a parse failure here falls back
    /// to defaults.
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions::from_params(&self.params).unwrap_or_default()
    }

    /// Parameters forwarded to the driver (reserved keys removed).
    pub fn driver_params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params
            .iter()
            .filter(|(k, _)| !PoolOptions::is_reserved(k))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl std::fmt::Debug for DatabaseConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfiguration")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("driver", &self.driver)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("encrypted_password", &"****")
            .field("database", &self.database)
            .field("params", &self.params)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}
