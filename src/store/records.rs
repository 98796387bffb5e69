//! In-memory configuration records.

use crate::error::{DbError, DbResult};
use crate::models::configuration::join_errors;
use crate::models::{ConfigId, ConfigurationRequest, DatabaseConfiguration};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Configuration records keyed by id, ids assigned sequentially from 1.
///
/// Methods are synchronous and never hold the lock across an await, so the
/// connection manager can call them while holding its own registry lock.
#[derive(Debug)]
pub struct RecordStore {
    records: RwLock<BTreeMap<ConfigId, DatabaseConfiguration>>,
    next_id: AtomicU64,
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Validate and store a new record.
    pub fn insert(&self, request: ConfigurationRequest) -> DbResult<DatabaseConfiguration> {
        let (driver, port) = request
            .validate()
            .map_err(|errors| DbError::validation(join_errors(&errors)))?;

        let id = ConfigId(self.next_id.fetch_add(1, Ordering::AcqRel));
        let config = DatabaseConfiguration::from_validated(id, request, driver, port, Utc::now());

        self.write()?.insert(id, config.clone());
        debug!(config_id = %id, driver = %driver, "Stored configuration");
        Ok(config)
    }

    /// Validate and replace an existing record, keeping its id and creation time.
    pub fn replace(
        &self,
        id: ConfigId,
        request: ConfigurationRequest,
    ) -> DbResult<DatabaseConfiguration> {
        let (driver, port) = request
            .validate()
            .map_err(|errors| DbError::validation(join_errors(&errors)))?;

        let mut records = self.write()?;
        let existing = records.get(&id).ok_or(DbError::not_found(id))?;

        let now = Utc::now();
        let mut config = DatabaseConfiguration::from_validated(id, request, driver, port, now);
        config.created_at = existing.created_at;
        // Never move updated_at backwards if the clock stepped back
        if config.updated_at < existing.updated_at {
            config.updated_at = existing.updated_at;
        }

        records.insert(id, config.clone());
        debug!(config_id = %id, driver = %driver, "Replaced configuration");
        Ok(config)
    }

    pub fn remove(&self, id: ConfigId) -> DbResult<DatabaseConfiguration> {
        let removed = self.write()?.remove(&id).ok_or(DbError::not_found(id))?;
        debug!(config_id = %id, "Removed configuration");
        Ok(removed)
    }

    pub fn get(&self, id: ConfigId) -> DbResult<Option<DatabaseConfiguration>> {
        Ok(self.read()?.get(&id).cloned())
    }

    /// All records in id order.
    pub fn list(&self) -> DbResult<Vec<DatabaseConfiguration>> {
        Ok(self.read()?.values().cloned().collect())
    }

    fn read(
        &self,
    ) -> DbResult<std::sync::RwLockReadGuard<'_, BTreeMap<ConfigId, DatabaseConfiguration>>> {
        self.records
            .read()
            .map_err(|_| DbError::internal("Configuration store lock poisoned"))
    }

    fn write(
        &self,
    ) -> DbResult<std::sync::RwLockWriteGuard<'_, BTreeMap<ConfigId, DatabaseConfiguration>>> {
        self.records
            .write()
            .map_err(|_| DbError::internal("Configuration store lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DriverFamily;

    fn postgres_request(name: &str) -> ConfigurationRequest {
        ConfigurationRequest {
            name: name.to_string(),
            driver: "postgresql".to_string(),
            host: "db.internal".to_string(),
            port: 5432,
            username: "reporter".to_string(),
            encrypted_password: "c2VjcmV0".to_string(),
            database: "warehouse".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_ids_are_sequential() {
        let store = RecordStore::new();
        let a = store.insert(postgres_request("a")).unwrap();
        let b = store.insert(postgres_request("b")).unwrap();
        assert_eq!(a.id, ConfigId(1));
        assert_eq!(b.id, ConfigId(2));
        assert_eq!(a.driver, DriverFamily::Postgres);
    }

    #[test]
    fn test_invalid_request_is_not_stored() {
        let store = RecordStore::new();
        let err = store
            .insert(ConfigurationRequest {
                port: 70000,
                ..postgres_request("bad")
            })
            .unwrap_err();
        assert!(matches!(err, DbError::Validation { .. }));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_replace_keeps_identity() {
        let store = RecordStore::new();
        let original = store.insert(postgres_request("orders")).unwrap();
        let replaced = store
            .replace(
                original.id,
                ConfigurationRequest {
                    database: "archive".to_string(),
                    ..postgres_request("orders")
                },
            )
            .unwrap();
        assert_eq!(replaced.id, original.id);
        assert_eq!(replaced.created_at, original.created_at);
        assert!(replaced.updated_at >= original.updated_at);
        assert_eq!(store.get(original.id).unwrap().unwrap().database, "archive");
    }

    #[test]
    fn test_updated_at_never_decreases() {
        let store = RecordStore::new();
        let original = store.insert(postgres_request("orders")).unwrap();

        let mut previous = original.updated_at;
        for _ in 0..5 {
            let replaced = store
                .replace(original.id, postgres_request("orders"))
                .unwrap();
            assert!(replaced.updated_at >= previous);
            assert!(replaced.updated_at >= replaced.created_at);
            previous = replaced.updated_at;
        }
        assert_eq!(store.get(original.id).unwrap().unwrap().updated_at, previous);
    }

    #[test]
    fn test_replace_and_remove_missing() {
        let store = RecordStore::new();
        assert!(matches!(
            store.replace(ConfigId(5), postgres_request("x")),
            Err(DbError::NotFound { .. })
        ));
        assert!(matches!(
            store.remove(ConfigId(5)),
            Err(DbError::NotFound { .. })
        ));
    }
}
