//! Configuration CRUD.
//!
//! [`RecordStore`] is the plain keyed record store. [`ConfigurationStore`] wraps
//! it so that every update and delete goes through the connection manager and
//! retires the configuration's pool as part of the same mutation.

mod records;

pub use records::RecordStore;

use crate::db::ConnectionManager;
use crate::error::{DbError, DbResult};
use crate::models::{ConfigId, ConfigurationRequest, DatabaseConfiguration};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone)]
pub struct ConfigurationStore {
    records: Arc<RecordStore>,
    manager: Arc<ConnectionManager>,
}

impl ConfigurationStore {
    pub fn new(records: Arc<RecordStore>, manager: Arc<ConnectionManager>) -> Self {
        Self { records, manager }
    }

    /// Validate and store a new configuration.
    pub fn save(&self, request: ConfigurationRequest) -> DbResult<DatabaseConfiguration> {
        let config = self.records.insert(request)?;
        info!(config_id = %config.id, driver = %config.driver, name = %config.name, "Configuration created");
        Ok(config)
    }

    /// Replace a configuration and drop every connection built from the old one.
    pub async fn update(
        &self,
        id: ConfigId,
        request: ConfigurationRequest,
    ) -> DbResult<DatabaseConfiguration> {
        let records = Arc::clone(&self.records);
        let config = self
            .manager
            .mutate_configuration(id, move || records.replace(id, request))
            .await?;
        info!(config_id = %id, driver = %config.driver, "Configuration updated");
        Ok(config)
    }

    pub fn get(&self, id: ConfigId) -> DbResult<DatabaseConfiguration> {
        self.records.get(id)?.ok_or(DbError::not_found(id))
    }

    /// All configurations in creation order.
    pub fn list(&self) -> DbResult<Vec<DatabaseConfiguration>> {
        self.records.list()
    }

    /// Remove a configuration after draining its pool.
    pub async fn delete(&self, id: ConfigId) -> DbResult<()> {
        let records = Arc::clone(&self.records);
        self.manager
            .mutate_configuration(id, move || records.remove(id))
            .await?;
        info!(config_id = %id, "Configuration deleted");
        Ok(())
    }
}
