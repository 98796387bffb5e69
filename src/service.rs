//! Service facade wiring the store, pools, executor and introspector together.
//!
//! This is the surface a transport layer calls into. Every operation returns a
//! [`DbResult`] so callers can map [`DbError::kind`](crate::error::DbError::kind)
//! to a code or collapse it into a message.

use crate::config::{ExecutorSettings, PoolSettings};
use crate::db::{ConnectionManager, MetadataIntrospector, PoolStatus, SecretResolver, SqlExecutor};
use crate::error::DbResult;
use crate::models::{
    ConfigId, ConfigurationRequest, DatabaseConfiguration, NormalizedResult, SchemaMetadata,
    SqlStatement,
};
use crate::store::{ConfigurationStore, RecordStore};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone)]
pub struct DatabaseService {
    store: ConfigurationStore,
    manager: Arc<ConnectionManager>,
    executor: SqlExecutor,
    introspector: MetadataIntrospector,
}

impl DatabaseService {
    /// Must be called within a Tokio runtime.
    pub fn new(pool_settings: PoolSettings, executor_settings: ExecutorSettings) -> Self {
        let records = Arc::new(RecordStore::new());
        let manager = ConnectionManager::new(Arc::clone(&records), pool_settings);
        Self::assemble(records, manager, executor_settings)
    }

    /// Same as [`DatabaseService::new`] with a custom password resolver.
    pub fn with_secrets(
        pool_settings: PoolSettings,
        executor_settings: ExecutorSettings,
        secrets: Arc<dyn SecretResolver>,
    ) -> Self {
        let records = Arc::new(RecordStore::new());
        let manager = ConnectionManager::with_secrets(Arc::clone(&records), pool_settings, secrets);
        Self::assemble(records, manager, executor_settings)
    }

    fn assemble(
        records: Arc<RecordStore>,
        manager: Arc<ConnectionManager>,
        settings: ExecutorSettings,
    ) -> Self {
        let introspector = MetadataIntrospector::new(
            Arc::clone(&manager),
            Arc::clone(&records),
            settings.metadata_batch_size,
            settings.statement_timeout,
        );
        let executor = SqlExecutor::new(Arc::clone(&manager), Arc::clone(&records), settings);
        let store = ConfigurationStore::new(records, Arc::clone(&manager));
        Self {
            store,
            manager,
            executor,
            introspector,
        }
    }

    pub fn save(&self, request: ConfigurationRequest) -> DbResult<DatabaseConfiguration> {
        self.store.save(request)
    }

    pub async fn update(
        &self,
        id: ConfigId,
        request: ConfigurationRequest,
    ) -> DbResult<DatabaseConfiguration> {
        self.store.update(id, request).await
    }

    pub fn get(&self, id: ConfigId) -> DbResult<DatabaseConfiguration> {
        self.store.get(id)
    }

    pub async fn delete(&self, id: ConfigId) -> DbResult<()> {
        self.store.delete(id).await
    }

    pub fn list(&self) -> DbResult<Vec<DatabaseConfiguration>> {
        self.store.list()
    }

    pub async fn introspect(&self, id: ConfigId) -> DbResult<SchemaMetadata> {
        self.introspector.introspect(id).await
    }

    pub async fn execute(&self, statement: &SqlStatement) -> DbResult<NormalizedResult> {
        self.executor.execute(statement).await
    }

    /// `None` until the configuration's pool has been created by a first acquire.
    pub async fn pool_status(&self, id: ConfigId) -> Option<PoolStatus> {
        self.manager.pool_status(id).await
    }

    /// Close every pool. Later calls fail with a connection error.
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
        info!("Database service shut down");
    }
}
