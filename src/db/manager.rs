//! Registry of per-configuration pools.
//!
//! # Design Decisions
//!
//! - **One pool per configuration id**, created lazily on first acquire from
//!   the current record. Creation does no I/O, so the write lock is held only
//!   for a map insert.
//! - **Configuration changes swap pools**: [`ConnectionManager::mutate_configuration`]
//!   runs the record mutation and retires the pool under the same write lock.
//!   An acquire re-checks retirement under the read lock before handing out a
//!   connection, so no caller ever receives a connection built from a record
//!   older than the last completed update.
//! - **Background sweeper holds a `Weak`** and exits once the manager is dropped.

use crate::config::PoolSettings;
use crate::db::connection::{PlaintextSecrets, SecretResolver};
use crate::db::pool::{ConfigPool, PoolStatus, PooledConnection};
use crate::error::{DbError, DbResult};
use crate::models::ConfigId;
use crate::store::RecordStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Owns every pool and the idle sweeper.
pub struct ConnectionManager {
    records: Arc<RecordStore>,
    settings: PoolSettings,
    secrets: Arc<dyn SecretResolver>,
    pools: RwLock<HashMap<ConfigId, Arc<ConfigPool>>>,
    generation: AtomicU64,
    closed: AtomicBool,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a manager with stored passwords used as-is.
    ///
    /// Must be called within a Tokio runtime (spawns the idle sweeper).
    pub fn new(records: Arc<RecordStore>, settings: PoolSettings) -> Arc<Self> {
        Self::with_secrets(records, settings, Arc::new(PlaintextSecrets))
    }

    pub fn with_secrets(
        records: Arc<RecordStore>,
        settings: PoolSettings,
        secrets: Arc<dyn SecretResolver>,
    ) -> Arc<Self> {
        let sweep_interval = settings.sweep_interval;
        let manager = Arc::new(Self {
            records,
            settings,
            secrets,
            pools: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            sweeper: std::sync::Mutex::new(None),
        });

        let weak = Arc::downgrade(&manager);
        let handle = tokio::spawn(Self::sweep_task(weak, sweep_interval));
        *manager.sweeper.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        manager
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Borrow a connection for a configuration.
    ///
    /// Waits up to `timeout` for capacity, then fails with `PoolExhausted`.
    /// Fails with `NotFound` when the configuration does not exist and with
    /// `ConnectionError` when establishment keeps failing.
    pub async fn acquire(&self, id: ConfigId, timeout: Duration) -> DbResult<PooledConnection> {
        let deadline = Instant::now() + timeout;

        loop {
            self.ensure_open()?;
            let pool = self.pool_for(id).await?;
            let remaining = deadline.saturating_duration_since(Instant::now());

            match pool.checkout(&self.settings, self.secrets.as_ref(), remaining).await {
                Ok(handle) => {
                    // Linearize with configuration mutations
                    let pools = self.pools.read().await;
                    if !pool.is_retired() {
                        drop(pools);
                        return Ok(handle);
                    }
                    drop(pools);
                    debug!(config_id = %id, "Pool retired during acquire, retrying");
                    handle.release(true).await;
                }
                Err(e) if pool.is_retired() => {
                    debug!(config_id = %id, error = %e, "Pool retired while waiting, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Return a borrowed connection. Unhealthy connections are destroyed.
    pub async fn release(&self, handle: PooledConnection, healthy: bool) {
        handle.release(healthy).await;
    }

    /// Apply a record mutation and retire the configuration's pool atomically.
    ///
    /// Idle connections are closed right away. Borrowed ones refuse further
    /// statements, and this waits up to `drain_timeout` for their holders to
    /// release them. If `mutate` fails, the pool is left untouched.
    pub async fn mutate_configuration<T>(
        &self,
        id: ConfigId,
        mutate: impl FnOnce() -> DbResult<T>,
    ) -> DbResult<T> {
        let (value, retired) = {
            let mut pools = self.pools.write().await;
            let value = mutate()?;
            // Retire while the write lock is held
            let retired = pools.remove(&id).map(|pool| {
                let drained = pool.retire();
                (pool, drained)
            });
            (value, retired)
        };

        if let Some((pool, drained)) = retired {
            let closed = pool
                .close_drained(drained, self.settings.validation_timeout)
                .await;
            if !pool.wait_drained(self.settings.drain_timeout).await {
                warn!(
                    config_id = %id,
                    still_borrowed = pool.status().open,
                    waited_ms = self.settings.drain_timeout.as_millis() as u64,
                    "Borrowed connections outlived the configuration change"
                );
            }
            info!(config_id = %id, closed, "Invalidated pool after configuration change");
        }
        Ok(value)
    }

    /// Retire the pool of a configuration without changing the record.
    pub async fn invalidate(&self, id: ConfigId) {
        // Infallible mutation
        let _ = self.mutate_configuration(id, || Ok(())).await;
    }

    /// Status of a configuration's pool, if one has been created.
    pub async fn pool_status(&self, id: ConfigId) -> Option<PoolStatus> {
        self.pools.read().await.get(&id).map(|pool| pool.status())
    }

    pub async fn pool_count(&self) -> usize {
        self.pools.read().await.len()
    }

    /// One idle-eviction pass over every pool.
    pub async fn sweep_idle(&self) -> usize {
        let pools: Vec<Arc<ConfigPool>> = self.pools.read().await.values().cloned().collect();

        let mut evicted = 0;
        for pool in pools {
            evicted += pool.evict_idle(self.settings.validation_timeout).await;
        }
        evicted
    }

    /// Close every pool and refuse further acquires.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }

        let pools: Vec<Arc<ConfigPool>> = {
            let mut pools = self.pools.write().await;
            pools.drain().map(|(_, pool)| pool).collect()
        };
        let count = pools.len();
        let mut closed = 0;
        for pool in pools {
            closed += pool.shutdown(self.settings.validation_timeout).await;
            if !pool.wait_drained(self.settings.drain_timeout).await {
                warn!(config_id = %pool.config_id(), "Borrowed connections still open at shutdown");
            }
        }
        info!(pools = count, connections = closed, "Connection manager shut down");
    }

    fn ensure_open(&self) -> DbResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::connection(
                "Connection manager is shut down",
                "Restart the gateway",
            ));
        }
        Ok(())
    }

    /// Existing pool, or a fresh one built from the current record.
    async fn pool_for(&self, id: ConfigId) -> DbResult<Arc<ConfigPool>> {
        if let Some(pool) = self.pools.read().await.get(&id) {
            return Ok(Arc::clone(pool));
        }

        let mut pools = self.pools.write().await;
        if let Some(pool) = pools.get(&id) {
            return Ok(Arc::clone(pool));
        }
        self.ensure_open()?;

        let config = self.records.get(id)?.ok_or(DbError::not_found(id))?;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let pool = ConfigPool::new(config, &self.settings, generation);
        info!(
            config_id = %id,
            driver = %pool.family(),
            capacity = pool.status().capacity,
            generation,
            "Created connection pool"
        );
        pools.insert(id, Arc::clone(&pool));
        Ok(pool)
    }

    async fn sweep_task(weak: Weak<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Some(manager) = weak.upgrade() else {
                info!("Connection manager dropped, idle sweeper exiting");
                return;
            };

            let evicted = manager.sweep_idle().await;
            if evicted > 0 {
                debug!(evicted, "Idle sweep closed connections");
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("settings", &self.settings)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConfigurationRequest;
    use std::collections::BTreeMap;

    fn sqlite_request(path: &str, params: &[(&str, &str)]) -> ConfigurationRequest {
        ConfigurationRequest {
            name: "local".to_string(),
            driver: "sqlite".to_string(),
            database: path.to_string(),
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_acquire_unknown_id_is_not_found() {
        let manager = ConnectionManager::new(Arc::new(RecordStore::new()), PoolSettings::default());
        let err = manager
            .acquire(ConfigId(42), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound { id } if id == ConfigId(42)));
        assert_eq!(manager.pool_count().await, 0);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wait.db");
        let records = Arc::new(RecordStore::new());
        let config = records
            .insert(sqlite_request(path.to_str().unwrap(), &[]))
            .unwrap();
        let manager = ConnectionManager::new(Arc::clone(&records), PoolSettings::default());

        let held = manager.acquire(config.id, Duration::from_secs(1)).await.unwrap();

        let mut waiter = tokio_test::task::spawn(manager.acquire(config.id, Duration::from_secs(5)));
        tokio_test::assert_pending!(waiter.poll());

        manager.release(held, true).await;
        assert!(waiter.is_woken());
        drop(waiter);

        // The abandoned waiter left nothing borrowed
        let status = manager.pool_status(config.id).await.unwrap();
        assert_eq!(status.in_use, 0);
        assert_eq!(status.open, 1);
    }

    #[tokio::test]
    async fn test_pool_created_lazily_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lazy.db");
        let records = Arc::new(RecordStore::new());
        let config = records
            .insert(sqlite_request(path.to_str().unwrap(), &[]))
            .unwrap();
        let manager = ConnectionManager::new(Arc::clone(&records), PoolSettings::default());

        assert!(manager.pool_status(config.id).await.is_none());
        let handle = manager.acquire(config.id, Duration::from_secs(1)).await.unwrap();
        manager.release(handle, true).await;

        let handle = manager.acquire(config.id, Duration::from_secs(1)).await.unwrap();
        manager.release(handle, true).await;

        let status = manager.pool_status(config.id).await.unwrap();
        assert_eq!(status.open, 1);
        assert_eq!(status.in_use, 0);
        assert_eq!(status.generation, 1);
    }

    #[tokio::test]
    async fn test_invalidate_creates_new_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gen.db");
        let records = Arc::new(RecordStore::new());
        let config = records
            .insert(sqlite_request(path.to_str().unwrap(), &[]))
            .unwrap();
        let manager = ConnectionManager::new(Arc::clone(&records), PoolSettings::default());

        let handle = manager.acquire(config.id, Duration::from_secs(1)).await.unwrap();
        manager.release(handle, true).await;
        manager.invalidate(config.id).await;
        assert!(manager.pool_status(config.id).await.is_none());

        let handle = manager.acquire(config.id, Duration::from_secs(1)).await.unwrap();
        manager.release(handle, true).await;
        assert_eq!(manager.pool_status(config.id).await.unwrap().generation, 2);
    }

    #[tokio::test]
    async fn test_failed_mutation_keeps_pool() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keep.db");
        let records = Arc::new(RecordStore::new());
        let config = records
            .insert(sqlite_request(path.to_str().unwrap(), &[]))
            .unwrap();
        let manager = ConnectionManager::new(Arc::clone(&records), PoolSettings::default());

        let handle = manager.acquire(config.id, Duration::from_secs(1)).await.unwrap();
        manager.release(handle, true).await;

        let result: DbResult<()> = manager
            .mutate_configuration(config.id, || Err(DbError::validation("rejected")))
            .await;
        assert!(result.is_err());
        assert_eq!(manager.pool_status(config.id).await.unwrap().idle, 1);
    }

    #[tokio::test]
    async fn test_delete_waits_for_borrowed_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("borrowed.db");
        let records = Arc::new(RecordStore::new());
        let config = records
            .insert(sqlite_request(path.to_str().unwrap(), &[]))
            .unwrap();
        let manager = ConnectionManager::new(Arc::clone(&records), PoolSettings::default());

        let mut held = manager.acquire(config.id, Duration::from_secs(1)).await.unwrap();
        held.connection().unwrap().ping().await.unwrap();

        let delete = {
            let manager = Arc::clone(&manager);
            let records = Arc::clone(&records);
            tokio::spawn(async move {
                manager
                    .mutate_configuration(config.id, || records.remove(config.id))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!delete.is_finished(), "delete returned while a connection was open");

        // The held handle can no longer run statements
        assert!(matches!(held.connection(), Err(DbError::Connection { .. })));

        manager.release(held, true).await;
        delete.await.unwrap().unwrap();
        assert!(manager.pool_status(config.id).await.is_none());
    }

    #[tokio::test]
    async fn test_drain_wait_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bounded.db");
        let records = Arc::new(RecordStore::new());
        let config = records
            .insert(sqlite_request(path.to_str().unwrap(), &[]))
            .unwrap();
        let settings = PoolSettings {
            drain_timeout: Duration::from_millis(50),
            ..PoolSettings::default()
        };
        let manager = ConnectionManager::new(Arc::clone(&records), settings);

        let mut held = manager.acquire(config.id, Duration::from_secs(1)).await.unwrap();
        let start = Instant::now();
        manager.invalidate(config.id).await;
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_secs(5));

        assert!(held.connection().is_err());
        manager.release(held, true).await;

        // The next borrower gets a connection from a fresh pool
        let mut fresh = manager.acquire(config.id, Duration::from_secs(1)).await.unwrap();
        fresh.connection().unwrap().ping().await.unwrap();
        manager.release(fresh, true).await;
        assert_eq!(manager.pool_status(config.id).await.unwrap().generation, 2);
    }

    #[tokio::test]
    async fn test_sweeper_evicts_idle_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sweep.db");
        let records = Arc::new(RecordStore::new());
        let config = records
            .insert(sqlite_request(path.to_str().unwrap(), &[("idle_timeout", "50ms")]))
            .unwrap();
        let settings = PoolSettings {
            sweep_interval: Duration::from_millis(30),
            ..PoolSettings::default()
        };
        let manager = ConnectionManager::new(Arc::clone(&records), settings);

        let handle = manager.acquire(config.id, Duration::from_secs(1)).await.unwrap();
        manager.release(handle, true).await;
        assert_eq!(manager.pool_status(config.id).await.unwrap().open, 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        let status = manager.pool_status(config.id).await.unwrap();
        assert_eq!(status.open, 0);
        assert_eq!(status.idle, 0);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shutdown.db");
        let records = Arc::new(RecordStore::new());
        let config = records
            .insert(sqlite_request(path.to_str().unwrap(), &[]))
            .unwrap();
        let manager = ConnectionManager::new(Arc::clone(&records), PoolSettings::default());

        let handle = manager.acquire(config.id, Duration::from_secs(1)).await.unwrap();
        manager.release(handle, true).await;
        manager.shutdown().await;

        assert_eq!(manager.pool_count().await, 0);
        let err = manager
            .acquire(config.id, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Connection { .. }));
    }
}
