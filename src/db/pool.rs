//! Bounded per-configuration connection pool.
//!
//! # Design Decisions
//!
//! - **`Semaphore` for capacity**: one permit per borrowed connection, FIFO wait
//!   queue per pool. A connection is only opened by a permit holder that found
//!   no idle connection, so `idle + borrowed <= capacity` always holds.
//! - **`std::sync::Mutex` for the idle list**: never held across an await.
//! - **Retirement instead of mutation**: an invalidated pool is marked retired,
//!   its semaphore closed and its idle list drained. Borrowed connections of a
//!   retired pool refuse further statements and are closed on release instead
//!   of being returned. [`ConfigPool::wait_drained`] lets the retiring side wait
//!   for them.
//!
//! # Panic Safety
//!
//! [`PooledConnection`] discards its connection and frees its permit when dropped
//! without an explicit release, so an unexpected fault never leaks capacity.

use crate::config::{DEFAULT_VALIDATION_TIMEOUT_SECS, PoolOptions, PoolSettings};
use crate::db::connection::{DbConnection, SecretResolver};
use crate::error::{DbError, DbResult};
use crate::models::{ConfigId, DatabaseConfiguration, DriverFamily};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Point-in-time view of one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub config_id: ConfigId,
    pub capacity: u32,
    /// Live connections, idle or borrowed.
    pub open: usize,
    pub idle: usize,
    pub in_use: usize,
    /// Highest number of simultaneously open connections seen.
    pub peak_open: usize,
    pub generation: u64,
}

struct IdleConnection {
    conn: DbConnection,
    idle_since: Instant,
}

/// Connections for one configuration, bound to the configuration snapshot
/// the pool was created from.
pub struct ConfigPool {
    config: DatabaseConfiguration,
    capacity: u32,
    idle_timeout: Duration,
    test_before_acquire: bool,
    generation: u64,
    permits: Arc<Semaphore>,
    idle: std::sync::Mutex<VecDeque<IdleConnection>>,
    open: AtomicUsize,
    peak_open: AtomicUsize,
    retired: AtomicBool,
    // Signalled when the last open connection goes away
    drained: Notify,
    created_at: Instant,
}

impl ConfigPool {
    /// Create an empty pool. No connection is opened until the first checkout.
    pub fn new(config: DatabaseConfiguration, settings: &PoolSettings, generation: u64) -> Arc<Self> {
        let options: PoolOptions = config.pool_options();
        let capacity = options
            .max_connections_or_default(config.driver, settings)
            .max(1);

        Arc::new(Self {
            capacity,
            idle_timeout: options.idle_timeout_or_default(settings),
            test_before_acquire: options.test_before_acquire_or_default(settings),
            generation,
            permits: Arc::new(Semaphore::new(capacity as usize)),
            idle: std::sync::Mutex::new(VecDeque::new()),
            open: AtomicUsize::new(0),
            peak_open: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
            drained: Notify::new(),
            created_at: Instant::now(),
            config,
        })
    }

    pub fn config_id(&self) -> ConfigId {
        self.config.id
    }

    pub fn config(&self) -> &DatabaseConfiguration {
        &self.config
    }

    pub fn family(&self) -> DriverFamily {
        self.config.driver
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub fn status(&self) -> PoolStatus {
        let open = self.open.load(Ordering::Acquire);
        let idle = self.idle_len();
        PoolStatus {
            config_id: self.config.id,
            capacity: self.capacity,
            open,
            idle,
            in_use: open.saturating_sub(idle),
            peak_open: self.peak_open.load(Ordering::Acquire),
            generation: self.generation,
        }
    }

    /// Borrow a connection, waiting up to `wait` for capacity.
    ///
    /// Idle connections are reused most-recent first and validated with a ping;
    /// otherwise a new connection is established with bounded retries.
    pub async fn checkout(
        self: &Arc<Self>,
        settings: &PoolSettings,
        secrets: &dyn SecretResolver,
        wait: Duration,
    ) -> DbResult<PooledConnection> {
        let start = Instant::now();
        let permit = match timeout(wait, Arc::clone(&self.permits).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(DbError::connection(
                    format!("Pool for configuration {} was closed", self.config.id),
                    "The configuration changed; retry the request",
                ));
            }
            Err(_) => {
                let waited_ms = start.elapsed().as_millis() as u64;
                warn!(
                    config_id = %self.config.id,
                    capacity = self.capacity,
                    waited_ms,
                    "Connection pool exhausted"
                );
                return Err(DbError::pool_exhausted(self.config.id, waited_ms));
            }
        };

        while let Some(candidate) = self.pop_idle() {
            if candidate.idle_since.elapsed() > self.idle_timeout {
                debug!(config_id = %self.config.id, "Idle connection expired, closing");
                self.close_connection(candidate.conn, settings.validation_timeout)
                    .await;
                continue;
            }

            let mut validating = Validating {
                pool: self,
                conn: Some(candidate.conn),
            };
            if self.test_before_acquire {
                let Some(conn) = validating.conn.as_mut() else {
                    continue;
                };
                match timeout(settings.validation_timeout, conn.ping()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(config_id = %self.config.id, error = %e, "Liveness check failed, discarding connection");
                        continue;
                    }
                    Err(_) => {
                        warn!(config_id = %self.config.id, "Liveness check timed out, discarding connection");
                        continue;
                    }
                }
            }
            if let Some(conn) = validating.conn.take() {
                return Ok(PooledConnection::new(Arc::clone(self), conn, permit));
            }
        }

        let conn = self.establish(settings, secrets).await?;
        let open = self.open.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_open.fetch_max(open, Ordering::AcqRel);
        debug!(
            config_id = %self.config.id,
            open,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Opened new connection"
        );
        Ok(PooledConnection::new(Arc::clone(self), conn, permit))
    }

    /// Connect with bounded exponential backoff between attempts.
    async fn establish(
        &self,
        settings: &PoolSettings,
        secrets: &dyn SecretResolver,
    ) -> DbResult<DbConnection> {
        let password = secrets.reveal(&self.config).map_err(|e| {
            DbError::connection(
                format!("Could not resolve password: {}", e),
                "Check the stored password of the configuration",
            )
        })?;

        let attempts = settings.connect_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(settings.backoff_for(attempt - 1)).await;
            }

            match timeout(
                settings.connect_timeout,
                DbConnection::connect(&self.config, &password),
            )
            .await
            {
                Ok(Ok(conn)) => return Ok(conn),
                Ok(Err(e)) => {
                    warn!(config_id = %self.config.id, attempt, attempts, error = %e, "Connection attempt failed");
                    last_error = Some(e);
                }
                Err(_) => {
                    warn!(config_id = %self.config.id, attempt, attempts, "Connection attempt timed out");
                    last_error = Some(DbError::connection(
                        format!(
                            "Connection attempt timed out after {}ms",
                            settings.connect_timeout.as_millis()
                        ),
                        "Check that the server is reachable",
                    ));
                }
            }

            if self.is_retired() {
                break;
            }
        }

        Err(last_error.unwrap_or_else(|| {
            DbError::connection("No connection attempt was made", "Check connect_attempts")
        }))
    }

    /// Mark retired, wake waiters and take the idle connections.
    pub(crate) fn retire(&self) -> Vec<DbConnection> {
        self.retired.store(true, Ordering::Release);
        self.permits.close();
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        idle.drain(..).map(|c| c.conn).collect()
    }

    /// Retire the pool and close its idle connections. Returns how many were closed.
    pub async fn shutdown(&self, close_timeout: Duration) -> usize {
        let drained = self.retire();
        let count = self.close_drained(drained, close_timeout).await;
        info!(
            config_id = %self.config.id,
            closed = count,
            still_borrowed = self.open.load(Ordering::Acquire),
            age_secs = self.created_at.elapsed().as_secs(),
            "Pool retired"
        );
        count
    }

    /// Close connections taken out by [`retire`](Self::retire).
    pub(crate) async fn close_drained(&self, drained: Vec<DbConnection>, close_timeout: Duration) -> usize {
        let count = drained.len();
        for conn in drained {
            self.close_connection(conn, close_timeout).await;
        }
        count
    }

    /// Wait until every connection of the pool is closed, for at most `limit`.
    ///
    /// Returns false if connections were still borrowed when the wait ended.
    pub(crate) async fn wait_drained(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            // Register before checking so a close in between is not missed
            let notified = self.drained.notified();
            if self.open.load(Ordering::Acquire) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.open.load(Ordering::Acquire) == 0;
            }
        }
    }

    /// Close idle connections older than the idle window.
    pub async fn evict_idle(&self, close_timeout: Duration) -> usize {
        let expired: Vec<DbConnection> = {
            let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
            let mut kept = VecDeque::with_capacity(idle.len());
            let mut expired = Vec::new();
            for entry in idle.drain(..) {
                if entry.idle_since.elapsed() > self.idle_timeout {
                    expired.push(entry.conn);
                } else {
                    kept.push_back(entry);
                }
            }
            *idle = kept;
            expired
        };

        let count = expired.len();
        for conn in expired {
            self.close_connection(conn, close_timeout).await;
        }
        if count > 0 {
            debug!(config_id = %self.config.id, evicted = count, "Evicted idle connections");
        }
        count
    }

    fn pop_idle(&self) -> Option<IdleConnection> {
        self.idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_back()
    }

    fn idle_len(&self) -> usize {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn push_idle(&self, conn: DbConnection) {
        self.idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(IdleConnection {
                conn,
                idle_since: Instant::now(),
            });
    }

    /// Graceful close, bounded so a stuck peer cannot block the caller.
    async fn close_connection(&self, conn: DbConnection, close_timeout: Duration) {
        self.forget();
        if timeout(close_timeout, conn.close()).await.is_err() {
            warn!(config_id = %self.config.id, "Closing connection timed out");
        }
    }

    /// Drop a connection without a graceful shutdown.
    fn discard(&self, conn: DbConnection) {
        drop(conn);
        self.forget();
    }

    fn forget(&self) {
        // Saturate at 0 to tolerate double accounting from a logic bug
        let result = self
            .open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(1))
            });
        match result {
            Ok(0) => warn!(config_id = %self.config.id, "Open connection count underflow"),
            Ok(1) => self.drained.notify_waiters(),
            _ => {}
        }
    }
}

/// An idle connection being checked out. Dropping it (failed ping or a
/// cancelled checkout) destroys the connection and fixes the open count.
struct Validating<'a> {
    pool: &'a ConfigPool,
    conn: Option<DbConnection>,
}

impl Drop for Validating<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.discard(conn);
        }
    }
}

impl std::fmt::Debug for ConfigPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigPool")
            .field("config_id", &self.config.id)
            .field("driver", &self.config.driver)
            .field("capacity", &self.capacity)
            .field("generation", &self.generation)
            .field("open", &self.open.load(Ordering::Relaxed))
            .field("retired", &self.retired.load(Ordering::Relaxed))
            .finish()
    }
}

/// A borrowed connection.
///
/// Release it through [`ConnectionManager::release`](super::ConnectionManager::release)
/// (or [`PooledConnection::release`]). Dropping it unreleased discards the
/// connection as if it were unhealthy.
pub struct PooledConnection {
    pool: Arc<ConfigPool>,
    conn: Option<DbConnection>,
    acquired_at: Instant,
    // Dropped last, after the connection went back to the idle list
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn new(pool: Arc<ConfigPool>, conn: DbConnection, permit: OwnedSemaphorePermit) -> Self {
        Self {
            pool,
            conn: Some(conn),
            acquired_at: Instant::now(),
            _permit: permit,
        }
    }

    pub fn config_id(&self) -> ConfigId {
        self.pool.config_id()
    }

    pub fn family(&self) -> DriverFamily {
        self.pool.family()
    }

    /// Options of the configuration this connection was opened for.
    pub fn pool_options(&self) -> PoolOptions {
        self.pool.config().pool_options()
    }

    /// The live driver connection.
    ///
    /// Fails once the configuration was updated or deleted; the handle must
    /// then be released.
    pub fn connection(&mut self) -> DbResult<&mut DbConnection> {
        if self.pool.is_retired() {
            return Err(DbError::connection(
                format!(
                    "Configuration {} changed while the connection was borrowed",
                    self.pool.config_id()
                ),
                "Release the connection and retry the request",
            ));
        }
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::internal("Connection handle already released"))
    }

    /// Return a healthy connection to its pool, or destroy it.
    pub async fn release(mut self, healthy: bool) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let held_ms = self.acquired_at.elapsed().as_millis() as u64;

        if !healthy {
            debug!(config_id = %self.pool.config_id(), held_ms, "Destroying poisoned connection");
            self.pool.discard(conn);
        } else if self.pool.is_retired() {
            debug!(config_id = %self.pool.config_id(), held_ms, "Closing connection of retired pool");
            self.pool
                .close_connection(conn, Duration::from_secs(DEFAULT_VALIDATION_TIMEOUT_SECS))
                .await;
        } else {
            self.pool.push_idle(conn);
            debug!(config_id = %self.pool.config_id(), held_ms, "Connection returned to pool");
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(
                config_id = %self.pool.config_id(),
                "Connection dropped without release, discarding"
            );
            self.pool.discard(conn);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("config_id", &self.pool.config_id())
            .field("released", &self.conn.is_none())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::PlaintextSecrets;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn sqlite_config(path: &str, params: &[(&str, &str)]) -> DatabaseConfiguration {
        DatabaseConfiguration {
            id: ConfigId(9),
            name: "pool-test".to_string(),
            driver: DriverFamily::Sqlite,
            host: String::new(),
            port: 0,
            username: String::new(),
            encrypted_password: String::new(),
            database: path.to_string(),
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn fast_settings() -> PoolSettings {
        PoolSettings {
            connect_attempts: 3,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(40),
            connect_timeout: Duration::from_secs(2),
            ..PoolSettings::default()
        }
    }

    #[tokio::test]
    async fn test_capacity_from_options() {
        let pool = ConfigPool::new(
            sqlite_config("unused.db", &[("max_connections", "4")]),
            &PoolSettings::default(),
            1,
        );
        let status = pool.status();
        assert_eq!(status.capacity, 4);
        assert_eq!(status.open, 0);
        assert_eq!(status.generation, 1);
    }

    #[tokio::test]
    async fn test_checkout_reuses_idle_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reuse.db");
        let pool = ConfigPool::new(
            sqlite_config(path.to_str().unwrap(), &[]),
            &fast_settings(),
            1,
        );

        let handle = pool
            .checkout(&fast_settings(), &PlaintextSecrets, Duration::from_secs(1))
            .await
            .unwrap();
        handle.release(true).await;
        assert_eq!(pool.status().idle, 1);

        let handle = pool
            .checkout(&fast_settings(), &PlaintextSecrets, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(pool.status().open, 1);
        assert_eq!(pool.status().idle, 0);
        handle.release(true).await;
        assert_eq!(pool.status().peak_open, 1);
    }

    #[tokio::test]
    async fn test_checkout_times_out_when_full() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("full.db");
        let pool = ConfigPool::new(
            sqlite_config(path.to_str().unwrap(), &[]),
            &fast_settings(),
            1,
        );

        let held = pool
            .checkout(&fast_settings(), &PlaintextSecrets, Duration::from_secs(1))
            .await
            .unwrap();
        let err = pool
            .checkout(&fast_settings(), &PlaintextSecrets, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::PoolExhausted { .. }));
        held.release(true).await;
    }

    #[tokio::test]
    async fn test_dropped_handle_frees_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drop.db");
        let pool = ConfigPool::new(
            sqlite_config(path.to_str().unwrap(), &[]),
            &fast_settings(),
            1,
        );

        let handle = pool
            .checkout(&fast_settings(), &PlaintextSecrets, Duration::from_secs(1))
            .await
            .unwrap();
        drop(handle);
        assert_eq!(pool.status().open, 0);

        let again = pool
            .checkout(&fast_settings(), &PlaintextSecrets, Duration::from_millis(50))
            .await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_establish_retries_then_fails() {
        let pool = ConfigPool::new(
            sqlite_config("/nonexistent-dir/sub/never.db", &[]),
            &fast_settings(),
            1,
        );
        let start = Instant::now();
        let err = pool
            .checkout(&fast_settings(), &PlaintextSecrets, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Connection { .. }));
        // Two backoff sleeps: 10ms + 20ms
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(pool.status().open, 0);
        // The failed attempt must not hold the permit
        assert_eq!(pool.permits.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_retired_pool_closes_on_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("retire.db");
        let pool = ConfigPool::new(
            sqlite_config(path.to_str().unwrap(), &[("max_connections", "2")]),
            &fast_settings(),
            1,
        );

        let borrowed = pool
            .checkout(&fast_settings(), &PlaintextSecrets, Duration::from_secs(1))
            .await
            .unwrap();
        let idle = pool
            .checkout(&fast_settings(), &PlaintextSecrets, Duration::from_secs(1))
            .await
            .unwrap();
        idle.release(true).await;

        assert_eq!(pool.shutdown(Duration::from_secs(1)).await, 1);
        assert_eq!(pool.status().open, 1);

        borrowed.release(true).await;
        assert_eq!(pool.status().open, 0);
        assert_eq!(pool.status().idle, 0);

        let err = pool
            .checkout(&fast_settings(), &PlaintextSecrets, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_wait_drained_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drain.db");
        let pool = ConfigPool::new(
            sqlite_config(path.to_str().unwrap(), &[]),
            &fast_settings(),
            1,
        );

        let mut borrowed = pool
            .checkout(&fast_settings(), &PlaintextSecrets, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(borrowed.connection().is_ok());
        pool.retire();

        // A retired handle refuses statements but stays open until released
        assert!(matches!(
            borrowed.connection(),
            Err(DbError::Connection { .. })
        ));
        assert!(!pool.wait_drained(Duration::from_millis(50)).await);

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.wait_drained(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        borrowed.release(true).await;
        assert!(waiter.await.unwrap());
        assert_eq!(pool.status().open, 0);
    }

    #[tokio::test]
    async fn test_evict_idle_respects_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evict.db");
        let pool = ConfigPool::new(
            sqlite_config(path.to_str().unwrap(), &[("idle_timeout", "50ms")]),
            &fast_settings(),
            1,
        );

        let handle = pool
            .checkout(&fast_settings(), &PlaintextSecrets, Duration::from_secs(1))
            .await
            .unwrap();
        handle.release(true).await;

        assert_eq!(pool.evict_idle(Duration::from_secs(1)).await, 0);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(pool.evict_idle(Duration::from_secs(1)).await, 1);
        assert_eq!(pool.status().open, 0);
    }
}
