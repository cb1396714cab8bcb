//! `PostgreSQL` connection pool manager.
//!
//! [`PostgresPool`] owns a lazily created [`sqlx::PgPool`]. It starts out
//! unconnected; [`PostgresPool::initialize`] opens the pool and is
//! idempotent, and [`PostgresPool::acquire`] initializes on first use.
//!
//! Uses [`sqlx`] with runtime query construction (not compile-time checked)
//! to avoid requiring a live database at build time. All queries are
//! parameterized to prevent SQL injection.

use std::time::Duration;

use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres};
use tokio::sync::RwLock;

use crate::config::{ConnectionConfig, PoolConfig};
use crate::error::StoreError;

/// Default idle timeout in seconds.
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

/// Pool sizing and connection target for [`PostgresPool`].
#[derive(Clone)]
pub struct PostgresConfig {
    /// Host, port, database and credentials. The password is never logged.
    pub connect_options: PgConnectOptions,
    /// Connections kept open while idle.
    pub min_connections: u32,
    /// Upper bound on open connections.
    pub max_connections: u32,
    /// Connections opened per growth step. `sqlx` grows the pool one
    /// connection at a time on demand, so this only feeds diagnostics.
    pub increment: u32,
    /// How long to wait for a free connection.
    pub acquire_timeout: Duration,
    /// Idle connection timeout.
    pub idle_timeout: Duration,
}

impl PostgresConfig {
    /// Build pool settings from the typed configuration sections.
    pub fn new(connection: &ConnectionConfig, pool: &PoolConfig) -> Self {
        let mut connect_options = PgConnectOptions::new()
            .host(&connection.host)
            .port(connection.port)
            .database(&connection.database);
        if let Some(username) = &connection.username {
            connect_options = connect_options.username(username);
        }
        if let Some(password) = &connection.password {
            connect_options = connect_options.password(password.expose());
        }

        Self {
            connect_options,
            min_connections: pool.min,
            max_connections: pool.max,
            increment: pool.increment,
            acquire_timeout: pool.timeout(),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
        }
    }

    /// Set the idle connection timeout.
    #[must_use]
    pub const fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

// `PgConnectOptions` prints the password in its `Debug` output.
impl core::fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("host", &self.connect_options.get_host())
            .field("port", &self.connect_options.get_port())
            .field("database", &self.connect_options.get_database())
            .field("min_connections", &self.min_connections)
            .field("max_connections", &self.max_connections)
            .field("increment", &self.increment)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

/// Lazily connected pool of `PostgreSQL` connections.
#[derive(Debug)]
pub struct PostgresPool {
    config: PostgresConfig,
    pool: RwLock<Option<PgPool>>,
}

impl PostgresPool {
    /// Create an unconnected manager. No I/O happens until
    /// [`PostgresPool::initialize`] or [`PostgresPool::acquire`].
    pub fn new(config: PostgresConfig) -> Self {
        Self {
            config,
            pool: RwLock::new(None),
        }
    }

    /// Open the pool. Calling this on an initialized manager is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the first connection cannot be established.
    pub async fn initialize(&self) -> Result<(), StoreError> {
        self.connected_pool().await.map(drop)
    }

    /// Whether [`PostgresPool::initialize`] has succeeded and the pool has
    /// not been shut down since.
    pub async fn is_initialized(&self) -> bool {
        self.pool.read().await.is_some()
    }

    /// Borrow one connection for the duration of an operation.
    ///
    /// The returned guard goes back to the pool when dropped, whether the
    /// operation finished, returned early with `?`, or panicked.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::PoolTimedOut`] when no connection frees up
    /// within the acquisition timeout, or the connection error if the pool
    /// had to be initialized and that failed.
    pub async fn acquire(&self) -> Result<PoolConnection<Postgres>, StoreError> {
        let pool = self.connected_pool().await?;
        Ok(pool.acquire().await?)
    }

    /// Run a trivial query. Never errors; any failure reads as unhealthy.
    pub async fn is_healthy(&self) -> bool {
        let Some(pool) = self.pool.read().await.clone() else {
            return false;
        };
        match sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&pool).await {
            Ok(one) => one == 1,
            Err(e) => {
                tracing::warn!(error = %e, "PostgreSQL health check failed");
                false
            }
        }
    }

    /// Close every connection and return to the unconnected state.
    /// Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let pool = self.pool.write().await.take();
        if let Some(pool) = pool {
            pool.close().await;
            tracing::info!("PostgreSQL pool closed");
        }
    }

    /// Return the open pool, connecting first if necessary.
    async fn connected_pool(&self) -> Result<PgPool, StoreError> {
        if let Some(pool) = self.pool.read().await.as_ref() {
            return Ok(pool.clone());
        }

        // Concurrent initializers serialize on the write lock; only the
        // first one connects.
        let mut slot = self.pool.write().await;
        if let Some(pool) = slot.as_ref() {
            return Ok(pool.clone());
        }

        let config = &self.config;
        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect_with(config.connect_options.clone())
            .await?;

        tracing::info!(
            host = config.connect_options.get_host(),
            port = config.connect_options.get_port(),
            database = config.connect_options.get_database().unwrap_or_default(),
            min_connections = config.min_connections,
            max_connections = config.max_connections,
            increment = config.increment,
            "Connected to PostgreSQL"
        );

        *slot = Some(pool.clone());
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PersistenceConfig, Secret};

    fn pool_config() -> PostgresConfig {
        let mut config = PersistenceConfig::default();
        config.connection.host = "db.farm.local".to_owned();
        config.connection.username = Some("filer".to_owned());
        config.connection.password = Some(Secret::new("hunter2"));
        PostgresConfig::new(&config.connection, &config.pool)
    }

    #[test]
    fn config_maps_sections() {
        let config = pool_config();
        assert_eq!(config.connect_options.get_host(), "db.farm.local");
        assert_eq!(config.connect_options.get_port(), 5432);
        assert_eq!(config.connect_options.get_database(), Some("canewatch"));
        assert_eq!(config.min_connections, 1);
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.acquire_timeout, Duration::from_secs(60));
    }

    #[test]
    fn debug_output_omits_password() {
        let rendered = format!("{:?}", pool_config());
        assert!(rendered.contains("db.farm.local"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn builder_overrides_idle_timeout() {
        let config = pool_config().with_idle_timeout(Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn unconnected_pool_is_unhealthy_and_shutdown_is_safe() {
        let pool = PostgresPool::new(pool_config());
        assert!(!pool.is_initialized().await);
        assert!(!pool.is_healthy().await);
        pool.shutdown().await;
        pool.shutdown().await;
        assert!(!pool.is_initialized().await);
    }
}
