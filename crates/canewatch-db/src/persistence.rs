//! The persistence handle.
//!
//! [`Persistence`] is the single construction point for the layer: it owns
//! the connection provider chosen from configuration, the retry policy, and
//! the clock, and hands out the stores. Every store operation borrows it.

use std::sync::Arc;

use canewatch_types::{SessionId, SessionMetadata, SessionStatus};
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::carbon_stock_store::CarbonStockStore;
use crate::clock::{Clock, SystemClock};
use crate::config::PersistenceConfig;
use crate::emission_store::EmissionStore;
use crate::error::{PersistenceError, StoreError};
use crate::harvest_loss_store::HarvestLossStore;
use crate::provider::ConnectionProvider;
use crate::retry::{RetryPolicy, with_retry};
use crate::schema::{SchemaInitializer, SchemaReport};
use crate::sensor_store::SensorStore;
use crate::session_store::{SessionStore, SessionUpdate};

/// Shared handle to the persistence layer.
///
/// Cheap to share behind an [`Arc`]; every method takes `&self`.
#[derive(Debug)]
pub struct Persistence {
    provider: ConnectionProvider,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl Persistence {
    /// Assemble a handle from parts. No I/O happens here.
    pub fn new(provider: ConnectionProvider, policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            provider,
            policy,
            clock,
        }
    }

    /// Validate `config` and pick the provider it asks for. The pool is not
    /// opened; see [`Persistence::initialize`].
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Config`] if the configuration is
    /// inconsistent.
    pub fn from_config(
        config: &PersistenceConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PersistenceError> {
        config.validate()?;
        let provider = ConnectionProvider::from_config(config, clock.now());
        let policy = RetryPolicy::from_config(&config.retry);
        Ok(Self::new(provider, policy, clock))
    }

    /// Build a handle on the system clock and open the pool.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Config`] for an inconsistent
    /// configuration, or [`PersistenceError::Store`] if the pool cannot
    /// connect within the retry budget.
    pub async fn connect(config: &PersistenceConfig) -> Result<Self, PersistenceError> {
        let db = Self::from_config(config, Arc::new(SystemClock))?;
        db.initialize().await?;
        Ok(db)
    }

    /// Open the pool. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if the pool cannot connect
    /// within the retry budget.
    pub async fn initialize(&self) -> Result<(), PersistenceError> {
        let provider = &self.provider;
        self.run("initialize_pool", move || provider.initialize())
            .await
    }

    /// Whether the store answers a trivial query. Never errors.
    pub async fn is_healthy(&self) -> bool {
        self.provider.is_healthy().await
    }

    /// Close every pooled connection. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.provider.shutdown().await;
    }

    /// The connection provider in use.
    pub const fn provider(&self) -> &ConnectionProvider {
        &self.provider
    }

    /// The retry policy applied to every store operation.
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Current time from the injected clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Run one store operation under the retry policy.
    pub(crate) async fn run<T, F, Fut>(&self, operation: &'static str, op: F) -> Result<T, PersistenceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        with_retry(&self.policy, operation, op).await
    }

    // =====================================================================
    // Stores
    // =====================================================================

    /// Session lifecycle operations.
    pub const fn sessions(&self) -> SessionStore<'_> {
        SessionStore::new(self)
    }

    /// Sensor reading operations.
    pub const fn sensors(&self) -> SensorStore<'_> {
        SensorStore::new(self)
    }

    /// Emission record operations.
    pub const fn emissions(&self) -> EmissionStore<'_> {
        EmissionStore::new(self)
    }

    /// Carbon stock operations.
    pub const fn carbon_stocks(&self) -> CarbonStockStore<'_> {
        CarbonStockStore::new(self)
    }

    /// Harvest loss operations.
    pub const fn harvest_losses(&self) -> HarvestLossStore<'_> {
        HarvestLossStore::new(self)
    }

    /// Schema bootstrap.
    pub const fn schema(&self) -> SchemaInitializer<'_> {
        SchemaInitializer::new(self)
    }

    // =====================================================================
    // Shortcuts
    // =====================================================================

    /// See [`SchemaInitializer::ensure_schema`].
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the catalog cannot be listed.
    pub async fn ensure_schema(&self) -> Result<SchemaReport, PersistenceError> {
        self.schema().ensure_schema().await
    }

    /// See [`SessionStore::create`].
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::DuplicateSession`] or
    /// [`PersistenceError::Store`].
    pub async fn create_session(&self, metadata: &SessionMetadata) -> Result<SessionId, PersistenceError> {
        self.sessions().create(metadata).await
    }

    /// See [`SessionStore::end`].
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::InvalidArgument`] or
    /// [`PersistenceError::Store`].
    pub async fn end_session(
        &self,
        id: &SessionId,
        final_status: SessionStatus,
    ) -> Result<SessionUpdate, PersistenceError> {
        self.sessions().end(id, final_status).await
    }

    /// See [`SessionStore::validate`].
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if the read fails.
    pub async fn validate_session(&self, id: &SessionId) -> Result<bool, PersistenceError> {
        self.sessions().validate(id).await
    }

    /// See [`SensorStore::save_batch`].
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::InvalidSession`] or
    /// [`PersistenceError::Store`].
    pub async fn save_sensor_batch(&self, id: &SessionId, payload: &Value) -> Result<usize, PersistenceError> {
        self.sensors().save_batch(id, payload).await
    }

    /// See [`EmissionStore::save_batch`].
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::InvalidSession`] or
    /// [`PersistenceError::Store`].
    pub async fn save_emission_batch(&self, id: &SessionId, payload: &Value) -> Result<usize, PersistenceError> {
        self.emissions().save_batch(id, payload).await
    }

    /// See [`CarbonStockStore::save_batch`].
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::InvalidSession`] or
    /// [`PersistenceError::Store`].
    pub async fn save_carbon_stock_batch(
        &self,
        id: &SessionId,
        payload: &Value,
    ) -> Result<usize, PersistenceError> {
        self.carbon_stocks().save_batch(id, payload).await
    }

    /// See [`HarvestLossStore::save_batch`].
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::InvalidSession`] or
    /// [`PersistenceError::Store`].
    pub async fn save_harvest_loss_batch(
        &self,
        id: &SessionId,
        payload: &Value,
    ) -> Result<usize, PersistenceError> {
        self.harvest_losses().save_batch(id, payload).await
    }
}
