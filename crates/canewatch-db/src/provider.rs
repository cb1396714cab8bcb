//! Provider selection and dispatch.
//!
//! A [`ConnectionProvider`] is chosen once, from configuration, when the
//! [`crate::Persistence`] handle is built. Every store primitive goes
//! through it; no store checks the simulated flag itself.
//!
//! Enum dispatch rather than a trait object: the primitives are async and
//! there are exactly two providers.

use std::collections::BTreeSet;

use canewatch_types::{
    CarbonStockRecord, EmissionRecord, HarvestLossRecord, SensorReading, Session, SessionId,
    SessionStatus,
};
use chrono::{DateTime, Utc};

use crate::config::PersistenceConfig;
use crate::error::StoreError;
use crate::postgres::{PostgresConfig, PostgresPool};
use crate::schema::{self, ObjectKind, SchemaObject};
use crate::simulated::SimulatedStore;
use crate::session_store::{self, SessionChange};
use crate::{carbon_stock_store, emission_store, harvest_loss_store, sensor_store};

/// Source of connections for every store primitive.
#[derive(Debug)]
pub enum ConnectionProvider {
    /// A real `PostgreSQL` pool.
    Pooled(PostgresPool),
    /// The in-memory simulator.
    Simulated(SimulatedStore),
}

/// Acquire a connection from the pool for the duration of `$body`, or
/// delegate to the simulator.
macro_rules! dispatch {
    ($self:ident, |$conn:ident| $pooled:expr, |$sim:ident| $simulated:expr) => {
        match $self {
            Self::Pooled(pool) => {
                let mut $conn = pool.acquire().await?;
                $pooled
            }
            Self::Simulated($sim) => $simulated,
        }
    };
}

impl ConnectionProvider {
    /// Pick the provider the configuration asks for. No I/O happens here.
    pub fn from_config(config: &PersistenceConfig, now: DateTime<Utc>) -> Self {
        if config.simulated_mode {
            tracing::info!("Simulated mode: persistence is served from memory");
            Self::Simulated(SimulatedStore::seeded(now))
        } else {
            Self::Pooled(PostgresPool::new(PostgresConfig::new(
                &config.connection,
                &config.pool,
            )))
        }
    }

    /// Whether this provider is the in-memory simulator.
    pub const fn is_simulated(&self) -> bool {
        matches!(self, Self::Simulated(_))
    }

    /// Open the pool. Idempotent; trivially succeeds when simulated.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the pool cannot connect.
    pub async fn initialize(&self) -> Result<(), StoreError> {
        match self {
            Self::Pooled(pool) => pool.initialize().await,
            Self::Simulated(_) => Ok(()),
        }
    }

    /// Whether the store answers a trivial query. Never errors.
    pub async fn is_healthy(&self) -> bool {
        match self {
            Self::Pooled(pool) => pool.is_healthy().await,
            Self::Simulated(_) => true,
        }
    }

    /// Release every pooled connection. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        if let Self::Pooled(pool) = self {
            pool.shutdown().await;
        }
    }

    // =====================================================================
    // Schema
    // =====================================================================

    pub(crate) async fn existing_objects(
        &self,
        kind: ObjectKind,
    ) -> Result<BTreeSet<String>, StoreError> {
        dispatch!(
            self,
            |conn| schema::select_existing(&mut conn, kind).await,
            |sim| sim.existing_objects(kind).await
        )
    }

    pub(crate) async fn create_object(&self, object: &SchemaObject) -> Result<(), StoreError> {
        dispatch!(
            self,
            |conn| schema::execute_ddl(&mut conn, object).await,
            |sim| sim.create_object(object.kind, object.name).await
        )
    }

    // =====================================================================
    // Sessions
    // =====================================================================

    pub(crate) async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        dispatch!(
            self,
            |conn| session_store::insert_row(&mut conn, session).await,
            |sim| sim.insert_session(session).await
        )
    }

    pub(crate) async fn fetch_session(
        &self,
        id: &SessionId,
    ) -> Result<Option<Session>, StoreError> {
        dispatch!(
            self,
            |conn| session_store::select_row(&mut conn, id).await,
            |sim| sim.fetch_session(id).await
        )
    }

    pub(crate) async fn update_session(&self, change: &SessionChange) -> Result<bool, StoreError> {
        dispatch!(
            self,
            |conn| session_store::update_row(&mut conn, change).await,
            |sim| sim.update_session(change).await
        )
    }

    pub(crate) async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
    ) -> Result<Vec<Session>, StoreError> {
        dispatch!(
            self,
            |conn| session_store::select_rows(&mut conn, status).await,
            |sim| sim.list_sessions(status).await
        )
    }

    // =====================================================================
    // Records
    // =====================================================================

    pub(crate) async fn insert_sensor_readings(
        &self,
        rows: &[SensorReading],
    ) -> Result<u64, StoreError> {
        dispatch!(
            self,
            |conn| sensor_store::insert_rows(&mut conn, rows).await,
            |sim| sim.insert_sensor_readings(rows).await
        )
    }

    pub(crate) async fn sensor_readings(
        &self,
        id: &SessionId,
    ) -> Result<Vec<SensorReading>, StoreError> {
        dispatch!(
            self,
            |conn| sensor_store::select_rows(&mut conn, id).await,
            |sim| sim.sensor_readings(id).await
        )
    }

    pub(crate) async fn insert_emissions(&self, rows: &[EmissionRecord]) -> Result<u64, StoreError> {
        dispatch!(
            self,
            |conn| emission_store::insert_rows(&mut conn, rows).await,
            |sim| sim.insert_emissions(rows).await
        )
    }

    pub(crate) async fn emissions(&self, id: &SessionId) -> Result<Vec<EmissionRecord>, StoreError> {
        dispatch!(
            self,
            |conn| emission_store::select_rows(&mut conn, id).await,
            |sim| sim.emissions(id).await
        )
    }

    pub(crate) async fn insert_carbon_stocks(
        &self,
        rows: &[CarbonStockRecord],
    ) -> Result<u64, StoreError> {
        dispatch!(
            self,
            |conn| carbon_stock_store::insert_rows(&mut conn, rows).await,
            |sim| sim.insert_carbon_stocks(rows).await
        )
    }

    pub(crate) async fn carbon_stocks(
        &self,
        id: &SessionId,
    ) -> Result<Vec<CarbonStockRecord>, StoreError> {
        dispatch!(
            self,
            |conn| carbon_stock_store::select_rows(&mut conn, id).await,
            |sim| sim.carbon_stocks(id).await
        )
    }

    pub(crate) async fn insert_harvest_losses(
        &self,
        rows: &[HarvestLossRecord],
    ) -> Result<u64, StoreError> {
        dispatch!(
            self,
            |conn| harvest_loss_store::insert_rows(&mut conn, rows).await,
            |sim| sim.insert_harvest_losses(rows).await
        )
    }

    pub(crate) async fn harvest_losses(
        &self,
        id: &SessionId,
    ) -> Result<Vec<HarvestLossRecord>, StoreError> {
        dispatch!(
            self,
            |conn| harvest_loss_store::select_rows(&mut conn, id).await,
            |sim| sim.harvest_losses(id).await
        )
    }
}
