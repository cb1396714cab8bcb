//! Persistence and resilience layer for Canewatch harvest monitoring.
//!
//! Stores session-scoped time series (sensor readings, greenhouse-gas
//! emissions, carbon stock changes, harvest loss estimates) in
//! `PostgreSQL`, classifies and retries transient failures, and guards
//! session lifecycle state with optimistic concurrency.
//!
//! # Architecture
//!
//! ```text
//! Persistence (config, retry policy, clock)
//!     |
//!     +-- ConnectionProvider --+-- Pooled    (PostgresPool, sqlx)
//!     |                        +-- Simulated (in-memory, no network)
//!     |
//!     +-- SchemaInitializer   (create missing tables and indices)
//!     +-- SessionStore        (lifecycle, versioned transitions)
//!     +-- SensorStore         \
//!     +-- EmissionStore        | validate payload, one transaction per batch,
//!     +-- CarbonStockStore     | in-process queries and aggregates
//!     +-- HarvestLossStore    /
//! ```
//!
//! Every store primitive runs through [`retry::with_retry`]; callers only
//! ever see [`PersistenceError`] or an expected outcome such as
//! [`SessionUpdate::Conflict`].
//!
//! # Modules
//!
//! - [`config`] -- YAML configuration with environment overrides
//! - [`error`] -- Store errors, failure classification, caller-facing errors
//! - [`retry`] -- Exponential backoff with jitter
//! - [`postgres`] -- `PostgreSQL` connection pool
//! - [`simulated`] -- In-memory provider for simulated mode
//! - [`provider`] -- Provider selection and dispatch
//! - [`schema`] -- Schema bootstrap
//! - [`session_store`] -- Session lifecycle
//! - [`sensor_store`], [`emission_store`], [`carbon_stock_store`],
//!   [`harvest_loss_store`] -- Batch record stores
//! - [`export`] -- Whole-session export with partial success

pub mod aggregate;
pub mod batch;
pub mod carbon_stock_store;
pub mod clock;
pub mod config;
pub mod emission_store;
pub mod error;
pub mod export;
pub mod harvest_loss_store;
pub mod persistence;
pub mod postgres;
pub mod provider;
pub mod retry;
pub mod schema;
pub mod sensor_store;
pub mod session_store;
pub mod simulated;

// Re-export primary types for convenience.
pub use aggregate::Summary;
pub use batch::{Parsed, Rejection};
pub use carbon_stock_store::{CarbonStockStore, StockTotals};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{ConfigError, PersistenceConfig};
pub use emission_store::{EmissionStore, GasTotals, SeriesPoint};
pub use error::{ErrorCategory, PersistenceError, StoreError, StoreFailure, classify};
pub use export::{ExportPayload, ExportReport, RecordKind, export_session};
pub use harvest_loss_store::{FactorFrequency, HarvestLossStore, LossInterval, LossStatistics};
pub use persistence::Persistence;
pub use postgres::{PostgresConfig, PostgresPool};
pub use provider::ConnectionProvider;
pub use retry::{RetryPolicy, with_retry};
pub use schema::{SchemaInitializer, SchemaReport};
pub use sensor_store::{IntervalAggregate, SensorStore};
pub use session_store::{SessionStore, SessionUpdate};
pub use simulated::{SIMULATED_SESSION_ID, SimulatedStore};
