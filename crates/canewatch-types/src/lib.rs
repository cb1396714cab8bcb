//! Shared type definitions for Canewatch harvest monitoring.
//!
//! This crate holds the data model that flows between the domain engines
//! (sensor capture, emission and carbon accounting, harvest-loss analysis)
//! and the persistence layer in `canewatch-db`.
//!
//! # Modules
//!
//! - [`ids`] -- Session identifier newtype and its time-ordered generator
//! - [`enums`] -- Closed label sets (session status, gases, scopes, stock types)
//! - [`structs`] -- Session and time-series record structs

pub mod enums;
pub mod ids;
pub mod structs;

// Re-export all public types at crate root for convenience.
pub use enums::{
    CalculationMethod, ConfidenceLevel, EmissionScope, FactorDirection, GasType, LossCategory,
    LossTrend, MeasurementMethod, SessionStatus, StockType, TimeBucket,
};
pub use ids::SessionId;
pub use structs::{
    CarbonStockRecord, EmissionRecord, HarvestLossRecord, ProblematicFactor, SensorReading,
    Session, SessionMetadata,
};
