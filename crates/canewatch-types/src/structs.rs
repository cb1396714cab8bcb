//! Session and record structs.
//!
//! Records are append-only: once written for a session they are never
//! updated or deleted by the persistence layer. Sessions mutate only through
//! lifecycle transitions, each of which bumps [`Session::version`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::enums::{
    CalculationMethod, ConfidenceLevel, EmissionScope, FactorDirection, GasType, LossCategory,
    MeasurementMethod, SessionStatus, StockType,
};
use crate::ids::SessionId;

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// A bounded monitoring period to which every record belongs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier.
    pub id: SessionId,
    /// When the session was created.
    pub start_ts: DateTime<Utc>,
    /// When the session ended. Set exactly when the status is terminal.
    pub end_ts: Option<DateTime<Utc>>,
    /// Current lifecycle state.
    pub status: SessionStatus,
    /// Who opened the session.
    pub created_by: String,
    /// Time of the most recent transition.
    pub last_updated: DateTime<Utc>,
    /// Optimistic-concurrency version, starting at 1.
    pub version: i64,
}

impl Session {
    /// Whether the session accepts new records.
    pub const fn is_open(&self) -> bool {
        matches!(self.status, SessionStatus::Active) && self.end_ts.is_none()
    }
}

/// Caller-supplied details for a new session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// Explicit identifier. Generated when absent.
    #[serde(default)]
    pub session_id: Option<SessionId>,
    /// Creator name. Defaults to `system`.
    #[serde(default)]
    pub created_by: Option<String>,
}

impl SessionMetadata {
    /// Request a specific session identifier.
    #[must_use]
    pub fn with_session_id(mut self, id: impl Into<SessionId>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    /// Record who created the session.
    #[must_use]
    pub fn with_created_by(mut self, creator: impl Into<String>) -> Self {
        self.created_by = Some(creator.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Time-series records
// ---------------------------------------------------------------------------

/// A single sensor measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Owning session.
    pub session_id: SessionId,
    /// Measurement time.
    pub ts: DateTime<Utc>,
    /// Sensor name, e.g. `soil_humidity`.
    pub sensor_type: String,
    /// Measured value.
    pub value: f64,
    /// Unit of `value`. Empty when the sensor reported none.
    pub unit: String,
    /// Data-quality flag, `good` unless the sensor says otherwise.
    pub quality_flag: String,
}

/// A greenhouse-gas quantity for one scope, category, source and gas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmissionRecord {
    /// Owning session.
    pub session_id: SessionId,
    /// Recording time.
    pub ts: DateTime<Utc>,
    /// GHG Protocol scope.
    pub scope: EmissionScope,
    /// Scope 1 category. Empty for scopes 2 and 3.
    pub category: String,
    /// Emitting source, e.g. `diesel_harvester`.
    pub source: String,
    /// Gas measured.
    pub gas: GasType,
    /// Quantity in `unit`. Negative only for CO2 removals.
    pub value: Decimal,
    /// Unit of `value`, `kg` by default.
    pub unit: String,
    /// How the quantity was derived.
    pub calc_method: CalculationMethod,
    /// Uncertainty as a percentage of `value`.
    pub uncertainty_pct: f64,
}

/// A change in one carbon pool, amortized over a number of years.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarbonStockRecord {
    /// Owning session.
    pub session_id: SessionId,
    /// Recording time.
    pub ts: DateTime<Utc>,
    /// Carbon pool.
    pub stock_type: StockType,
    /// Signed stock change (negative is a loss to the atmosphere).
    pub change: Decimal,
    /// Years over which the change is spread. Always at least 1.
    pub amortization_period: u32,
    /// Unit of `change`, `kg CO2` by default.
    pub unit: String,
    /// How the change was measured.
    pub measurement_method: MeasurementMethod,
}

/// A field condition that fell outside its optimal range during harvest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblematicFactor {
    /// Factor name, e.g. `harvester_speed`.
    pub factor: String,
    /// Observed value.
    pub value: f64,
    /// Optimal `[min, max]` range.
    pub optimal_range: [f64; 2],
    /// Severity in `[0, 1]`.
    pub severity: f64,
    /// Which side of the range the value fell on.
    pub direction: FactorDirection,
}

/// An estimated harvest loss with its contributing factors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestLossRecord {
    /// Owning session.
    pub session_id: SessionId,
    /// Estimate time.
    pub ts: DateTime<Utc>,
    /// Estimated loss as a percentage in `[0, 100]`.
    pub loss_percent: f64,
    /// Conditions that contributed to the loss.
    pub factors: Vec<ProblematicFactor>,
    /// Confidence in the estimate.
    pub confidence: ConfidenceLevel,
    /// Free-form snapshot of field conditions.
    pub field_conditions: Option<serde_json::Map<String, serde_json::Value>>,
}

impl HarvestLossRecord {
    /// Severity band of this loss.
    pub fn category(&self) -> LossCategory {
        LossCategory::from_percent(self.loss_percent)
    }

    /// Whether `factor` is among the problematic factors.
    pub fn mentions_factor(&self, factor: &str) -> bool {
        self.factors.iter().any(|f| f.factor == factor)
    }
}
