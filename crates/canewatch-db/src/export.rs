//! Whole-session export.
//!
//! [`export_session`] saves everything a monitoring run produced (sensor
//! batches, emissions, carbon stock changes, harvest losses) through the
//! four batch stores. Each save commits or fails on its own; nothing is
//! rolled back across kinds, and the [`ExportReport`] says what landed.

use canewatch_types::SessionId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Instrument;

use crate::batch;
use crate::error::PersistenceError;
use crate::persistence::Persistence;

/// Everything one monitoring run produced, in the batch payload shapes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportPayload {
    /// Sensor payloads, saved one batch each in order.
    #[serde(default)]
    pub sensor_batches: Vec<Value>,
    /// Emission scope tree.
    #[serde(default)]
    pub emissions: Option<Value>,
    /// Carbon stock changes.
    #[serde(default)]
    pub carbon_stocks: Option<Value>,
    /// Harvest loss estimate or estimates.
    #[serde(default)]
    pub harvest_losses: Option<Value>,
}

/// Kind of record in an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Sensor readings.
    SensorReadings,
    /// Emission records.
    Emissions,
    /// Carbon stock changes.
    CarbonStocks,
    /// Harvest loss estimates.
    HarvestLosses,
}

impl RecordKind {
    /// Short lowercase name for logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SensorReadings => "sensor_readings",
            Self::Emissions => "emissions",
            Self::CarbonStocks => "carbon_stocks",
            Self::HarvestLosses => "harvest_losses",
        }
    }
}

impl core::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A save that failed during export.
#[derive(Debug)]
pub struct ExportFailure {
    /// What was being saved.
    pub kind: RecordKind,
    /// Why it failed.
    pub error: PersistenceError,
}

/// Outcome of [`export_session`].
#[derive(Debug)]
pub struct ExportReport {
    /// Session the records were attached to.
    pub session_id: SessionId,
    /// Sensor readings written.
    pub sensor_readings: usize,
    /// Emission records written.
    pub emissions: usize,
    /// Carbon stock changes written.
    pub carbon_stocks: usize,
    /// Harvest loss estimates written.
    pub harvest_losses: usize,
    /// Saves that failed. Their records were not written.
    pub failures: Vec<ExportFailure>,
}

impl ExportReport {
    fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            sensor_readings: 0,
            emissions: 0,
            carbon_stocks: 0,
            harvest_losses: 0,
            failures: Vec::new(),
        }
    }

    /// Whether every save succeeded.
    pub const fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Records written across all kinds.
    pub const fn total(&self) -> usize {
        self.sensor_readings
            .saturating_add(self.emissions)
            .saturating_add(self.carbon_stocks)
            .saturating_add(self.harvest_losses)
    }

    fn record(&mut self, kind: RecordKind, outcome: Result<usize, PersistenceError>) {
        match outcome {
            Ok(count) => {
                let slot = match kind {
                    RecordKind::SensorReadings => &mut self.sensor_readings,
                    RecordKind::Emissions => &mut self.emissions,
                    RecordKind::CarbonStocks => &mut self.carbon_stocks,
                    RecordKind::HarvestLosses => &mut self.harvest_losses,
                };
                *slot = slot.saturating_add(count);
            }
            Err(error) => {
                tracing::warn!(kind = %kind, error = %error, "Export save failed");
                self.failures.push(ExportFailure { kind, error });
            }
        }
    }
}

/// Save every part of `payload` for an active session.
///
/// # Errors
///
/// Returns [`PersistenceError::InvalidSession`] if the session is not
/// active, or [`PersistenceError::Store`] if that check itself fails.
/// Failures of the individual saves are reported in
/// [`ExportReport::failures`].
pub async fn export_session(
    db: &Persistence,
    session_id: &SessionId,
    payload: &ExportPayload,
) -> Result<ExportReport, PersistenceError> {
    async {
        batch::require_open_session(db, session_id).await?;

        let mut report = ExportReport::new(session_id.clone());
        for sensor_batch in &payload.sensor_batches {
            report.record(
                RecordKind::SensorReadings,
                db.save_sensor_batch(session_id, sensor_batch).await,
            );
        }
        if let Some(emissions) = &payload.emissions {
            report.record(
                RecordKind::Emissions,
                db.save_emission_batch(session_id, emissions).await,
            );
        }
        if let Some(stocks) = &payload.carbon_stocks {
            report.record(
                RecordKind::CarbonStocks,
                db.save_carbon_stock_batch(session_id, stocks).await,
            );
        }
        if let Some(losses) = &payload.harvest_losses {
            report.record(
                RecordKind::HarvestLosses,
                db.save_harvest_loss_batch(session_id, losses).await,
            );
        }

        tracing::info!(
            written = report.total(),
            failed = report.failures.len(),
            "Session export finished"
        );
        Ok(report)
    }
    .instrument(tracing::info_span!("export_session", session_id = %session_id))
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_sections_are_optional() {
        let payload: Result<ExportPayload, _> =
            serde_json::from_str(r#"{ "emissions": { "scope2": { "grid": { "CO2e": 1 } } } }"#);
        assert!(payload.is_ok());
        let payload = payload.unwrap_or_default();
        assert!(payload.sensor_batches.is_empty());
        assert!(payload.emissions.is_some());
        assert!(payload.harvest_losses.is_none());
    }

    #[test]
    fn report_tracks_counts_and_failures() {
        let mut report = ExportReport::new(SessionId::new("s-1"));
        report.record(RecordKind::SensorReadings, Ok(3));
        report.record(RecordKind::SensorReadings, Ok(2));
        report.record(RecordKind::Emissions, Ok(4));
        assert!(report.is_complete());
        assert_eq!(report.sensor_readings, 5);
        assert_eq!(report.total(), 9);

        report.record(
            RecordKind::HarvestLosses,
            Err(PersistenceError::InvalidArgument("bad".to_owned())),
        );
        assert!(!report.is_complete());
        assert_eq!(report.total(), 9);
    }
}
