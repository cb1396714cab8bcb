//! In-memory stand-in for the database.
//!
//! Selected by `simulated_mode: true`. Every primitive the pooled provider
//! offers is served from process memory: nothing touches the network, and
//! writes are kept so later reads stay consistent with them. A canned
//! active session with a few sensor readings is seeded so reads return
//! representative data even before anything is written.

use std::collections::{BTreeMap, BTreeSet};

use canewatch_types::{
    CarbonStockRecord, EmissionRecord, HarvestLossRecord, SensorReading, Session, SessionId,
    SessionStatus,
};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::schema::ObjectKind;
use crate::session_store::SessionChange;

/// Identifier of the session seeded into every simulated store.
pub const SIMULATED_SESSION_ID: &str = "SIMULATED-SESSION";

/// Canned sensor readings: type, value, unit.
const CANNED_READINGS: &[(&str, f64, &str)] = &[
    ("temperature", 25.0, "C"),
    ("soil_humidity", 62.0, "%"),
    ("harvester_speed", 5.2, "km/h"),
];

#[derive(Debug, Default)]
struct SimulatedState {
    tables: BTreeSet<String>,
    indexes: BTreeSet<String>,
    sessions: BTreeMap<SessionId, Session>,
    sensor_readings: Vec<SensorReading>,
    emissions: Vec<EmissionRecord>,
    carbon_stocks: Vec<CarbonStockRecord>,
    harvest_losses: Vec<HarvestLossRecord>,
    /// Objects whose creation fails with a permission error.
    #[cfg(test)]
    refused: BTreeSet<String>,
    /// Objects that exist but are missing from catalog listings, as if a
    /// concurrent bootstrap created them after the listing.
    #[cfg(test)]
    unlisted: BTreeSet<String>,
}

/// Memory-backed provider used when `simulated_mode` is set.
#[derive(Debug, Default)]
pub struct SimulatedStore {
    state: Mutex<SimulatedState>,
}

impl SimulatedStore {
    /// An empty store with no sessions and no schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store seeded with the canned session and readings, stamped `now`.
    pub fn seeded(now: DateTime<Utc>) -> Self {
        let id = SessionId::new(SIMULATED_SESSION_ID);
        let session = Session {
            id: id.clone(),
            start_ts: now,
            end_ts: None,
            status: SessionStatus::Active,
            created_by: "simulator".to_owned(),
            last_updated: now,
            version: 1,
        };
        let sensor_readings = CANNED_READINGS
            .iter()
            .map(|(sensor_type, value, unit)| SensorReading {
                session_id: id.clone(),
                ts: now,
                sensor_type: (*sensor_type).to_owned(),
                value: *value,
                unit: (*unit).to_owned(),
                quality_flag: "good".to_owned(),
            })
            .collect();

        let mut sessions = BTreeMap::new();
        sessions.insert(id, session);
        Self {
            state: Mutex::new(SimulatedState {
                sessions,
                sensor_readings,
                ..SimulatedState::default()
            }),
        }
    }

    // =====================================================================
    // Schema
    // =====================================================================

    pub(crate) async fn existing_objects(
        &self,
        kind: ObjectKind,
    ) -> Result<BTreeSet<String>, StoreError> {
        let state = self.state.lock().await;
        #[allow(unused_mut)]
        let mut names = match kind {
            ObjectKind::Table => state.tables.clone(),
            ObjectKind::Index => state.indexes.clone(),
        };
        #[cfg(test)]
        names.retain(|name| !state.unlisted.contains(name));
        Ok(names)
    }

    pub(crate) async fn create_object(
        &self,
        kind: ObjectKind,
        name: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        #[cfg(test)]
        if state.refused.contains(name) {
            return Err(StoreError::Database {
                code: Some("42501".to_owned()),
                message: format!("permission denied to create \"{name}\""),
                constraint: None,
            });
        }
        let set = match kind {
            ObjectKind::Table => &mut state.tables,
            ObjectKind::Index => &mut state.indexes,
        };
        if set.insert(name.to_owned()) {
            Ok(())
        } else {
            Err(StoreError::Database {
                code: Some("42P07".to_owned()),
                message: format!("relation \"{name}\" already exists"),
                constraint: None,
            })
        }
    }

    // =====================================================================
    // Sessions
    // =====================================================================

    pub(crate) async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.sessions.contains_key(&session.id) {
            return Err(StoreError::Database {
                code: Some("23505".to_owned()),
                message: format!("duplicate key value violates unique constraint: {}", session.id),
                constraint: Some("sessions_pkey".to_owned()),
            });
        }
        state.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    pub(crate) async fn fetch_session(
        &self,
        id: &SessionId,
    ) -> Result<Option<Session>, StoreError> {
        Ok(self.state.lock().await.sessions.get(id).cloned())
    }

    /// Compare-and-set under the state lock, mirroring the guarded UPDATE.
    pub(crate) async fn update_session(&self, change: &SessionChange) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(session) = state.sessions.get_mut(&change.id) else {
            return Ok(false);
        };
        if session.version != change.expected_version || session.end_ts.is_some() {
            return Ok(false);
        }
        session.status = change.status;
        session.end_ts = change.end_ts;
        session.last_updated = change.last_updated;
        session.version = session.version.saturating_add(1);
        Ok(true)
    }

    pub(crate) async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
    ) -> Result<Vec<Session>, StoreError> {
        let state = self.state.lock().await;
        let mut sessions: Vec<Session> = state
            .sessions
            .values()
            .filter(|session| status.is_none_or(|wanted| session.status == wanted))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.start_ts.cmp(&a.start_ts));
        Ok(sessions)
    }

    // =====================================================================
    // Records
    // =====================================================================

    pub(crate) async fn insert_sensor_readings(
        &self,
        rows: &[SensorReading],
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        state.sensor_readings.extend_from_slice(rows);
        Ok(row_count(rows.len()))
    }

    pub(crate) async fn sensor_readings(
        &self,
        id: &SessionId,
    ) -> Result<Vec<SensorReading>, StoreError> {
        let state = self.state.lock().await;
        Ok(for_session(&state.sensor_readings, id, |r| (&r.session_id, r.ts)))
    }

    pub(crate) async fn insert_emissions(&self, rows: &[EmissionRecord]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        state.emissions.extend_from_slice(rows);
        Ok(row_count(rows.len()))
    }

    pub(crate) async fn emissions(&self, id: &SessionId) -> Result<Vec<EmissionRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(for_session(&state.emissions, id, |r| (&r.session_id, r.ts)))
    }

    pub(crate) async fn insert_carbon_stocks(
        &self,
        rows: &[CarbonStockRecord],
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        state.carbon_stocks.extend_from_slice(rows);
        Ok(row_count(rows.len()))
    }

    pub(crate) async fn carbon_stocks(
        &self,
        id: &SessionId,
    ) -> Result<Vec<CarbonStockRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(for_session(&state.carbon_stocks, id, |r| (&r.session_id, r.ts)))
    }

    pub(crate) async fn insert_harvest_losses(
        &self,
        rows: &[HarvestLossRecord],
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        state.harvest_losses.extend_from_slice(rows);
        Ok(row_count(rows.len()))
    }

    pub(crate) async fn harvest_losses(
        &self,
        id: &SessionId,
    ) -> Result<Vec<HarvestLossRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(for_session(&state.harvest_losses, id, |r| (&r.session_id, r.ts)))
    }
}

#[cfg(test)]
impl SimulatedStore {
    /// Make every later attempt to create `name` fail.
    pub(crate) async fn refuse_object(&self, name: &str) {
        self.state.lock().await.refused.insert(name.to_owned());
    }

    /// Create `name` without it showing up in catalog listings.
    pub(crate) async fn create_unlisted(&self, kind: ObjectKind, name: &str) {
        let mut state = self.state.lock().await;
        state.unlisted.insert(name.to_owned());
        match kind {
            ObjectKind::Table => state.tables.insert(name.to_owned()),
            ObjectKind::Index => state.indexes.insert(name.to_owned()),
        };
    }
}

fn row_count(len: usize) -> u64 {
    u64::try_from(len).unwrap_or(u64::MAX)
}

/// Rows of `id`, ordered by timestamp then insertion like the SQL reads.
fn for_session<T: Clone>(
    rows: &[T],
    id: &SessionId,
    key: impl Fn(&T) -> (&SessionId, DateTime<Utc>),
) -> Vec<T> {
    let mut matching: Vec<T> = rows.iter().filter(|row| key(row).0 == id).cloned().collect();
    matching.sort_by_key(|row| key(row).1);
    matching
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seeded_store_has_canned_session_and_readings() {
        let store = SimulatedStore::seeded(Utc::now());
        let id = SessionId::new(SIMULATED_SESSION_ID);
        let session = store.fetch_session(&id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(store.sensor_readings(&id).await.unwrap().len(), CANNED_READINGS.len());
    }

    #[tokio::test]
    async fn compare_and_set_requires_matching_version() {
        let now = Utc::now();
        let store = SimulatedStore::seeded(now);
        let id = SessionId::new(SIMULATED_SESSION_ID);
        let change = SessionChange {
            id: id.clone(),
            expected_version: 1,
            status: SessionStatus::Paused,
            end_ts: None,
            last_updated: now,
        };
        assert!(store.update_session(&change).await.unwrap());
        assert!(!store.update_session(&change).await.unwrap());
        let session = store.fetch_session(&id).await.unwrap().unwrap();
        assert_eq!(session.version, 2);
        assert_eq!(session.status, SessionStatus::Paused);
    }

    #[tokio::test]
    async fn creating_an_existing_object_reports_duplicate() {
        let store = SimulatedStore::new();
        assert!(store.create_object(ObjectKind::Table, "sessions").await.is_ok());
        let err = store
            .create_object(ObjectKind::Table, "sessions")
            .await
            .unwrap_err();
        assert!(err.is_duplicate_object());
    }

    #[tokio::test]
    async fn duplicate_session_insert_is_a_unique_violation() {
        let store = SimulatedStore::seeded(Utc::now());
        let existing = store
            .fetch_session(&SessionId::new(SIMULATED_SESSION_ID))
            .await
            .unwrap()
            .unwrap();
        let err = store.insert_session(&existing).await.unwrap_err();
        assert_eq!(err.code(), Some("23505"));
    }
}
