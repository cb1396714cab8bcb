//! Sensor readings: batch save, queries and per-type statistics.
//!
//! A sensor payload maps each sensor type to either a bare number or a
//! reading object:
//!
//! ```json
//! {
//!   "temperature": 25.5,
//!   "soil_humidity": { "value": 62.0, "unit": "%", "timestamp": "2025-04-10T14:30:00", "quality_flag": "good" }
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};

use canewatch_types::{SensorReading, SessionId, TimeBucket};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::{Connection, PgConnection};
use tracing::Instrument;

use crate::aggregate::{self, Summary};
use crate::batch::{self, INSERT_CHUNK, Parsed};
use crate::error::{PersistenceError, StoreError};
use crate::persistence::Persistence;

/// Quality flag for readings that do not carry one.
const DEFAULT_QUALITY: &str = "good";

/// Readings of one sensor type within one time bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntervalAggregate {
    /// Start of the bucket.
    pub bucket_start: DateTime<Utc>,
    /// Readings in the bucket.
    pub count: usize,
    /// Mean value.
    pub mean: f64,
    /// Smallest value.
    pub min: f64,
    /// Largest value.
    pub max: f64,
}

/// Operations on the `sensor_data` table.
pub struct SensorStore<'a> {
    db: &'a Persistence,
}

impl<'a> SensorStore<'a> {
    /// Create a sensor store bound to a persistence handle.
    pub const fn new(db: &'a Persistence) -> Self {
        Self { db }
    }

    /// Validate and insert every reading in `payload` for an active session.
    ///
    /// Invalid readings are dropped and logged. Returns how many were
    /// written; all of them are committed together or none are.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::InvalidSession`] if the session is not
    /// active, or [`PersistenceError::Store`] if the insert fails.
    pub async fn save_batch(
        &self,
        session_id: &SessionId,
        payload: &Value,
    ) -> Result<usize, PersistenceError> {
        async {
            batch::require_open_session(self.db, session_id).await?;

            let parsed = parse_readings(session_id, payload, self.db.now());
            if parsed.records.is_empty() {
                tracing::info!(rejected = parsed.rejections.len(), "No valid sensor readings");
                return Ok(0);
            }

            let provider = self.db.provider();
            let rows = parsed.records.as_slice();
            let inserted = self
                .db
                .run("insert_sensor_readings", move || {
                    provider.insert_sensor_readings(rows)
                })
                .await?;

            tracing::info!(
                inserted,
                rejected = parsed.rejections.len(),
                "Saved sensor readings"
            );
            Ok(batch::row_count(inserted))
        }
        .instrument(tracing::info_span!("save_sensor_batch", session_id = %session_id))
        .await
    }

    /// Every reading of a session, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if the read fails.
    pub async fn query_by_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<SensorReading>, PersistenceError> {
        let provider = self.db.provider();
        let readings = self
            .db
            .run("select_sensor_readings", move || {
                provider.sensor_readings(session_id)
            })
            .await?;
        tracing::debug!(session_id = %session_id, count = readings.len(), "Read sensor readings");
        Ok(readings)
    }

    /// Readings of one sensor type, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if the read fails.
    pub async fn query_by_type(
        &self,
        session_id: &SessionId,
        sensor_type: &str,
    ) -> Result<Vec<SensorReading>, PersistenceError> {
        let mut readings = self.query_by_session(session_id).await?;
        readings.retain(|r| r.sensor_type == sensor_type);
        Ok(readings)
    }

    /// Readings taken within `[from, to]`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::InvalidArgument`] if `from` is after `to`,
    /// or [`PersistenceError::Store`] if the read fails.
    pub async fn query_time_range(
        &self,
        session_id: &SessionId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SensorReading>, PersistenceError> {
        if from > to {
            return Err(PersistenceError::InvalidArgument(format!(
                "range start {from} is after range end {to}"
            )));
        }
        let mut readings = self.query_by_session(session_id).await?;
        readings.retain(|r| r.ts >= from && r.ts <= to);
        Ok(readings)
    }

    /// Most recent reading of one sensor type.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if the read fails.
    pub async fn latest_reading(
        &self,
        session_id: &SessionId,
        sensor_type: &str,
    ) -> Result<Option<SensorReading>, PersistenceError> {
        Ok(self.query_by_type(session_id, sensor_type).await?.pop())
    }

    /// Distinct sensor types seen in a session.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if the read fails.
    pub async fn sensor_types(
        &self,
        session_id: &SessionId,
    ) -> Result<BTreeSet<String>, PersistenceError> {
        let readings = self.query_by_session(session_id).await?;
        Ok(readings.into_iter().map(|r| r.sensor_type).collect())
    }

    /// Count, min, max, mean, median and standard deviation per sensor type.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if the read fails.
    pub async fn statistics(
        &self,
        session_id: &SessionId,
    ) -> Result<BTreeMap<String, Summary>, PersistenceError> {
        let readings = self.query_by_session(session_id).await?;
        Ok(statistics_by_type(&readings))
    }

    /// Readings of one sensor type grouped into time buckets.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if the read fails.
    pub async fn aggregate_by_interval(
        &self,
        session_id: &SessionId,
        sensor_type: &str,
        bucket: TimeBucket,
    ) -> Result<Vec<IntervalAggregate>, PersistenceError> {
        let readings = self.query_by_type(session_id, sensor_type).await?;
        Ok(aggregate_by_bucket(&readings, bucket))
    }
}

// =========================================================================
// Payload flattening
// =========================================================================

/// Flatten a sensor payload into readings stamped with `session_id`.
///
/// Readings without a timestamp take `now`.
pub fn parse_readings(
    session_id: &SessionId,
    payload: &Value,
    now: DateTime<Utc>,
) -> Parsed<SensorReading> {
    let mut parsed = Parsed::default();
    let entries = match batch::as_object(payload, "sensor payload") {
        Ok(entries) => entries,
        Err(reason) => {
            parsed.reject("", reason);
            return parsed;
        }
    };

    for (sensor_type, entry) in entries {
        parsed.push(
            sensor_type.as_str(),
            parse_reading(session_id, sensor_type, entry, now),
        );
    }
    parsed
}

fn parse_reading(
    session_id: &SessionId,
    sensor_type: &str,
    entry: &Value,
    now: DateTime<Utc>,
) -> Result<SensorReading, String> {
    if sensor_type.trim().is_empty() {
        return Err("sensor type is empty".to_owned());
    }

    let reading = |value: f64, unit: String, ts: DateTime<Utc>, quality_flag: String| SensorReading {
        session_id: session_id.clone(),
        ts,
        sensor_type: sensor_type.to_owned(),
        value,
        unit,
        quality_flag,
    };

    match entry {
        Value::Object(fields) => {
            let value = fields
                .get("value")
                .ok_or_else(|| "reading has no value".to_owned())?;
            let value = batch::finite_number(value)
                .ok_or_else(|| format!("value must be a finite number, got {value}"))?;
            Ok(reading(
                value,
                batch::optional_string(fields, "unit", "")?,
                batch::optional_timestamp(fields, "timestamp", now)?,
                quality_flag(fields)?,
            ))
        }
        other => {
            let value = batch::finite_number(other)
                .ok_or_else(|| format!("value must be a finite number, got {other}"))?;
            Ok(reading(value, String::new(), now, DEFAULT_QUALITY.to_owned()))
        }
    }
}

/// Quality flags are stored lowercase.
fn quality_flag(fields: &Map<String, Value>) -> Result<String, String> {
    let flag = batch::optional_string(fields, "quality_flag", DEFAULT_QUALITY)?;
    Ok(flag.to_lowercase())
}

// =========================================================================
// Aggregation
// =========================================================================

fn statistics_by_type(readings: &[SensorReading]) -> BTreeMap<String, Summary> {
    let mut values: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for reading in readings {
        values
            .entry(reading.sensor_type.as_str())
            .or_default()
            .push(reading.value);
    }
    values
        .into_iter()
        .filter_map(|(sensor_type, values)| {
            Summary::of(&values).map(|summary| (sensor_type.to_owned(), summary))
        })
        .collect()
}

fn aggregate_by_bucket(readings: &[SensorReading], bucket: TimeBucket) -> Vec<IntervalAggregate> {
    let mut buckets: BTreeMap<DateTime<Utc>, Vec<f64>> = BTreeMap::new();
    for reading in readings {
        buckets
            .entry(aggregate::bucket_start(reading.ts, bucket))
            .or_default()
            .push(reading.value);
    }
    buckets
        .into_iter()
        .filter_map(|(bucket_start, values)| {
            let summary = Summary::of(&values)?;
            Some(IntervalAggregate {
                bucket_start,
                count: summary.count,
                mean: summary.mean,
                min: summary.min,
                max: summary.max,
            })
        })
        .collect()
}

// =========================================================================
// PostgreSQL primitives
// =========================================================================

#[derive(Debug, sqlx::FromRow)]
struct SensorRow {
    session_id: String,
    ts: DateTime<Utc>,
    sensor_type: String,
    value: f64,
    unit: String,
    quality_flag: String,
}

impl From<SensorRow> for SensorReading {
    fn from(row: SensorRow) -> Self {
        Self {
            session_id: SessionId::new(row.session_id),
            ts: row.ts,
            sensor_type: row.sensor_type,
            value: row.value,
            unit: row.unit,
            quality_flag: row.quality_flag,
        }
    }
}

pub(crate) async fn insert_rows(
    conn: &mut PgConnection,
    rows: &[SensorReading],
) -> Result<u64, StoreError> {
    let mut tx = conn.begin().await?;
    let mut inserted: u64 = 0;

    for chunk in rows.chunks(INSERT_CHUNK) {
        let len = chunk.len();
        let mut session_ids = Vec::with_capacity(len);
        let mut timestamps = Vec::with_capacity(len);
        let mut sensor_types = Vec::with_capacity(len);
        let mut values = Vec::with_capacity(len);
        let mut units = Vec::with_capacity(len);
        let mut quality_flags = Vec::with_capacity(len);

        for row in chunk {
            session_ids.push(row.session_id.as_str());
            timestamps.push(row.ts);
            sensor_types.push(row.sensor_type.as_str());
            values.push(row.value);
            units.push(row.unit.as_str());
            quality_flags.push(row.quality_flag.as_str());
        }

        let result = sqlx::query(
            r"INSERT INTO sensor_data (session_id, ts, sensor_type, value, unit, quality_flag)
              SELECT * FROM UNNEST($1::TEXT[], $2::TIMESTAMPTZ[], $3::TEXT[], $4::DOUBLE PRECISION[], $5::TEXT[], $6::TEXT[])",
        )
        .bind(&session_ids)
        .bind(&timestamps)
        .bind(&sensor_types)
        .bind(&values)
        .bind(&units)
        .bind(&quality_flags)
        .execute(&mut *tx)
        .await?;
        inserted = inserted.saturating_add(result.rows_affected());
    }

    tx.commit().await?;
    tracing::debug!(count = inserted, "Inserted sensor readings (batch UNNEST)");
    Ok(inserted)
}

pub(crate) async fn select_rows(
    conn: &mut PgConnection,
    session_id: &SessionId,
) -> Result<Vec<SensorReading>, StoreError> {
    let rows = sqlx::query_as::<_, SensorRow>(
        r"SELECT session_id, ts, sensor_type, value, unit, quality_flag
          FROM sensor_data
          WHERE session_id = $1
          ORDER BY ts, id",
    )
    .bind(session_id.as_str())
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(SensorReading::from).collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 10, 14, 0, 0).unwrap()
    }

    fn id() -> SessionId {
        SessionId::new("s-1")
    }

    #[test]
    fn bare_numbers_and_objects_both_flatten() {
        let payload = json!({
            "temperature": 25.5,
            "soil_humidity": {
                "value": 62.0,
                "unit": "%",
                "timestamp": "2025-04-10T14:30:00",
                "quality_flag": "SUSPECT"
            }
        });
        let parsed = parse_readings(&id(), &payload, now());
        assert!(parsed.rejections.is_empty());
        assert_eq!(parsed.records.len(), 2);

        let humidity = parsed
            .records
            .iter()
            .find(|r| r.sensor_type == "soil_humidity")
            .unwrap();
        assert_eq!(humidity.unit, "%");
        assert_eq!(humidity.quality_flag, "suspect");
        assert_eq!(humidity.ts, Utc.with_ymd_and_hms(2025, 4, 10, 14, 30, 0).unwrap());

        let temperature = parsed
            .records
            .iter()
            .find(|r| r.sensor_type == "temperature")
            .unwrap();
        assert_eq!(temperature.value, 25.5);
        assert_eq!(temperature.ts, now());
        assert_eq!(temperature.quality_flag, "good");
    }

    #[test]
    fn invalid_readings_are_dropped() {
        let payload = json!({
            "temperature": "hot",
            "wind": { "unit": "m/s" },
            "rain": { "value": 1.0, "timestamp": "soon" },
            "speed": 5.2
        });
        let parsed = parse_readings(&id(), &payload, now());
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.rejections.len(), 3);
    }

    #[test]
    fn non_object_payload_is_one_rejection() {
        let parsed = parse_readings(&id(), &json!([1, 2, 3]), now());
        assert!(parsed.records.is_empty());
        assert_eq!(parsed.rejections.len(), 1);
    }

    #[test]
    fn statistics_group_by_type() {
        let payload = json!({ "a": 1.0, "b": 10.0 });
        let mut readings = parse_readings(&id(), &payload, now()).records;
        readings.extend(parse_readings(&id(), &json!({ "a": 3.0 }), now()).records);

        let stats = statistics_by_type(&readings);
        assert_eq!(stats.len(), 2);
        let a = stats.get("a").unwrap();
        assert_eq!(a.count, 2);
        assert_eq!(a.mean, 2.0);
        assert_eq!(a.std_dev, 1.0);
    }

    #[test]
    fn buckets_are_ordered_and_summarized() {
        let payload = |ts: &str, value: f64| json!({ "t": { "value": value, "timestamp": ts } });
        let readings: Vec<SensorReading> = [
            ("2025-04-10T15:10:00Z", 4.0),
            ("2025-04-10T14:05:00Z", 1.0),
            ("2025-04-10T14:55:00Z", 3.0),
        ]
        .iter()
        .flat_map(|(ts, value)| parse_readings(&id(), &payload(*ts, *value), now()).records)
        .collect();

        let hourly = aggregate_by_bucket(&readings, TimeBucket::Hour);
        assert_eq!(hourly.len(), 2);
        let first = hourly.first().unwrap();
        assert_eq!(first.bucket_start, now());
        assert_eq!(first.count, 2);
        assert_eq!(first.mean, 2.0);
        assert_eq!(first.max, 3.0);
    }
}
