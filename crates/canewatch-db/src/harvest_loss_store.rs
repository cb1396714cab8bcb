//! Harvest loss estimates: batch save, factor analysis and trend.
//!
//! The payload is one loss estimate or an array of them:
//!
//! ```json
//! {
//!   "timestamp": "2025-04-10T14:30:00",
//!   "loss_estimate": 12.5,
//!   "problematic_factors": [
//!     { "factor": "harvester_speed", "value": 7.5, "optimal_range": [4.5, 6.5], "severity": 0.8, "direction": "above" }
//!   ],
//!   "confidence_level": "high",
//!   "field_conditions": { "crop_variety": "RB92579", "field_slope": 5.2 }
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};

use canewatch_types::{
    ConfidenceLevel, HarvestLossRecord, LossCategory, LossTrend, ProblematicFactor, SessionId,
    TimeBucket,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::{Connection, PgConnection};
use tracing::Instrument;

use crate::aggregate::{self, count_f64};
use crate::batch::{self, INSERT_CHUNK, Parsed};
use crate::error::{PersistenceError, StoreError};
use crate::persistence::Persistence;

/// Ratio of second-half to first-half mean above which losses are rising.
const RISING_RATIO: f64 = 1.1;
/// Ratio below which losses are falling.
const FALLING_RATIO: f64 = 0.9;
/// Fewest records for which a trend is computed.
const MIN_TREND_RECORDS: usize = 3;

/// How often a factor shows up across a session's loss records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FactorFrequency {
    /// Factor name.
    pub factor: String,
    /// Records mentioning the factor.
    pub count: usize,
    /// `count` as a fraction of all records.
    pub share: f64,
}

/// Summary of a session's loss estimates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LossStatistics {
    /// Number of estimates.
    pub count: usize,
    /// Mean loss percentage (0 when there are none).
    pub mean: f64,
    /// Smallest loss percentage.
    pub min: f64,
    /// Largest loss percentage.
    pub max: f64,
    /// Direction of losses over the session.
    pub trend: LossTrend,
    /// Estimates per severity band. Every band is present.
    pub categories: BTreeMap<LossCategory, usize>,
    /// Share of estimates per band, in percent.
    pub category_percentages: BTreeMap<LossCategory, f64>,
}

/// Mean loss within one time bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LossInterval {
    /// Start of the bucket.
    pub bucket_start: DateTime<Utc>,
    /// Estimates in the bucket.
    pub count: usize,
    /// Mean loss percentage.
    pub mean: f64,
}

/// Operations on the `harvest_losses` table.
pub struct HarvestLossStore<'a> {
    db: &'a Persistence,
}

impl<'a> HarvestLossStore<'a> {
    /// Create a harvest loss store bound to a persistence handle.
    pub const fn new(db: &'a Persistence) -> Self {
        Self { db }
    }

    /// Validate and insert every estimate in `payload` for an active
    /// session, atomically.
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

            let parsed = parse_losses(session_id, payload, self.db.now());
            if parsed.records.is_empty() {
                tracing::info!(rejected = parsed.rejections.len(), "No valid harvest loss estimates");
                return Ok(0);
            }

            let provider = self.db.provider();
            let rows = parsed.records.as_slice();
            let inserted = self
                .db
                .run("insert_harvest_losses", move || {
                    provider.insert_harvest_losses(rows)
                })
                .await?;

            tracing::info!(
                inserted,
                rejected = parsed.rejections.len(),
                "Saved harvest loss estimates"
            );
            Ok(batch::row_count(inserted))
        }
        .instrument(tracing::info_span!("save_harvest_loss_batch", session_id = %session_id))
        .await
    }

    /// Every estimate of a session, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if the read fails.
    pub async fn query_by_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<HarvestLossRecord>, PersistenceError> {
        let provider = self.db.provider();
        let records = self
            .db
            .run("select_harvest_losses", move || {
                provider.harvest_losses(session_id)
            })
            .await?;
        tracing::debug!(session_id = %session_id, count = records.len(), "Read harvest loss estimates");
        Ok(records)
    }

    /// The most recent estimate.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if the read fails.
    pub async fn latest(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<HarvestLossRecord>, PersistenceError> {
        Ok(self.query_by_session(session_id).await?.pop())
    }

    /// Estimates in one severity band, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if the read fails.
    pub async fn query_by_category(
        &self,
        session_id: &SessionId,
        category: LossCategory,
    ) -> Result<Vec<HarvestLossRecord>, PersistenceError> {
        let mut records = self.query_by_session(session_id).await?;
        records.retain(|r| r.category() == category);
        Ok(records)
    }

    /// Estimates naming `factor` among their problematic factors.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if the read fails.
    pub async fn query_by_factor(
        &self,
        session_id: &SessionId,
        factor: &str,
    ) -> Result<Vec<HarvestLossRecord>, PersistenceError> {
        let mut records = self.query_by_session(session_id).await?;
        records.retain(|r| r.mentions_factor(factor));
        Ok(records)
    }

    /// Factors whose share of records is at least `threshold`, most
    /// frequent first.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::InvalidArgument`] if `threshold` is not
    /// in `[0, 1]`, or [`PersistenceError::Store`] if the read fails.
    pub async fn factor_frequency(
        &self,
        session_id: &SessionId,
        threshold: f64,
    ) -> Result<Vec<FactorFrequency>, PersistenceError> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(PersistenceError::InvalidArgument(format!(
                "threshold must be within [0, 1], got {threshold}"
            )));
        }
        let records = self.query_by_session(session_id).await?;
        Ok(factor_frequency(&records, threshold))
    }

    /// Count, mean, range, trend and severity breakdown.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if the read fails.
    pub async fn statistics(&self, session_id: &SessionId) -> Result<LossStatistics, PersistenceError> {
        let records = self.query_by_session(session_id).await?;
        Ok(statistics(&records))
    }

    /// Mean loss per time bucket.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if the read fails.
    pub async fn average_by_interval(
        &self,
        session_id: &SessionId,
        bucket: TimeBucket,
    ) -> Result<Vec<LossInterval>, PersistenceError> {
        let records = self.query_by_session(session_id).await?;
        Ok(average_by_interval(&records, bucket))
    }
}

// =========================================================================
// Payload flattening
// =========================================================================

/// Flatten a loss payload (one estimate or an array) into records stamped
/// with `session_id`. Estimates without a timestamp take `now`.
pub fn parse_losses(
    session_id: &SessionId,
    payload: &Value,
    now: DateTime<Utc>,
) -> Parsed<HarvestLossRecord> {
    let mut parsed = Parsed::default();
    match payload {
        Value::Array(estimates) => {
            for (index, estimate) in estimates.iter().enumerate() {
                parsed.push(format!("[{index}]"), parse_loss(session_id, estimate, now));
            }
        }
        estimate => parsed.push("", parse_loss(session_id, estimate, now)),
    }
    parsed
}

fn parse_loss(
    session_id: &SessionId,
    estimate: &Value,
    now: DateTime<Utc>,
) -> Result<HarvestLossRecord, String> {
    let fields = batch::as_object(estimate, "loss estimate")?;

    let loss = fields
        .get("loss_estimate")
        .ok_or_else(|| "estimate has no loss_estimate".to_owned())?;
    let loss_percent = batch::finite_number(loss)
        .filter(|pct| (0.0..=100.0).contains(pct))
        .ok_or_else(|| format!("loss_estimate must be a number within [0, 100], got {loss}"))?;

    Ok(HarvestLossRecord {
        session_id: session_id.clone(),
        ts: batch::optional_timestamp(fields, "timestamp", now)?,
        loss_percent,
        factors: factors(fields)?,
        confidence: batch::optional_label(
            fields,
            "confidence_level",
            ConfidenceLevel::parse,
            ConfidenceLevel::Medium,
        )?,
        field_conditions: field_conditions(fields)?,
    })
}

fn factors(fields: &Map<String, Value>) -> Result<Vec<ProblematicFactor>, String> {
    let list = match fields.get("problematic_factors") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(list)) => list,
        Some(other) => return Err(format!("problematic_factors must be an array, got {other}")),
    };
    list.iter()
        .map(|entry| {
            let factor: ProblematicFactor = serde_json::from_value(entry.clone())
                .map_err(|e| format!("malformed problematic factor: {e}"))?;
            let [low, high] = factor.optimal_range;
            if factor.factor.trim().is_empty() {
                Err("problematic factor has no name".to_owned())
            } else if !(0.0..=1.0).contains(&factor.severity) {
                Err(format!("severity of {} must be within [0, 1]", factor.factor))
            } else if low > high {
                Err(format!("optimal range of {} is inverted", factor.factor))
            } else {
                Ok(factor)
            }
        })
        .collect()
}

fn field_conditions(fields: &Map<String, Value>) -> Result<Option<Map<String, Value>>, String> {
    match fields.get("field_conditions") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(conditions)) => Ok(Some(conditions.clone())),
        Some(other) => Err(format!("field_conditions must be an object, got {other}")),
    }
}

// =========================================================================
// Analysis
// =========================================================================

fn factor_frequency(records: &[HarvestLossRecord], threshold: f64) -> Vec<FactorFrequency> {
    if records.is_empty() {
        return Vec::new();
    }
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for record in records {
        let named: BTreeSet<&str> = record.factors.iter().map(|f| f.factor.as_str()).collect();
        for factor in named {
            let count = counts.entry(factor).or_default();
            *count = count.saturating_add(1);
        }
    }

    let total = count_f64(records.len());
    let mut frequencies: Vec<FactorFrequency> = counts
        .into_iter()
        .map(|(factor, count)| FactorFrequency {
            factor: factor.to_owned(),
            count,
            share: count_f64(count) / total,
        })
        .filter(|f| f.share >= threshold)
        .collect();
    // Stable sort keeps name order among equal counts.
    frequencies.sort_by(|a, b| b.count.cmp(&a.count));
    frequencies
}

fn statistics(records: &[HarvestLossRecord]) -> LossStatistics {
    let losses: Vec<f64> = records.iter().map(|r| r.loss_percent).collect();
    let mut categories: BTreeMap<LossCategory, usize> =
        LossCategory::ALL.iter().map(|c| (*c, 0)).collect();
    for record in records {
        let count = categories.entry(record.category()).or_default();
        *count = count.saturating_add(1);
    }
    let total = count_f64(losses.len());
    let category_percentages = categories
        .iter()
        .map(|(category, count)| {
            let pct = if losses.is_empty() {
                0.0
            } else {
                count_f64(*count) / total * 100.0
            };
            (*category, pct)
        })
        .collect();

    let min = losses.iter().copied().reduce(f64::min).unwrap_or(0.0);
    let max = losses.iter().copied().reduce(f64::max).unwrap_or(0.0);

    LossStatistics {
        count: losses.len(),
        mean: aggregate::mean(&losses).unwrap_or(0.0),
        min,
        max,
        trend: trend(&losses),
        categories,
        category_percentages,
    }
}

/// Compare the mean of the later half of the estimates with the earlier
/// half.
fn trend(losses: &[f64]) -> LossTrend {
    if losses.is_empty() {
        return LossTrend::InsufficientData;
    }
    if losses.len() < MIN_TREND_RECORDS {
        return LossTrend::Stable;
    }
    let (first, second) = losses.split_at(losses.len() / 2);
    match (aggregate::mean(first), aggregate::mean(second)) {
        (Some(first), Some(second)) if second > first * RISING_RATIO => LossTrend::Increasing,
        (Some(first), Some(second)) if second < first * FALLING_RATIO => LossTrend::Decreasing,
        _ => LossTrend::Stable,
    }
}

fn average_by_interval(records: &[HarvestLossRecord], bucket: TimeBucket) -> Vec<LossInterval> {
    let mut buckets: BTreeMap<DateTime<Utc>, Vec<f64>> = BTreeMap::new();
    for record in records {
        buckets
            .entry(aggregate::bucket_start(record.ts, bucket))
            .or_default()
            .push(record.loss_percent);
    }
    buckets
        .into_iter()
        .filter_map(|(bucket_start, losses)| {
            Some(LossInterval {
                bucket_start,
                count: losses.len(),
                mean: aggregate::mean(&losses)?,
            })
        })
        .collect()
}

// =========================================================================
// PostgreSQL primitives
// =========================================================================

#[derive(Debug, sqlx::FromRow)]
struct HarvestLossRow {
    session_id: String,
    ts: DateTime<Utc>,
    loss_percent: f64,
    factors_json: Value,
    confidence_level: String,
    field_conditions_json: Option<Value>,
}

impl TryFrom<HarvestLossRow> for HarvestLossRecord {
    type Error = StoreError;

    fn try_from(row: HarvestLossRow) -> Result<Self, Self::Error> {
        let confidence = ConfidenceLevel::parse(&row.confidence_level).ok_or_else(|| {
            StoreError::Decode(format!("unknown confidence level: {}", row.confidence_level))
        })?;
        let field_conditions = match row.field_conditions_json {
            Some(Value::Object(conditions)) => Some(conditions),
            _ => None,
        };
        Ok(Self {
            session_id: SessionId::new(row.session_id),
            ts: row.ts,
            loss_percent: row.loss_percent,
            factors: serde_json::from_value(row.factors_json)?,
            confidence,
            field_conditions,
        })
    }
}

pub(crate) async fn insert_rows(
    conn: &mut PgConnection,
    rows: &[HarvestLossRecord],
) -> Result<u64, StoreError> {
    let mut tx = conn.begin().await?;
    let mut inserted: u64 = 0;

    for chunk in rows.chunks(INSERT_CHUNK) {
        let len = chunk.len();
        let mut session_ids = Vec::with_capacity(len);
        let mut timestamps = Vec::with_capacity(len);
        let mut losses = Vec::with_capacity(len);
        let mut factors = Vec::with_capacity(len);
        let mut confidences = Vec::with_capacity(len);
        let mut conditions: Vec<Option<Value>> = Vec::with_capacity(len);

        for row in chunk {
            session_ids.push(row.session_id.as_str());
            timestamps.push(row.ts);
            losses.push(row.loss_percent);
            factors.push(serde_json::to_value(&row.factors)?);
            confidences.push(row.confidence.as_str());
            conditions.push(row.field_conditions.clone().map(Value::Object));
        }

        let result = sqlx::query(
            r"INSERT INTO harvest_losses (session_id, ts, loss_percent, factors_json, confidence_level, field_conditions_json)
              SELECT * FROM UNNEST($1::TEXT[], $2::TIMESTAMPTZ[], $3::DOUBLE PRECISION[], $4::JSONB[], $5::TEXT[], $6::JSONB[])",
        )
        .bind(&session_ids)
        .bind(&timestamps)
        .bind(&losses)
        .bind(&factors)
        .bind(&confidences)
        .bind(&conditions)
        .execute(&mut *tx)
        .await?;
        inserted = inserted.saturating_add(result.rows_affected());
    }

    tx.commit().await?;
    tracing::debug!(count = inserted, "Inserted harvest loss estimates (batch UNNEST)");
    Ok(inserted)
}

pub(crate) async fn select_rows(
    conn: &mut PgConnection,
    session_id: &SessionId,
) -> Result<Vec<HarvestLossRecord>, StoreError> {
    let rows = sqlx::query_as::<_, HarvestLossRow>(
        r"SELECT session_id, ts, loss_percent, factors_json, confidence_level, field_conditions_json
          FROM harvest_losses
          WHERE session_id = $1
          ORDER BY ts, id",
    )
    .bind(session_id.as_str())
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter().map(HarvestLossRecord::try_from).collect()
}
