//! Greenhouse-gas emissions: batch save, queries and totals.
//!
//! The payload follows the GHG Protocol scope tree. Scope 1 has a category
//! level; scopes 2 and 3 go straight to the source:
//!
//! ```json
//! {
//!   "timestamp": "2025-04-10T14:30:00Z",
//!   "scope1": { "mechanical": { "harvester": { "CO2": 105.3, "CO2e": { "value": 110.2, "calculation_method": "tier2" } } } },
//!   "scope2": { "grid_electricity": { "CO2e": 12.0 } }
//! }
//! ```
//!
//! A leaf is either a bare quantity or `{value, unit?, calculation_method?,
//! uncertainty_percent?}`. Only CO2 may be negative (removals).

use std::collections::BTreeMap;

use canewatch_types::{CalculationMethod, EmissionRecord, EmissionScope, GasType, SessionId, TimeBucket};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::{Connection, PgConnection};
use tracing::Instrument;

use crate::aggregate;
use crate::batch::{self, INSERT_CHUNK, Parsed};
use crate::error::{PersistenceError, StoreError};
use crate::persistence::Persistence;

const DEFAULT_UNIT: &str = "kg";
const DEFAULT_UNCERTAINTY_PCT: f64 = 10.0;
const TIMESTAMP_KEY: &str = "timestamp";

/// Per-gas sums.
pub type GasTotals = BTreeMap<GasType, Decimal>;

/// One point of an emission time series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeriesPoint {
    /// Start of the bucket.
    pub bucket_start: DateTime<Utc>,
    /// Sum of the gas within the bucket.
    pub total: Decimal,
}

/// Operations on the `ghg_emissions` table.
pub struct EmissionStore<'a> {
    db: &'a Persistence,
}

impl<'a> EmissionStore<'a> {
    /// Create an emission store bound to a persistence handle.
    pub const fn new(db: &'a Persistence) -> Self {
        Self { db }
    }

    /// Validate and insert every emission leaf in `payload` for an active
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

            let parsed = parse_emissions(session_id, payload, self.db.now());
            if parsed.records.is_empty() {
                tracing::info!(rejected = parsed.rejections.len(), "No valid emission records");
                return Ok(0);
            }

            let provider = self.db.provider();
            let rows = parsed.records.as_slice();
            let inserted = self
                .db
                .run("insert_emissions", move || provider.insert_emissions(rows))
                .await?;

            tracing::info!(
                inserted,
                rejected = parsed.rejections.len(),
                "Saved emission records"
            );
            Ok(batch::row_count(inserted))
        }
        .instrument(tracing::info_span!("save_emission_batch", session_id = %session_id))
        .await
    }

    /// Every emission record of a session, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if the read fails.
    pub async fn query_by_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<EmissionRecord>, PersistenceError> {
        let provider = self.db.provider();
        let records = self
            .db
            .run("select_emissions", move || provider.emissions(session_id))
            .await?;
        tracing::debug!(session_id = %session_id, count = records.len(), "Read emission records");
        Ok(records)
    }

    /// Records of one scope, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if the read fails.
    pub async fn query_by_scope(
        &self,
        session_id: &SessionId,
        scope: EmissionScope,
    ) -> Result<Vec<EmissionRecord>, PersistenceError> {
        let mut records = self.query_by_session(session_id).await?;
        records.retain(|r| r.scope == scope);
        Ok(records)
    }

    /// Per-gas sums for every scope that has records.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if the read fails.
    pub async fn totals_by_scope(
        &self,
        session_id: &SessionId,
    ) -> Result<BTreeMap<EmissionScope, GasTotals>, PersistenceError> {
        Ok(totals_by_scope(&self.query_by_session(session_id).await?))
    }

    /// CO2e sums per scope and category. Scopes 2 and 3 use the empty
    /// category.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if the read fails.
    pub async fn totals_by_category(
        &self,
        session_id: &SessionId,
    ) -> Result<BTreeMap<EmissionScope, BTreeMap<String, Decimal>>, PersistenceError> {
        Ok(co2e_by_category(&self.query_by_session(session_id).await?))
    }

    /// The session's emissions as a scope tree shaped like the save
    /// payload, with repeated leaves summed.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if the read fails.
    pub async fn structure(&self, session_id: &SessionId) -> Result<Value, PersistenceError> {
        Ok(structure(&self.query_by_session(session_id).await?))
    }

    /// Sums of one gas per time bucket, per scope.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if the read fails.
    pub async fn time_series(
        &self,
        session_id: &SessionId,
        gas: GasType,
        bucket: TimeBucket,
    ) -> Result<BTreeMap<EmissionScope, Vec<SeriesPoint>>, PersistenceError> {
        Ok(time_series(&self.query_by_session(session_id).await?, gas, bucket))
    }
}

// =========================================================================
// Payload flattening
// =========================================================================

/// Flatten an emission payload into records stamped with `session_id`.
///
/// Every record takes the payload's top-level `timestamp`, or `now`.
pub fn parse_emissions(
    session_id: &SessionId,
    payload: &Value,
    now: DateTime<Utc>,
) -> Parsed<EmissionRecord> {
    let mut parsed = Parsed::default();
    let scopes = match batch::as_object(payload, "emission payload") {
        Ok(scopes) => scopes,
        Err(reason) => {
            parsed.reject("", reason);
            return parsed;
        }
    };
    let ts = match batch::optional_timestamp(scopes, TIMESTAMP_KEY, now) {
        Ok(ts) => ts,
        Err(reason) => {
            parsed.reject(TIMESTAMP_KEY, reason);
            return parsed;
        }
    };

    let mut walker = Walker {
        session_id,
        ts,
        parsed: &mut parsed,
    };
    for (key, subtree) in scopes {
        if key == TIMESTAMP_KEY {
            continue;
        }
        let Some(scope) = EmissionScope::from_key(key) else {
            walker.parsed.reject(key.as_str(), format!("unknown scope: {key}"));
            continue;
        };
        let Some(level) = walker.level(key, subtree) else {
            continue;
        };
        if scope.has_categories() {
            for (category, sources) in level {
                let path = format!("{key}/{category}");
                if category.trim().is_empty() {
                    walker.parsed.reject(path, "category is empty");
                    continue;
                }
                if let Some(sources) = walker.level(&path, sources) {
                    walker.sources(scope, category, &path, sources);
                }
            }
        } else {
            walker.sources(scope, "", key, level);
        }
    }
    parsed
}

struct Walker<'p> {
    session_id: &'p SessionId,
    ts: DateTime<Utc>,
    parsed: &'p mut Parsed<EmissionRecord>,
}

impl Walker<'_> {
    /// An intermediate tree level, or a rejection of the whole subtree.
    fn level<'v>(&mut self, path: &str, value: &'v Value) -> Option<&'v Map<String, Value>> {
        match value.as_object() {
            Some(level) => Some(level),
            None => {
                self.parsed.reject(path, "expected a nested object");
                None
            }
        }
    }

    fn sources(
        &mut self,
        scope: EmissionScope,
        category: &str,
        prefix: &str,
        sources: &Map<String, Value>,
    ) {
        for (source, gases) in sources {
            let path = format!("{prefix}/{source}");
            let Some(gases) = self.level(&path, gases) else {
                continue;
            };
            for (gas, leaf) in gases {
                let candidate = GasType::parse(gas)
                    .ok_or_else(|| format!("unknown gas: {gas}"))
                    .and_then(|gas| self.leaf(scope, category, source, gas, leaf));
                self.parsed.push(format!("{path}/{gas}"), candidate);
            }
        }
    }

    fn leaf(
        &self,
        scope: EmissionScope,
        category: &str,
        source: &str,
        gas: GasType,
        leaf: &Value,
    ) -> Result<EmissionRecord, String> {
        let (value, unit, calc_method, uncertainty_pct) = match leaf {
            Value::Object(fields) => {
                let value = fields
                    .get("value")
                    .ok_or_else(|| "emission has no value".to_owned())?;
                (
                    quantity(value)?,
                    batch::optional_string(fields, "unit", DEFAULT_UNIT)?,
                    batch::optional_label(
                        fields,
                        "calculation_method",
                        CalculationMethod::parse,
                        CalculationMethod::Tier1,
                    )?,
                    uncertainty(fields)?,
                )
            }
            other => (
                quantity(other)?,
                DEFAULT_UNIT.to_owned(),
                CalculationMethod::Tier1,
                DEFAULT_UNCERTAINTY_PCT,
            ),
        };

        if value < Decimal::ZERO && !gas.allows_negative() {
            return Err(format!("negative {gas} quantity {value}"));
        }
        if source.trim().is_empty() {
            return Err("source is empty".to_owned());
        }

        Ok(EmissionRecord {
            session_id: self.session_id.clone(),
            ts: self.ts,
            scope,
            category: category.to_owned(),
            source: source.to_owned(),
            gas,
            value,
            unit,
            calc_method,
            uncertainty_pct,
        })
    }
}

fn quantity(value: &Value) -> Result<Decimal, String> {
    batch::decimal(value).ok_or_else(|| format!("quantity must be a number, got {value}"))
}

fn uncertainty(fields: &Map<String, Value>) -> Result<f64, String> {
    match fields.get("uncertainty_percent") {
        None | Some(Value::Null) => Ok(DEFAULT_UNCERTAINTY_PCT),
        Some(value) => batch::finite_number(value)
            .filter(|pct| *pct >= 0.0)
            .ok_or_else(|| format!("uncertainty_percent must be a non-negative number, got {value}")),
    }
}

// =========================================================================
// Aggregation
// =========================================================================

fn totals_by_scope(records: &[EmissionRecord]) -> BTreeMap<EmissionScope, GasTotals> {
    let mut totals: BTreeMap<EmissionScope, GasTotals> = BTreeMap::new();
    for record in records {
        let sum = totals
            .entry(record.scope)
            .or_default()
            .entry(record.gas)
            .or_default();
        *sum = sum.saturating_add(record.value);
    }
    totals
}

fn co2e_by_category(records: &[EmissionRecord]) -> BTreeMap<EmissionScope, BTreeMap<String, Decimal>> {
    let mut totals: BTreeMap<EmissionScope, BTreeMap<String, Decimal>> = BTreeMap::new();
    for record in records.iter().filter(|r| r.gas == GasType::Co2e) {
        let sum = totals
            .entry(record.scope)
            .or_default()
            .entry(record.category.clone())
            .or_default();
        *sum = sum.saturating_add(record.value);
    }
    totals
}

fn structure(records: &[EmissionRecord]) -> Value {
    // scope -> [category] -> source -> gas
    let mut tree: BTreeMap<&str, BTreeMap<Vec<&str>, GasTotals>> = BTreeMap::new();
    for record in records {
        let mut path = Vec::with_capacity(2);
        if record.scope.has_categories() {
            path.push(record.category.as_str());
        }
        path.push(record.source.as_str());
        let sum = tree
            .entry(record.scope.key())
            .or_default()
            .entry(path)
            .or_default()
            .entry(record.gas)
            .or_default();
        *sum = sum.saturating_add(record.value);
    }

    let mut root = Map::new();
    for (scope, leaves) in tree {
        let mut scope_node = Map::new();
        for (path, gases) in leaves {
            for (gas, total) in gases {
                insert_leaf(&mut scope_node, &path, gas.as_str(), number(total));
            }
        }
        root.insert(scope.to_owned(), Value::Object(scope_node));
    }
    Value::Object(root)
}

fn insert_leaf(node: &mut Map<String, Value>, path: &[&str], gas: &str, total: Value) {
    match path.split_first() {
        Some((head, rest)) => {
            let child = node
                .entry((*head).to_owned())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(child) = child {
                insert_leaf(child, rest, gas, total);
            }
        }
        None => {
            node.insert(gas.to_owned(), total);
        }
    }
}

fn number(value: Decimal) -> Value {
    value
        .to_f64()
        .and_then(serde_json::Number::from_f64)
        .map_or(Value::Null, Value::Number)
}

fn time_series(
    records: &[EmissionRecord],
    gas: GasType,
    bucket: TimeBucket,
) -> BTreeMap<EmissionScope, Vec<SeriesPoint>> {
    let mut sums: BTreeMap<EmissionScope, BTreeMap<DateTime<Utc>, Decimal>> = BTreeMap::new();
    for record in records.iter().filter(|r| r.gas == gas) {
        let sum = sums
            .entry(record.scope)
            .or_default()
            .entry(aggregate::bucket_start(record.ts, bucket))
            .or_default();
        *sum = sum.saturating_add(record.value);
    }
    sums.into_iter()
        .map(|(scope, points)| {
            let series = points
                .into_iter()
                .map(|(bucket_start, total)| SeriesPoint { bucket_start, total })
                .collect();
            (scope, series)
        })
        .collect()
}

// =========================================================================
// PostgreSQL primitives
// =========================================================================

#[derive(Debug, sqlx::FromRow)]
struct EmissionRow {
    session_id: String,
    ts: DateTime<Utc>,
    scope: i16,
    category: String,
    source: String,
    gas: String,
    value: Decimal,
    unit: String,
    calc_method: String,
    uncertainty_pct: f64,
}

impl TryFrom<EmissionRow> for EmissionRecord {
    type Error = StoreError;

    fn try_from(row: EmissionRow) -> Result<Self, Self::Error> {
        let scope = EmissionScope::from_number(row.scope)
            .ok_or_else(|| StoreError::Decode(format!("unknown scope: {}", row.scope)))?;
        let gas = GasType::parse(&row.gas)
            .ok_or_else(|| StoreError::Decode(format!("unknown gas: {}", row.gas)))?;
        let calc_method = CalculationMethod::parse(&row.calc_method).ok_or_else(|| {
            StoreError::Decode(format!("unknown calculation method: {}", row.calc_method))
        })?;
        Ok(Self {
            session_id: SessionId::new(row.session_id),
            ts: row.ts,
            scope,
            category: row.category,
            source: row.source,
            gas,
            value: row.value,
            unit: row.unit,
            calc_method,
            uncertainty_pct: row.uncertainty_pct,
        })
    }
}

pub(crate) async fn insert_rows(
    conn: &mut PgConnection,
    rows: &[EmissionRecord],
) -> Result<u64, StoreError> {
    let mut tx = conn.begin().await?;
    let mut inserted: u64 = 0;

    for chunk in rows.chunks(INSERT_CHUNK) {
        let len = chunk.len();
        let mut session_ids = Vec::with_capacity(len);
        let mut timestamps = Vec::with_capacity(len);
        let mut scopes = Vec::with_capacity(len);
        let mut categories = Vec::with_capacity(len);
        let mut sources = Vec::with_capacity(len);
        let mut gases = Vec::with_capacity(len);
        let mut values = Vec::with_capacity(len);
        let mut units = Vec::with_capacity(len);
        let mut methods = Vec::with_capacity(len);
        let mut uncertainties = Vec::with_capacity(len);

        for row in chunk {
            session_ids.push(row.session_id.as_str());
            timestamps.push(row.ts);
            scopes.push(row.scope.number());
            categories.push(row.category.as_str());
            sources.push(row.source.as_str());
            gases.push(row.gas.as_str());
            values.push(row.value);
            units.push(row.unit.as_str());
            methods.push(row.calc_method.as_str());
            uncertainties.push(row.uncertainty_pct);
        }

        let result = sqlx::query(
            r"INSERT INTO ghg_emissions (session_id, ts, scope, category, source, gas, value, unit, calc_method, uncertainty_pct)
              SELECT * FROM UNNEST($1::TEXT[], $2::TIMESTAMPTZ[], $3::SMALLINT[], $4::TEXT[], $5::TEXT[], $6::TEXT[], $7::NUMERIC[], $8::TEXT[], $9::TEXT[], $10::DOUBLE PRECISION[])",
        )
        .bind(&session_ids)
        .bind(&timestamps)
        .bind(&scopes)
        .bind(&categories)
        .bind(&sources)
        .bind(&gases)
        .bind(&values)
        .bind(&units)
        .bind(&methods)
        .bind(&uncertainties)
        .execute(&mut *tx)
        .await?;
        inserted = inserted.saturating_add(result.rows_affected());
    }

    tx.commit().await?;
    tracing::debug!(count = inserted, "Inserted emission records (batch UNNEST)");
    Ok(inserted)
}

pub(crate) async fn select_rows(
    conn: &mut PgConnection,
    session_id: &SessionId,
) -> Result<Vec<EmissionRecord>, StoreError> {
    let rows = sqlx::query_as::<_, EmissionRow>(
        r"SELECT session_id, ts, scope, category, source, gas, value, unit, calc_method, uncertainty_pct
          FROM ghg_emissions
          WHERE session_id = $1
          ORDER BY ts, id",
    )
    .bind(session_id.as_str())
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter().map(EmissionRecord::try_from).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 10, 14, 0, 0).unwrap()
    }

    fn parse(payload: &Value) -> Parsed<EmissionRecord> {
        parse_emissions(&SessionId::new("s-1"), payload, now())
    }

    #[test]
    fn scope_tree_flattens_with_defaults() {
        let parsed = parse(&json!({
            "scope1": {
                "mechanical": {
                    "harvester": {
                        "CO2": 105.3,
                        "CO2e": { "value": 110.2, "calculation_method": "tier2", "uncertainty_percent": 5.0 }
                    }
                }
            },
            "scope2": { "grid_electricity": { "CO2e": 12 } }
        }));
        assert!(parsed.rejections.is_empty());
        assert_eq!(parsed.records.len(), 3);

        let co2 = parsed.records.iter().find(|r| r.gas == GasType::Co2).unwrap();
        assert_eq!(co2.scope, EmissionScope::Scope1);
        assert_eq!(co2.category, "mechanical");
        assert_eq!(co2.source, "harvester");
        assert_eq!(co2.value, Decimal::new(1053, 1));
        assert_eq!(co2.unit, "kg");
        assert_eq!(co2.calc_method, CalculationMethod::Tier1);
        assert_eq!(co2.uncertainty_pct, 10.0);

        let detailed = parsed
            .records
            .iter()
            .find(|r| r.gas == GasType::Co2e && r.scope == EmissionScope::Scope1)
            .unwrap();
        assert_eq!(detailed.calc_method, CalculationMethod::Tier2);
        assert_eq!(detailed.uncertainty_pct, 5.0);

        let grid = parsed
            .records
            .iter()
            .find(|r| r.scope == EmissionScope::Scope2)
            .unwrap();
        assert_eq!(grid.category, "");
        assert_eq!(grid.ts, now());
    }

    #[test]
    fn invalid_leaves_are_dropped() {
        let parsed = parse(&json!({
            "scope1": { "mechanical": { "harvester": {
                "CO2": -3.0,
                "CH4": -1.0,
                "SF6": 1.0,
                "N2O": { "value": 1.0, "calculation_method": "guess" }
            } }, "  ": { "truck": { "CO2e": 1 } } },
            "scope4": { "x": { "CO2": 1.0 } },
            "scope3": { "transport": 7 }
        }));
        // Only the CO2 removal survives.
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.rejections.len(), 6);
        assert!(
            parsed
                .rejections
                .iter()
                .any(|r| r.path == "scope1/  " && r.reason == "category is empty")
        );
        let removal = parsed.records.first().unwrap();
        assert_eq!(removal.value, Decimal::from(-3));
    }

    #[test]
    fn top_level_timestamp_applies_to_every_record() {
        let parsed = parse(&json!({
            "timestamp": "2025-04-10T16:45:00Z",
            "scope3": { "fertilizer": { "N2O": 0.4 } }
        }));
        assert_eq!(
            parsed.records.first().unwrap().ts,
            Utc.with_ymd_and_hms(2025, 4, 10, 16, 45, 0).unwrap()
        );
    }

    #[test]
    fn totals_and_structure_sum_repeated_leaves() {
        let payload = json!({
            "scope1": { "mechanical": { "harvester": { "CO2e": 10, "CH4": 1 } } },
            "scope2": { "grid": { "CO2e": 4 } }
        });
        let mut records = parse(&payload).records;
        records.extend(parse(&payload).records);

        let totals = totals_by_scope(&records);
        assert_eq!(
            totals[&EmissionScope::Scope1][&GasType::Co2e],
            Decimal::from(20)
        );
        assert_eq!(totals[&EmissionScope::Scope1][&GasType::Ch4], Decimal::from(2));

        let categories = co2e_by_category(&records);
        assert_eq!(categories[&EmissionScope::Scope1]["mechanical"], Decimal::from(20));
        assert_eq!(categories[&EmissionScope::Scope2][""], Decimal::from(8));

        let tree = structure(&records);
        assert_eq!(tree["scope1"]["mechanical"]["harvester"]["CO2e"], json!(20.0));
        assert_eq!(tree["scope2"]["grid"]["CO2e"], json!(8.0));
    }

    #[test]
    fn time_series_filters_gas_and_buckets_per_scope() {
        let early = json!({ "timestamp": "2025-04-10T14:10:00Z", "scope1": { "m": { "h": { "CO2e": 1, "CO2": 9 } } } });
        let late = json!({ "timestamp": "2025-04-10T15:20:00Z", "scope1": { "m": { "h": { "CO2e": 2 } } } });
        let mut records = parse(&early).records;
        records.extend(parse(&late).records);

        let series = time_series(&records, GasType::Co2e, TimeBucket::Hour);
        let points = &series[&EmissionScope::Scope1];
        assert_eq!(points.len(), 2);
        assert_eq!(points.first().unwrap().total, Decimal::from(1));
        assert_eq!(points.last().unwrap().total, Decimal::from(2));
    }
}
