//! Carbon stock changes: batch save, totals and amortized flux.
//!
//! The payload maps each carbon pool to its change:
//!
//! ```json
//! {
//!   "soil_organic_carbon": { "change_co2": -1200.0, "amortization_period": 20, "measurement_method": "direct_sampling" },
//!   "above_ground_biomass": { "change_co2": -300.0, "cause": "combustion" }
//! }
//! ```
//!
//! A biomass or dead-matter loss caused by `combustion` is released at
//! once, so its amortization period is forced to one year.

use std::collections::BTreeMap;

use canewatch_types::{CarbonStockRecord, MeasurementMethod, SessionId, StockType};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use sqlx::{Connection, PgConnection};
use tracing::Instrument;

use crate::batch::{self, INSERT_CHUNK, Parsed};
use crate::error::{PersistenceError, StoreError};
use crate::persistence::Persistence;

/// Years over which a change is spread when the payload does not say.
pub const DEFAULT_AMORTIZATION_YEARS: u32 = 20;

const DEFAULT_UNIT: &str = "kg CO2";
const COMBUSTION: &str = "combustion";
const TIMESTAMP_KEY: &str = "timestamp";

/// Sums per carbon pool. Every pool is present, zero when it has no
/// records.
pub type StockTotals = BTreeMap<StockType, Decimal>;

/// Operations on the `carbon_stocks` table.
pub struct CarbonStockStore<'a> {
    db: &'a Persistence,
}

impl<'a> CarbonStockStore<'a> {
    /// Create a carbon stock store bound to a persistence handle.
    pub const fn new(db: &'a Persistence) -> Self {
        Self { db }
    }

    /// Validate and insert every pool change in `payload` for an active
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

            let parsed = parse_stock_changes(session_id, payload, self.db.now());
            if parsed.records.is_empty() {
                tracing::info!(rejected = parsed.rejections.len(), "No valid carbon stock changes");
                return Ok(0);
            }

            let provider = self.db.provider();
            let rows = parsed.records.as_slice();
            let inserted = self
                .db
                .run("insert_carbon_stocks", move || {
                    provider.insert_carbon_stocks(rows)
                })
                .await?;

            tracing::info!(
                inserted,
                rejected = parsed.rejections.len(),
                "Saved carbon stock changes"
            );
            Ok(batch::row_count(inserted))
        }
        .instrument(tracing::info_span!("save_carbon_stock_batch", session_id = %session_id))
        .await
    }

    /// Every stock change of a session, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if the read fails.
    pub async fn query_by_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<CarbonStockRecord>, PersistenceError> {
        let provider = self.db.provider();
        let records = self
            .db
            .run("select_carbon_stocks", move || {
                provider.carbon_stocks(session_id)
            })
            .await?;
        tracing::debug!(session_id = %session_id, count = records.len(), "Read carbon stock changes");
        Ok(records)
    }

    /// Changes to one pool, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if the read fails.
    pub async fn query_by_type(
        &self,
        session_id: &SessionId,
        stock_type: StockType,
    ) -> Result<Vec<CarbonStockRecord>, PersistenceError> {
        let mut records = self.query_by_session(session_id).await?;
        records.retain(|r| r.stock_type == stock_type);
        Ok(records)
    }

    /// Net change per pool.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if the read fails.
    pub async fn totals_by_type(&self, session_id: &SessionId) -> Result<StockTotals, PersistenceError> {
        let records = self.query_by_session(session_id).await?;
        Ok(sum_by_type(&records, |_| true))
    }

    /// Flux attributed to `year` (1-based) of each change's amortization
    /// window: `change / period` for every change whose period covers it.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::InvalidArgument`] if `year` is zero, or
    /// [`PersistenceError::Store`] if the read fails.
    pub async fn amortized_flux(
        &self,
        session_id: &SessionId,
        year: u32,
    ) -> Result<StockTotals, PersistenceError> {
        if year == 0 {
            return Err(PersistenceError::InvalidArgument(
                "amortization years start at 1".to_owned(),
            ));
        }
        let records = self.query_by_session(session_id).await?;
        Ok(amortized_flux(&records, year))
    }

    /// Land-use change emissions: losses spread over more than one year.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if the read fails.
    pub async fn land_use_change_emissions(
        &self,
        session_id: &SessionId,
    ) -> Result<StockTotals, PersistenceError> {
        let records = self.query_by_session(session_id).await?;
        Ok(sum_by_type(&records, |r| {
            r.change < Decimal::ZERO && r.amortization_period > 1
        }))
    }

    /// Carbon taken up by each pool: the sum of positive changes.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Store`] if the read fails.
    pub async fn sequestration(&self, session_id: &SessionId) -> Result<StockTotals, PersistenceError> {
        let records = self.query_by_session(session_id).await?;
        Ok(sum_by_type(&records, |r| r.change > Decimal::ZERO))
    }
}

// =========================================================================
// Payload flattening
// =========================================================================

/// Flatten a carbon stock payload into records stamped with `session_id`.
///
/// Every record takes the payload's top-level `timestamp`, or `now`.
pub fn parse_stock_changes(
    session_id: &SessionId,
    payload: &Value,
    now: DateTime<Utc>,
) -> Parsed<CarbonStockRecord> {
    let mut parsed = Parsed::default();
    let pools = match batch::as_object(payload, "carbon stock payload") {
        Ok(pools) => pools,
        Err(reason) => {
            parsed.reject("", reason);
            return parsed;
        }
    };
    let ts = match batch::optional_timestamp(pools, TIMESTAMP_KEY, now) {
        Ok(ts) => ts,
        Err(reason) => {
            parsed.reject(TIMESTAMP_KEY, reason);
            return parsed;
        }
    };

    for (key, entry) in pools {
        if key == TIMESTAMP_KEY {
            continue;
        }
        let candidate = StockType::parse(key)
            .ok_or_else(|| format!("unknown stock type: {key}"))
            .and_then(|stock_type| {
                let fields = batch::as_object(entry, "stock change")?;
                parse_change(session_id, ts, stock_type, fields)
            });
        parsed.push(key.as_str(), candidate);
    }
    parsed
}

fn parse_change(
    session_id: &SessionId,
    ts: DateTime<Utc>,
    stock_type: StockType,
    fields: &Map<String, Value>,
) -> Result<CarbonStockRecord, String> {
    let change = fields
        .get("change_co2")
        .ok_or_else(|| "stock change has no change_co2".to_owned())?;
    let change = batch::decimal(change)
        .ok_or_else(|| format!("change_co2 must be a number, got {change}"))?;

    let cause = batch::optional_string(fields, "cause", "")?;
    let amortization_period = if cause == COMBUSTION && stock_type.is_combustible() && change < Decimal::ZERO {
        1
    } else {
        amortization_period(fields)?
    };

    Ok(CarbonStockRecord {
        session_id: session_id.clone(),
        ts,
        stock_type,
        change,
        amortization_period,
        unit: batch::optional_string(fields, "unit", DEFAULT_UNIT)?,
        measurement_method: batch::optional_label(
            fields,
            "measurement_method",
            MeasurementMethod::parse,
            MeasurementMethod::ModelEstimate,
        )?,
    })
}

fn amortization_period(fields: &Map<String, Value>) -> Result<u32, String> {
    match fields.get("amortization_period") {
        None | Some(Value::Null) => Ok(DEFAULT_AMORTIZATION_YEARS),
        Some(value) => value
            .as_u64()
            .and_then(|years| i32::try_from(years).ok())
            .and_then(|years| u32::try_from(years).ok())
            .filter(|years| *years >= 1)
            .ok_or_else(|| format!("amortization_period must be a whole number of years >= 1, got {value}")),
    }
}

// =========================================================================
// Aggregation
// =========================================================================

fn zeroed() -> StockTotals {
    StockType::ALL.iter().map(|t| (*t, Decimal::ZERO)).collect()
}

fn sum_by_type(records: &[CarbonStockRecord], include: impl Fn(&CarbonStockRecord) -> bool) -> StockTotals {
    let mut totals = zeroed();
    for record in records.iter().filter(|r| include(r)) {
        let sum = totals.entry(record.stock_type).or_default();
        *sum = sum.saturating_add(record.change);
    }
    totals
}

fn amortized_flux(records: &[CarbonStockRecord], year: u32) -> StockTotals {
    let mut totals = zeroed();
    for record in records.iter().filter(|r| year <= r.amortization_period) {
        let share = record
            .change
            .checked_div(Decimal::from(record.amortization_period))
            .unwrap_or(Decimal::ZERO);
        let sum = totals.entry(record.stock_type).or_default();
        *sum = sum.saturating_add(share);
    }
    totals
}

// =========================================================================
// PostgreSQL primitives
// =========================================================================

#[derive(Debug, sqlx::FromRow)]
struct CarbonStockRow {
    session_id: String,
    ts: DateTime<Utc>,
    stock_type: String,
    change: Decimal,
    amortization_period: i32,
    unit: String,
    measurement_method: String,
}

impl TryFrom<CarbonStockRow> for CarbonStockRecord {
    type Error = StoreError;

    fn try_from(row: CarbonStockRow) -> Result<Self, Self::Error> {
        let stock_type = StockType::parse(&row.stock_type)
            .ok_or_else(|| StoreError::Decode(format!("unknown stock type: {}", row.stock_type)))?;
        let measurement_method = MeasurementMethod::parse(&row.measurement_method).ok_or_else(|| {
            StoreError::Decode(format!("unknown measurement method: {}", row.measurement_method))
        })?;
        let amortization_period = u32::try_from(row.amortization_period)
            .ok()
            .ok_or_else(|| {
                StoreError::Decode(format!("negative amortization period: {}", row.amortization_period))
            })?;
        Ok(Self {
            session_id: SessionId::new(row.session_id),
            ts: row.ts,
            stock_type,
            change: row.change,
            amortization_period,
            unit: row.unit,
            measurement_method,
        })
    }
}

pub(crate) async fn insert_rows(
    conn: &mut PgConnection,
    rows: &[CarbonStockRecord],
) -> Result<u64, StoreError> {
    let mut tx = conn.begin().await?;
    let mut inserted: u64 = 0;

    for chunk in rows.chunks(INSERT_CHUNK) {
        let len = chunk.len();
        let mut session_ids = Vec::with_capacity(len);
        let mut timestamps = Vec::with_capacity(len);
        let mut stock_types = Vec::with_capacity(len);
        let mut changes = Vec::with_capacity(len);
        let mut periods = Vec::with_capacity(len);
        let mut units = Vec::with_capacity(len);
        let mut methods = Vec::with_capacity(len);

        for row in chunk {
            session_ids.push(row.session_id.as_str());
            timestamps.push(row.ts);
            stock_types.push(row.stock_type.as_str());
            changes.push(row.change);
            periods.push(i32::try_from(row.amortization_period).map_err(|e| {
                StoreError::Decode(format!(
                    "amortization_period {} does not fit the column: {e}",
                    row.amortization_period
                ))
            })?);
            units.push(row.unit.as_str());
            methods.push(row.measurement_method.as_str());
        }

        let result = sqlx::query(
            r"INSERT INTO carbon_stocks (session_id, ts, stock_type, change, amortization_period, unit, measurement_method)
              SELECT * FROM UNNEST($1::TEXT[], $2::TIMESTAMPTZ[], $3::TEXT[], $4::NUMERIC[], $5::INTEGER[], $6::TEXT[], $7::TEXT[])",
        )
        .bind(&session_ids)
        .bind(&timestamps)
        .bind(&stock_types)
        .bind(&changes)
        .bind(&periods)
        .bind(&units)
        .bind(&methods)
        .execute(&mut *tx)
        .await?;
        inserted = inserted.saturating_add(result.rows_affected());
    }

    tx.commit().await?;
    tracing::debug!(count = inserted, "Inserted carbon stock changes (batch UNNEST)");
    Ok(inserted)
}

pub(crate) async fn select_rows(
    conn: &mut PgConnection,
    session_id: &SessionId,
) -> Result<Vec<CarbonStockRecord>, StoreError> {
    let rows = sqlx::query_as::<_, CarbonStockRow>(
        r"SELECT session_id, ts, stock_type, change, amortization_period, unit, measurement_method
          FROM carbon_stocks
          WHERE session_id = $1
          ORDER BY ts, id",
    )
    .bind(session_id.as_str())
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter().map(CarbonStockRecord::try_from).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(payload: &Value) -> Parsed<CarbonStockRecord> {
        parse_stock_changes(&SessionId::new("s-1"), payload, Utc::now())
    }

    fn find(records: &[CarbonStockRecord], stock_type: StockType) -> &CarbonStockRecord {
        records.iter().find(|r| r.stock_type == stock_type).unwrap()
    }

    #[test]
    fn defaults_apply_to_absent_fields() {
        let parsed = parse(&json!({
            "soil_organic_carbon": { "change_co2": -1200 }
        }));
        let soil = find(&parsed.records, StockType::SoilOrganicCarbon);
        assert_eq!(soil.amortization_period, DEFAULT_AMORTIZATION_YEARS);
        assert_eq!(soil.measurement_method, MeasurementMethod::ModelEstimate);
        assert_eq!(soil.unit, "kg CO2");
        assert_eq!(soil.change, Decimal::from(-1200));
    }

    #[test]
    fn combustion_loss_is_released_in_one_year() {
        let parsed = parse(&json!({
            "above_ground_biomass": { "change_co2": -300, "amortization_period": 20, "cause": "combustion" },
            "dead_organic_matter": { "change_co2": 50, "cause": "combustion" },
            "soil_organic_carbon": { "change_co2": -10, "cause": "combustion" }
        }));
        assert!(parsed.rejections.is_empty());
        assert_eq!(find(&parsed.records, StockType::AboveGroundBiomass).amortization_period, 1);
        // Gains and non-combustible pools keep their period.
        assert_eq!(find(&parsed.records, StockType::DeadOrganicMatter).amortization_period, 20);
        assert_eq!(find(&parsed.records, StockType::SoilOrganicCarbon).amortization_period, 20);
    }

    #[test]
    fn invalid_changes_are_dropped() {
        let parsed = parse(&json!({
            "peat": { "change_co2": 1 },
            "soil_organic_carbon": { "change_co2": 1, "amortization_period": 0 },
            "above_ground_biomass": { "change_co2": 1, "measurement_method": "guess" },
            "below_ground_biomass": { "amortization_period": 5 },
            "dead_organic_matter": 4
        }));
        assert!(parsed.records.is_empty());
        assert_eq!(parsed.rejections.len(), 5);
    }

    #[test]
    fn period_must_fit_the_integer_column() {
        let parsed = parse(&json!({
            "soil_organic_carbon": { "change_co2": 1, "amortization_period": 2_147_483_648_u64 },
            "above_ground_biomass": { "change_co2": 1, "amortization_period": 2_147_483_647 }
        }));
        assert_eq!(parsed.rejections.len(), 1);
        assert_eq!(
            parsed.rejections.first().map(|r| r.path.as_str()),
            Some("soil_organic_carbon")
        );
        assert_eq!(
            find(&parsed.records, StockType::AboveGroundBiomass).amortization_period,
            2_147_483_647
        );
    }

    #[test]
    fn flux_spreads_changes_over_their_window() {
        let records = parse(&json!({
            "soil_organic_carbon": { "change_co2": -1000, "amortization_period": 20 },
            "above_ground_biomass": { "change_co2": -300, "cause": "combustion" },
            "below_ground_biomass": { "change_co2": 200, "amortization_period": 10 }
        }))
        .records;

        let first = amortized_flux(&records, 1);
        assert_eq!(first.len(), StockType::ALL.len());
        assert_eq!(first[&StockType::SoilOrganicCarbon], Decimal::from(-50));
        assert_eq!(first[&StockType::AboveGroundBiomass], Decimal::from(-300));
        assert_eq!(first[&StockType::BelowGroundBiomass], Decimal::from(20));
        assert_eq!(first[&StockType::DeadOrganicMatter], Decimal::ZERO);

        let eleventh = amortized_flux(&records, 11);
        assert_eq!(eleventh[&StockType::SoilOrganicCarbon], Decimal::from(-50));
        assert_eq!(eleventh[&StockType::AboveGroundBiomass], Decimal::ZERO);
        assert_eq!(eleventh[&StockType::BelowGroundBiomass], Decimal::ZERO);
    }

    #[test]
    fn luc_and_sequestration_split_by_sign() {
        let records = parse(&json!({
            "soil_organic_carbon": { "change_co2": -1000 },
            "above_ground_biomass": { "change_co2": -300, "cause": "combustion" },
            "below_ground_biomass": { "change_co2": 200 }
        }))
        .records;

        let luc = sum_by_type(&records, |r| r.change < Decimal::ZERO && r.amortization_period > 1);
        assert_eq!(luc[&StockType::SoilOrganicCarbon], Decimal::from(-1000));
        assert_eq!(luc[&StockType::AboveGroundBiomass], Decimal::ZERO);

        let uptake = sum_by_type(&records, |r| r.change > Decimal::ZERO);
        assert_eq!(uptake[&StockType::BelowGroundBiomass], Decimal::from(200));
        assert_eq!(uptake[&StockType::SoilOrganicCarbon], Decimal::ZERO);
    }
}
