//! Shared pieces of the batch record stores.
//!
//! Every `save_batch` follows the same steps: check the session, flatten
//! the payload into candidates, drop invalid candidates with a warning,
//! and write the survivors in one transaction. This module holds the
//! candidate bookkeeping and the JSON field readers the four stores share.

use std::str::FromStr;

use canewatch_types::SessionId;
use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde_json::{Map, Value};

use crate::error::PersistenceError;
use crate::persistence::Persistence;

/// Rows per `UNNEST` statement. Every chunk of one batch shares a
/// transaction.
pub(crate) const INSERT_CHUNK: usize = 500;

/// A candidate that failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Where in the payload the candidate sat, e.g. `scope1/mechanical/harvester/CO2`.
    pub path: String,
    /// What was wrong with it.
    pub reason: String,
}

/// Valid records flattened from a payload, plus what was dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed<T> {
    /// Candidates that passed validation, in payload order.
    pub records: Vec<T>,
    /// Candidates that did not.
    pub rejections: Vec<Rejection>,
}

impl<T> Default for Parsed<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            rejections: Vec::new(),
        }
    }
}

impl<T> Parsed<T> {
    /// Keep a valid record.
    pub(crate) fn accept(&mut self, record: T) {
        self.records.push(record);
    }

    /// Drop a candidate and log why.
    pub(crate) fn reject(&mut self, path: impl Into<String>, reason: impl Into<String>) {
        let rejection = Rejection {
            path: path.into(),
            reason: reason.into(),
        };
        tracing::warn!(path = %rejection.path, reason = %rejection.reason, "Dropped invalid candidate");
        self.rejections.push(rejection);
    }

    /// Record the outcome of validating one candidate.
    pub(crate) fn push(&mut self, path: impl Into<String>, candidate: Result<T, String>) {
        match candidate {
            Ok(record) => self.accept(record),
            Err(reason) => self.reject(path, reason),
        }
    }
}

/// Fail with [`PersistenceError::InvalidSession`] unless the session
/// exists, is active, and has not ended.
pub(crate) async fn require_open_session(
    db: &Persistence,
    id: &SessionId,
) -> Result<(), PersistenceError> {
    if db.sessions().validate(id).await? {
        Ok(())
    } else {
        tracing::warn!(session_id = %id, "Session is missing, not active, or ended");
        Err(PersistenceError::InvalidSession(id.clone()))
    }
}

/// Row count reported by the driver, as a `usize`.
pub(crate) fn row_count(rows: u64) -> usize {
    usize::try_from(rows).unwrap_or(usize::MAX)
}

// =========================================================================
// Field readers
// =========================================================================

/// The payload's top level as an object.
pub(crate) fn as_object<'v>(value: &'v Value, what: &str) -> Result<&'v Map<String, Value>, String> {
    value
        .as_object()
        .ok_or_else(|| format!("{what} must be a JSON object"))
}

/// A finite number.
pub(crate) fn finite_number(value: &Value) -> Option<f64> {
    value.as_f64().filter(|n| n.is_finite())
}

/// A number as an exact decimal.
///
/// Integers and plain decimals keep every digit; scientific notation is
/// expanded; anything else goes through `f64`.
pub(crate) fn decimal(value: &Value) -> Option<Decimal> {
    let Value::Number(number) = value else {
        return None;
    };
    let text = number.to_string();
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
        .or_else(|| number.as_f64().and_then(Decimal::from_f64))
}

/// An optional string field. Absent or `null` takes `default`.
pub(crate) fn optional_string(
    object: &Map<String, Value>,
    key: &str,
    default: &str,
) -> Result<String, String> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(default.to_owned()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(format!("{key} must be a string, got {other}")),
    }
}

/// An optional closed label. Absent or `null` takes `default`; a present
/// label the set does not know is an error.
pub(crate) fn optional_label<T>(
    object: &Map<String, Value>,
    key: &str,
    parse: fn(&str) -> Option<T>,
    default: T,
) -> Result<T, String> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::String(label)) => parse(label).ok_or_else(|| format!("unknown {key}: {label}")),
        Some(other) => Err(format!("{key} must be a string, got {other}")),
    }
}

/// An optional timestamp. Absent or `null` takes `default`.
///
/// Accepts RFC 3339 and zone-less ISO 8601 (read as UTC).
pub(crate) fn optional_timestamp(
    object: &Map<String, Value>,
    key: &str,
    default: DateTime<Utc>,
) -> Result<DateTime<Utc>, String> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::String(text)) => parse_timestamp(text),
        Some(other) => Err(format!("{key} must be a string, got {other}")),
    }
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| format!("unreadable timestamp: {text}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use canewatch_types::GasType;
    use chrono::TimeZone;
    use serde_json::json;

    fn object(value: &Value) -> &Map<String, Value> {
        value.as_object().unwrap()
    }

    #[test]
    fn decimals_keep_exact_digits() {
        assert_eq!(decimal(&json!(105.3)), Some(Decimal::new(1053, 1)));
        assert_eq!(decimal(&json!(-42)), Some(Decimal::from(-42)));
        assert_eq!(decimal(&json!(1.5e3)), Some(Decimal::from(1500)));
        assert_eq!(decimal(&json!("12")), None);
    }

    #[test]
    fn labels_default_when_absent_and_fail_when_unknown() {
        let payload = json!({ "gas": "SF6" });
        let fields = object(&payload);
        assert_eq!(
            optional_label(fields, "other", GasType::parse, GasType::Co2e),
            Ok(GasType::Co2e)
        );
        assert!(optional_label(fields, "gas", GasType::parse, GasType::Co2e).is_err());
    }

    #[test]
    fn timestamps_accept_offset_and_naive_forms() {
        let expected = Utc.with_ymd_and_hms(2025, 4, 10, 14, 30, 0).unwrap();
        let fallback = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        for text in [
            "2025-04-10T14:30:00Z",
            "2025-04-10T11:30:00-03:00",
            "2025-04-10T14:30:00",
            "2025-04-10 14:30:00.000",
        ] {
            let payload = json!({ "timestamp": text });
            assert_eq!(
                optional_timestamp(object(&payload), "timestamp", fallback),
                Ok(expected),
                "{text}"
            );
        }
        let empty = json!({});
        assert_eq!(optional_timestamp(object(&empty), "timestamp", fallback), Ok(fallback));
        let bad = json!({ "timestamp": "yesterday" });
        assert!(optional_timestamp(object(&bad), "timestamp", fallback).is_err());
    }

    #[test]
    fn non_finite_numbers_are_refused() {
        assert_eq!(finite_number(&json!(2.5)), Some(2.5));
        assert_eq!(finite_number(&json!("2.5")), None);
    }

    #[test]
    fn rejections_are_collected() {
        let mut parsed: Parsed<u8> = Parsed::default();
        parsed.push("a", Ok(1));
        parsed.push("b", Err("bad".to_owned()));
        assert_eq!(parsed.records, vec![1]);
        assert_eq!(parsed.rejections.len(), 1);
        assert_eq!(parsed.rejections.first().map(|r| r.path.as_str()), Some("b"));
    }
}
