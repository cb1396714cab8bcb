//! In-process aggregation over a session's rows.
//!
//! Results are keyed by `BTreeMap` so iteration order is deterministic.

use canewatch_types::TimeBucket;
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::Serialize;

/// Descriptive statistics of a set of values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Summary {
    /// Number of values.
    pub count: usize,
    /// Smallest value.
    pub min: f64,
    /// Largest value.
    pub max: f64,
    /// Arithmetic mean.
    pub mean: f64,
    /// Median (mean of the two middle values for even counts).
    pub median: f64,
    /// Population standard deviation.
    pub std_dev: f64,
}

impl Summary {
    /// Summarize `values`. `None` when there are none.
    pub fn of(values: &[f64]) -> Option<Self> {
        let mean = mean(values)?;
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);

        let min = *sorted.first()?;
        let max = *sorted.last()?;
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            let low = *sorted.get(mid.checked_sub(1)?)?;
            let high = *sorted.get(mid)?;
            (low + high) / 2.0
        } else {
            *sorted.get(mid)?
        };
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count_f64(values.len());

        Some(Self {
            count: values.len(),
            min,
            max,
            mean,
            median,
            std_dev: variance.sqrt(),
        })
    }
}

/// Arithmetic mean. `None` for an empty slice.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / count_f64(values.len()))
}

/// Start of the bucket containing `ts`.
pub fn bucket_start(ts: DateTime<Utc>, bucket: TimeBucket) -> DateTime<Utc> {
    let width = match bucket {
        TimeBucket::Minute => TimeDelta::minutes(1),
        TimeBucket::Hour => TimeDelta::hours(1),
        TimeBucket::Day => TimeDelta::days(1),
    };
    ts.duration_trunc(width).unwrap_or(ts)
}

/// A count as `f64`, saturating at `u32::MAX`.
pub(crate) fn count_f64(count: usize) -> f64 {
    u32::try_from(count).map_or(f64::from(u32::MAX), f64::from)
}
