//! Enumeration types for Canewatch.
//!
//! Every label set that reaches the database is closed: parsing an unknown
//! label yields `None`, and callers decide whether to drop the candidate or
//! fall back to a default.

use serde::{Deserialize, Serialize};

/// Generates a closed label enum stored as its text label.
macro_rules! define_labels {
    (
        $(#[$meta:meta])*
        $name:ident {
            $(
                $(#[$vmeta:meta])*
                $variant:ident => $label:literal,
            )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                $(#[$vmeta])*
                #[serde(rename = $label)]
                $variant,
            )+
        }

        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            /// The label stored in the database for this variant.
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $label,)+
                }
            }

            /// Parse a stored label. Unknown labels return `None`.
            pub fn parse(label: &str) -> Option<Self> {
                match label {
                    $($label => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

define_labels! {
    /// Lifecycle state of a monitoring session.
    ///
    /// `Completed` and `Aborted` are terminal: a session in either state has
    /// an end timestamp and accepts no further transitions.
    SessionStatus {
        /// Session is collecting data.
        Active => "active",
        /// Collection is suspended and may resume.
        Paused => "paused",
        /// Session ended normally.
        Completed => "completed",
        /// Session ended abnormally.
        Aborted => "aborted",
    }
}

impl SessionStatus {
    /// Whether this status ends the session.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    /// Whether a session in `self` may move to `next`.
    ///
    /// Allowed: `active <-> paused`, and any non-terminal state to a
    /// terminal one.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Paused)
                | (Self::Paused, Self::Active)
                | (Self::Active | Self::Paused, Self::Completed | Self::Aborted)
        )
    }
}

// ---------------------------------------------------------------------------
// Greenhouse-gas emissions
// ---------------------------------------------------------------------------

/// GHG Protocol emission scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EmissionScope {
    /// Direct emissions from owned or controlled sources.
    #[serde(rename = "scope1")]
    Scope1,
    /// Indirect emissions from purchased energy.
    #[serde(rename = "scope2")]
    Scope2,
    /// Other indirect emissions in the value chain.
    #[serde(rename = "scope3")]
    Scope3,
}

impl EmissionScope {
    /// Every scope, in ascending order.
    pub const ALL: &'static [Self] = &[Self::Scope1, Self::Scope2, Self::Scope3];

    /// Scope number as stored in the `scope` column.
    pub const fn number(self) -> i16 {
        match self {
            Self::Scope1 => 1,
            Self::Scope2 => 2,
            Self::Scope3 => 3,
        }
    }

    /// Parse a stored scope number.
    pub const fn from_number(number: i16) -> Option<Self> {
        match number {
            1 => Some(Self::Scope1),
            2 => Some(Self::Scope2),
            3 => Some(Self::Scope3),
            _ => None,
        }
    }

    /// Payload key for this scope (`scope1`, `scope2`, `scope3`).
    pub const fn key(self) -> &'static str {
        match self {
            Self::Scope1 => "scope1",
            Self::Scope2 => "scope2",
            Self::Scope3 => "scope3",
        }
    }

    /// Parse a payload key.
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|scope| scope.key() == key)
    }

    /// Only scope 1 records carry a category level.
    pub const fn has_categories(self) -> bool {
        matches!(self, Self::Scope1)
    }
}

impl core::fmt::Display for EmissionScope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.key())
    }
}

define_labels! {
    /// Greenhouse gas tracked in emission records.
    GasType {
        /// Carbon dioxide. The only gas that may be recorded as negative (removal).
        Co2 => "CO2",
        /// Methane.
        Ch4 => "CH4",
        /// Nitrous oxide.
        N2o => "N2O",
        /// Carbon-dioxide equivalent aggregate.
        Co2e => "CO2e",
    }
}

impl GasType {
    /// Whether a negative quantity is meaningful for this gas.
    pub const fn allows_negative(self) -> bool {
        matches!(self, Self::Co2)
    }
}

define_labels! {
    /// How an emission quantity was derived.
    CalculationMethod {
        /// Default emission factors.
        Tier1 => "tier1",
        /// Country-specific factors.
        Tier2 => "tier2",
        /// Site-specific models.
        Tier3 => "tier3",
        /// Instrument measurement.
        DirectMeasurement => "direct_measurement",
    }
}

// ---------------------------------------------------------------------------
// Carbon stocks
// ---------------------------------------------------------------------------

define_labels! {
    /// Carbon pool whose stock changed.
    StockType {
        /// Carbon held in soil organic matter.
        SoilOrganicCarbon => "soil_organic_carbon",
        /// Living biomass above the soil surface.
        AboveGroundBiomass => "above_ground_biomass",
        /// Roots and other living biomass below ground.
        BelowGroundBiomass => "below_ground_biomass",
        /// Litter and dead wood.
        DeadOrganicMatter => "dead_organic_matter",
    }
}

impl StockType {
    /// Pools whose losses are released at once when burned.
    pub const fn is_combustible(self) -> bool {
        matches!(self, Self::AboveGroundBiomass | Self::DeadOrganicMatter)
    }
}

define_labels! {
    /// How a carbon-stock change was measured.
    MeasurementMethod {
        /// Field samples.
        DirectSampling => "direct_sampling",
        /// Satellite or aerial imagery.
        RemoteSensing => "remote_sensing",
        /// Process model output.
        ModelEstimate => "model_estimate",
        /// Published default factor.
        DefaultFactor => "default_factor",
    }
}

// ---------------------------------------------------------------------------
// Harvest losses
// ---------------------------------------------------------------------------

define_labels! {
    /// Confidence attached to a harvest-loss estimate.
    ConfidenceLevel {
        /// High confidence.
        High => "high",
        /// Medium confidence.
        Medium => "medium",
        /// Low confidence.
        Low => "low",
    }
}

define_labels! {
    /// Which side of its optimal range a factor fell on.
    FactorDirection {
        /// Value exceeded the range.
        Above => "above",
        /// Value fell short of the range.
        Below => "below",
    }
}

define_labels! {
    /// Severity band derived from a loss percentage.
    LossCategory {
        /// Loss of 15% or more.
        High => "high",
        /// Loss from 10% up to 15%.
        Medium => "medium",
        /// Loss from 5% up to 10%.
        Low => "low",
        /// Loss below 5%.
        Minimal => "minimal",
    }
}

impl LossCategory {
    /// Classify a loss percentage.
    ///
    /// Anything below the lowest band, including NaN, is `Minimal`.
    pub fn from_percent(percent: f64) -> Self {
        Self::ALL
            .iter()
            .copied()
            .find(|band| percent >= band.bounds().0)
            .unwrap_or(Self::Minimal)
    }

    /// Inclusive lower and exclusive upper bound of the band.
    pub const fn bounds(self) -> (f64, f64) {
        match self {
            Self::High => (15.0, f64::INFINITY),
            Self::Medium => (10.0, 15.0),
            Self::Low => (5.0, 10.0),
            Self::Minimal => (0.0, 5.0),
        }
    }
}

define_labels! {
    /// Direction of harvest losses over a session.
    LossTrend {
        /// Later losses are more than 10% above earlier ones.
        Increasing => "increasing",
        /// Later losses are more than 10% below earlier ones.
        Decreasing => "decreasing",
        /// No significant change, or too few records to tell.
        Stable => "stable",
        /// No records at all.
        InsufficientData => "insufficient_data",
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

define_labels! {
    /// Width of the time buckets used by interval aggregates.
    TimeBucket {
        /// One-minute buckets.
        Minute => "minute",
        /// One-hour buckets.
        Hour => "hour",
        /// One-day buckets.
        Day => "day",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_round_trip() {
        for status in SessionStatus::ALL {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(*status));
        }
        for gas in GasType::ALL {
            assert_eq!(GasType::parse(gas.as_str()), Some(*gas));
        }
        assert_eq!(StockType::parse("peat"), None);
    }

    #[test]
    fn terminal_statuses_accept_no_transitions() {
        for from in [SessionStatus::Completed, SessionStatus::Aborted] {
            for to in SessionStatus::ALL {
                assert!(!from.can_transition_to(*to));
            }
        }
        assert!(SessionStatus::Active.can_transition_to(SessionStatus::Paused));
        assert!(SessionStatus::Paused.can_transition_to(SessionStatus::Active));
        assert!(!SessionStatus::Active.can_transition_to(SessionStatus::Active));
    }

    #[test]
    fn loss_category_thresholds() {
        assert_eq!(LossCategory::from_percent(15.0), LossCategory::High);
        assert_eq!(LossCategory::from_percent(14.9), LossCategory::Medium);
        assert_eq!(LossCategory::from_percent(10.0), LossCategory::Medium);
        assert_eq!(LossCategory::from_percent(5.0), LossCategory::Low);
        assert_eq!(LossCategory::from_percent(4.99), LossCategory::Minimal);
        assert_eq!(LossCategory::from_percent(-1.0), LossCategory::Minimal);
        assert_eq!(LossCategory::from_percent(f64::NAN), LossCategory::Minimal);
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn loss_bands_are_contiguous() {
        for pair in LossCategory::ALL.windows(2) {
            let [higher, lower] = pair else { continue };
            assert_eq!(lower.bounds().1, higher.bounds().0);
        }
        for band in LossCategory::ALL {
            assert_eq!(LossCategory::from_percent(band.bounds().0), *band);
        }
    }

    #[test]
    fn scope_keys_and_numbers() {
        assert_eq!(EmissionScope::from_key("scope2"), Some(EmissionScope::Scope2));
        assert_eq!(EmissionScope::from_number(3), Some(EmissionScope::Scope3));
        assert_eq!(EmissionScope::from_number(4), None);
        assert!(EmissionScope::Scope1.has_categories());
        assert!(!EmissionScope::Scope3.has_categories());
    }

    #[test]
    fn gas_serializes_with_chemical_label() {
        let json = serde_json::to_string(&GasType::Co2e).unwrap_or_default();
        assert_eq!(json, "\"CO2e\"");
        assert!(GasType::Co2.allows_negative());
        assert!(!GasType::Ch4.allows_negative());
    }
}
