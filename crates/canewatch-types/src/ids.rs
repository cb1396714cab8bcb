//! Session identifiers.
//!
//! Sessions are keyed by a human-readable string rather than a bare UUID so
//! operators can sort and grep them: `YYYYMMDD-HHMMSS-xxxxxxxx`, a UTC
//! timestamp prefix followed by the first eight hex digits of a random
//! UUID v4. Externally supplied identifiers are accepted verbatim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Length of the random suffix appended to generated identifiers.
const SUFFIX_LEN: usize = 8;

/// Unique identifier for a monitoring session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap an existing identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identifier whose prefix encodes `now`.
    pub fn generate(now: DateTime<Utc>) -> Self {
        let random = Uuid::new_v4().simple().to_string();
        let suffix = random.get(..SUFFIX_LEN).unwrap_or(&random);
        Self(format!("{}-{suffix}", now.format("%Y%m%d-%H%M%S")))
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Return the owned inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl core::fmt::Display for SessionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn generated_id_has_timestamp_prefix() {
        let now = Utc.with_ymd_and_hms(2025, 4, 21, 8, 30, 5).single();
        assert!(now.is_some());
        let id = SessionId::generate(now.unwrap_or_default());
        assert!(id.as_str().starts_with("20250421-083005-"));
        assert_eq!(id.as_str().len(), "20250421-083005-".len() + SUFFIX_LEN);
    }

    #[test]
    fn generated_ids_differ() {
        let now = Utc::now();
        assert_ne!(SessionId::generate(now), SessionId::generate(now));
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = SessionId::new("field-7");
        let json = serde_json::to_string(&id).unwrap_or_default();
        assert_eq!(json, "\"field-7\"");
    }
}
