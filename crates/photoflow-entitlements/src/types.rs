//! Core types shared across the entitlement system

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Credit amount; one credit pays for one processing step
pub type Credits = u64;

/// Store product identifier (e.g. "photoflow.pack.large")
pub type ProductId = String;

/// Unique identifier of a single purchase attempt
pub type PurchaseId = String;

/// Store platform a purchase originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    AppStore,
    PlayStore,
    Web,
}

/// Timestamp wrapper for cross-platform compatibility
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub DateTime<Utc>);

impl Timestamp {
    pub fn now() -> Self {
        Timestamp(Utc::now())
    }

    pub fn unix_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Millis outside chrono's representable range clamp to the matching
    /// bound, so a corrupt persisted value stays at an extreme instead of
    /// masquerading as the current time.
    pub fn from_unix_millis(millis: i64) -> Self {
        match DateTime::from_timestamp_millis(millis) {
            Some(instant) => Timestamp(instant),
            None if millis < 0 => Timestamp(DateTime::<Utc>::MIN_UTC),
            None => Timestamp(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// Smallest representable instant strictly after this one (saturating)
    pub(crate) fn just_after(&self) -> Timestamp {
        Timestamp(
            self.0
                .checked_add_signed(chrono::Duration::nanoseconds(1))
                .unwrap_or(self.0),
        )
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Timestamp::now()
    }
}

/// Generate a new unique ID
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id() {
        let id = generate_id();
        assert_eq!(id.len(), 36); // UUID format
        assert_ne!(id, generate_id());
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let ts = Timestamp::from_unix_millis(1_700_000_000_000);
        assert_eq!(ts.unix_millis(), 1_700_000_000_000);
        assert!(ts < Timestamp::now());
    }

    #[test]
    fn test_out_of_range_millis_clamp_deterministically() {
        let far_future = Timestamp::from_unix_millis(i64::MAX);
        assert_eq!(far_future, Timestamp::from_unix_millis(i64::MAX));
        assert!(far_future > Timestamp::now());

        let far_past = Timestamp::from_unix_millis(i64::MIN);
        assert_eq!(far_past, Timestamp::from_unix_millis(i64::MIN));
        assert!(far_past < Timestamp::from_unix_millis(0));
    }

    #[test]
    fn test_just_after_is_strictly_later() {
        let ts = Timestamp::from_unix_millis(1_000);
        assert!(ts.just_after() > ts);
    }
}
