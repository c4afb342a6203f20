// src/quoting_math.rs
//
// Pure helpers shared by the quoting pipeline: address normalization,
// distance-pair cache keys, great-circle distance, month-day windows and
// decimal rounding with the money scales used across the engine.

use chrono::{Datelike, NaiveDate};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use sha2::{Digest, Sha256};

/// Money at rest carries 2 decimal digits.
pub const MONEY_SCALE: u32 = 2;
/// Intermediate products carry 6 decimal digits before the final rounding.
pub const INTERMEDIATE_SCALE: u32 = 6;
/// Road miles carry 1 decimal digit.
pub const MILES_SCALE: u32 = 1;

/// Mean Earth radius in statute miles (haversine).
const EARTH_RADIUS_MILES: f64 = 3958.8;

/// Normalize a free-form address: collapse internal whitespace, casefold.
/// Two spellings of the same address must produce the same cache key.
pub fn normalize_address(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Stable cache key for an (origin, destination) pair. The pair is hashed
/// after normalization so header casing and stray whitespace do not fork
/// cache entries. 16 hex chars keep the key family compact.
pub fn distance_pair_key(origin: &str, destination: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_address(origin).as_bytes());
    hasher.update(b"\x1f");
    hasher.update(normalize_address(destination).as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// Great-circle miles between two (lat, lon) points.
pub fn haversine_miles(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_MILES * c
}

/// Final money rounding: 2 digits, half away from zero.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Intermediate rounding: 6 digits, half away from zero.
pub fn round_intermediate(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(INTERMEDIATE_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Miles rounding: 1 digit.
pub fn round_miles(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MILES_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Convert an f64 mile count coming from an upstream provider into the
/// engine's 1-digit decimal representation.
pub fn miles_from_f64(miles: f64) -> Decimal {
    round_miles(Decimal::from_f64(miles).unwrap_or(Decimal::ZERO))
}

/// A calendar (month, day) pair with no year, used by seasonal windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MonthDay {
    pub month: u32,
    pub day: u32,
}

impl MonthDay {
    /// Parse `"MM-DD"` (also accepts `"M-D"`).
    pub fn parse(raw: &str) -> Option<Self> {
        let (m, d) = raw.trim().split_once('-')?;
        let month: u32 = m.trim().parse().ok()?;
        let day: u32 = d.trim().parse().ok()?;
        if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
            return None;
        }
        Some(Self { month, day })
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            month: date.month(),
            day: date.day(),
        }
    }

    /// Inclusive containment of `date` in `[start, end]`. Windows never wrap
    /// the year boundary (validated at catalog install).
    pub fn contains(start: MonthDay, end: MonthDay, date: NaiveDate) -> bool {
        let md = Self::from_date(date);
        start <= md && md <= end
    }
}

impl std::fmt::Display for MonthDay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}-{:02}", self.month, self.day)
    }
}

// Serialized as "MM-DD" so catalog JSON matches the sheet representation.
impl serde::Serialize for MonthDay {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for MonthDay {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = <String as serde::Deserialize>::deserialize(deserializer)?;
        MonthDay::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid month-day: {raw}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_normalize_address() {
        assert_eq!(
            normalize_address("  3035   Whitmore Street,\tOmaha, NE "),
            "3035 whitmore street, omaha, ne"
        );
        assert_eq!(normalize_address("ASPEN, CO"), "aspen, co");
    }

    #[test]
    fn test_distance_pair_key_is_normalization_stable() {
        let a = distance_pair_key("Aspen,  CO", "Omaha, NE");
        let b = distance_pair_key("aspen, co", "OMAHA,   NE");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);

        // Direction matters: A->B is not B->A.
        let reversed = distance_pair_key("Omaha, NE", "Aspen, CO");
        assert_ne!(a, reversed);
    }

    #[test]
    fn test_haversine_known_pair() {
        // Omaha -> Denver is roughly 484 great-circle miles.
        let miles = haversine_miles(41.2565, -95.9345, 39.7392, -104.9903);
        assert!((miles - 484.0).abs() < 10.0, "got {miles}");
    }

    #[test]
    fn test_haversine_zero_distance() {
        let miles = haversine_miles(41.25, -95.93, 41.25, -95.93);
        assert!(miles.abs() < 1e-9);
    }

    #[test]
    fn test_round_money_half_away_from_zero() {
        assert_eq!(
            round_money(Decimal::from_str("1.005").unwrap()),
            Decimal::from_str("1.01").unwrap()
        );
        assert_eq!(
            round_money(Decimal::from_str("-1.005").unwrap()),
            Decimal::from_str("-1.01").unwrap()
        );
        assert_eq!(
            round_money(Decimal::from_str("2.004").unwrap()),
            Decimal::from_str("2.00").unwrap()
        );
    }

    #[test]
    fn test_round2_error_bound() {
        // round2(x) - x must stay within [-0.005, +0.005].
        for raw in ["0.001", "0.004999", "17.235", "99.994999", "1234.565"] {
            let x = Decimal::from_str(raw).unwrap();
            let diff = round_money(x) - x;
            assert!(diff.abs() <= Decimal::from_str("0.005").unwrap(), "x={raw}");
        }
    }

    #[test]
    fn test_month_day_parse_and_contains() {
        let start = MonthDay::parse("06-01").unwrap();
        let end = MonthDay::parse("08-31").unwrap();

        let inside = NaiveDate::from_ymd_opt(2025, 7, 4).unwrap();
        let at_start = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        let at_end = NaiveDate::from_ymd_opt(2025, 8, 31).unwrap();
        let outside = NaiveDate::from_ymd_opt(2025, 9, 1).unwrap();

        assert!(MonthDay::contains(start, end, inside));
        assert!(MonthDay::contains(start, end, at_start));
        assert!(MonthDay::contains(start, end, at_end));
        assert!(!MonthDay::contains(start, end, outside));
    }

    #[test]
    fn test_month_day_rejects_garbage() {
        assert!(MonthDay::parse("13-01").is_none());
        assert!(MonthDay::parse("06-32").is_none());
        assert!(MonthDay::parse("junk").is_none());
    }
}
