//! Timestamp helpers.
//!
//! All persisted datetimes are `i64` microseconds since the Unix epoch.
//! Wire responses render them as RFC 3339 strings.

use chrono::{DateTime, SecondsFormat, Utc};

/// Current wall-clock time in microseconds since the Unix epoch.
#[must_use]
pub fn now_micros() -> i64 {
    let now = Utc::now();
    now.timestamp()
        .saturating_mul(1_000_000)
        .saturating_add(i64::from(now.timestamp_subsec_micros()))
}

/// Render microseconds-since-epoch as an RFC 3339 UTC string.
///
/// Out-of-range values clamp to the epoch rather than panicking.
#[must_use]
pub fn micros_to_iso(micros: i64) -> String {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .unwrap_or_else(|| DateTime::<Utc>::from_timestamp_micros(0).unwrap_or_default())
        .to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_micros_is_positive_and_monotonic_enough() {
        let a = now_micros();
        let b = now_micros();
        assert!(a > 1_600_000_000_000_000, "expected post-2020 timestamp");
        assert!(b >= a);
    }

    #[test]
    fn micros_to_iso_round_trips_epoch() {
        assert_eq!(micros_to_iso(0), "1970-01-01T00:00:00.000000Z");
    }

    #[test]
    fn micros_to_iso_renders_microsecond_precision() {
        let s = micros_to_iso(1_700_000_000_123_456);
        assert!(s.ends_with("Z"));
        assert!(s.contains(".123456"));
    }
}
