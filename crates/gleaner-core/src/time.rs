//! Timestamp helpers. Every persisted timestamp is ISO-8601 UTC with a `Z`
//! suffix and second precision, so lexicographic order equals time order.

use chrono::{DateTime, SecondsFormat, Utc};

pub fn now_iso() -> String {
    to_iso(Utc::now())
}

pub fn to_iso(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a stored timestamp back into a `DateTime<Utc>`.
pub fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn z_suffix_and_seconds() {
        let dt = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(to_iso(dt), "2025-01-01T00:00:00Z");
    }

    #[test]
    fn round_trip() {
        let s = "2025-06-30T12:34:56Z";
        assert_eq!(to_iso(parse_iso(s).unwrap()), s);
    }

    #[test]
    fn lexicographic_order_is_time_order() {
        let a = to_iso(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        let b = to_iso(Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap());
        assert!(a < b);
    }
}
