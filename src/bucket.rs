//! Time buckets for the counter keys.

use chrono::{DateTime, Utc};

/// Beacons sending `Date.now()` report milliseconds; anything past this is
/// treated as such (this many seconds is the year 5138).
const MILLIS_THRESHOLD: u64 = 100_000_000_000;

/// Resolve a beacon `time` field to unix seconds.
///
/// Accepts unix seconds, unix milliseconds, or RFC 3339. Anything else,
/// including instants outside the representable calendar, is counted at the
/// current wall-clock time.
pub fn resolve_timestamp(time: &str) -> i64 {
    let time = time.trim();
    let parsed = match time.parse::<i64>() {
        Ok(ts) if ts.unsigned_abs() >= MILLIS_THRESHOLD => Some(ts.div_euclid(1000)),
        Ok(ts) => Some(ts),
        Err(_) => DateTime::parse_from_rfc3339(time)
            .ok()
            .map(|dt| dt.timestamp()),
    };
    parsed
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
        .unwrap_or_else(Utc::now)
        .timestamp()
}

/// Time granularity of one counter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    Day,
    Hour,
    Minute,
}

impl Granularity {
    pub const ALL: [Granularity; 3] = [Granularity::Day, Granularity::Hour, Granularity::Minute];

    /// Key segment, as read by consumers of the store.
    pub fn label(self) -> &'static str {
        match self {
            Granularity::Day => "day",
            Granularity::Hour => "hour",
            Granularity::Minute => "min",
        }
    }

    fn seconds(self) -> i64 {
        match self {
            Granularity::Day => 86_400,
            Granularity::Hour => 3_600,
            Granularity::Minute => 60,
        }
    }

    /// Start of the UTC bucket containing `ts`. Saturates at `i64::MIN`.
    pub fn bucket(self, ts: i64) -> i64 {
        ts.saturating_sub(ts.rem_euclid(self.seconds()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2021-05-03T00:00:00Z
    const MIDNIGHT: i64 = 1_620_000_000;

    #[test]
    fn buckets_align_to_utc() {
        let ts = MIDNIGHT + 3_723;
        assert_eq!(Granularity::Day.bucket(ts), MIDNIGHT);
        assert_eq!(Granularity::Hour.bucket(ts), MIDNIGHT + 3_600);
        assert_eq!(Granularity::Minute.bucket(ts), MIDNIGHT + 3_720);
        assert_eq!(Granularity::Minute.bucket(MIDNIGHT), MIDNIGHT);
    }

    #[test]
    fn labels() {
        let labels: Vec<_> = Granularity::ALL.iter().map(|g| g.label()).collect();
        assert_eq!(labels, ["day", "hour", "min"]);
    }

    #[test]
    fn resolves_time_formats() {
        assert_eq!(resolve_timestamp("1620000000"), MIDNIGHT);
        assert_eq!(resolve_timestamp(" 1620000000123 "), MIDNIGHT);
        assert_eq!(resolve_timestamp("2021-05-03T01:00:00+01:00"), MIDNIGHT);
    }

    #[test]
    fn garbage_time_is_now() {
        let before = Utc::now().timestamp();
        let ts = resolve_timestamp("yesterday-ish");
        assert!(ts >= before && ts <= Utc::now().timestamp());
        assert!(resolve_timestamp("") >= before);
    }

    #[test]
    fn out_of_range_time_is_now() {
        let before = Utc::now().timestamp();
        for time in ["-9223372036854775808", "9223372036854775807", "-99999999999999999"] {
            let ts = resolve_timestamp(time);
            assert!(ts >= before && ts <= Utc::now().timestamp(), "{time}");
        }
    }

    #[test]
    fn extreme_buckets_do_not_overflow() {
        for g in Granularity::ALL {
            assert_eq!(g.bucket(i64::MIN), i64::MIN);
            assert!(g.bucket(i64::MAX) > i64::MAX - g.seconds());
        }
    }
}
